//! Error types for the replica node.

use thiserror::Error;

use crate::membership::MembershipError;
use crate::node::NodeState;

/// Result type alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// A failure reported by the storage engine.
///
/// Displays the engine's diagnostic verbatim; the numeric return code is
/// kept alongside for callers that branch on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub code: i32,
    pub message: String,
}

impl EngineError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The engine's numeric return code.
    pub fn code(&self) -> i32 {
        self.code
    }
}

/// Errors that can occur while driving a node through its lifecycle.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0}")]
    Create(EngineError),

    #[error("failed to set {setting}: {source} (code {code})", code = .source.code)]
    Configure {
        setting: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("{0}")]
    Start(EngineError),

    /// Shutdown may be incomplete; the node must still be destroyed.
    #[error("node stopped with error code {code}: {0}", code = .0.code)]
    Stop(EngineError),

    #[error("recover failed with error code {code}: {0}", code = .0.code)]
    Recover(EngineError),

    #[error("invalid membership: {0}")]
    Membership(#[from] MembershipError),

    #[error("cannot {op} while node is {state}")]
    InvalidState { op: &'static str, state: NodeState },

    #[error("config error: {0}")]
    Config(String),
}

impl NodeError {
    /// The engine return code behind this error, if there is one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Create(e) | Self::Start(e) | Self::Stop(e) | Self::Recover(e) => Some(e.code),
            Self::Configure { source, .. } => Some(source.code),
            Self::Membership(_) | Self::InvalidState { .. } | Self::Config(_) => None,
        }
    }
}
