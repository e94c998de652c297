//! Node handle — one cluster member and its lifecycle.
//!
//! ```text
//! Created ──set_*──▶ Configured ──start──▶ Running ──stop──▶ Stopped
//!    │                   │                                      │
//!    └──── recover ──────┴──────────── recover ─────────────────┘
//! ```
//!
//! Setters are only accepted before the node starts; the state is checked
//! here rather than left to the engine. Destruction is [`Node::destroy`] (or
//! drop): it stops a running node, releases the node's dial registration and
//! then the engine itself. Taking `self` by value makes a second destroy
//! impossible.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::connect_with_dial;
use crate::dial::{DEFAULT_DIAL_TIMEOUT, DialFunc};
use crate::engine::{Engine, LocalEngine, SnapshotParams};
use crate::error::{NodeError, NodeResult};
use crate::membership::{self, NodeInfo, RawMembership};
use crate::registry::{DialHandle, Dialer, registry};

/// Lifecycle state of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Configured,
    Running,
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "created"),
            NodeState::Configured => write!(f, "configured"),
            NodeState::Running => write!(f, "running"),
            NodeState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A single member of the replicated cluster.
pub struct Node<E: Engine = LocalEngine> {
    id: u64,
    address: String,
    state: NodeState,
    dial: Option<DialFunc>,
    dial_handle: Option<DialHandle>,
    dial_timeout: Duration,
    engine: E,
}

impl<E: Engine> Node<E> {
    /// Create a node with the given id, advertised address and data directory.
    pub fn create(id: u64, address: &str, dir: impl AsRef<Path>) -> NodeResult<Self> {
        let engine = E::create(id, address, dir.as_ref()).map_err(NodeError::Create)?;
        info!(node_id = id, %address, "node created");
        Ok(Self {
            id,
            address: address.to_string(),
            state: NodeState::Created,
            dial: None,
            dial_handle: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            engine,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// The underlying engine, for inspection.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn ensure_state(&self, op: &'static str, allowed: &[NodeState]) -> NodeResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(NodeError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn ensure_configurable(&self, op: &'static str) -> NodeResult<()> {
        self.ensure_state(op, &[NodeState::Created, NodeState::Configured])
    }

    /// Route the engine's outbound connections through `dial`.
    pub fn set_dial_func(&mut self, dial: DialFunc) -> NodeResult<()> {
        self.ensure_configurable("set dial func")?;
        self.install_dialer(dial, self.dial_timeout)
    }

    /// Bound every dial attempt by `timeout` (default 5s).
    pub fn set_dial_timeout(&mut self, timeout: Duration) -> NodeResult<()> {
        self.ensure_configurable("set dial timeout")?;
        match self.dial.clone() {
            // Registered entries are never mutated; re-register instead.
            Some(dial) => self.install_dialer(dial, timeout),
            None => {
                self.dial_timeout = timeout;
                self.state = NodeState::Configured;
                Ok(())
            }
        }
    }

    /// Register `dial` under a fresh handle and hand it to the engine. The
    /// node keeps its previous registration if the engine refuses.
    fn install_dialer(&mut self, dial: DialFunc, timeout: Duration) -> NodeResult<()> {
        let handle = registry().register(Dialer::new(dial.clone()).with_timeout(timeout));
        if let Err(source) = self.engine.set_connect_func(connect_with_dial, handle) {
            registry().remove(handle);
            return Err(NodeError::Configure {
                setting: "connect func",
                source,
            });
        }
        if let Some(previous) = self.dial_handle.replace(handle) {
            registry().remove(previous);
        }
        self.dial = Some(dial);
        self.dial_timeout = timeout;
        self.state = NodeState::Configured;
        debug!(node_id = self.id, handle, ?timeout, "dial function installed");
        Ok(())
    }

    pub fn set_bind_address(&mut self, address: &str) -> NodeResult<()> {
        self.ensure_configurable("set bind address")?;
        self.engine
            .set_bind_address(address)
            .map_err(|source| NodeError::Configure {
                setting: "bind address",
                source,
            })?;
        self.state = NodeState::Configured;
        Ok(())
    }

    /// The configured bind address; once running, the address actually bound.
    pub fn bind_address(&self) -> String {
        self.engine.bind_address()
    }

    pub fn set_network_latency(&mut self, latency: Duration) -> NodeResult<()> {
        self.ensure_configurable("set network latency")?;
        let nanoseconds = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.engine
            .set_network_latency(nanoseconds)
            .map_err(|source| NodeError::Configure {
                setting: "network latency",
                source,
            })?;
        self.state = NodeState::Configured;
        Ok(())
    }

    pub fn set_snapshot_params(&mut self, params: SnapshotParams) -> NodeResult<()> {
        self.ensure_configurable("set snapshot params")?;
        self.engine
            .set_snapshot_params(params)
            .map_err(|source| NodeError::Configure {
                setting: "snapshot params",
                source,
            })?;
        self.state = NodeState::Configured;
        Ok(())
    }

    pub fn set_failure_domain(&mut self, code: u64) -> NodeResult<()> {
        self.ensure_configurable("set failure domain")?;
        self.engine
            .set_failure_domain(code)
            .map_err(|source| NodeError::Configure {
                setting: "failure domain",
                source,
            })?;
        self.state = NodeState::Configured;
        Ok(())
    }

    /// Start serving. On failure the node stays stopped and may be retried.
    pub fn start(&mut self) -> NodeResult<()> {
        self.ensure_configurable("start")?;
        self.engine.start().map_err(|e| {
            warn!(node_id = self.id, code = e.code, error = %e, "node failed to start");
            NodeError::Start(e)
        })?;
        self.state = NodeState::Running;
        info!(node_id = self.id, bind_address = %self.engine.bind_address(), "node started");
        Ok(())
    }

    /// Stop serving.
    ///
    /// An error means shutdown may be incomplete; the node is considered
    /// stopped either way and must still be destroyed.
    pub fn stop(&mut self) -> NodeResult<()> {
        self.ensure_state("stop", &[NodeState::Running])?;
        let result = self.engine.stop();
        self.state = NodeState::Stopped;
        match result {
            Ok(()) => {
                info!(node_id = self.id, "node stopped");
                Ok(())
            }
            Err(e) => {
                warn!(node_id = self.id, code = e.code, error = %e, "node stopped with error");
                Err(NodeError::Stop(e))
            }
        }
    }

    /// Overwrite the persisted membership, making every member a voter.
    pub fn recover(&mut self, cluster: &[NodeInfo]) -> NodeResult<()> {
        self.recover_ext(&membership::with_default_role(cluster))
    }

    /// Overwrite the persisted membership, keeping each member's role.
    ///
    /// Destructive and synchronous; only valid while the node is not running.
    pub fn recover_ext(&mut self, cluster: &[NodeInfo]) -> NodeResult<()> {
        self.ensure_state(
            "recover",
            &[NodeState::Created, NodeState::Configured, NodeState::Stopped],
        )?;
        let mut raw = RawMembership::build(cluster)?;
        // SAFETY: `raw` owns the address strings and outlives the call.
        unsafe { self.engine.recover(raw.as_mut_slice()) }.map_err(NodeError::Recover)?;
        info!(node_id = self.id, members = cluster.len(), "membership recovered");
        Ok(())
    }

    /// Release the node: stop it if running, drop its dial registration and
    /// free the engine.
    pub fn destroy(self) {
        debug!(node_id = self.id, "destroying node");
        drop(self);
    }
}

impl<E: Engine> Drop for Node<E> {
    fn drop(&mut self) {
        if self.state == NodeState::Running {
            if let Err(e) = self.stop() {
                warn!(node_id = self.id, error = %e, "stop during destroy failed");
            }
        }
        if let Some(handle) = self.dial_handle.take() {
            registry().remove(handle);
        }
    }
}
