//! Node configuration parser.
//!
//! A flat TOML document mirroring the node's setters:
//!
//! ```toml
//! id = 1
//! address = "10.0.0.1:9001"
//! dir = "/var/lib/replica"
//! bind_address = "0.0.0.0:9001"
//! network_latency_ms = 20
//! dial_timeout_ms = 5000
//! failure_domain = 1
//!
//! [snapshot]
//! threshold = 8192
//! trailing = 1024
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dial::DialFunc;
use crate::engine::{Engine, SnapshotParams};
use crate::error::{NodeError, NodeResult};
use crate::node::Node;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: u64,
    pub address: String,
    pub dir: PathBuf,
    pub bind_address: Option<String>,
    pub network_latency_ms: Option<u64>,
    pub dial_timeout_ms: Option<u64>,
    pub failure_domain: Option<u64>,
    pub snapshot: Option<SnapshotConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub threshold: u64,
    pub trailing: u64,
}

impl From<SnapshotConfig> for SnapshotParams {
    fn from(c: SnapshotConfig) -> Self {
        SnapshotParams {
            threshold: c.threshold,
            trailing: c.trailing,
        }
    }
}

impl NodeConfig {
    /// Minimal configuration; every optional setting left to the engine default.
    pub fn new(id: u64, address: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            address: address.into(),
            dir: dir.into(),
            bind_address: None,
            network_latency_ms: None,
            dial_timeout_ms: None,
            failure_domain: None,
            snapshot: None,
        }
    }

    pub fn from_toml_str(s: &str) -> NodeResult<Self> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> NodeResult<String> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }
}

impl<E: Engine> Node<E> {
    /// Create a node and apply every setting present in `config`.
    ///
    /// `dial`, when given, is installed after the dial timeout so the
    /// registration carries the configured value.
    pub fn from_config(config: &NodeConfig, dial: Option<DialFunc>) -> NodeResult<Self> {
        let mut node = Node::create(config.id, &config.address, &config.dir)?;
        if let Some(ms) = config.dial_timeout_ms {
            node.set_dial_timeout(Duration::from_millis(ms))?;
        }
        if let Some(dial) = dial {
            node.set_dial_func(dial)?;
        }
        if let Some(address) = &config.bind_address {
            node.set_bind_address(address)?;
        }
        if let Some(ms) = config.network_latency_ms {
            node.set_network_latency(Duration::from_millis(ms))?;
        }
        if let Some(snapshot) = config.snapshot {
            node.set_snapshot_params(snapshot.into())?;
        }
        if let Some(code) = config.failure_domain {
            node.set_failure_domain(code)?;
        }
        debug!(node_id = config.id, "node configured from file");
        Ok(node)
    }
}
