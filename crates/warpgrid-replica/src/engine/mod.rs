//! The storage engine seam.
//!
//! [`Engine`] mirrors the engine's node API one call per method. It speaks
//! the engine's own terms (return codes, raw membership records, a C connect
//! callback) so that [`crate::Node`] drives every backend through the same
//! marshaling and callback path.
//!
//! - [`LocalEngine`]: in-process engine, the default backend.
//! - `NativeEngine`: libdqlite, behind the `libdqlite` feature.

pub mod local;
#[cfg(feature = "libdqlite")]
pub mod native;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::ffi::{ConnectFunc, NodeInfoExt};
use crate::registry::DialHandle;

pub use local::LocalEngine;
#[cfg(feature = "libdqlite")]
pub use native::NativeEngine;

/// Snapshot policy: take a snapshot every `threshold` log entries and keep
/// `trailing` entries behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotParams {
    pub threshold: u64,
    pub trailing: u64,
}

/// One node inside a storage engine.
///
/// Dropping the engine releases all of its resources.
pub trait Engine: Send + Sized {
    /// Allocate a node with the given id, advertised address and data directory.
    fn create(id: u64, address: &str, dir: &Path) -> Result<Self, EngineError>;

    fn set_bind_address(&mut self, address: &str) -> Result<(), EngineError>;

    /// The configured bind address; once started, the address actually bound.
    fn bind_address(&self) -> String;

    /// Route outbound connections through `func`, passing `handle` as its argument.
    fn set_connect_func(&mut self, func: ConnectFunc, handle: DialHandle)
    -> Result<(), EngineError>;

    fn set_network_latency(&mut self, nanoseconds: u64) -> Result<(), EngineError>;

    fn set_snapshot_params(&mut self, params: SnapshotParams) -> Result<(), EngineError>;

    fn set_failure_domain(&mut self, code: u64) -> Result<(), EngineError>;

    fn start(&mut self) -> Result<(), EngineError>;

    fn stop(&mut self) -> Result<(), EngineError>;

    /// Overwrite the persisted cluster configuration.
    ///
    /// # Safety
    ///
    /// Every record's `address` must point to a NUL-terminated string that
    /// stays valid for the duration of the call.
    unsafe fn recover(&mut self, infos: &mut [NodeInfoExt]) -> Result<(), EngineError>;
}
