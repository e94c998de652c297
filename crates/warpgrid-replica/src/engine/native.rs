//! libdqlite-backed engine.
//!
//! Thin safe layer over [`crate::ffi`]: converts strings, maps return codes
//! to [`EngineError`] and owns the `dqlite_node *`, destroying it on drop.

use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::path::Path;

use super::{Engine, SnapshotParams};
use crate::error::EngineError;
use crate::ffi::{self, ConnectFunc, DQLITE_MISUSE, NodeInfoExt};
use crate::registry::DialHandle;

/// A node owned by libdqlite.
pub struct NativeEngine {
    node: *mut ffi::dqlite_node,
}

// Safety: the node pointer is only touched through `&mut self` (or `&self`
// for read-only accessors), and libdqlite allows a node to be driven from
// any single thread at a time.
unsafe impl Send for NativeEngine {}

fn c_string(value: &str, what: &str) -> Result<CString, EngineError> {
    CString::new(value)
        .map_err(|_| EngineError::new(DQLITE_MISUSE, format!("{what} contains a NUL byte")))
}

fn borrowed_str(ptr: *const std::os::raw::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: non-null strings returned by libdqlite are NUL-terminated and
    // owned by the node.
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

impl NativeEngine {
    /// The node's last diagnostic message.
    fn errmsg(&self) -> String {
        // SAFETY: `self.node` is a live node.
        borrowed_str(unsafe { ffi::dqlite_node_errmsg(self.node) })
    }

    fn check(&self, rc: c_int, what: &str) -> Result<(), EngineError> {
        if rc == 0 {
            return Ok(());
        }
        Err(EngineError::new(rc, format!("{what}: error code {rc}")))
    }
}

impl Engine for NativeEngine {
    fn create(id: u64, address: &str, dir: &Path) -> Result<Self, EngineError> {
        let c_address = c_string(address, "address")?;
        let dir = dir
            .to_str()
            .ok_or_else(|| EngineError::new(DQLITE_MISUSE, "data directory is not UTF-8"))?;
        let c_dir = c_string(dir, "data directory")?;

        let mut node: *mut ffi::dqlite_node = std::ptr::null_mut();
        // SAFETY: both strings outlive the call; `node` is a valid out slot.
        let rc = unsafe { ffi::dqlite_node_create(id, c_address.as_ptr(), c_dir.as_ptr(), &mut node) };
        if rc != 0 {
            // The node is allocated even on failure so the message can be read.
            let message = if node.is_null() {
                format!("create node: error code {rc}")
            } else {
                // SAFETY: non-null node returned by dqlite_node_create.
                let msg = borrowed_str(unsafe { ffi::dqlite_node_errmsg(node) });
                unsafe { ffi::dqlite_node_destroy(node) };
                msg
            };
            return Err(EngineError::new(rc, message));
        }
        Ok(Self { node })
    }

    fn set_bind_address(&mut self, address: &str) -> Result<(), EngineError> {
        let c_address = c_string(address, "bind address")?;
        // SAFETY: live node; string outlives the call.
        let rc = unsafe { ffi::dqlite_node_set_bind_address(self.node, c_address.as_ptr()) };
        self.check(rc, &format!("set bind address {address:?}"))
    }

    fn bind_address(&self) -> String {
        // SAFETY: live node.
        borrowed_str(unsafe { ffi::dqlite_node_get_bind_address(self.node) })
    }

    fn set_connect_func(
        &mut self,
        func: ConnectFunc,
        handle: DialHandle,
    ) -> Result<(), EngineError> {
        // SAFETY: live node; `handle` is carried as an integer, never dereferenced.
        let rc = unsafe {
            ffi::dqlite_node_set_connect_func(self.node, Some(func), handle as *mut c_void)
        };
        self.check(rc, "set connect func")
    }

    fn set_network_latency(&mut self, nanoseconds: u64) -> Result<(), EngineError> {
        // SAFETY: live node.
        let rc = unsafe { ffi::dqlite_node_set_network_latency(self.node, nanoseconds) };
        self.check(rc, "set network latency")
    }

    fn set_snapshot_params(&mut self, params: SnapshotParams) -> Result<(), EngineError> {
        let out_of_range =
            || EngineError::new(DQLITE_MISUSE, format!("snapshot params {params:?} out of range"));
        let threshold = u32::try_from(params.threshold).map_err(|_| out_of_range())?;
        let trailing = u32::try_from(params.trailing).map_err(|_| out_of_range())?;
        // SAFETY: live node.
        let rc = unsafe { ffi::dqlite_node_set_snapshot_params(self.node, threshold, trailing) };
        self.check(rc, "set snapshot params")
    }

    fn set_failure_domain(&mut self, code: u64) -> Result<(), EngineError> {
        // SAFETY: live node.
        let rc = unsafe { ffi::dqlite_node_set_failure_domain(self.node, code) };
        self.check(rc, "set failure domain")
    }

    fn start(&mut self) -> Result<(), EngineError> {
        // SAFETY: live node.
        let rc = unsafe { ffi::dqlite_node_start(self.node) };
        if rc != 0 {
            return Err(EngineError::new(rc, self.errmsg()));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        // SAFETY: live node.
        let rc = unsafe { ffi::dqlite_node_stop(self.node) };
        self.check(rc, "stop")
    }

    unsafe fn recover(&mut self, infos: &mut [NodeInfoExt]) -> Result<(), EngineError> {
        let n = c_int::try_from(infos.len())
            .map_err(|_| EngineError::new(DQLITE_MISUSE, "too many cluster members"))?;
        // SAFETY: live node; the caller guarantees the record addresses.
        let rc = unsafe { ffi::dqlite_node_recover_ext(self.node, infos.as_mut_ptr(), n) };
        self.check(rc, "recover")
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        // SAFETY: the node was created by dqlite_node_create and is destroyed once.
        unsafe { ffi::dqlite_node_destroy(self.node) };
    }
}
