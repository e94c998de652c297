//! Raw FFI surface shared with the storage engine.
//!
//! The layouts and constants here are compatibility-critical: they match
//! `dqlite.h` / `raft.h`. The `extern "C"` bindings are only compiled with
//! the `libdqlite` feature; `LocalEngine` consumes the same layouts
//! in-process.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_int, c_void};

/// Generic engine failure.
pub const DQLITE_ERROR: c_int = 1;
/// Call made in the wrong state or with out-of-range arguments.
pub const DQLITE_MISUSE: c_int = 2;
/// Allocation failure.
pub const DQLITE_NOMEM: c_int = 3;

/// Returned by the connect callback when no connection could be made.
pub const RAFT_NOCONNECTION: c_int = 16;

/// Role codes (`dqlite_node_role`).
pub const DQLITE_VOTER: u64 = 0;
pub const DQLITE_STANDBY: u64 = 1;
pub const DQLITE_SPARE: u64 = 2;

pub type dqlite_node_id = u64;

/// Outbound connection callback installed on a node.
///
/// `arg` is the opaque value given at registration time (a dial handle,
/// never a pointer), `address` the peer to reach. On success the callee
/// writes an owned socket descriptor to `fd` and returns 0.
pub type ConnectFunc =
    unsafe extern "C" fn(arg: *mut c_void, address: *const c_char, fd: *mut c_int) -> c_int;

/// One membership record, as consumed by `dqlite_node_recover_ext`.
///
/// `address` holds a pointer to a NUL-terminated string widened to 64 bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfoExt {
    pub size: u64,
    pub id: u64,
    pub address: u64,
    pub dqlite_role: u64,
}

/// Opaque node handle.
#[repr(C)]
pub struct dqlite_node {
    _private: [u8; 0],
}

#[cfg(feature = "libdqlite")]
unsafe extern "C" {
    // ── Lifecycle ───────────────────────────────────────────────
    pub fn dqlite_node_create(
        id: dqlite_node_id,
        address: *const c_char,
        data_dir: *const c_char,
        n: *mut *mut dqlite_node,
    ) -> c_int;
    pub fn dqlite_node_destroy(n: *mut dqlite_node);
    pub fn dqlite_node_start(n: *mut dqlite_node) -> c_int;
    pub fn dqlite_node_stop(n: *mut dqlite_node) -> c_int;
    pub fn dqlite_node_errmsg(n: *mut dqlite_node) -> *const c_char;

    // ── Configuration ───────────────────────────────────────────
    pub fn dqlite_node_set_bind_address(n: *mut dqlite_node, address: *const c_char) -> c_int;
    pub fn dqlite_node_get_bind_address(n: *mut dqlite_node) -> *const c_char;
    pub fn dqlite_node_set_connect_func(
        n: *mut dqlite_node,
        f: Option<ConnectFunc>,
        arg: *mut c_void,
    ) -> c_int;
    pub fn dqlite_node_set_network_latency(n: *mut dqlite_node, nanoseconds: u64) -> c_int;
    pub fn dqlite_node_set_snapshot_params(
        n: *mut dqlite_node,
        snapshot_threshold: u32,
        snapshot_trailing: u32,
    ) -> c_int;
    pub fn dqlite_node_set_failure_domain(n: *mut dqlite_node, code: u64) -> c_int;

    // ── Administration ──────────────────────────────────────────
    pub fn dqlite_node_recover_ext(
        n: *mut dqlite_node,
        infos: *mut NodeInfoExt,
        n_info: c_int,
    ) -> c_int;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_info_layout_is_four_words() {
        assert_eq!(std::mem::size_of::<NodeInfoExt>(), 32);
        assert_eq!(std::mem::align_of::<NodeInfoExt>(), 8);
    }

    #[test]
    fn role_codes_match_engine_enum() {
        assert_eq!(DQLITE_VOTER, 0);
        assert_eq!(DQLITE_STANDBY, 1);
        assert_eq!(DQLITE_SPARE, 2);
    }
}
