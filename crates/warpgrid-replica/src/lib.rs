//! warpgrid-replica — control surface for one member of a replicated
//! storage cluster.
//!
//! Starts and stops a node, configures its network behavior, supplies its
//! outbound transport through an application-level dial function, and
//! rewrites cluster membership during disaster recovery.
//!
//! # Architecture
//!
//! ```text
//!   Node<E: Engine>  ── set_dial_func ──▶  DialRegistry (handle → Dialer)
//!        │                                      ▲
//!        │ set_connect_func(connect_with_dial,   │ resolve(handle)
//!        ▼                handle)                │
//!     Engine  ── connect(arg=handle, address) ──▶ bridge ──▶ DialFunc
//!        ▲                                                      │
//!        └──────────── owned socket descriptor ◀── materialize ─┘
//! ```
//!
//! The engine never holds a reference into Rust: it only sees an integer
//! handle and gets back a descriptor it owns outright. Recovery lays the
//! membership list out as fixed-size [`ffi::NodeInfoExt`] records owned by
//! [`membership::RawMembership`] for the duration of the call.
//!
//! [`LocalEngine`] is the in-process engine used by default. With the
//! `libdqlite` feature, `engine::NativeEngine` drives the system library
//! through the same path.

pub mod bridge;
pub mod config;
pub mod conn;
pub mod dial;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod id;
pub mod membership;
pub mod node;
pub mod registry;
pub mod store;

pub use config::{NodeConfig, SnapshotConfig};
pub use conn::{Connection, MaterializeError, materialize};
pub use dial::{DialContext, DialFunc, dial_fn, tcp_dialer};
pub use engine::{Engine, LocalEngine, SnapshotParams};
pub use error::{EngineError, NodeError, NodeResult};
pub use id::generate_id;
pub use membership::{NodeInfo, Role};
pub use node::{Node, NodeState};
