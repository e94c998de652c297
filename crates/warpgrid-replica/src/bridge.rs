//! Dial bridge — the connect callback the engine invokes.
//!
//! ```text
//! engine worker thread
//!   → connect_with_dial(handle, address, &fd)
//!     → registry().resolve(handle)
//!     → dial(ctx, address) bounded by the dialer's timeout
//!     → materialize(conn) → duplicated descriptor
//!   ← 0 and *fd set, or RAFT_NOCONNECTION
//! ```
//!
//! Dial futures run on a small runtime owned by the bridge. A callback that
//! arrives on a thread already inside a tokio runtime is moved to a scoped
//! thread first.
//! The bridge never retries; retry policy belongs to the engine.

use std::ffi::CStr;
use std::io;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::{debug, error, warn};

use crate::conn::{MaterializeError, materialize};
use crate::dial::DialContext;
use crate::ffi::RAFT_NOCONNECTION;
use crate::registry::{DialHandle, registry};

/// Why the bridge could not produce a descriptor.
///
/// All variants collapse to `RAFT_NOCONNECTION` at the callback boundary.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("dial handle {0} is not registered")]
    UnknownHandle(DialHandle),

    #[error("peer address is not valid UTF-8")]
    InvalidAddress,

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("dial failed: {0}")]
    Dial(#[source] io::Error),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("dial runtime unavailable: {0}")]
    Runtime(String),
}

static RUNTIME: LazyLock<io::Result<Runtime>> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("replica-dial")
        .enable_all()
        .build()
});

fn runtime() -> Result<&'static Runtime, BridgeError> {
    RUNTIME
        .as_ref()
        .map_err(|e| BridgeError::Runtime(e.to_string()))
}

/// Resolve `handle`, dial `address` within the dialer's timeout and return
/// an owned socket for the engine.
pub fn dial_handle(handle: DialHandle, address: &str) -> Result<OwnedFd, BridgeError> {
    let Some(dialer) = registry().resolve(handle) else {
        // The engine is only ever given handles that were registered.
        error!(handle, %address, "connect callback invoked with unknown dial handle");
        return Err(BridgeError::UnknownHandle(handle));
    };

    let timeout = dialer.timeout;
    let ctx = DialContext::with_timeout(timeout);
    let address = address.to_string();

    let run = move || {
        runtime()?.block_on(async move {
            let dial = (dialer.func)(ctx, address);
            let conn = tokio::time::timeout_at(ctx.deadline(), dial)
                .await
                .map_err(|_| BridgeError::Timeout(timeout))?
                .map_err(BridgeError::Dial)?;
            Ok(materialize(conn)?)
        })
    };

    if tokio::runtime::Handle::try_current().is_err() {
        return run();
    }
    // block_on panics inside a runtime context; hop to a plain thread.
    std::thread::scope(|s| match s.spawn(run).join() {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Runtime("dial thread panicked".into())),
    })
}

/// Connect callback handed to the engine (see [`crate::ffi::ConnectFunc`]).
///
/// # Safety
///
/// `address` must be null or point to a NUL-terminated string, and `fd`
/// must be null or valid for a single `c_int` write. `arg` is interpreted
/// as a [`DialHandle`] and never dereferenced.
pub unsafe extern "C" fn connect_with_dial(
    arg: *mut c_void,
    address: *const c_char,
    fd: *mut c_int,
) -> c_int {
    let handle = arg as DialHandle;
    if address.is_null() || fd.is_null() {
        error!(handle, "connect callback invoked with null arguments");
        return RAFT_NOCONNECTION;
    }

    // SAFETY: checked non-null above; the caller guarantees NUL termination.
    let address = unsafe { CStr::from_ptr(address) };

    let result = catch_unwind(AssertUnwindSafe(|| {
        let address = address.to_str().map_err(|_| BridgeError::InvalidAddress)?;
        dial_handle(handle, address)
    }));

    match result {
        Ok(Ok(socket)) => {
            let raw = socket.into_raw_fd();
            // SAFETY: checked non-null above; ownership of `raw` passes to the engine.
            unsafe { *fd = raw };
            debug!(handle, fd = raw, "handed socket to engine");
            0
        }
        Ok(Err(e)) => {
            warn!(handle, address = %address.to_string_lossy(), error = %e, "outbound connection failed");
            RAFT_NOCONNECTION
        }
        Err(_) => {
            error!(handle, "dial function panicked");
            RAFT_NOCONNECTION
        }
    }
}
