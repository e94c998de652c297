//! Dial registry — maps opaque handles to dial functions.
//!
//! The engine runs on threads this crate does not own and can only carry a
//! pointer-sized integer through its connect callback. Instead of smuggling
//! a reference to a closure across that boundary, each dialer is stored here
//! under a handle and the engine is given the handle.
//!
//! Handles are allocated monotonically above [`RESERVED_HANDLES`] and never
//! reused within a process. A single mutex guards both the counter and the
//! map.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::dial::{DEFAULT_DIAL_TIMEOUT, DialFunc};

/// Opaque key handed to the engine in place of a dial function.
pub type DialHandle = usize;

/// Handles at or below this value are never issued.
pub const RESERVED_HANDLES: DialHandle = 100;

/// A registered dial function together with its per-attempt timeout.
#[derive(Clone)]
pub struct Dialer {
    pub func: DialFunc,
    pub timeout: Duration,
}

impl Dialer {
    pub fn new(func: DialFunc) -> Self {
        Self {
            func,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

struct Inner {
    last: DialHandle,
    entries: HashMap<DialHandle, Dialer>,
}

/// Thread-safe handle → dialer table.
pub struct DialRegistry {
    inner: Mutex<Inner>,
}

impl DialRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last: RESERVED_HANDLES,
                entries: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries are only ever inserted or removed whole, so a poisoned
        // lock still guards a consistent map.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `dialer` under a freshly allocated handle.
    pub fn register(&self, dialer: Dialer) -> DialHandle {
        let mut inner = self.lock();
        inner.last += 1;
        let handle = inner.last;
        inner.entries.insert(handle, dialer);
        debug!(handle, "registered dialer");
        handle
    }

    /// Look up the dialer for `handle`.
    ///
    /// The returned value is a clone, so the lock is not held while the
    /// dial runs.
    pub fn resolve(&self, handle: DialHandle) -> Option<Dialer> {
        self.lock().entries.get(&handle).cloned()
    }

    /// Drop the entry for `handle`. Returns true if it existed.
    pub fn remove(&self, handle: DialHandle) -> bool {
        let removed = self.lock().entries.remove(&handle).is_some();
        if removed {
            debug!(handle, "removed dialer");
        }
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DialRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: LazyLock<DialRegistry> = LazyLock::new(DialRegistry::new);

/// The process-wide registry consulted by the engine's connect callback.
pub fn registry() -> &'static DialRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use crate::dial::tcp_dialer;

    #[test]
    fn first_handle_is_above_reserved_range() {
        let registry = DialRegistry::new();
        let handle = registry.register(Dialer::new(tcp_dialer()));
        assert_eq!(handle, RESERVED_HANDLES + 1);
    }

    #[test]
    fn handles_strictly_increase() {
        let registry = DialRegistry::new();
        let a = registry.register(Dialer::new(tcp_dialer()));
        let b = registry.register(Dialer::new(tcp_dialer()));
        let c = registry.register(Dialer::new(tcp_dialer()));
        assert!(a < b && b < c);
    }

    #[test]
    fn handles_not_reused_after_remove() {
        let registry = DialRegistry::new();
        let a = registry.register(Dialer::new(tcp_dialer()));
        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        let b = registry.register(Dialer::new(tcp_dialer()));
        assert_ne!(a, b);
        assert!(registry.resolve(a).is_none());
    }

    #[test]
    fn unknown_handle_resolves_to_none() {
        let registry = DialRegistry::new();
        assert!(registry.resolve(42).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_registration_yields_distinct_handles() {
        let registry = Arc::new(DialRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| {
                            let func = tcp_dialer();
                            let handle = registry.register(Dialer::new(Arc::clone(&func)));
                            (handle, func)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for t in threads {
            for (handle, func) in t.join().unwrap() {
                assert!(seen.insert(handle), "handle {handle} issued twice");
                let resolved = registry.resolve(handle).unwrap();
                assert!(Arc::ptr_eq(&resolved.func, &func));
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(registry.len(), 400);
    }

    #[test]
    fn timeout_travels_with_entry() {
        let registry = DialRegistry::new();
        let handle = registry.register(
            Dialer::new(tcp_dialer()).with_timeout(Duration::from_millis(250)),
        );
        let dialer = registry.resolve(handle).unwrap();
        assert_eq!(dialer.timeout, Duration::from_millis(250));
    }
}
