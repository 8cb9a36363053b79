//! Opaque handles for values owned on the native side of a foreign boundary.
//!
//! A foreign runtime cannot hold a Rust value, so the registry keeps it and
//! hands out a non-zero `i64` instead. Zero is never issued, which leaves it
//! free to mean "no handle" on the other side.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// A handle issued by a [`HandleRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(i64);

impl Handle {
    /// Wrap a raw value; `0` is the null handle and yields `None`.
    pub fn from_raw(raw: i64) -> Option<Handle> {
        (raw != 0).then_some(Handle(raw))
    }

    /// The value handed across the boundary.
    pub fn as_raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Thread-safe table from handles to owned values.
///
/// Each value sits behind its own lock, so operations on different handles
/// do not serialize on each other. The table lock is only held to look a
/// handle up.
///
/// # Example
///
/// ```
/// use vdi_relay::HandleRegistry;
///
/// let registry = HandleRegistry::new();
/// let handle = registry.insert(vec![1, 2, 3]);
/// let sum: i32 = registry.with(handle.as_raw(), |v| Ok(v.iter().sum())).unwrap();
/// assert_eq!(sum, 6);
/// assert!(registry.release(handle.as_raw()));
/// assert!(!registry.release(handle.as_raw()));
/// ```
pub struct HandleRegistry<T> {
    next: AtomicI64,
    entries: Mutex<HashMap<i64, Arc<Mutex<T>>>>,
}

impl<T> HandleRegistry<T> {
    /// An empty registry.
    pub fn new() -> Self {
        HandleRegistry {
            next: AtomicI64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Take ownership of `value` and issue a fresh handle for it.
    pub fn insert(&self, value: T) -> Handle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(raw, Arc::new(Mutex::new(value)));
        debug!(handle = raw, "handle issued");
        Handle(raw)
    }

    /// Run `f` on the value behind `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `raw` was never issued or has been
    /// released, otherwise whatever `f` returns.
    pub fn with<U, F>(&self, raw: i64, f: F) -> Result<U>
    where
        F: FnOnce(&mut T) -> Result<U>,
    {
        let entry = self
            .entries
            .lock()
            .get(&raw)
            .cloned()
            .ok_or(Error::InvalidHandle(raw))?;
        let mut value = entry.lock();
        f(&mut *value)
    }

    /// Drop the value behind `raw`. Unknown handles, including `0` and
    /// handles already released, are ignored.
    ///
    /// Returns whether a value was removed. A call running on the value at
    /// the same time keeps it alive until it returns.
    pub fn release(&self, raw: i64) -> bool {
        let removed = self.entries.lock().remove(&raw);
        match removed {
            Some(entry) => {
                // Wait out an in-flight call before dropping.
                drop(entry.lock());
                drop(entry);
                debug!(handle = raw, "handle released");
                true
            }
            None => {
                debug!(handle = raw, "release of unknown handle ignored");
                false
            }
        }
    }

    /// Whether `raw` currently refers to a value.
    pub fn contains(&self, raw: i64) -> bool {
        self.entries.lock().contains_key(&raw)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no handle is live.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandleRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferRole, Capacities};
    use crate::config::TruncationPolicy;
    use crate::local::{LocalComm, LocalRuntime};
    use crate::resources::RelayResources;
    use crate::ExchangeDescriptor;

    #[test]
    fn handles_are_distinct_and_non_zero() {
        let registry = HandleRegistry::new();
        let a = registry.insert("a");
        let b = registry.insert("b");
        assert_ne!(a, b);
        assert_ne!(a.as_raw(), 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(Handle::from_raw(0), None);
        assert_eq!(Handle::from_raw(a.as_raw()), Some(a));
    }

    #[test]
    fn unknown_handles_are_rejected() {
        let registry: HandleRegistry<u32> = HandleRegistry::new();
        let err = registry.with(42, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::InvalidHandle(42)));
    }

    #[test]
    fn release_is_idempotent() {
        let registry = HandleRegistry::new();
        let handle = registry.insert(5u8);
        assert!(registry.release(handle.as_raw()));
        assert!(!registry.release(handle.as_raw()));
        assert!(!registry.release(0));
        assert!(registry.is_empty());
        assert!(matches!(
            registry.with(handle.as_raw(), |_| Ok(())),
            Err(Error::InvalidHandle(_))
        ));
    }

    #[test]
    fn handles_are_never_reused() {
        let registry = HandleRegistry::new();
        let first = registry.insert(());
        registry.release(first.as_raw());
        let second = registry.insert(());
        assert_ne!(first, second);
    }

    #[test]
    fn relay_resources_round_trip_through_a_handle() {
        let runtime = LocalRuntime::new();
        let registry = HandleRegistry::new();
        let resources =
            RelayResources::initialize(runtime.clone(), Capacities::new(8, 8, 8), TruncationPolicy::Truncate)
                .unwrap();
        let handle = registry.insert(resources).as_raw();

        let comm = LocalComm::solo();
        let bytes = registry
            .with(handle, |res| {
                let descriptor = ExchangeDescriptor::from_counts(vec![4], vec![4])?;
                Ok(res
                    .distribute(&comm, BufferRole::Color, &[5; 4], &descriptor)?
                    .to_vec())
            })
            .unwrap();
        assert_eq!(bytes, [5; 4]);

        assert!(registry.release(handle));
        assert_eq!(runtime.shutdowns(), 1);
        assert!(!registry.release(handle));
        assert_eq!(runtime.shutdowns(), 1);
    }

    #[test]
    fn concurrent_handles_do_not_interfere() {
        let registry = HandleRegistry::new();
        let handles: Vec<i64> = (0..4).map(|i| registry.insert(i * 100).as_raw()).collect();
        std::thread::scope(|scope| {
            for &handle in &handles {
                let registry = &registry;
                scope.spawn(move || {
                    for _ in 0..1000 {
                        registry.with(handle, |v| {
                            *v += 1;
                            Ok(())
                        })
                        .unwrap();
                    }
                });
            }
        });
        let values: Vec<i32> = handles
            .iter()
            .map(|&h| registry.with(h, |v| Ok(*v)).unwrap())
            .collect();
        assert_eq!(values, [1000, 1100, 1200, 1300]);
    }
}
