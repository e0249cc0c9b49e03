//! Per-key asynchronous mutual exclusion.
//!
//! Every RPC re-derives state from the hypervisor or the mount table and then
//! acts on it. Two concurrent RPCs for the same volume (or the same path)
//! would otherwise interleave their read-decide-act sequences. [`KeyedLocks`]
//! serializes them per key while letting different keys proceed in parallel.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// A table of named async mutexes.
///
/// Entries only live while somebody holds or waits for the key, so the table
/// does not grow with the number of volumes ever seen.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    inner: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        // Clone the Arc under the shard lock, then release the shard before
        // awaiting the mutex.
        let mutex = Arc::clone(
            self.inner
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        trace!(key, "waiting for key lock");
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_owned(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Holds a key of a [`KeyedLocks`] table until dropped.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own reference left: nobody holds or waits.
        self.locks
            .inner
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}
