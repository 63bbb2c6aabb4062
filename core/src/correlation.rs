//! Correlation table: the registry of calls waiting for a reply.
//!
//! Every pending entry is completed by exactly one of three triggers: a
//! matching reply (`resolve`), its deadline timer (`expire`), or an explicit
//! `cancel`. The map's atomic remove is the single point of truth; whichever
//! trigger removes the entry performs the completion, the others find nothing
//! and return `false`.
//!
//! Each entry carries a generation number. Its deadline timer only expires
//! the generation it was created for, so a timer that lost the race can never
//! expire a newer entry registered later under the same key.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::{BusError, Result};

/// Terminal state of a pending call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Matched(T),
    TimedOut,
    /// Removed without a reply or timeout (publish failure, shutdown).
    Cancelled,
}

struct PendingEntry<T> {
    generation: u64,
    completion: oneshot::Sender<Outcome<T>>,
    timer: JoinHandle<()>,
    registered_at: Instant,
}

impl<T> PendingEntry<T> {
    fn complete(self, outcome: Outcome<T>) {
        // The receiver may be gone if the caller stopped waiting; nothing to do then.
        let _ = self.completion.send(outcome);
    }
}

struct Inner<T> {
    entries: DashMap<String, PendingEntry<T>>,
    next_generation: AtomicU64,
}

impl<T> Inner<T> {
    fn expire_generation(&self, key: &str, generation: u64) -> bool {
        match self
            .entries
            .remove_if(key, |_, entry| entry.generation == generation)
        {
            Some((_, entry)) => {
                debug!(
                    target: "correlation",
                    key = %key,
                    waited_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "Pending call timed out"
                );
                entry.complete(Outcome::TimedOut);
                true
            }
            None => false,
        }
    }

    fn discard_generation(&self, key: &str, generation: u64) {
        if let Some((_, entry)) = self
            .entries
            .remove_if(key, |_, entry| entry.generation == generation)
        {
            trace!(target: "correlation", key = %key, "Discarding abandoned pending call");
            entry.timer.abort();
        }
    }
}

/// Concurrency-safe registry mapping correlation key → waiting caller.
///
/// Cloning is cheap and shares the same table.
///
/// # Examples
///
/// ```
/// use market_bus_core::{CorrelationTable, Outcome};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let table: CorrelationTable<&'static str> = CorrelationTable::new();
/// let handle = table.register("key-1", Duration::from_secs(5)).unwrap();
/// assert_eq!(table.len(), 1);
///
/// assert!(table.resolve("key-1", "done"));
/// assert!(!table.resolve("key-1", "again")); // first writer wins
/// assert_eq!(handle.wait().await, Outcome::Matched("done"));
/// assert!(table.is_empty());
/// # }
/// ```
pub struct CorrelationTable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CorrelationTable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for CorrelationTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.inner.entries.len())
            .finish()
    }
}

impl<T: Send + 'static> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Inserts a pending entry for `key` if none is live and starts its
    /// deadline timer. Must be called from within a tokio runtime.
    ///
    /// Returns [`BusError::DuplicateKey`] when `key` is already in flight.
    pub fn register(&self, key: impl Into<String>, timeout: Duration) -> Result<ReplyHandle<T>> {
        let key = key.into();
        match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(_) => Err(BusError::DuplicateKey(key)),
            Entry::Vacant(slot) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();

                let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
                let timer_key = key.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.expire_generation(&timer_key, generation);
                    }
                });

                slot.insert(PendingEntry {
                    generation,
                    completion: tx,
                    timer,
                    registered_at: Instant::now(),
                });
                trace!(target: "correlation", key = %key, timeout_ms = timeout.as_millis() as u64, "Registered pending call");

                Ok(ReplyHandle {
                    key,
                    generation,
                    rx,
                    table: Arc::downgrade(&self.inner),
                })
            }
        }
    }

    /// Completes the entry for `key` with `payload`. Returns `false` when no
    /// entry is live (late, duplicate or foreign reply).
    pub fn resolve(&self, key: &str, payload: T) -> bool {
        match self.inner.entries.remove(key) {
            Some((_, entry)) => {
                entry.timer.abort();
                entry.complete(Outcome::Matched(payload));
                true
            }
            None => false,
        }
    }

    /// Completes the entry for `key` with [`Outcome::TimedOut`]. Returns
    /// `false` when a reply already won the race.
    pub fn expire(&self, key: &str) -> bool {
        match self.inner.entries.remove(key) {
            Some((_, entry)) => {
                entry.timer.abort();
                entry.complete(Outcome::TimedOut);
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `key` without a reply or timeout; its handle
    /// observes [`Outcome::Cancelled`].
    pub fn cancel(&self, key: &str) -> bool {
        match self.inner.entries.remove(key) {
            Some((_, entry)) => {
                entry.timer.abort();
                debug!(target: "correlation", key = %key, "Pending call cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every pending entry. Returns how many were removed.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

/// Caller's side of a pending entry.
///
/// Dropping the handle before it completes removes the entry from the table,
/// so a caller that stops waiting never leaves a residue behind.
pub struct ReplyHandle<T> {
    key: String,
    generation: u64,
    rx: oneshot::Receiver<Outcome<T>>,
    table: Weak<Inner<T>>,
}

impl<T> ReplyHandle<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the entry's terminal state.
    pub async fn wait(mut self) -> Outcome<T> {
        (&mut self.rx).await.unwrap_or(Outcome::Cancelled)
    }
}

impl<T> fmt::Debug for ReplyHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> Drop for ReplyHandle<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.table.upgrade() {
            inner.discard_generation(&self.key, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn duplicate_key_is_rejected_while_in_flight() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let _first = table.register("k", Duration::from_secs(5)).unwrap();
        let second = table.register("k", Duration::from_secs(5));
        assert!(matches!(second, Err(BusError::DuplicateKey(ref k)) if k == "k"));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn timer_expires_entry() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let handle = table.register("k", Duration::from_millis(30)).unwrap();
        assert_eq!(handle.wait().await, Outcome::TimedOut);
        assert!(table.is_empty());
        assert!(!table.resolve("k", 1), "late reply is a no-op");
    }

    #[tokio::test]
    async fn resolve_then_expire_is_noop() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let handle = table.register("k", Duration::from_secs(5)).unwrap();
        assert!(table.resolve("k", 7));
        assert!(!table.expire("k"));
        assert!(!table.cancel("k"));
        assert_eq!(handle.wait().await, Outcome::Matched(7));
    }

    #[tokio::test]
    async fn cancel_completes_handle_as_cancelled() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let handle = table.register("k", Duration::from_secs(5)).unwrap();
        assert!(table.cancel("k"));
        assert_eq!(handle.wait().await, Outcome::Cancelled);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn stale_timer_does_not_expire_a_newer_entry() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let first = table.register("k", Duration::from_millis(20)).unwrap();
        assert!(table.resolve("k", 1));
        assert_eq!(first.wait().await, Outcome::Matched(1));

        let second = table.register("k", Duration::from_secs(5)).unwrap();
        sleep(Duration::from_millis(60)).await;
        assert!(table.contains("k"));
        assert!(table.resolve("k", 2));
        assert_eq!(second.wait().await, Outcome::Matched(2));
    }

    #[tokio::test]
    async fn dropping_handle_removes_entry() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let handle = table.register("k", Duration::from_secs(5)).unwrap();
        drop(handle);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn dropped_handle_leaves_newer_generation_alone() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let stale = table.register("k", Duration::from_secs(5)).unwrap();
        assert!(table.cancel("k"));
        let _fresh = table.register("k", Duration::from_secs(5)).unwrap();
        drop(stale);
        assert!(table.contains("k"));
    }

    #[tokio::test]
    async fn cancel_all_drains_the_table() {
        let table: CorrelationTable<u32> = CorrelationTable::new();
        let a = table.register("a", Duration::from_secs(5)).unwrap();
        let b = table.register("b", Duration::from_secs(5)).unwrap();
        assert_eq!(table.cancel_all(), 2);
        assert_eq!(a.wait().await, Outcome::Cancelled);
        assert_eq!(b.wait().await, Outcome::Cancelled);
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_resolve_and_expire_complete_each_call_once() {
        let table: CorrelationTable<u32> = CorrelationTable::new();

        for round in 0..200u32 {
            let key = format!("k-{round}");
            let handle = table.register(key.clone(), Duration::from_millis(1)).unwrap();
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let resolver = tokio::spawn({
                let (table, key, barrier) = (table.clone(), key.clone(), Arc::clone(&barrier));
                async move {
                    barrier.wait().await;
                    table.resolve(&key, round)
                }
            });
            let expirer = tokio::spawn({
                let (table, barrier) = (table.clone(), Arc::clone(&barrier));
                async move {
                    barrier.wait().await;
                    table.expire(&key)
                }
            });

            let resolved = resolver.await.unwrap();
            let expired = expirer.await.unwrap();
            assert!(!(resolved && expired), "round {round} completed twice");

            match handle.wait().await {
                Outcome::Matched(n) => {
                    assert!(resolved);
                    assert_eq!(n, round);
                }
                Outcome::TimedOut => assert!(!resolved),
                Outcome::Cancelled => panic!("round {round} was cancelled"),
            }
        }
        assert!(table.is_empty());
    }
}
