//! Request coalescing for expensive, keyed computations.
//!
//! When many callers ask for the value of the same key at once, only one
//! computation ("factory") runs - every other caller waits for and receives
//! the same outcome. Once the computation settles the key is released, so
//! the next request for it starts a fresh computation. Nothing is cached
//! beyond the lifetime of the in-flight computation.
//!
//! # Architecture
//!
//! ```text
//! Caller A ─┐
//!           │                                 Spawned
//! Caller B ─┼──► RequestCoalescer ──────────► computation
//!           │        │                             │
//! Caller C ─┘        │                             │
//!                    ▼                             ▼
//!              [A, B, C all                  [factory runs
//!               receive same                  exactly once]
//!               outcome]◄────── broadcast ─────────┘
//! ```
//!
//! # Implementation
//!
//! Uses `DashMap`'s entry API for the atomic claim-or-join step: the first
//! registrant for a key inserts an in-flight entry and spawns
//! the computation; every concurrent registrant subscribes to that
//! entry's broadcast channel while holding the shard lock. The factories
//! supplied by joiners are dropped without being called.
//!
//! The spawned task owns an entry guard that removes the entry when the
//! computation settles (value, error, panic, timeout or cancellation) and
//! also when the task is aborted. The entry is removed *before* the outcome
//! is broadcast, so no caller can join an epoch that has already settled.
//!
//! # Cancellation
//!
//! Dropping a `get_or_run` future only stops that caller waiting; the shared
//! computation continues for the remaining waiters. Shared cancellation is
//! explicit, through [`RequestCoalescer::cancel`] and
//! [`RequestCoalescer::shutdown`], and reaches every waiter as
//! [`CoalesceError::Cancelled`].

mod entry;
mod key;
mod stats;

pub use key::CoalesceKey;
pub use stats::CoalescerStats;

use crate::config::CoalescerConfig;
use crate::error::{CoalesceError, InvalidArgumentReason};
use dashmap::mapref::entry::Entry;
use entry::{settle, EntryGuard, InFlightEntry, InFlightMap, Outcome};
use stats::{Settlement, StatsCounters};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deduplicates concurrent computations per key.
///
/// Cloning is cheap and every clone shares the same in-flight map.
///
/// # Example
///
/// ```
/// use stampede::coalesce::RequestCoalescer;
///
/// # #[tokio::main]
/// # async fn main() {
/// let coalescer: RequestCoalescer<String, String, std::io::Error> = RequestCoalescer::new();
///
/// let name = coalescer
///     .get_or_run("user:42".to_string(), || async { Ok("Alice".to_string()) })
///     .await
///     .unwrap();
///
/// assert_eq!(name, "Alice");
/// assert_eq!(coalescer.in_flight_count(), 0);
/// # }
/// ```
pub struct RequestCoalescer<K: CoalesceKey, T, E> {
    inner: Arc<Inner<K, T, E>>,
}

struct Inner<K: CoalesceKey, T, E> {
    in_flight: Arc<InFlightMap<K, T, E>>,
    stats: Arc<StatsCounters>,
    next_epoch: AtomicU64,
    /// Parent of every entry's cancellation token
    shutdown: CancellationToken,
    config: CoalescerConfig,
}

/// Result of attempting to register a request.
enum Registration<K: CoalesceKey, T, E> {
    /// First request for the key - caller spawns the computation
    Started {
        guard: EntryGuard<K, T, E>,
        sender: broadcast::Sender<Outcome<T, E>>,
        receiver: broadcast::Receiver<Outcome<T, E>>,
        cancellation: CancellationToken,
    },
    /// A computation is already in flight - wait on this receiver
    Joined(broadcast::Receiver<Outcome<T, E>>),
}

impl<K, T, E> RequestCoalescer<K, T, E>
where
    K: CoalesceKey,
    T: Clone + Send + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a new request coalescer with default configuration.
    pub fn new() -> Self {
        Self::with_config(CoalescerConfig::default())
    }

    /// Creates a new request coalescer with the given configuration.
    pub fn with_config(config: CoalescerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                in_flight: Arc::new(InFlightMap::new()),
                stats: Arc::new(StatsCounters::default()),
                next_epoch: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                config,
            }),
        }
    }

    /// Returns the configuration this coalescer was built with.
    pub fn config(&self) -> &CoalescerConfig {
        &self.inner.config
    }

    /// Returns the value for `key`, running `factory` only if no computation
    /// for `key` is already in flight.
    ///
    /// Concurrent callers for the same key share one computation: the first
    /// registrant's factory runs exactly once and every caller receives a
    /// clone of its value, or the same [`CoalesceError`]. Factories passed by
    /// the other callers are dropped without being called. After the
    /// computation settles, the next call for `key` runs its factory again.
    ///
    /// # Errors
    ///
    /// - [`CoalesceError::InvalidArgument`] if `key` is blank; nothing is
    ///   registered and `factory` is not called
    /// - [`CoalesceError::Factory`] with the factory's own error
    /// - [`CoalesceError::Panicked`] if the factory panicked
    /// - [`CoalesceError::Cancelled`] if the computation was cancelled
    /// - [`CoalesceError::TimedOut`] if the configured factory timeout expired
    ///
    /// Must be called from within a tokio runtime.
    pub async fn get_or_run<F, Fut>(&self, key: K, factory: F) -> Result<T, CoalesceError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.get_or_run_cancellable(key, move |_| factory()).await
    }

    /// Like [`get_or_run`](Self::get_or_run), but hands the factory the
    /// computation's shared cancellation token.
    ///
    /// The token fires when the computation is cancelled through
    /// [`cancel`](Self::cancel) or [`shutdown`](Self::shutdown), letting the
    /// factory stop cooperatively (for example to abort an outbound request).
    pub async fn get_or_run_cancellable<F, Fut>(
        &self,
        key: K,
        factory: F,
    ) -> Result<T, CoalesceError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let receiver = match self.register(key)? {
            Registration::Joined(receiver) => receiver,
            Registration::Started {
                guard,
                sender,
                receiver,
                cancellation,
            } => {
                self.spawn_computation(guard, sender, cancellation, factory);
                receiver
            }
        };

        Self::wait(receiver).await
    }

    /// Atomically claims `key` for a new computation or joins the existing one.
    fn register(&self, key: K) -> Result<Registration<K, T, E>, CoalesceError<E>> {
        let inner = &self.inner;
        inner.stats.record_request();

        if key.is_blank() {
            inner.stats.record_rejected();
            debug!(key = ?key, "Rejecting request with blank key");
            return Err(CoalesceError::InvalidArgument(
                InvalidArgumentReason::EmptyKey,
            ));
        }

        // Entry API keeps check-and-insert indivisible
        match inner.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                let receiver = entry.sender.subscribe();
                let coalesced = inner.stats.record_coalesced();
                debug!(
                    key = ?key,
                    epoch = entry.epoch,
                    coalesced,
                    "Coalescing request - waiting for in-flight computation"
                );
                Ok(Registration::Joined(receiver))
            }
            Entry::Vacant(vacant) => {
                let epoch = inner.next_epoch.fetch_add(1, Ordering::Relaxed);
                // One message per channel, so capacity 1 never lags
                let (sender, receiver) = broadcast::channel(1);
                let cancellation = inner.shutdown.child_token();

                vacant.insert(InFlightEntry {
                    epoch,
                    sender: sender.clone(),
                    cancellation: cancellation.clone(),
                    started_at: Instant::now(),
                });
                inner.stats.record_new();
                debug!(key = ?key, epoch, "New request - starting computation");

                let guard = EntryGuard::new(
                    Arc::clone(&inner.in_flight),
                    Arc::clone(&inner.stats),
                    key,
                    epoch,
                );
                Ok(Registration::Started {
                    guard,
                    sender,
                    receiver,
                    cancellation,
                })
            }
        }
    }

    /// Spawns the shared computation for a freshly claimed key.
    ///
    /// The task owns the entry guard, so the entry is released even if the
    /// task never runs to completion.
    fn spawn_computation<F, Fut>(
        &self,
        guard: EntryGuard<K, T, E>,
        sender: broadcast::Sender<Outcome<T, E>>,
        cancellation: CancellationToken,
        factory: F,
    ) where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let stats = Arc::clone(&self.inner.stats);
        let config = self.inner.config;

        tokio::spawn(async move {
            let started = Instant::now();
            let token = cancellation.clone();
            // Factory is invoked on first poll, inside the panic boundary
            let computation = async move { factory(token).await };
            let outcome = settle(computation, cancellation, config.factory_timeout()).await;
            let elapsed = started.elapsed();

            let settlement = Settlement::of(&outcome);
            stats.record_settlement(settlement);

            let key = guard.key().clone();
            let epoch = guard.epoch();
            guard.release();

            if let Err(CoalesceError::Panicked(msg)) = &outcome {
                warn!(key = ?key, epoch, panic = %msg, "Factory panicked");
            }
            if elapsed > config.slow_threshold() {
                warn!(
                    key = ?key,
                    epoch,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Slow in-flight computation"
                );
            }

            // Receivers may all have been dropped; the outcome is then unobserved
            let waiters = sender.receiver_count();
            let _ = sender.send(outcome);

            debug!(
                key = ?key,
                epoch,
                waiters,
                outcome = ?settlement,
                elapsed_ms = elapsed.as_millis() as u64,
                "Broadcast outcome to {} waiters",
                waiters
            );
        });
    }

    async fn wait(mut receiver: broadcast::Receiver<Outcome<T, E>>) -> Result<T, CoalesceError<E>> {
        match receiver.recv().await {
            Ok(outcome) => outcome,
            // Sender dropped without a value: the computation was aborted
            Err(_) => Err(CoalesceError::Cancelled),
        }
    }

    /// Cancels the in-flight computation for `key`, if any.
    ///
    /// Every waiter bound to it receives [`CoalesceError::Cancelled`]. The key
    /// is released immediately, so a request made after this returns starts
    /// a fresh computation. Returns false if nothing was in flight.
    pub fn cancel(&self, key: &K) -> bool {
        match self.inner.in_flight.remove(key) {
            Some((_, entry)) => {
                entry.cancellation.cancel();
                debug!(
                    key = ?key,
                    epoch = entry.epoch,
                    running_ms = entry.started_at.elapsed().as_millis() as u64,
                    "Cancelled in-flight computation - waiters will receive error"
                );
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight computation and every computation started later.
    ///
    /// After shutdown, requests still register and coalesce as usual, but
    /// their computations settle as [`CoalesceError::Cancelled`] without
    /// invoking a factory.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        info!(
            in_flight = self.in_flight_count(),
            "Request coalescer shut down - cancelling in-flight computations"
        );
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Returns true if a computation for `key` is currently in flight.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inner.in_flight.contains_key(key)
    }

    /// Returns the number of currently in-flight computations.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Returns a snapshot of the current statistics.
    pub fn stats(&self) -> CoalescerStats {
        self.inner.stats.snapshot()
    }

    /// Logs current statistics.
    pub fn log_stats(&self) {
        let stats = self.stats();
        let in_flight_count = self.in_flight_count();

        info!(
            total_requests = stats.total_requests,
            new_requests = stats.new_requests,
            coalesced = stats.coalesced_requests,
            rejected = stats.rejected_requests,
            succeeded = stats.succeeded,
            failed = stats.failed,
            cancelled = stats.cancelled,
            timed_out = stats.timed_out,
            in_flight = in_flight_count,
            coalescing_ratio = format!("{:.1}%", stats.coalescing_ratio() * 100.0),
            "Request coalescing statistics"
        );
    }
}

impl<K, T, E> Default for RequestCoalescer<K, T, E>
where
    K: CoalesceKey,
    T: Clone + Send + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CoalesceKey, T, E> Clone for RequestCoalescer<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    #[derive(Debug, PartialEq, thiserror::Error)]
    #[error("boom: {0}")]
    struct BoomError(String);

    type TestCoalescer = RequestCoalescer<String, String, BoomError>;

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[tokio::test]
    async fn test_single_request_runs_factory() {
        let coalescer = TestCoalescer::new();

        let value = coalescer
            .get_or_run(key("user:42"), || async { Ok("Alice".to_string()) })
            .await
            .unwrap();

        assert_eq!(value, "Alice");
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_key_rejected_without_calling_factory() {
        let coalescer = TestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let result = coalescer
            .get_or_run(key(""), move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok("never".to_string())
            })
            .await;

        match result {
            Err(CoalesceError::InvalidArgument(InvalidArgumentReason::EmptyKey)) => {}
            other => panic!("Expected invalid argument, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coalescer.in_flight_count(), 0);

        let stats = coalescer.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.rejected_requests, 1);
        assert_eq!(stats.new_requests, 0);
    }

    #[tokio::test]
    async fn test_second_request_joins_in_flight() {
        let coalescer = TestCoalescer::new();
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let (r, c) = (Arc::clone(&release), Arc::clone(&calls));
        let first = tokio::spawn({
            let coalescer = coalescer.clone();
            async move {
                coalescer
                    .get_or_run(key("k"), move || async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        r.notified().await;
                        Ok("first".to_string())
                    })
                    .await
            }
        });

        // Wait until the first computation is registered
        while !coalescer.is_in_flight(&key("k")) {
            tokio::task::yield_now().await;
        }

        let c = Arc::clone(&calls);
        let second = tokio::spawn({
            let coalescer = coalescer.clone();
            async move {
                coalescer
                    .get_or_run(key("k"), move || async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok("second".to_string())
                    })
                    .await
            }
        });

        while coalescer.stats().coalesced_requests < 1 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        assert_eq!(first.await.unwrap().unwrap(), "first");
        assert_eq!(second.await.unwrap().unwrap(), "first");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_nullable_value_is_a_valid_outcome() {
        let coalescer: RequestCoalescer<String, Option<String>, BoomError> =
            RequestCoalescer::new();

        let value = coalescer
            .get_or_run(key("missing"), || async { Ok(None) })
            .await
            .unwrap();

        assert_eq!(value, None);
        assert_eq!(coalescer.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_factory_error_is_shared_verbatim() {
        let coalescer = TestCoalescer::new();

        let err = coalescer
            .get_or_run(key("x"), || async { Err(BoomError("bad".to_string())) })
            .await
            .unwrap_err();

        assert_eq!(err.factory_error(), Some(&BoomError("bad".to_string())));
        assert_eq!(err.to_string(), "boom: bad");
        assert_eq!(coalescer.stats().failed, 1);
        assert!(!coalescer.is_in_flight(&key("x")));
    }

    #[tokio::test]
    async fn test_panicking_factory_releases_key() {
        let coalescer = TestCoalescer::new();

        let err = coalescer
            .get_or_run(key("p"), || -> std::future::Ready<Result<String, BoomError>> {
                panic!("invoked and exploded")
            })
            .await
            .unwrap_err();

        match err {
            CoalesceError::Panicked(msg) => assert_eq!(msg.as_ref(), "invoked and exploded"),
            other => panic!("Expected panic error, got {:?}", other),
        }
        assert_eq!(coalescer.in_flight_count(), 0);

        // Key is usable again
        let value = coalescer
            .get_or_run(key("p"), || async { Ok("recovered".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "recovered");
    }

    #[tokio::test]
    async fn test_cancel_delivers_cancelled_and_releases_key() {
        let coalescer = TestCoalescer::new();
        let (started_tx, started_rx) = oneshot::channel();

        let handle = tokio::spawn({
            let coalescer = coalescer.clone();
            async move {
                coalescer
                    .get_or_run(key("slow"), move || async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok("late".to_string())
                    })
                    .await
            }
        });

        started_rx.await.unwrap();
        assert!(coalescer.cancel(&key("slow")));
        assert!(!coalescer.is_in_flight(&key("slow")));

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(!coalescer.cancel(&key("slow")));
    }

    #[tokio::test]
    async fn test_cancellable_factory_observes_token() {
        let coalescer = TestCoalescer::new();
        let (started_tx, started_rx) = oneshot::channel();

        let handle = tokio::spawn({
            let coalescer = coalescer.clone();
            async move {
                coalescer
                    .get_or_run_cancellable(key("coop"), move |token| async move {
                        let _ = started_tx.send(token.clone());
                        token.cancelled().await;
                        Ok("stopped".to_string())
                    })
                    .await
            }
        });

        let token = started_rx.await.unwrap();
        assert!(!token.is_cancelled());
        coalescer.cancel(&key("coop"));
        assert!(token.is_cancelled());

        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_future_computations() {
        let coalescer = TestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        coalescer.shutdown();
        assert!(coalescer.is_shutdown());

        let c = Arc::clone(&calls);
        let err = coalescer
            .get_or_run(key("after"), move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok("never".to_string())
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coalescer.in_flight_count(), 0);
        assert_eq!(coalescer.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_factory_timeout() {
        let config = CoalescerConfig::new().with_factory_timeout(Duration::from_millis(20));
        let coalescer = TestCoalescer::with_config(config);

        let err = coalescer
            .get_or_run(key("t"), || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("late".to_string())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(coalescer.stats().timed_out, 1);
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_cancel_shared_computation() {
        let coalescer = TestCoalescer::new();
        let release = Arc::new(Notify::new());

        let r = Arc::clone(&release);
        let first = tokio::spawn({
            let coalescer = coalescer.clone();
            async move {
                coalescer
                    .get_or_run(key("shared"), move || async move {
                        r.notified().await;
                        Ok("done".to_string())
                    })
                    .await
            }
        });

        while !coalescer.is_in_flight(&key("shared")) {
            tokio::task::yield_now().await;
        }

        // A joiner that gives up waiting
        let impatient = tokio::time::timeout(
            Duration::from_millis(10),
            coalescer.get_or_run(key("shared"), || async { Ok("unused".to_string()) }),
        )
        .await;
        assert!(impatient.is_err());
        assert!(coalescer.is_in_flight(&key("shared")));

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), "done");
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let coalescer = TestCoalescer::new();
        let clone = coalescer.clone();

        clone
            .get_or_run(key("a"), || async { Ok("v".to_string()) })
            .await
            .unwrap();

        assert_eq!(coalescer.stats().new_requests, 1);
        assert_eq!(coalescer.config(), clone.config());
    }

    #[tokio::test]
    async fn test_log_stats_does_not_panic() {
        let coalescer = TestCoalescer::default();
        coalescer
            .get_or_run(key("a"), || async { Ok("v".to_string()) })
            .await
            .unwrap();
        coalescer.log_stats();
    }
}
