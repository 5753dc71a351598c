//! In-flight entries and the machinery that settles them.

use super::key::CoalesceKey;
use super::stats::{Settlement, StatsCounters};
use crate::error::CoalesceError;
use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The single outcome broadcast to every waiter of an entry.
pub(crate) type Outcome<T, E> = Result<T, CoalesceError<E>>;

/// Map of keys to their in-flight computation.
pub(crate) type InFlightMap<K, T, E> = DashMap<K, InFlightEntry<T, E>>;

/// A computation currently bound to a key.
pub(crate) struct InFlightEntry<T, E> {
    /// Identity of this entry; never reused by the same coalescer
    pub(crate) epoch: u64,
    /// Used by joiners to subscribe to the outcome
    pub(crate) sender: broadcast::Sender<Outcome<T, E>>,
    /// Cancels the shared computation for every waiter
    pub(crate) cancellation: CancellationToken,
    pub(crate) started_at: Instant,
}

impl Settlement {
    pub(crate) fn of<T, E>(outcome: &Outcome<T, E>) -> Self {
        match outcome {
            Ok(_) => Settlement::Succeeded,
            Err(CoalesceError::Cancelled) => Settlement::Cancelled,
            Err(CoalesceError::TimedOut(_)) => Settlement::TimedOut,
            Err(_) => Settlement::Failed,
        }
    }
}

/// Removes an entry from the in-flight map exactly once.
///
/// Removal only succeeds while the key still maps to this guard's epoch, so a
/// late cleanup never evicts a newer computation for the same key. If the
/// guard is dropped without [`release`](Self::release) (the owning task was
/// aborted), the settlement is recorded as cancelled.
pub(crate) struct EntryGuard<K: CoalesceKey, T, E> {
    in_flight: Arc<InFlightMap<K, T, E>>,
    stats: Arc<StatsCounters>,
    key: K,
    epoch: u64,
    released: bool,
}

impl<K: CoalesceKey, T, E> EntryGuard<K, T, E> {
    pub(crate) fn new(
        in_flight: Arc<InFlightMap<K, T, E>>,
        stats: Arc<StatsCounters>,
        key: K,
        epoch: u64,
    ) -> Self {
        Self {
            in_flight,
            stats,
            key,
            epoch,
            released: false,
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Removes the entry after normal settlement.
    ///
    /// Returns false if the entry had already been removed (for example by an
    /// explicit cancel).
    pub(crate) fn release(mut self) -> bool {
        self.released = true;
        self.remove()
    }

    fn remove(&self) -> bool {
        let epoch = self.epoch;
        self.in_flight
            .remove_if(&self.key, |_, entry| entry.epoch == epoch)
            .is_some()
    }
}

impl<K: CoalesceKey, T, E> Drop for EntryGuard<K, T, E> {
    fn drop(&mut self) {
        if !self.released {
            self.remove();
            self.stats.record_settlement(Settlement::Cancelled);
            debug!(
                key = ?self.key,
                epoch = self.epoch,
                "In-flight computation aborted - entry released"
            );
        }
    }
}

/// Drives a computation to its single outcome.
///
/// Cancellation is checked before the computation is first polled, so a
/// computation cancelled before it starts never invokes its factory. Panics
/// raised while polling are captured and reported as
/// [`CoalesceError::Panicked`].
pub(crate) async fn settle<T, E, Fut>(
    computation: Fut,
    cancellation: CancellationToken,
    timeout: Option<Duration>,
) -> Outcome<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let guarded = AssertUnwindSafe(computation).catch_unwind();
    let bounded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| CoalesceError::TimedOut(limit)),
            None => Ok(guarded.await),
        }
    };

    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(CoalesceError::Cancelled),
        result = bounded => match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(CoalesceError::Factory(Arc::new(e))),
            Ok(Err(payload)) => Err(CoalesceError::Panicked(panic_message(payload.as_ref()).into())),
            Err(e) => Err(e),
        },
    }
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
