//! Coalescing statistics.
//!
//! Counters are plain atomics updated with relaxed ordering. They are
//! observational only and never take part in a coalescing decision.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of coalescer statistics for monitoring effectiveness.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Total requests received, including rejected ones
    pub total_requests: u64,
    /// Requests that started a new computation
    pub new_requests: u64,
    /// Requests that joined an existing computation
    pub coalesced_requests: u64,
    /// Requests rejected with an invalid argument
    pub rejected_requests: u64,
    /// Computations that produced a value
    pub succeeded: u64,
    /// Computations that returned an error or panicked
    pub failed: u64,
    /// Computations that were cancelled or aborted
    pub cancelled: u64,
    /// Computations that hit the factory timeout
    pub timed_out: u64,
}

impl CoalescerStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        let accepted = self.new_requests + self.coalesced_requests;
        if accepted == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / accepted as f64
        }
    }

    /// Returns the number of computations that have settled, whatever the outcome.
    pub fn settled(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled + self.timed_out
    }
}

/// How a shared computation settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

/// Live counters shared between the coalescer and its spawned computations.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    total_requests: AtomicU64,
    new_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    rejected_requests: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_new(&self) {
        self.new_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a joined request and returns the running coalesced total.
    pub(crate) fn record_coalesced(&self) -> u64 {
        self.coalesced_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_settlement(&self, settlement: Settlement) {
        let counter = match settlement {
            Settlement::Succeeded => &self.succeeded,
            Settlement::Failed => &self.failed,
            Settlement::Cancelled => &self.cancelled,
            Settlement::TimedOut => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CoalescerStats {
        CoalescerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}
