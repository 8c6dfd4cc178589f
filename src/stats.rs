//! Capture counters
//!
//! Drops are never retried or reported per frame; these counters carry the
//! volume instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by producers and the worker
#[derive(Debug)]
pub struct CaptureStats {
    started_at: DateTime<Utc>,
    submitted: AtomicU64,
    filtered: AtomicU64,
    no_consumer: AtomicU64,
    mode_disabled: AtomicU64,
    oversized: AtomicU64,
    pool_exhausted: AtomicU64,
    queue_full: AtomicU64,
    queued: AtomicU64,
    delivered: AtomicU64,
    delivery_failed: AtomicU64,
    dropped_unregistered: AtomicU64,
    flushed: AtomicU64,
}

/// Point-in-time copy of `CaptureStats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub submitted: u64,
    pub filtered: u64,
    pub no_consumer: u64,
    pub mode_disabled: u64,
    pub oversized: u64,
    pub pool_exhausted: u64,
    pub queue_full: u64,
    pub queued: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    pub dropped_unregistered: u64,
    pub flushed: u64,
}

impl StatsSnapshot {
    /// Frames dropped anywhere after passing the filter
    pub fn dropped(&self) -> u64 {
        self.pool_exhausted
            + self.queue_full
            + self.oversized
            + self.dropped_unregistered
            + self.flushed
    }

    /// Queued frames that have not been delivered, failed or dropped yet
    pub fn pending(&self) -> u64 {
        self.queued.saturating_sub(
            self.delivered + self.delivery_failed + self.dropped_unregistered + self.flushed,
        )
    }
}

impl Default for CaptureStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            submitted: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            no_consumer: AtomicU64::new(0),
            mode_disabled: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            queue_full: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            delivery_failed: AtomicU64::new(0),
            dropped_unregistered: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        }
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_submitted, submitted, submitted);
    counter!(record_filtered, filtered, filtered);
    counter!(record_no_consumer, no_consumer, no_consumer);
    counter!(record_mode_disabled, mode_disabled, mode_disabled);
    counter!(record_oversized, oversized, oversized);
    counter!(record_pool_exhausted, pool_exhausted, pool_exhausted);
    counter!(record_queue_full, queue_full, queue_full);
    counter!(record_queued, queued, queued);
    counter!(record_delivered, delivered, delivered);
    counter!(record_delivery_failed, delivery_failed, delivery_failed);
    counter!(record_dropped_unregistered, dropped_unregistered, dropped_unregistered);

    pub fn record_flushed(&self, count: usize) {
        self.flushed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started_at: self.started_at,
            submitted: self.submitted(),
            filtered: self.filtered(),
            no_consumer: self.no_consumer(),
            mode_disabled: self.mode_disabled(),
            oversized: self.oversized(),
            pool_exhausted: self.pool_exhausted(),
            queue_full: self.queue_full(),
            queued: self.queued(),
            delivered: self.delivered(),
            delivery_failed: self.delivery_failed(),
            dropped_unregistered: self.dropped_unregistered(),
            flushed: self.flushed(),
        }
    }
}
