//! Per-address reconnect windows for indexing servers.
//!
//! The first failure opens a window of `min_interval`. Attempts inside the window are refused
//! and leave the record untouched. The first attempt after the window is allowed and widens the
//! window to `min(interval * multiplier, max_interval)`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectRecord {
    pub last_attempt: Instant,
    pub interval: Duration,
}

impl ReconnectRecord {
    fn window_open(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_attempt) < self.interval
    }
}

#[derive(Debug)]
pub struct BackoffTable {
    records: DashMap<String, ReconnectRecord>,
    min_interval: Duration,
    multiplier: u32,
    max_interval: Duration,
}

impl BackoffTable {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            records: DashMap::new(),
            min_interval: config.min_interval(),
            multiplier: config.multiplier.max(1),
            max_interval: config.max_interval(),
        }
    }

    /// Records a failed attempt against `address` and says whether a new attempt may go out now.
    ///
    /// The read-decide-write runs under the entry's shard lock, so two concurrent failures for one
    /// address never both get through the same window.
    pub fn record_failure_and_check_backoff(&self, address: &str, now: Instant) -> bool {
        match self.records.entry(address.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(ReconnectRecord {
                    last_attempt: now,
                    interval: self.min_interval,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.window_open(now) {
                    debug!(
                        sp = %address,
                        interval_secs = record.interval.as_secs(),
                        "Reconnect refused inside backoff window"
                    );
                    return false;
                }
                record.interval = record
                    .interval
                    .saturating_mul(self.multiplier)
                    .min(self.max_interval);
                record.last_attempt = now;
                true
            }
        }
    }

    pub fn can_connect(&self, address: &str, now: Instant) -> bool {
        self.records
            .get(address)
            .map(|record| !record.window_open(now))
            .unwrap_or(true)
    }

    pub fn record(&self, address: &str) -> Option<ReconnectRecord> {
        self.records.get(address).map(|record| *record)
    }
}
