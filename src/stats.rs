//! Counters for fetch and install outcomes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Summary of one successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Bucket that was populated.
    pub cache_name: String,
    /// Number of assets stored.
    pub assets: usize,
    /// Total body bytes stored.
    pub total_bytes: u64,
    /// Time from the first fetch to the commit.
    pub elapsed: Duration,
}

/// Point-in-time copy of [`FetchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests answered by the network.
    pub network: u64,
    /// Requests answered from the cache after a network failure.
    pub cache_fallback: u64,
    /// Requests that neither the network nor the cache could answer.
    pub unavailable: u64,
    /// Installs that stored every asset.
    pub installs_succeeded: u64,
    /// Installs rejected because an asset failed.
    pub installs_failed: u64,
}

impl StatsSnapshot {
    /// Returns the number of fetch reactions observed.
    #[must_use]
    pub const fn total_requests(&self) -> u64 {
        self.network + self.cache_fallback + self.unavailable
    }
}

/// Thread-safe outcome counters shared by concurrent fetch reactions.
#[derive(Debug, Default)]
pub struct FetchStats {
    network: AtomicU64,
    cache_fallback: AtomicU64,
    unavailable: AtomicU64,
    installs_succeeded: AtomicU64,
    installs_failed: AtomicU64,
}

impl FetchStats {
    /// Creates zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            network: AtomicU64::new(0),
            cache_fallback: AtomicU64::new(0),
            unavailable: AtomicU64::new(0),
            installs_succeeded: AtomicU64::new(0),
            installs_failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_network(&self) {
        self.network.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_fallback(&self) {
        self.cache_fallback.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_install(&self, succeeded: bool) {
        if succeeded {
            self.installs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.installs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            network: self.network.load(Ordering::Relaxed),
            cache_fallback: self.cache_fallback.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            installs_succeeded: self.installs_succeeded.load(Ordering::Relaxed),
            installs_failed: self.installs_failed.load(Ordering::Relaxed),
        }
    }
}
