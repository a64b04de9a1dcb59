//! Per-device shootdown statistics.
//!
//! Relaxed atomic counters; a snapshot is a plain struct so readers never
//! contend with the invalidation path.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct DeviceStats {
    pub channels_acquired: AtomicU64,
    pub channels_released: AtomicU64,
    pub launches: AtomicU64,
    pub completion_polls: AtomicU64,
}

/// Point-in-time copy of [`DeviceStats`] plus pool state.
#[derive(Debug, Clone, Copy)]
pub struct DeviceStatsSnapshot {
    pub channels_acquired: u64,
    pub channels_released: u64,
    pub launches: u64,
    pub completion_polls: u64,
    pub acquire_retry_spins: u64,
    pub channels_busy: usize,
}

impl DeviceStats {
    pub const fn new() -> DeviceStats {
        DeviceStats {
            channels_acquired: AtomicU64::new(0),
            channels_released: AtomicU64::new(0),
            launches: AtomicU64::new(0),
            completion_polls: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self, acquire_retry_spins: u64, channels_busy: usize) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            channels_acquired: self.channels_acquired.load(Ordering::Relaxed),
            channels_released: self.channels_released.load(Ordering::Relaxed),
            launches: self.launches.load(Ordering::Relaxed),
            completion_polls: self.completion_polls.load(Ordering::Relaxed),
            acquire_retry_spins,
            channels_busy,
        }
    }
}
