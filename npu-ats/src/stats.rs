// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Subsystem-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

use npu_core::Granule;

#[derive(Default)]
pub struct AtsStats {
    pub invalidations_64k: AtomicU64,
    pub invalidations_2m: AtomicU64,
    pub invalidations_1g: AtomicU64,
    pub invalidations_whole: AtomicU64,
    pub drain_rounds: AtomicU64,
    pub pre_flushes: AtomicU64,
    pub faults_served: AtomicU64,
    pub faults_failed: AtomicU64,
    pub contexts_created: AtomicU64,
    pub contexts_destroyed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AtsStatsSnapshot {
    pub invalidations_64k: u64,
    pub invalidations_2m: u64,
    pub invalidations_1g: u64,
    pub invalidations_whole: u64,
    pub drain_rounds: u64,
    pub pre_flushes: u64,
    pub faults_served: u64,
    pub faults_failed: u64,
    pub contexts_created: u64,
    pub contexts_destroyed: u64,
}

impl AtsStats {
    pub const fn new() -> AtsStats {
        AtsStats {
            invalidations_64k: AtomicU64::new(0),
            invalidations_2m: AtomicU64::new(0),
            invalidations_1g: AtomicU64::new(0),
            invalidations_whole: AtomicU64::new(0),
            drain_rounds: AtomicU64::new(0),
            pre_flushes: AtomicU64::new(0),
            faults_served: AtomicU64::new(0),
            faults_failed: AtomicU64::new(0),
            contexts_created: AtomicU64::new(0),
            contexts_destroyed: AtomicU64::new(0),
        }
    }

    pub fn record_invalidation(&self, granule: Granule) {
        let counter = match granule {
            Granule::Page64K => &self.invalidations_64k,
            Granule::Block2M => &self.invalidations_2m,
            Granule::Block1G => &self.invalidations_1g,
            Granule::Whole => &self.invalidations_whole,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AtsStatsSnapshot {
        AtsStatsSnapshot {
            invalidations_64k: self.invalidations_64k.load(Ordering::Relaxed),
            invalidations_2m: self.invalidations_2m.load(Ordering::Relaxed),
            invalidations_1g: self.invalidations_1g.load(Ordering::Relaxed),
            invalidations_whole: self.invalidations_whole.load(Ordering::Relaxed),
            drain_rounds: self.drain_rounds.load(Ordering::Relaxed),
            pre_flushes: self.pre_flushes.load(Ordering::Relaxed),
            faults_served: self.faults_served.load(Ordering::Relaxed),
            faults_failed: self.faults_failed.load(Ordering::Relaxed),
            contexts_created: self.contexts_created.load(Ordering::Relaxed),
            contexts_destroyed: self.contexts_destroyed.load(Ordering::Relaxed),
        }
    }
}
