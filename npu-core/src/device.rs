// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! NPU device records and the fixed device registry.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::channel::{AtsdChannels, LaunchWord};
use crate::error::{Error, Result};
use crate::pool::{RegisterPool, MAX_CHANNELS};
use crate::stats::{DeviceStats, DeviceStatsSnapshot};

/// NPU bridge devices addressable by the platform.
pub const MAX_NPUS: usize = 8;
/// Accelerator links routed through one NPU.
pub const MAX_LINKS: usize = 6;

/// Opaque routing value identifying one accelerator link.
///
/// The raw value is nonzero so a cleared per-context link slot (stored as
/// zero) is distinguishable from any live route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkRoute(u64);

impl LinkRoute {
    pub fn new(npu_index: usize, link_index: usize) -> Result<LinkRoute> {
        if npu_index >= MAX_NPUS || link_index >= MAX_LINKS {
            return Err(Error::InvalidArgument);
        }
        Ok(LinkRoute((npu_index * MAX_LINKS + link_index) as u64 + 1))
    }

    pub fn npu_index(self) -> usize {
        (self.0 as usize - 1) / MAX_LINKS
    }

    pub fn link_index(self) -> usize {
        (self.0 as usize - 1) % MAX_LINKS
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Option<LinkRoute> {
        if raw == 0 || raw > (MAX_NPUS * MAX_LINKS) as u64 {
            None
        } else {
            Some(LinkRoute(raw))
        }
    }
}

/// Device bring-up input for [`NpuRegistry::register`].
pub struct DeviceDescriptor {
    pub name: String,
    pub channels: Arc<dyn AtsdChannels>,
    /// Fine-grained (by-address) flush is unsupported on this device;
    /// invalidations for contexts attached to it must be preceded by a full
    /// local address-space flush.
    pub needs_full_flush: bool,
}

/// One registered NPU bridge: identity, channel bank, channel pool.
pub struct NpuDevice {
    index: usize,
    name: String,
    channels: Arc<dyn AtsdChannels>,
    pool: RegisterPool,
    needs_full_flush: bool,
    stats: DeviceStats,
}

impl NpuDevice {
    fn new(index: usize, desc: DeviceDescriptor, yield_after_spins: u32) -> NpuDevice {
        let count = desc.channels.channel_count();
        NpuDevice {
            index,
            name: desc.name,
            channels: desc.channels,
            pool: RegisterPool::with_backoff(count, yield_after_spins),
            needs_full_flush: desc.needs_full_flush,
            stats: DeviceStats::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_count(&self) -> usize {
        self.pool.channel_count()
    }

    pub fn needs_full_flush(&self) -> bool {
        self.needs_full_flush
    }

    pub fn pool(&self) -> &RegisterPool {
        &self.pool
    }

    /// Claim one shootdown channel, blocking until one comes free.
    pub fn acquire_channel(&self) -> usize {
        let chan = self.pool.acquire();
        self.stats.channels_acquired.fetch_add(1, Ordering::Relaxed);
        chan
    }

    pub fn release_channel(&self, chan: usize) {
        self.pool.release(chan);
        self.stats.channels_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_address(&self, chan: usize, va: u64) {
        self.channels.write_address(chan, va);
    }

    pub fn launch(&self, chan: usize, word: LaunchWord) {
        self.stats.launches.fetch_add(1, Ordering::Relaxed);
        self.channels.write_launch(chan, word);
    }

    /// One status-register read; `true` once the shootdown has retired.
    pub fn poll_idle(&self, chan: usize) -> bool {
        self.stats.completion_polls.fetch_add(1, Ordering::Relaxed);
        self.channels.is_idle(chan)
    }

    pub fn stats(&self) -> DeviceStatsSnapshot {
        self.stats
            .snapshot(self.pool.retry_spins(), self.pool.busy_count())
    }
}

/// Fixed-slot table of registered NPU devices.
pub struct NpuRegistry {
    slots: RwLock<[Option<Arc<NpuDevice>>; MAX_NPUS]>,
    yield_after_spins: u32,
}

impl NpuRegistry {
    pub fn new() -> NpuRegistry {
        NpuRegistry::with_backoff(64)
    }

    pub fn with_backoff(yield_after_spins: u32) -> NpuRegistry {
        NpuRegistry {
            slots: RwLock::new(Default::default()),
            yield_after_spins,
        }
    }

    /// Assign the next free slot to a new device.
    pub fn register(&self, desc: DeviceDescriptor) -> Result<usize> {
        if desc.channels.channel_count() > MAX_CHANNELS {
            warn!(
                "npu: rejecting device {:?} with oversized channel bank ({})",
                desc.name,
                desc.channels.channel_count()
            );
            return Err(Error::InvalidArgument);
        }
        let mut slots = self.slots.write();
        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ConfigurationExhausted)?;
        let device = Arc::new(NpuDevice::new(index, desc, self.yield_after_spins));
        info!(
            "npu{}: registered {} with {} shootdown channels{}",
            index,
            device.name(),
            device.channel_count(),
            if device.needs_full_flush() {
                " (coarse flush only)"
            } else {
                ""
            }
        );
        slots[index] = Some(Arc::clone(&device));
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Option<Arc<NpuDevice>> {
        self.slots.read().get(index)?.clone()
    }

    /// Map a routing value back to its owning device.
    ///
    /// `None` means the device was unbound mid-flight; callers treat the
    /// link as contributing nothing, not as an error.
    pub fn resolve(&self, route: LinkRoute) -> Option<Arc<NpuDevice>> {
        self.get(route.npu_index())
    }

    /// Remove a device from its slot. In-flight holders keep their `Arc`;
    /// new resolutions of routes through this slot return `None`.
    pub fn unbind(&self, index: usize) -> Option<Arc<NpuDevice>> {
        let removed = self.slots.write().get_mut(index)?.take();
        if let Some(ref device) = removed {
            info!("npu{}: unbound {}", index, device.name());
        }
        removed
    }

    pub fn device_count(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }
}

impl Default for NpuRegistry {
    fn default() -> Self {
        NpuRegistry::new()
    }
}
