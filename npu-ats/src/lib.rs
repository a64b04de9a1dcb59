// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Address-translation-shootdown service for NPU-attached accelerators
//!
//! Accelerators behind an NPU bridge translate host virtual addresses on
//! their own. When the owning address space changes, every cached
//! translation on every linked accelerator must be shot down before the
//! change is allowed to complete. This crate owns that protocol and the
//! lifetime of the per-process records that drive it.
//!
//! ```text
//! ┌────────────────────────────┐      ┌──────────────────────────────┐
//! │  Device driver             │      │  OS VM subsystem (VmBackend) │
//! │  create/destroy_context    │      │  release / range events      │
//! └─────────────┬──────────────┘      └──────────────┬───────────────┘
//!               │                                    │
//! ┌─────────────▼────────────────────────────────────▼───────────────┐
//! │  NpuAts                                                          │
//! │  ┌──────────────────────┐   ┌──────────────────────────────────┐ │
//! │  │  ContextTable        │   │  InvalidationEngine              │ │
//! │  │  owner → context     │   │  classify → claim → launch →     │ │
//! │  │  refcount lifecycle  │   │  poll → drain ×2 → release       │ │
//! │  └──────────────────────┘   └───────────────┬──────────────────┘ │
//! └─────────────────────────────────────────────┼────────────────────┘
//!                                               │ channel pools
//! ┌─────────────────────────────────────────────▼────────────────────┐
//! │  npu-core: NpuRegistry / NpuDevice / AtsdChannels                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{info, trace, warn};

pub mod context;
mod fault;
pub mod invalidate;
pub mod stats;
pub mod vm;

#[cfg(test)]
pub(crate) mod testutil;

pub use npu_core::{
    AtsdChannels, DeviceDescriptor, Error, Granule, LaunchWord, LinkRoute, NpuDevice, NpuRegistry,
    Result, SimChannels, MAX_CHANNELS, MAX_LINKS, MAX_NPUS,
};

pub use crate::context::{
    AddressSpaceContext, ContextFlags, ContextTable, FlushMode, LifecycleState, ReleaseCallback,
};
pub use crate::invalidate::{InvalidationEngine, InvalidationRequest, DRAIN_ROUNDS};
pub use crate::stats::{AtsStats, AtsStatsSnapshot};
pub use crate::vm::{
    AddressSpaceObserver, Pid, ProcessHandle, Subscription, VmBackend, RESERVED_PID,
};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AtsConfig {
    /// Busy-poll passes between `yield_now` calls in the two spin loops.
    pub yield_after_spins: u32,
    /// Emit a `debug!` line per shootdown round.
    pub trace_shootdowns: bool,
}

impl Default for AtsConfig {
    fn default() -> Self {
        Self {
            yield_after_spins: 64,
            trace_shootdowns: false,
        }
    }
}

impl AtsConfig {
    /// Configuration from environment overrides.
    pub fn from_env() -> AtsConfig {
        let mut config = AtsConfig::default();

        if let Ok(val) = std::env::var("NPU_ATS_YIELD_AFTER_SPINS") {
            if let Ok(n) = val.parse() {
                config.yield_after_spins = n;
            }
        }

        if let Ok(val) = std::env::var("NPU_ATS_TRACE_SHOOTDOWNS") {
            config.trace_shootdowns = val == "1" || val.to_lowercase() == "true";
        }

        config
    }
}

/// Per-context notifier glue: forwards VM change events into the engine.
struct ContextObserver {
    engine: Arc<InvalidationEngine>,
    ctx: Arc<AddressSpaceContext>,
}

impl AddressSpaceObserver for ContextObserver {
    fn on_release(&self, owner: ProcessHandle) {
        debug_assert_eq!(owner, self.ctx.owner());
        self.engine.invalidate_all(&self.ctx);
    }

    fn on_single_address_changed(&self, _owner: ProcessHandle, address: u64) {
        let page = Granule::Page64K.size().unwrap();
        self.engine.invalidate(&self.ctx, address, page);
    }

    fn on_range_invalidated(&self, _owner: ProcessHandle, start: u64, end: u64) {
        self.engine.invalidate(&self.ctx, start, end.saturating_sub(start));
    }
}

/// The shootdown service: device registry, context lifetimes, engine.
pub struct NpuAts {
    registry: Arc<NpuRegistry>,
    contexts: ContextTable,
    vm: Arc<dyn VmBackend>,
    engine: Arc<InvalidationEngine>,
    stats: Arc<AtsStats>,
}

impl NpuAts {
    pub fn new(vm: Arc<dyn VmBackend>) -> NpuAts {
        NpuAts::with_config(vm, AtsConfig::default())
    }

    pub fn with_config(vm: Arc<dyn VmBackend>, config: AtsConfig) -> NpuAts {
        let registry = Arc::new(NpuRegistry::with_backoff(config.yield_after_spins));
        let stats = Arc::new(AtsStats::new());
        let engine = Arc::new(InvalidationEngine::new(
            Arc::clone(&registry),
            Arc::clone(&vm),
            Arc::clone(&stats),
            config.yield_after_spins,
            config.trace_shootdowns,
        ));
        NpuAts {
            registry,
            contexts: ContextTable::new(),
            vm,
            engine,
            stats,
        }
    }

    /// Bring up one NPU bridge device.
    pub fn register_device(&self, desc: DeviceDescriptor) -> Result<usize> {
        self.registry.register(desc)
    }

    pub fn registry(&self) -> &Arc<NpuRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &InvalidationEngine {
        &self.engine
    }

    pub fn stats(&self) -> AtsStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn lookup_context(&self, owner: ProcessHandle) -> Option<Arc<AddressSpaceContext>> {
        self.contexts.lookup(owner)
    }

    /// Bind `route` to the owner's context, creating the context on first
    /// use.
    ///
    /// Repeat calls for the same owner must present the same
    /// `release_cb`/`cb_data` pair that created the record; a mismatch is
    /// rejected without mutating anything. Each successful call takes one
    /// reference, paired with one [`NpuAts::destroy_context`].
    pub fn create_context(
        &self,
        owner: ProcessHandle,
        route: LinkRoute,
        flags: u64,
        release_cb: ReleaseCallback,
        cb_data: usize,
    ) -> Result<Arc<AddressSpaceContext>> {
        let flags = ContextFlags::from_bits(flags).ok_or(Error::InvalidArgument)?;
        let device = self
            .registry
            .resolve(route)
            .ok_or(Error::NoSuchLinkedDevice)?;
        let pid = self
            .vm
            .translation_id(owner)
            .ok_or(Error::OwnerHasNoAddressSpace)?;
        debug_assert_ne!(pid, RESERVED_PID);

        loop {
            if let Some(ctx) = self.contexts.lookup(owner) {
                if !ctx.matches_callback(release_cb, cb_data) {
                    return Err(Error::InvalidArgument);
                }
                if ctx.try_get() {
                    ctx.install_link(route);
                    if device.needs_full_flush() {
                        ctx.force_full_flush();
                    }
                    trace!(
                        "ats: pid {} attached npu{} link{} (refs {})",
                        pid,
                        route.npu_index(),
                        route.link_index(),
                        ctx.ref_count()
                    );
                    return Ok(ctx);
                }
                // The record hit zero under a concurrent teardown; wait for
                // it to leave the table, then create afresh.
                std::thread::yield_now();
                continue;
            }

            // Absent. Build and register the record outside the table lock.
            let ctx = Arc::new(AddressSpaceContext::new(
                owner, pid, flags, release_cb, cb_data,
            ));
            let observer = Arc::new(ContextObserver {
                engine: Arc::clone(&self.engine),
                ctx: Arc::clone(&ctx),
            });
            let subscription = self.vm.subscribe(owner, observer)?;
            ctx.set_subscription(subscription);
            ctx.install_link(route);
            if device.needs_full_flush() {
                ctx.force_full_flush();
            }

            if !self.contexts.insert_if_vacant(owner, &ctx) {
                // Lost a creation race; discard the half-built record.
                if let Some(subscription) = ctx.take_subscription() {
                    self.vm.unsubscribe(subscription);
                }
                continue;
            }
            ctx.set_state(LifecycleState::Active);
            self.stats.contexts_created.fetch_add(1, Ordering::Relaxed);
            info!(
                "ats: context created for pid {} via npu{} link{}",
                pid,
                route.npu_index(),
                route.link_index()
            );
            return Ok(ctx);
        }
    }

    /// Detach one link and drop one reference.
    ///
    /// The last drop tears the record down: the release callback runs
    /// first so the driver stops issuing translation requests, then a
    /// whole-address-space shootdown flushes anything in flight, then the
    /// notifier subscription is surrendered and the record leaves the
    /// lookup table.
    pub fn destroy_context(&self, ctx: &Arc<AddressSpaceContext>, route: LinkRoute) {
        match self.registry.resolve(route) {
            Some(_) => ctx.clear_link(route),
            None => warn!(
                "ats: detach route npu{} link{} no longer resolves; slot covered by teardown flush",
                route.npu_index(),
                route.link_index()
            ),
        }

        if !ctx.put() {
            trace!(
                "ats: pid {} detached npu{} link{} (refs {})",
                ctx.pid(),
                route.npu_index(),
                route.link_index(),
                ctx.ref_count()
            );
            return;
        }

        ctx.set_state(LifecycleState::Destroying);
        ctx.invoke_release();
        self.engine.invalidate_all(ctx);
        if let Some(subscription) = ctx.take_subscription() {
            self.vm.unsubscribe(subscription);
        }
        let removed = self.contexts.remove(ctx.owner());
        debug_assert!(removed.is_some());
        self.stats.contexts_destroyed.fetch_add(1, Ordering::Relaxed);
        info!("ats: context for pid {} destroyed", ctx.pid());
    }

    /// Service a batch of device translation faults.
    ///
    /// Each address is faulted in and touched; per-address failures do not
    /// stop the batch, and the aggregate error is the last one observed.
    pub fn handle_translation_fault(
        &self,
        ctx: &AddressSpaceContext,
        addresses: &[u64],
        write_flags: &[bool],
    ) -> Result<()> {
        fault::fault_in_batch(&*self.vm, ctx.owner(), addresses, write_flags, &self.stats)
    }
}
