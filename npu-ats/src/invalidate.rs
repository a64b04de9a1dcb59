// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Shootdown protocol.
//!
//! One invalidation round claims a channel on every NPU the context has a
//! live link through, programs and launches them together, polls each to
//! completion, then drains twice with the reserved PID before the channels
//! go back to their pools. Launch ordering within a round: every address
//! write is separated from every launch write by a single store-store
//! barrier, so the launches are seen together relative to the programmed
//! addresses.
//!
//! Nothing in this path returns an error. Channel acquisition and
//! completion are guaranteed by the hardware contract; prolonged blocking
//! is a hardware fault outside software recovery, and bounding it is the
//! scheduler's business, not this module's.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use npu_core::{Granule, LaunchWord, NpuDevice, NpuRegistry, MAX_NPUS};

use crate::context::{AddressSpaceContext, FlushMode};
use crate::stats::AtsStats;
use crate::vm::{Pid, VmBackend, RESERVED_PID};

/// Extra entire-PID rounds issued after every primary invalidation.
///
/// A single shootdown is not guaranteed to have fully retired when its
/// status register goes idle; two drain rounds tagged with the reserved
/// PID flush it out. Protocol constant, not a tunable.
pub const DRAIN_ROUNDS: usize = 2;

/// Ephemeral description of one shootdown round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationRequest {
    pid: Pid,
    /// Aligned block base and granule, or `None` for the whole space.
    target: Option<(u64, Granule)>,
}

impl InvalidationRequest {
    pub fn whole(pid: Pid) -> InvalidationRequest {
        InvalidationRequest { pid, target: None }
    }

    /// Classify `[start, start+len)` onto the coarsest covering granule.
    pub fn range(pid: Pid, start: u64, len: u64) -> InvalidationRequest {
        match Granule::classify(start, len) {
            (Granule::Whole, _) => InvalidationRequest::whole(pid),
            (granule, base) => InvalidationRequest {
                pid,
                target: Some((base, granule)),
            },
        }
    }

    pub fn granule(&self) -> Granule {
        self.target.map_or(Granule::Whole, |(_, granule)| granule)
    }

    fn launch_word(&self) -> LaunchWord {
        match self.target {
            Some((_, granule)) => LaunchWord::by_address(self.pid, granule),
            None => LaunchWord::entire_pid(self.pid),
        }
    }
}

/// Channels claimed for one round, in acquisition order (ascending NPU
/// index). Released in that same order.
pub(crate) struct HeldChannels {
    held: Vec<(Arc<NpuDevice>, usize)>,
}

impl HeldChannels {
    fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub(crate) fn npu_indices(&self) -> Vec<usize> {
        self.held.iter().map(|(device, _)| device.index()).collect()
    }

    /// Release every channel in acquisition order; returns the NPU index
    /// sequence released.
    pub(crate) fn release(self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.held.len());
        for (device, chan) in self.held {
            device.release_channel(chan);
            order.push(device.index());
        }
        order
    }
}

/// Drives the shootdown protocol against the device registry.
pub struct InvalidationEngine {
    registry: Arc<NpuRegistry>,
    vm: Arc<dyn VmBackend>,
    stats: Arc<AtsStats>,
    yield_after_spins: u32,
    trace_shootdowns: bool,
}

impl InvalidationEngine {
    pub fn new(
        registry: Arc<NpuRegistry>,
        vm: Arc<dyn VmBackend>,
        stats: Arc<AtsStats>,
        yield_after_spins: u32,
        trace_shootdowns: bool,
    ) -> InvalidationEngine {
        InvalidationEngine {
            registry,
            vm,
            stats,
            yield_after_spins: yield_after_spins.max(1),
            trace_shootdowns,
        }
    }

    /// Invalidate cached translations covering `[start, start+len)`.
    pub fn invalidate(&self, ctx: &AddressSpaceContext, start: u64, len: u64) {
        if len == 0 {
            trace!("ats: empty invalidation for pid {}", ctx.pid());
            return;
        }
        self.run(ctx, InvalidationRequest::range(ctx.pid(), start, len));
    }

    /// Invalidate every translation tagged with the context's pid.
    pub fn invalidate_all(&self, ctx: &AddressSpaceContext) {
        self.run(ctx, InvalidationRequest::whole(ctx.pid()));
    }

    fn run(&self, ctx: &AddressSpaceContext, request: InvalidationRequest) {
        self.stats.record_invalidation(request.granule());

        // Hardware that cannot flush by address needs the whole local
        // address space flushed before any device sees the launch.
        if ctx.flush_mode() == FlushMode::FullAddressSpaceOnly {
            self.vm.flush_full_address_space(ctx.owner());
            self.stats.pre_flushes.fetch_add(1, Ordering::Relaxed);
        }

        let held = self.acquire_channels(ctx);
        if held.is_empty() {
            trace!("ats: pid {} has no linked devices", ctx.pid());
            return;
        }

        if self.trace_shootdowns {
            debug!(
                "ats: pid {} {:?} on NPUs {:?}",
                ctx.pid(),
                request.granule(),
                held.npu_indices()
            );
        }

        if let Some((base, _)) = request.target {
            for (device, chan) in &held.held {
                device.write_address(*chan, base);
            }
        }
        // All address writes become visible before any launch write.
        fence(Ordering::Release);
        let word = request.launch_word();
        for (device, chan) in &held.held {
            device.launch(*chan, word);
        }
        self.wait_all(&held);

        // Two entire-PID drain rounds on the reserved pid, each with its
        // own completion wait. The reserved pid never aliases a live
        // context, so the drains cannot invalidate anything real.
        let drain = LaunchWord::entire_pid(RESERVED_PID);
        for _ in 0..DRAIN_ROUNDS {
            for (device, chan) in &held.held {
                device.launch(*chan, drain);
            }
            self.wait_all(&held);
            self.stats.drain_rounds.fetch_add(1, Ordering::Relaxed);
        }

        let order = held.release();
        trace!("ats: released channels on NPUs {:?}", order);
    }

    /// Claim one channel on each NPU the context links through, ascending
    /// by NPU index. Each link slot is loaded exactly once: a concurrent
    /// detach may hide a link from this round, which is fine because the
    /// teardown path always ends with its own whole-space invalidation.
    pub(crate) fn acquire_channels(&self, ctx: &AddressSpaceContext) -> HeldChannels {
        let mut held = Vec::new();
        for npu in 0..MAX_NPUS {
            let route = match ctx.first_link_on(npu) {
                Some(route) => route,
                None => continue,
            };
            let device = match self.registry.resolve(route) {
                Some(device) => device,
                None => {
                    // Unbound mid-flight; this link contributes nothing.
                    trace!("ats: route {:?} no longer resolves", route);
                    continue;
                }
            };
            if device.channel_count() == 0 {
                continue;
            }
            let chan = device.acquire_channel();
            held.push((device, chan));
        }
        HeldChannels { held }
    }

    fn wait_all(&self, held: &HeldChannels) {
        for (device, chan) in &held.held {
            let mut spins: u32 = 0;
            while !device.poll_idle(*chan) {
                spins = spins.wrapping_add(1);
                std::hint::spin_loop();
                if spins % self.yield_after_spins == 0 {
                    std::thread::yield_now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{context_with_links, MockVm};
    use crate::vm::ProcessHandle;
    use npu_core::{DeviceDescriptor, SimChannels};

    fn make_engine(registry: &Arc<NpuRegistry>, vm: &Arc<MockVm>) -> InvalidationEngine {
        InvalidationEngine::new(
            Arc::clone(registry),
            Arc::clone(vm) as Arc<dyn VmBackend>,
            Arc::new(AtsStats::new()),
            4,
            false,
        )
    }

    fn register_sim(registry: &NpuRegistry, channels: usize, latency: usize) -> Arc<SimChannels> {
        let sim = Arc::new(SimChannels::with_latency(channels, latency));
        registry
            .register(DeviceDescriptor {
                name: "sim".to_string(),
                channels: Arc::clone(&sim) as Arc<dyn npu_core::AtsdChannels>,
                needs_full_flush: false,
            })
            .unwrap();
        sim
    }

    #[test]
    fn test_primary_round_then_two_drains() {
        let registry = Arc::new(NpuRegistry::new());
        let sim = register_sim(&registry, 2, 3);
        let vm = Arc::new(MockVm::new());
        let engine = make_engine(&registry, &vm);
        let ctx = context_with_links(ProcessHandle(1), 42, &[(0, 0)]);

        engine.invalidate(&ctx, 0x1000, 0x1000);

        let journal = sim.journal();
        assert_eq!(journal.len(), 1 + DRAIN_ROUNDS);

        assert!(!journal[0].launch.is_entire_pid());
        assert_eq!(journal[0].launch.pid(), 42);
        assert_eq!(journal[0].address, Some(0));
        assert_eq!(journal[0].launch.ap(), Granule::Page64K.ap());

        for drain in &journal[1..] {
            assert!(drain.launch.is_entire_pid());
            assert_eq!(drain.launch.pid(), RESERVED_PID);
            assert_eq!(drain.address, None);
        }

        // All launches went through the same claimed channel.
        assert!(journal.iter().all(|r| r.channel == journal[0].channel));
        assert_eq!(registry.get(0).unwrap().pool().busy_count(), 0);
    }

    #[test]
    fn test_whole_invalidation_writes_no_address() {
        let registry = Arc::new(NpuRegistry::new());
        let sim = register_sim(&registry, 1, 0);
        let vm = Arc::new(MockVm::new());
        let engine = make_engine(&registry, &vm);
        let ctx = context_with_links(ProcessHandle(1), 7, &[(0, 2)]);

        engine.invalidate_all(&ctx);

        let journal = sim.journal();
        assert_eq!(journal.len(), 1 + DRAIN_ROUNDS);
        assert!(journal[0].launch.is_entire_pid());
        assert_eq!(journal[0].launch.pid(), 7);
        assert_eq!(journal[0].address, None);
    }

    #[test]
    fn test_huge_range_collapses_to_whole() {
        let registry = Arc::new(NpuRegistry::new());
        let sim = register_sim(&registry, 1, 0);
        let vm = Arc::new(MockVm::new());
        let engine = make_engine(&registry, &vm);
        let ctx = context_with_links(ProcessHandle(1), 7, &[(0, 0)]);

        engine.invalidate(&ctx, 0, 8 << 30);
        assert!(sim.journal()[0].launch.is_entire_pid());
    }

    #[test]
    fn test_coarse_context_pre_flushes() {
        let registry = Arc::new(NpuRegistry::new());
        register_sim(&registry, 1, 0);
        let vm = Arc::new(MockVm::new());
        let engine = make_engine(&registry, &vm);
        let ctx = context_with_links(ProcessHandle(5), 9, &[(0, 0)]);
        ctx.force_full_flush();

        engine.invalidate(&ctx, 0x2000, 0x1000);
        assert_eq!(vm.full_flushes(), 1);

        engine.invalidate_all(&ctx);
        assert_eq!(vm.full_flushes(), 2);
    }

    #[test]
    fn test_fine_context_does_not_pre_flush() {
        let registry = Arc::new(NpuRegistry::new());
        register_sim(&registry, 1, 0);
        let vm = Arc::new(MockVm::new());
        let engine = make_engine(&registry, &vm);
        let ctx = context_with_links(ProcessHandle(5), 9, &[(0, 0)]);

        engine.invalidate(&ctx, 0x2000, 0x1000);
        assert_eq!(vm.full_flushes(), 0);
    }

    #[test]
    fn test_release_order_matches_acquisition_order() {
        let registry = Arc::new(NpuRegistry::new());
        for _ in 0..3 {
            register_sim(&registry, 2, 0);
        }
        let vm = Arc::new(MockVm::new());
        let engine = make_engine(&registry, &vm);
        let ctx = context_with_links(ProcessHandle(2), 11, &[(0, 0), (1, 3), (2, 5)]);

        let held = engine.acquire_channels(&ctx);
        let acquired = held.npu_indices();
        assert_eq!(acquired, vec![0, 1, 2]);
        let released = held.release();
        assert_eq!(released, acquired);
    }

    #[test]
    fn test_unbound_device_contributes_nothing() {
        let registry = Arc::new(NpuRegistry::new());
        let sim0 = register_sim(&registry, 1, 0);
        let sim1 = register_sim(&registry, 1, 0);
        let vm = Arc::new(MockVm::new());
        let engine = make_engine(&registry, &vm);
        let ctx = context_with_links(ProcessHandle(3), 13, &[(0, 0), (1, 0)]);

        registry.unbind(1);
        engine.invalidate_all(&ctx);

        assert_eq!(sim0.launch_count(), 1 + DRAIN_ROUNDS);
        assert_eq!(sim1.launch_count(), 0);
    }

    #[test]
    fn test_channel_less_device_is_skipped() {
        let registry = Arc::new(NpuRegistry::new());
        let sim = register_sim(&registry, 0, 0);
        let vm = Arc::new(MockVm::new());
        let engine = make_engine(&registry, &vm);
        let ctx = context_with_links(ProcessHandle(4), 17, &[(0, 0)]);

        // Must not panic in RegisterPool::acquire.
        engine.invalidate_all(&ctx);
        assert_eq!(sim.launch_count(), 0);
    }

    #[test]
    fn test_zero_length_is_a_no_op() {
        let registry = Arc::new(NpuRegistry::new());
        let sim = register_sim(&registry, 1, 0);
        let vm = Arc::new(MockVm::new());
        let engine = make_engine(&registry, &vm);
        let ctx = context_with_links(ProcessHandle(4), 17, &[(0, 0)]);

        engine.invalidate(&ctx, 0x1000, 0);
        assert_eq!(sim.launch_count(), 0);
    }
}
