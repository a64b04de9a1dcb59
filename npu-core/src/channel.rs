// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! ATSD channel-bank abstraction and launch-word encoding.
//!
//! The launch register is a single 64-bit image. One write of it starts a
//! shootdown; the fields select whether the invalidation targets a single
//! translation granule at a programmed address or every translation tagged
//! with the process id.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex as SpinMutex;

/// Invalidate every translation tagged with the PID field; the address
/// register is ignored.
pub const LAUNCH_INVAL_ALL: u64 = 1 << 63;
/// Process-scoped translation. Set on every launch this core issues.
pub const LAUNCH_PSCOPED: u64 = 1 << 62;
/// Skip the coherency flush after invalidating. Defined by the register
/// layout but never set: every launch performs a real flush.
pub const LAUNCH_SKIP_FLUSH: u64 = 1 << 61;
/// Page-size (AP) field for by-address launches.
pub const LAUNCH_AP_SHIFT: u32 = 56;
pub const LAUNCH_AP_MASK: u64 = 0x7 << LAUNCH_AP_SHIFT;
/// Process id tag.
pub const LAUNCH_PID_MASK: u64 = 0xF_FFFF;

/// Granularity at which one shootdown is expressed.
///
/// The hardware only accepts a small fixed set of granules. A request that
/// fits none of them whole falls back to invalidating the entire address
/// space; over-invalidation is cheaper than issuing several launches given
/// the fixed latency per shootdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granule {
    Page64K,
    Block2M,
    Block1G,
    Whole,
}

impl Granule {
    /// Size in bytes, or `None` for the whole address space.
    pub const fn size(self) -> Option<u64> {
        match self {
            Granule::Page64K => Some(64 * 1024),
            Granule::Block2M => Some(2 * 1024 * 1024),
            Granule::Block1G => Some(1024 * 1024 * 1024),
            Granule::Whole => None,
        }
    }

    /// Radix AP encoding of this granule for the launch word.
    pub const fn ap(self) -> u64 {
        match self {
            Granule::Page64K => 0b101,
            Granule::Block2M => 0b001,
            Granule::Block1G => 0b010,
            Granule::Whole => 0,
        }
    }

    /// Pick the coarsest supported granule that covers `[start, start+len)`
    /// with a single aligned block, and the block base. Ranges that fit no
    /// single block of any class collapse to [`Granule::Whole`].
    pub fn classify(start: u64, len: u64) -> (Granule, u64) {
        debug_assert!(len > 0);
        let end = match start.checked_add(len) {
            Some(end) => end,
            None => return (Granule::Whole, 0),
        };
        for granule in [Granule::Page64K, Granule::Block2M, Granule::Block1G] {
            let size = granule.size().unwrap();
            let base = start & !(size - 1);
            match base.checked_add(size) {
                Some(limit) if end <= limit => return (granule, base),
                _ => continue,
            }
        }
        (Granule::Whole, 0)
    }
}

/// One fully-encoded launch register image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchWord(u64);

impl LaunchWord {
    /// Launch targeting the granule programmed in the address register.
    pub fn by_address(pid: u64, granule: Granule) -> LaunchWord {
        debug_assert!(granule != Granule::Whole);
        LaunchWord(LAUNCH_PSCOPED | (granule.ap() << LAUNCH_AP_SHIFT) | (pid & LAUNCH_PID_MASK))
    }

    /// Launch invalidating every translation tagged with `pid`; no address
    /// is encoded.
    pub fn entire_pid(pid: u64) -> LaunchWord {
        LaunchWord(LAUNCH_INVAL_ALL | LAUNCH_PSCOPED | (pid & LAUNCH_PID_MASK))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn pid(self) -> u64 {
        self.0 & LAUNCH_PID_MASK
    }

    pub fn ap(self) -> u64 {
        (self.0 & LAUNCH_AP_MASK) >> LAUNCH_AP_SHIFT
    }

    pub fn is_entire_pid(self) -> bool {
        self.0 & LAUNCH_INVAL_ALL != 0
    }
}

/// The seam between the shootdown protocol and one device's channel bank.
///
/// Implementations map these calls onto the device's register file. All
/// methods take `&self`; channel ownership (who may program which channel)
/// is the caller's business, arbitrated by [`crate::pool::RegisterPool`].
pub trait AtsdChannels: Send + Sync {
    /// Number of channels present in this bank. May be zero.
    fn channel_count(&self) -> usize;

    /// Program the target-address register of `chan`.
    fn write_address(&self, chan: usize, va: u64);

    /// Write the launch register of `chan`, starting the shootdown.
    fn write_launch(&self, chan: usize, word: LaunchWord);

    /// Read the status register of `chan`; `true` once the shootdown has
    /// retired.
    fn is_idle(&self, chan: usize) -> bool;
}

/// One launch observed by [`SimChannels`].
#[derive(Debug, Clone, Copy)]
pub struct LaunchRecord {
    pub channel: usize,
    /// Address programmed since the previous launch on this channel, if any.
    pub address: Option<u64>,
    pub launch: LaunchWord,
}

struct SimLane {
    address: AtomicU64,
    address_valid: AtomicBool,
    /// `is_idle` reads left before this lane reports completion.
    polls_left: AtomicUsize,
}

/// Software-modelled channel bank.
///
/// Stands in for a mapped register file on platforms without one and backs
/// the test suites. Launches are recorded in an inspectable journal;
/// `latency_polls` makes each launch stay busy for a fixed number of status
/// reads so completion-wait paths are exercised.
pub struct SimChannels {
    lanes: Vec<SimLane>,
    latency_polls: usize,
    journal: SpinMutex<Vec<LaunchRecord>>,
}

impl SimChannels {
    pub fn new(count: usize) -> SimChannels {
        SimChannels::with_latency(count, 0)
    }

    pub fn with_latency(count: usize, latency_polls: usize) -> SimChannels {
        SimChannels {
            lanes: (0..count)
                .map(|_| SimLane {
                    address: AtomicU64::new(0),
                    address_valid: AtomicBool::new(false),
                    polls_left: AtomicUsize::new(0),
                })
                .collect(),
            latency_polls,
            journal: SpinMutex::new(Vec::new()),
        }
    }

    /// Every launch observed so far, in program order.
    pub fn journal(&self) -> Vec<LaunchRecord> {
        self.journal.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.journal.lock().len()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }
}

impl AtsdChannels for SimChannels {
    fn channel_count(&self) -> usize {
        self.lanes.len()
    }

    fn write_address(&self, chan: usize, va: u64) {
        let lane = &self.lanes[chan];
        lane.address.store(va, Ordering::Relaxed);
        lane.address_valid.store(true, Ordering::Relaxed);
    }

    fn write_launch(&self, chan: usize, word: LaunchWord) {
        let lane = &self.lanes[chan];
        let address = if lane.address_valid.swap(false, Ordering::Relaxed) {
            Some(lane.address.load(Ordering::Relaxed))
        } else {
            None
        };
        lane.polls_left.store(self.latency_polls, Ordering::Release);
        self.journal.lock().push(LaunchRecord {
            channel: chan,
            address,
            launch: word,
        });
        log::trace!(
            "sim: chan {} launch {:#018x} addr {:x?}",
            chan,
            word.raw(),
            address
        );
    }

    fn is_idle(&self, chan: usize) -> bool {
        self.lanes[chan]
            .polls_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                left.checked_sub(1)
            })
            .is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const K64: u64 = 64 * 1024;
    const M2: u64 = 2 * 1024 * 1024;
    const G1: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_classify_small_range_uses_smallest_granule() {
        let (granule, base) = Granule::classify(0x1000, 0x1000);
        assert_eq!(granule, Granule::Page64K);
        assert_eq!(base, 0);
    }

    #[test]
    fn test_classify_aligned_page() {
        let (granule, base) = Granule::classify(3 * K64, K64);
        assert_eq!(granule, Granule::Page64K);
        assert_eq!(base, 3 * K64);
    }

    #[test]
    fn test_classify_page_crossing_escalates() {
        // One page worth of bytes straddling a 64K boundary needs a 2M block.
        let (granule, base) = Granule::classify(K64 / 2, K64);
        assert_eq!(granule, Granule::Block2M);
        assert_eq!(base, 0);

        // Straddling a 2M boundary needs a 1G block.
        let (granule, base) = Granule::classify(M2 - 0x1000, 0x2000);
        assert_eq!(granule, Granule::Block1G);
        assert_eq!(base, 0);
    }

    #[test]
    fn test_classify_falls_back_to_whole() {
        let (granule, _) = Granule::classify(G1 - 0x1000, 0x2000);
        assert_eq!(granule, Granule::Whole);

        let (granule, _) = Granule::classify(0, 4 * G1);
        assert_eq!(granule, Granule::Whole);

        // start + len overflow
        let (granule, _) = Granule::classify(u64::MAX - 4, 0x1000);
        assert_eq!(granule, Granule::Whole);
    }

    #[test]
    fn test_classify_covers_requested_range() {
        let samples = [
            (0x1000u64, 0x1000u64),
            (0, 1),
            (K64 - 1, 2),
            (M2 + 0x3000, K64),
            (G1 + M2, M2),
            (7 * G1 + 5, G1 / 2),
            (u64::MAX - 2 * K64, K64),
        ];
        for (start, len) in samples {
            let (granule, base) = Granule::classify(start, len);
            if let Some(size) = granule.size() {
                assert!(base <= start, "{start:#x}+{len:#x}");
                assert!(base + size >= start + len, "{start:#x}+{len:#x}");
                assert_eq!(base % size, 0);
            }
        }
    }

    #[test]
    fn test_launch_word_by_address() {
        let word = LaunchWord::by_address(42, Granule::Page64K);
        assert!(!word.is_entire_pid());
        assert_eq!(word.pid(), 42);
        assert_eq!(word.ap(), 0b101);
        assert_eq!(word.raw() & LAUNCH_PSCOPED, LAUNCH_PSCOPED);
        assert_eq!(word.raw() & LAUNCH_SKIP_FLUSH, 0);
    }

    #[test]
    fn test_launch_word_entire_pid() {
        let word = LaunchWord::entire_pid(7);
        assert!(word.is_entire_pid());
        assert_eq!(word.pid(), 7);
        assert_eq!(word.raw() & LAUNCH_SKIP_FLUSH, 0);
    }

    #[test]
    fn test_sim_journal_records_address_presence() {
        let sim = SimChannels::new(2);
        sim.write_address(1, 0xA000);
        sim.write_launch(1, LaunchWord::by_address(3, Granule::Page64K));
        sim.write_launch(1, LaunchWord::entire_pid(3));

        let journal = sim.journal();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].address, Some(0xA000));
        assert_eq!(journal[1].address, None);
    }

    #[test]
    fn test_sim_latency_polls() {
        let sim = SimChannels::with_latency(1, 3);
        assert!(sim.is_idle(0));
        sim.write_launch(0, LaunchWord::entire_pid(0));
        assert!(!sim.is_idle(0));
        assert!(!sim.is_idle(0));
        assert!(!sim.is_idle(0));
        assert!(sim.is_idle(0));
    }
}
