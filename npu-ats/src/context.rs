// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Per-address-space context records and the owner lookup table.
//!
//! A context binds one process's address space to the set of accelerator
//! links currently allowed to translate on its behalf. Contexts are shared:
//! every bound device holds one reference, and the record is torn down when
//! the last device detaches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::trace;
use parking_lot::Mutex;

use npu_core::{LinkRoute, MAX_LINKS, MAX_NPUS};

use crate::vm::{Pid, ProcessHandle, Subscription};

bitflags! {
    /// Creation flags accepted from device drivers.
    ///
    /// Only the translation-environment subset a user context may request;
    /// anything else is rejected at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u64 {
        /// Address translation enabled.
        const TRANSLATION = 1 << 0;
        /// User (problem-state) execution.
        const USER = 1 << 1;
        /// Hypervisor-mediated translation.
        const HYPERVISOR = 1 << 2;
    }
}

/// How invalidations for this context reach the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Launches may target a single granule by address.
    PerAddress,
    /// At least one attached device cannot flush by address; every
    /// invalidation is preceded by a full local address-space flush.
    FullAddressSpaceOnly,
}

/// Lifecycle of one context record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Creating = 0,
    Active = 1,
    Destroying = 2,
}

/// Release notification installed at creation: plain function pointer plus
/// one caller-owned word, compared verbatim when another device attaches.
pub type ReleaseCallback = fn(&AddressSpaceContext, usize);

/// Per-process record of which (NPU, link) pairs route invalidations to
/// this address space.
pub struct AddressSpaceContext {
    owner: ProcessHandle,
    pid: Pid,
    flags: ContextFlags,
    /// `links[npu][link]` holds a raw [`LinkRoute`] value, or zero when the
    /// slot is empty. Slots are written under the caller's address-space
    /// structural lock; the invalidation path only loads them, one relaxed
    /// single-word read per slot, and may observe a stale empty slot but
    /// never a torn value.
    links: [[AtomicU64; MAX_LINKS]; MAX_NPUS],
    ref_count: AtomicUsize,
    release_cb: ReleaseCallback,
    cb_data: usize,
    full_flush_only: AtomicBool,
    state: AtomicU8,
    subscription: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for AddressSpaceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpaceContext")
            .field("owner", &self.owner)
            .field("pid", &self.pid)
            .field("flags", &self.flags)
            .field("refs", &self.ref_count())
            .field("state", &self.state())
            .finish()
    }
}

impl AddressSpaceContext {
    pub(crate) fn new(
        owner: ProcessHandle,
        pid: Pid,
        flags: ContextFlags,
        release_cb: ReleaseCallback,
        cb_data: usize,
    ) -> AddressSpaceContext {
        AddressSpaceContext {
            owner,
            pid,
            flags,
            links: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
            ref_count: AtomicUsize::new(1),
            release_cb,
            cb_data,
            full_flush_only: AtomicBool::new(false),
            state: AtomicU8::new(LifecycleState::Creating as u8),
            subscription: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> ProcessHandle {
        self.owner
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    pub fn flush_mode(&self) -> FlushMode {
        if self.full_flush_only.load(Ordering::Relaxed) {
            FlushMode::FullAddressSpaceOnly
        } else {
            FlushMode::PerAddress
        }
    }

    /// Degrade to coarse flushing. Sticky: translations from the coarse
    /// device may stay live until the final teardown flush, so the mode
    /// never upgrades back.
    pub(crate) fn force_full_flush(&self) {
        self.full_flush_only.store(true, Ordering::Relaxed);
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Relaxed)
    }

    pub(crate) fn matches_callback(&self, release_cb: ReleaseCallback, cb_data: usize) -> bool {
        self.release_cb == release_cb && self.cb_data == cb_data
    }

    pub(crate) fn invoke_release(self: &Arc<Self>) {
        (self.release_cb)(self, self.cb_data);
    }

    /// Take a reference unless the count already hit zero (a concurrent
    /// teardown owns the record). Callers seeing `false` retry after the
    /// record leaves the table.
    pub(crate) fn try_get(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    Some(count + 1)
                }
            })
            .is_ok()
    }

    /// Drop one reference; `true` when this was the last one and the caller
    /// must run the teardown sequence.
    pub(crate) fn put(&self) -> bool {
        if self.ref_count.fetch_sub(1, Ordering::Release) == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    pub(crate) fn install_link(&self, route: LinkRoute) {
        self.links[route.npu_index()][route.link_index()].store(route.raw(), Ordering::Relaxed);
    }

    pub(crate) fn clear_link(&self, route: LinkRoute) {
        self.links[route.npu_index()][route.link_index()].store(0, Ordering::Relaxed);
    }

    /// First live route on `npu`, reading each slot exactly once.
    pub(crate) fn first_link_on(&self, npu: usize) -> Option<LinkRoute> {
        self.links[npu]
            .iter()
            .find_map(|slot| LinkRoute::from_raw(slot.load(Ordering::Relaxed)))
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::Acquire) {
            0 => LifecycleState::Creating,
            1 => LifecycleState::Active,
            _ => LifecycleState::Destroying,
        }
    }

    pub(crate) fn set_state(&self, next: LifecycleState) {
        let prev = self.state.swap(next as u8, Ordering::AcqRel);
        trace!(
            "ats: context pid {} state {} -> {}",
            self.pid,
            prev,
            next as u8
        );
        debug_assert!(next as u8 == prev + 1, "illegal lifecycle transition");
    }

    pub(crate) fn set_subscription(&self, subscription: Subscription) {
        let prev = self.subscription.lock().replace(subscription);
        debug_assert!(prev.is_none());
    }

    /// Surrender the subscription token; `None` on the second call.
    pub(crate) fn take_subscription(&self) -> Option<Subscription> {
        self.subscription.lock().take()
    }
}

/// Global owner → context lookup table.
///
/// The lock bounds only pointer-sized lookups, inserts and removals; it is
/// never held across register programming or polling.
pub struct ContextTable {
    map: Mutex<HashMap<ProcessHandle, Arc<AddressSpaceContext>>>,
}

impl ContextTable {
    pub fn new() -> ContextTable {
        ContextTable {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, owner: ProcessHandle) -> Option<Arc<AddressSpaceContext>> {
        self.map.lock().get(&owner).cloned()
    }

    /// Insert unless an entry for `owner` exists; `false` if it did.
    pub(crate) fn insert_if_vacant(
        &self,
        owner: ProcessHandle,
        ctx: &Arc<AddressSpaceContext>,
    ) -> bool {
        let mut map = self.map.lock();
        if map.contains_key(&owner) {
            false
        } else {
            map.insert(owner, Arc::clone(ctx));
            true
        }
    }

    pub(crate) fn remove(&self, owner: ProcessHandle) -> Option<Arc<AddressSpaceContext>> {
        self.map.lock().remove(&owner)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl Default for ContextTable {
    fn default() -> Self {
        ContextTable::new()
    }
}
