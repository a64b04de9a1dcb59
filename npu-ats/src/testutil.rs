//! Shared doubles for the unit suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use npu_core::{Error, LinkRoute, Result};

use crate::context::{AddressSpaceContext, ContextFlags, LifecycleState};
use crate::vm::{AddressSpaceObserver, Pid, ProcessHandle, Subscription, VmBackend};

fn release_noop(_ctx: &AddressSpaceContext, _data: usize) {}

/// Context in `Active` state with the given `(npu, link)` pairs installed.
pub(crate) fn context_with_links(
    owner: ProcessHandle,
    pid: Pid,
    links: &[(usize, usize)],
) -> Arc<AddressSpaceContext> {
    let ctx = Arc::new(AddressSpaceContext::new(
        owner,
        pid,
        ContextFlags::TRANSLATION | ContextFlags::USER,
        release_noop,
        0,
    ));
    for &(npu, link) in links {
        ctx.install_link(LinkRoute::new(npu, link).unwrap());
    }
    ctx.set_state(LifecycleState::Active);
    ctx
}

/// VM backend double: every owner has an address space whose pid is
/// `owner.0` unless overridden, faults succeed unless told otherwise, and
/// subscriptions are retained for delivery and inspection.
pub(crate) struct MockVm {
    full_flushes: AtomicU64,
    faulted: Mutex<Vec<u64>>,
    failing: Mutex<HashMap<u64, Error>>,
    no_address_space: Mutex<Vec<ProcessHandle>>,
    next_subscription: AtomicU64,
    subscriptions: Mutex<HashMap<Subscription, (ProcessHandle, Arc<dyn AddressSpaceObserver>)>>,
    deny_subscribe: Mutex<Option<Error>>,
}

impl MockVm {
    pub(crate) fn new() -> MockVm {
        MockVm {
            full_flushes: AtomicU64::new(0),
            faulted: Mutex::new(Vec::new()),
            failing: Mutex::new(HashMap::new()),
            no_address_space: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
            deny_subscribe: Mutex::new(None),
        }
    }

    pub(crate) fn full_flushes(&self) -> u64 {
        self.full_flushes.load(Ordering::Relaxed)
    }

    pub(crate) fn faulted(&self) -> Vec<u64> {
        self.faulted.lock().clone()
    }

    pub(crate) fn fail_address(&self, address: u64, err: Error) {
        self.failing.lock().insert(address, err);
    }

    pub(crate) fn mark_no_address_space(&self, owner: ProcessHandle) {
        self.no_address_space.lock().push(owner);
    }

    pub(crate) fn deny_next_subscribe(&self, err: Error) {
        *self.deny_subscribe.lock() = Some(err);
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Deliver a range event the way the real notifier would.
    pub(crate) fn notify_range(&self, owner: ProcessHandle, start: u64, end: u64) {
        let observers: Vec<_> = self
            .subscriptions
            .lock()
            .values()
            .filter(|(sub_owner, _)| *sub_owner == owner)
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer.on_range_invalidated(owner, start, end);
        }
    }
}

impl VmBackend for MockVm {
    fn translation_id(&self, owner: ProcessHandle) -> Option<Pid> {
        if self.no_address_space.lock().contains(&owner) {
            None
        } else {
            Some(owner.0)
        }
    }

    fn flush_full_address_space(&self, _owner: ProcessHandle) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn fault_in(&self, _owner: ProcessHandle, address: u64, _write: bool) -> Result<()> {
        self.faulted.lock().push(address);
        match self.failing.lock().get(&address) {
            Some(&err) => Err(err),
            None => Ok(()),
        }
    }

    fn subscribe(
        &self,
        owner: ProcessHandle,
        observer: Arc<dyn AddressSpaceObserver>,
    ) -> Result<Subscription> {
        if let Some(err) = self.deny_subscribe.lock().take() {
            return Err(err);
        }
        let subscription = Subscription(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .insert(subscription, (owner, observer));
        Ok(subscription)
    }

    fn unsubscribe(&self, subscription: Subscription) {
        let removed = self.subscriptions.lock().remove(&subscription);
        debug_assert!(removed.is_some(), "double unsubscribe");
    }
}
