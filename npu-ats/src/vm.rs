// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Boundary to the OS virtual-memory subsystem.
//!
//! The VM side owns address spaces, page faulting and change notification;
//! this core consumes those services through [`VmBackend`] and hands back an
//! [`AddressSpaceObserver`] that forwards change events into the
//! invalidation engine.

use std::sync::Arc;

use npu_core::Result;

/// Hardware translation tag for one address space.
///
/// Distinct from any OS process id: this is the value the NPU compares
/// translations against.
pub type Pid = u64;

/// Drain identifier. Reserved by the hardware contract, never assigned to a
/// live address space, so a shootdown tagged with it can never alias a real
/// context.
pub const RESERVED_PID: Pid = 0;

/// Opaque identity of an address-space owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(pub u64);

/// Opaque token for one registered observer, minted by the backend and
/// surrendered exactly once at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(pub u64);

/// Address-space change events delivered by the VM subsystem.
///
/// Implemented by this core, once per context.
pub trait AddressSpaceObserver: Send + Sync {
    /// The address space is going away.
    fn on_release(&self, owner: ProcessHandle);

    /// One page's translation changed.
    fn on_single_address_changed(&self, owner: ProcessHandle, address: u64);

    /// Translations in `[start, end)` were invalidated.
    fn on_range_invalidated(&self, owner: ProcessHandle, start: u64, end: u64);
}

/// Services consumed from the VM subsystem.
pub trait VmBackend: Send + Sync {
    /// Hardware translation tag backing `owner`, or `None` for an actor
    /// with no address space. Never [`RESERVED_PID`] for a live owner.
    fn translation_id(&self, owner: ProcessHandle) -> Option<Pid>;

    /// Flush the owner's entire local translation state. Used before device
    /// shootdowns for contexts whose hardware cannot flush by address.
    fn flush_full_address_space(&self, owner: ProcessHandle);

    /// Fault in the page at `address` and touch it so a second-level
    /// translation entry exists.
    fn fault_in(&self, owner: ProcessHandle, address: u64, write: bool) -> Result<()>;

    /// Start delivering change events for `owner` to `observer`.
    fn subscribe(
        &self,
        owner: ProcessHandle,
        observer: Arc<dyn AddressSpaceObserver>,
    ) -> Result<Subscription>;

    /// Stop delivery for a previous [`VmBackend::subscribe`].
    fn unsubscribe(&self, subscription: Subscription);
}
