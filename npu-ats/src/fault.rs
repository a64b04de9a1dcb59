//! Translation-fault servicing for accelerator-initiated access.
//!
//! The device reports addresses it could not translate; each one is faulted
//! in and touched through the VM backend so a second-level translation
//! entry exists before the device retries.

use std::sync::atomic::Ordering;

use log::{debug, warn};

use npu_core::{Error, Result};

use crate::stats::AtsStats;
use crate::vm::{ProcessHandle, VmBackend};

/// Fault in a batch of addresses.
///
/// Per-address status is accumulated; one failure does not stop the rest of
/// the batch. The aggregate result is the last error observed — which code
/// wins under multiple failures is implementation-defined.
pub(crate) fn fault_in_batch(
    vm: &dyn VmBackend,
    owner: ProcessHandle,
    addresses: &[u64],
    write_flags: &[bool],
    stats: &AtsStats,
) -> Result<()> {
    if addresses.len() != write_flags.len() {
        return Err(Error::InvalidArgument);
    }

    let mut statuses: Vec<Result<()>> = Vec::with_capacity(addresses.len());
    let mut last_err = None;
    for (&address, &write) in addresses.iter().zip(write_flags) {
        let status = vm.fault_in(owner, address, write);
        match status {
            Ok(()) => {
                stats.faults_served.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!("ats: fault at {:#x} (write={}) failed: {}", address, write, err);
                stats.faults_failed.fetch_add(1, Ordering::Relaxed);
                last_err = Some(err);
            }
        }
        statuses.push(status);
    }

    if let Some(err) = last_err {
        let failed = statuses.iter().filter(|s| s.is_err()).count();
        warn!(
            "ats: {} of {} translation faults failed",
            failed,
            statuses.len()
        );
        return Err(err);
    }
    Ok(())
}
