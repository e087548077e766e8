//! Pure VMID allocation arithmetic backing `ProviderClient::nextVMID` (§4.1).

use std::collections::BTreeSet;

/// Return the smallest id in `[start, end]` not present in `used`.
///
/// `None` means the range is exhausted; the caller (the Proxmox client) is
/// responsible for turning that into a `"no available VMID"` error.
#[must_use]
pub fn next_free_vmid(used: &BTreeSet<u32>, start: u32, end: u32) -> Option<u32> {
    (start..=end).find(|id| !used.contains(id))
}
