//! Pure arithmetic backing `checkHostResources` (§4.4).
//!
//! Byte→MB conversion is integer division by `1024*1024`, exactly as
//! specified — no rounding, no float arithmetic, so behavior is bit-exact
//! and trivially testable.

use vessel_common::ResourceCheckResult;

const BYTES_PER_MB: u64 = 1024 * 1024;
const CPU_APPROVAL_THRESHOLD: f64 = 0.80;

/// Evaluate a resource check given raw node-status figures.
///
/// `cpu_utilization` is a fraction in `[0.0, 1.0]` (the node's reported
/// current CPU load), not the number of cores in use.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn evaluate_resource_check(
    required_cpus: u32,
    required_memory_mb: u64,
    total_memory_bytes: u64,
    free_memory_bytes: u64,
    total_cpus: u32,
    cpu_utilization: f64,
    available_disk_mb: u64,
) -> ResourceCheckResult {
    let total_memory_mb = total_memory_bytes / BYTES_PER_MB;
    let available_memory_mb = free_memory_bytes / BYTES_PER_MB;
    // Available CPUs is advisory headroom derived from current utilization;
    // never allowed to exceed total.
    let available_cpus = if cpu_utilization >= 1.0 {
        0
    } else {
        ((f64::from(total_cpus)) * (1.0 - cpu_utilization)).floor() as u32
    };

    let needs_memory_approval = required_memory_mb > available_memory_mb;
    let needs_cpu_approval = cpu_utilization > CPU_APPROVAL_THRESHOLD;

    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    if needs_memory_approval {
        warnings.push(format!(
            "requested {required_memory_mb} MiB memory exceeds {available_memory_mb} MiB available"
        ));
    }
    if needs_cpu_approval {
        warnings.push(format!(
            "host CPU utilization is {:.0}%, above the 80% threshold",
            cpu_utilization * 100.0
        ));
    }
    if required_cpus > total_cpus {
        errors.push(format!(
            "requested {required_cpus} vCPUs exceeds {total_cpus} total on host"
        ));
    }

    ResourceCheckResult {
        valid: errors.is_empty(),
        required_cpus,
        required_memory_mb,
        available_cpus,
        total_cpus,
        available_memory_mb,
        total_memory_mb,
        available_disk_mb,
        needs_cpu_approval,
        needs_memory_approval,
        warnings,
        errors,
    }
}
