//! Data model shared across the provider driver, the orchestrator, and the
//! source-preparation protocol. Pure data — no I/O, no async.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── VM identity & state ───────────────────────────────────────────────────

/// Opaque handle to a VM after a successful clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VMRef {
    pub name: String,
    /// Provider-defined. For Proxmox, the stringified VMID.
    pub uuid: String,
}

/// Canonical VM power state, mapped once at the driver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VMState {
    Running,
    ShutOff,
    Paused,
    Unknown,
}

/// Kind of snapshot a driver created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Internal,
    External,
}

/// Reference to a VM snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub name: String,
    pub kind: SnapshotKind,
    /// Provider-opaque locator, e.g. `"proxmox:<vmid>:<name>"`.
    pub reference: String,
}

/// Cross-provider async task identifier.
///
/// An empty `handle` with `empty_means_sync = true` is the synchronous
/// completion sentinel (§9 design notes): some provider endpoints can
/// complete inline and return no task to poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub handle: String,
    pub empty_means_sync: bool,
}

impl TaskHandle {
    /// The handle used when an operation completed synchronously.
    #[must_use]
    pub fn sync() -> Self {
        Self {
            handle: String::new(),
            empty_means_sync: true,
        }
    }

    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.empty_means_sync || self.handle.is_empty()
    }
}

// ── Validation & resource checks ──────────────────────────────────────────

/// Result of a pre-flight check against a source VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VMValidationResult {
    pub vm_name: String,
    pub valid: bool,
    pub state: Option<VMState>,
    pub has_network: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Result of checking host resource availability against a requested clone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceCheckResult {
    pub valid: bool,
    pub required_cpus: u32,
    pub required_memory_mb: u64,
    pub available_cpus: u32,
    pub total_cpus: u32,
    pub available_memory_mb: u64,
    pub total_memory_mb: u64,
    pub available_disk_mb: u64,
    pub needs_cpu_approval: bool,
    pub needs_memory_approval: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ResourceCheckResult {
    /// Whether either resource dimension needs human approval.
    #[must_use]
    pub fn needs_approval(&self) -> bool {
        self.needs_cpu_approval || self.needs_memory_approval
    }
}

// ── Multi-host listing ─────────────────────────────────────────────────────

/// A VM as surfaced through the multi-host aggregate listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiHostVMInfo {
    pub name: String,
    pub uuid: String,
    pub state: VMState,
    /// Always `true` for VMs surfaced through this path — they are
    /// hypervisor-managed, not agent-ephemeral.
    pub persistent: bool,
    pub host_name: String,
    pub host_address: String,
}

/// A per-host failure encountered while aggregating a multi-host listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostError {
    pub host_name: String,
    pub host_address: String,
    pub message: String,
}

/// Aggregate result of listing VMs across all configured hosts/nodes.
/// Partial failure is first-class: per-host errors never fail the call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiHostListResult {
    pub vms: Vec<MultiHostVMInfo>,
    pub host_errors: Vec<HostError>,
}

// ── Persisted entities (owned by the `Store` collaborator) ────────────────

/// State of an agent-managed sandbox, persisted through `Store`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxLifecycleState {
    Creating,
    Running,
    Stopped,
    Destroying,
    Destroyed,
    Failed,
}

/// An ephemeral sandbox cloned from a source VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    /// Follows the convention `sbx-<short-id>` — the sole marker
    /// distinguishing sandbox VMs from source VMs in external listings.
    pub sandbox_name: String,
    pub state: SandboxLifecycleState,
    pub base_image: String,
    pub network: String,
    pub agent_id: String,
    pub ip_address: Option<String>,
    pub host_name: Option<String>,
    pub host_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sandbox {
    /// The `sbx-` naming convention used to distinguish agent-created
    /// sandboxes from golden source VMs in any listing.
    #[must_use]
    pub fn name_for(short_id: &str) -> String {
        format!("sbx-{short_id}")
    }

    #[must_use]
    pub fn is_sandbox_name(name: &str) -> bool {
        name.starts_with("sbx-")
    }
}

/// A golden/source VM, persisted through `Store`. Never mutated by agents
/// beyond the one-shot preparation protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceVM {
    pub name: String,
    pub prepared: bool,
    pub prepared_at: Option<DateTime<Utc>>,
    pub prepare_json: Option<String>,
    pub ca_fingerprint: Option<String>,
    pub host_name: Option<String>,
    pub host_address: Option<String>,
}

impl SourceVM {
    /// A source VM is "prepared" iff `prepared` is set and its recorded CA
    /// fingerprint matches the CA currently in effect. A mismatch means the
    /// CA has rotated and preparation must be redone.
    #[must_use]
    pub fn is_prepared_under(&self, current_ca_fingerprint: &str) -> bool {
        self.prepared
            && self
                .ca_fingerprint
                .as_deref()
                .is_some_and(|fp| fp == current_ca_fingerprint)
    }
}

/// Record of side effects performed while preparing a source VM, persisted
/// as JSON for audit (`SourceVM::prepare_json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreparationResult {
    pub user_created: bool,
    pub shell_installed: bool,
    pub ca_key_installed: bool,
    pub sshd_configured: bool,
    pub principals_created: bool,
    pub sshd_restarted: bool,
}

// ── Human-in-the-loop approvals ────────────────────────────────────────────

/// What kind of human decision an outstanding approval is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Memory,
    Network,
    SourcePrepare,
}

/// The request payload shown to the human for a memory-insufficiency gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryApprovalRequest {
    pub check: ResourceCheckResult,
}

/// The request payload shown to the human for a network-touching command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkApprovalRequest {
    pub command: String,
    pub tool: String,
    pub urls: Vec<String>,
}

/// The request payload shown to the human for a source-VM preparation gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePrepareApprovalRequest {
    pub vm_name: String,
}

/// The union of approval request payloads, tagged by `ApprovalKind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalRequest {
    Memory(MemoryApprovalRequest),
    Network(NetworkApprovalRequest),
    SourcePrepare(SourcePrepareApprovalRequest),
}

impl ApprovalRequest {
    #[must_use]
    pub fn kind(&self) -> ApprovalKind {
        match self {
            ApprovalRequest::Memory(_) => ApprovalKind::Memory,
            ApprovalRequest::Network(_) => ApprovalKind::Network,
            ApprovalRequest::SourcePrepare(_) => ApprovalKind::SourcePrepare,
        }
    }
}
