//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces infrastructure must fulfill, and the
//! boundary at which external collaborators the spec treats as
//! out-of-scope (`Store`, the CA/key manager, the terminal UI, the LLM
//! backend) are consumed through narrow contracts instead of being
//! implemented here. This file imports only from `crate::domain` and
//! `vessel_common` — never from `crate::infra`.

#![allow(async_fn_in_trait)]

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vessel_common::{
    CoreError, MultiHostListResult, PreparationResult, ResourceCheckResult, Sandbox, SnapshotRef,
    SourceVM, TaskHandle, VMRef, VMState, VMValidationResult,
};

// ── Value types used only at port boundaries ──────────────────────────────

/// Parameters for cloning a new VM from a source/golden VM.
pub struct CloneSpec<'a> {
    pub source_name: &'a str,
    pub new_name: &'a str,
    pub cpu: u32,
    pub memory_mb: u64,
    pub network: Option<&'a str>,
}

/// Advisory plan returned by back-ends without a native filesystem diff.
/// Implementers must not synthesize a fake diff (§4.4).
#[derive(Debug, Clone, Default)]
pub struct FsComparePlan {
    pub notes: Vec<String>,
}

/// An IPv4 address plus the MAC address of the interface it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ip: String,
    pub mac: String,
}

// ── Provider (§4.4, §6) ────────────────────────────────────────────────────

/// The cross-hypervisor contract every driver (Proxmox, libvirt, ...)
/// must honor identically, including state mapping and validation
/// semantics (§9 design notes: polymorphism over provider back-ends is
/// expressed as a capability set, not via inheritance).
pub trait Provider {
    async fn clone_from_vm(&self, spec: &CloneSpec<'_>, cancel: &CancellationToken) -> Result<VMRef, CoreError>;

    /// Alias for back-ends (like Proxmox) where "base images" are
    /// themselves VMs/templates; delegates to `clone_from_vm`. Back-ends
    /// without VM-as-template semantics may instead return a
    /// `ValidationFailed` "not supported" error (see REDESIGN FLAG /
    /// Open Question #2 — this crate resolves it; see DESIGN.md).
    async fn clone_vm(&self, spec: &CloneSpec<'_>, cancel: &CancellationToken) -> Result<VMRef, CoreError>;

    async fn start_vm(&self, name: &str, cancel: &CancellationToken) -> Result<(), CoreError>;
    async fn stop_vm(&self, name: &str, force: bool, cancel: &CancellationToken) -> Result<(), CoreError>;
    async fn destroy_vm(&self, name: &str, cancel: &CancellationToken) -> Result<(), CoreError>;

    async fn create_snapshot(
        &self,
        name: &str,
        snapshot_name: &str,
        external: bool,
        cancel: &CancellationToken,
    ) -> Result<SnapshotRef, CoreError>;

    async fn diff_snapshot(&self, name: &str, from: &str, to: &str) -> Result<FsComparePlan, CoreError>;

    async fn get_ip_address(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DiscoveredAddress, CoreError>;

    async fn get_vm_state(&self, name: &str) -> Result<VMState, CoreError>;

    async fn validate_source_vm(&self, name: &str) -> Result<VMValidationResult, CoreError>;

    async fn check_host_resources(
        &self,
        cpus: u32,
        memory_mb: u64,
    ) -> Result<ResourceCheckResult, CoreError>;

    async fn inject_ssh_key(&self, name: &str, user: &str, public_key: &str) -> Result<(), CoreError>;
}

/// Aggregates a "list all VMs" view across configured hosts/nodes (§4.5).
pub trait MultiHostList {
    async fn list_vms(&self) -> MultiHostListResult;

    /// Scan hosts in configuration order; return the first host that
    /// lists a VM of that name.
    async fn find_host_for_vm(&self, name: &str) -> Option<String>;
}

// ── Async task polling (§4.2) ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// Terminal status; `exit_status` is the provider's raw exit string
    /// (e.g. `"OK"` on Proxmox, anything else is a failure).
    Stopped { exit_status: String },
}

/// Anything that can report the status of a previously issued async task
/// handle. Implemented by the Proxmox client; `TaskWaiter` is generic over
/// this so polling logic is written once (§9 design notes).
pub trait TaskStatusSource {
    async fn get_task_status(&self, handle: &TaskHandle) -> Result<TaskStatus, CoreError>;
}

// ── Store (out of scope — narrow contract only) ───────────────────────────

/// The persistence collaborator. Implemented elsewhere (SQLite-backed);
/// the core only ever holds identifiers and calls through this contract.
pub trait Store {
    async fn get_source_vm(&self, name: &str) -> Result<Option<SourceVM>, CoreError>;
    async fn upsert_source_vm(&self, vm: &SourceVM) -> Result<(), CoreError>;

    async fn get_sandbox(&self, id: &str) -> Result<Option<Sandbox>, CoreError>;
    async fn list_sandboxes(&self, agent_id: Option<&str>) -> Result<Vec<Sandbox>, CoreError>;
    async fn create_sandbox(&self, sandbox: &Sandbox) -> Result<(), CoreError>;
    async fn update_sandbox(&self, sandbox: &Sandbox) -> Result<(), CoreError>;
    async fn destroy_sandbox(&self, id: &str) -> Result<(), CoreError>;
}

// ── LLM collaborator (§6) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single requested tool invocation emitted by the model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON-encoded arguments, parsed by the dispatcher.
    pub arguments: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    /// Character length contributed to the orchestrator's token estimate:
    /// `len(content) + Σ (len(name) + len(arguments))` over any tool
    /// calls this message carries (§4.10).
    #[must_use]
    pub fn estimate_len(&self) -> usize {
        self.content.len()
            + self
                .tool_calls
                .iter()
                .map(|tc| tc.name.len() + tc.arguments.len())
                .sum::<usize>()
    }
}

pub struct ChatRequest<'a> {
    pub model: Option<&'a str>,
    pub messages: &'a [ChatMessage],
    pub tool_schema: &'a serde_json::Value,
}

pub struct ChatResponse {
    pub message: ChatMessage,
}

pub trait LlmClient {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatResponse, CoreError>;
}

// ── Approval UI (§4.6, §6) ─────────────────────────────────────────────────

/// The outward-facing half of the approval gate rendezvous: emitting a
/// request message to the UI. The inward half (`handleApprovalResponse`)
/// is modeled as the gate's own channel, not part of this trait, since
/// only one direction is ever initiated by the core.
pub trait ApprovalUi {
    fn emit_memory_request(&self, check: &ResourceCheckResult);
    fn emit_network_request(&self, command: &str, tool: &str, urls: &[String]);
    fn emit_source_prepare_request(&self, vm_name: &str);
}

// ── SSH collaborator ────────────────────────────────────────────────────────

/// Optional bastion indirection for reaching VMs on private networks.
pub struct ProxyJump<'a> {
    pub host: &'a str,
    pub user: Option<&'a str>,
    pub port: Option<u16>,
}

pub struct SshTarget<'a> {
    pub host: &'a str,
    pub user: &'a str,
    pub port: u16,
    pub proxy_jump: Option<ProxyJump<'a>>,
}

/// A single chunk of streamed command output (§4.8).
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Data { data: Vec<u8>, is_stderr: bool },
    Retry { attempt: u32, max: u32, delay: Duration, error: String },
    Reset,
}

/// Command execution over SSH, abstracted so the driver is swappable and
/// mockable in tests (the teacher's `ShellExecutor` pattern, generalized
/// from a local child process to a remote SSH session).
pub trait SshSession {
    /// Run a command to completion, invoking `on_event` for every output
    /// chunk and retry/reset signal as it arrives.
    async fn run_command(
        &self,
        target: &SshTarget<'_>,
        command: &str,
        on_event: &mut dyn FnMut(OutputEvent),
        cancel: &CancellationToken,
    ) -> Result<(i32, Vec<u8>, Vec<u8>), CoreError>;

    /// Read a remote file's full contents.
    async fn read_file(&self, target: &SshTarget<'_>, path: &str) -> Result<Vec<u8>, CoreError>;
}

// ── CA key material (out of scope — narrow contract only) ─────────────────

/// Read-only access to the CA public key used by the preparation protocol
/// and the cert-auth trust anchor. The CA/key manager itself is out of
/// scope; this crate only ever reads the public key file.
pub trait CaKeyReader {
    fn read_ca_public_key(&self) -> Result<Vec<u8>, CoreError>;
}

// ── Progress reporting (cleanup, §4.10) ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxCleanupStatus {
    Pending,
    Destroying,
    Destroyed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct SandboxCleanupEvent {
    pub sandbox_id: String,
    pub status: SandboxCleanupStatus,
    pub message: Option<String>,
}

pub trait ProgressReporter {
    fn report(&self, event: &SandboxCleanupEvent);
}

// ── Orchestrator turn events (§4.10) ───────────────────────────────────────

/// Observability events emitted across a single `run` turn. The state
/// machine for a tool call is `Dispatch -> [ApprovalRequested] ->
/// [Executing] -> ResultAppended`; `ToolStart` brackets the dispatch side,
/// `ToolComplete` the result side.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    ToolStart { call_id: String, name: String },
    ToolComplete { call_id: String, name: String, success: bool },
    FinalMessage { content: String },
}

pub trait OrchestratorObserver {
    fn on_event(&self, event: &OrchestratorEvent);
}

/// A minimal key/value configuration carrier accepted by value by the
/// orchestrator and the Proxmox driver — this crate never reads env vars
/// or files itself (§1.1 Configuration).
pub type ConfigMap = HashMap<String, String>;
