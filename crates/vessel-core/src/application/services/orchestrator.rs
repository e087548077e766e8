//! Single-threaded cooperative loop driving an LLM tool-calling session
//! (§4.10).
//!
//! One `AgentOrchestrator` instance belongs to exactly one session: at
//! most one in-flight LLM turn, tool calls within a turn dispatched
//! sequentially. The provider driver underneath is shared and thread-safe,
//! but nothing in this module is — it is not `Sync`, and is not meant to be.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use vessel_common::{
    ApprovalRequest, CoreError, MemoryApprovalRequest, Sandbox, SandboxLifecycleState,
};

use crate::application::ports::{
    ApprovalUi, CaKeyReader, ChatMessage, ChatRequest, ChatRole, CloneSpec, LlmClient,
    MultiHostList, OrchestratorEvent, OrchestratorObserver, Provider, ProxyJump, SandboxCleanupEvent,
    SandboxCleanupStatus, SshSession, SshTarget, Store, TaskStatusSource, ToolCall,
};
use crate::application::services::{ApprovalGate, CommandStreamer, SourcePrepareConfig, SourcePrepareProtocol};
use crate::domain::estimate_tokens;

const DEFAULT_CONTEXT_CEILING_TOKENS: u64 = 64_000;
const DEFAULT_COMPACT_THRESHOLD: f64 = 0.9;
const DEFAULT_TOKENS_PER_CHAR: f64 = 0.25;
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

const READ_ONLY_TOOLS: &[&str] = &[
    "list_sandboxes",
    "get_sandbox",
    "list_vms",
    "read_file",
    "list_playbooks",
    "get_playbook",
    "run_source_command",
    "read_source_file",
];

const WRITE_ONLY_TOOLS: &[&str] = &["create_sandbox", "destroy_sandbox", "run_command"];

/// Deployment knobs handed to the orchestrator by value — no internal
/// env/file reads (§1.1).
pub struct OrchestratorConfig {
    pub system_prompt: String,
    pub model: Option<String>,
    pub compaction_model: Option<String>,
    pub context_ceiling_tokens: u64,
    pub compact_threshold: f64,
    pub tokens_per_char: f64,
    pub cleanup_timeout: Duration,
    pub sandbox_ssh_user: String,
    pub sandbox_ssh_port: u16,
    pub source_prepare: SourcePrepareConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model: None,
            compaction_model: None,
            context_ceiling_tokens: DEFAULT_CONTEXT_CEILING_TOKENS,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            tokens_per_char: DEFAULT_TOKENS_PER_CHAR,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            sandbox_ssh_user: "root".to_string(),
            sandbox_ssh_port: 22,
            source_prepare: SourcePrepareConfig::default(),
        }
    }
}

struct NoopProgress;
impl crate::application::ports::ProgressReporter for NoopProgress {
    fn report(&self, _event: &SandboxCleanupEvent) {}
}

/// Outcome of a single `run` call.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The LLM produced a final assistant message with no further tool
    /// calls.
    Final(String),
    /// `input` was a recognized slash command, handled without touching
    /// the LLM.
    SlashCommand(String),
}

/// Drives one session's worth of LLM tool-calling turns.
///
/// Generic over every collaborator so the whole stack is testable with
/// hand-written doubles, the same discipline as `CommandStreamer` and
/// `SourcePrepareProtocol`.
pub struct AgentOrchestrator<'a, P, S, C, T, L>
where
    P: Provider + MultiHostList + TaskStatusSource,
    S: SshSession,
    C: CaKeyReader,
    T: Store,
    L: LlmClient,
{
    provider: &'a P,
    ssh: &'a S,
    ca: &'a C,
    store: &'a T,
    llm: &'a L,
    approval_gate: ApprovalGate,
    config: OrchestratorConfig,
    history: Vec<ChatMessage>,
    session_prepared_cache: HashMap<String, bool>,
    created_sandbox_ids: Vec<String>,
    read_only: bool,
}

impl<'a, P, S, C, T, L> AgentOrchestrator<'a, P, S, C, T, L>
where
    P: Provider + MultiHostList + TaskStatusSource,
    S: SshSession,
    C: CaKeyReader,
    T: Store,
    L: LlmClient,
{
    #[must_use]
    pub fn new(provider: &'a P, ssh: &'a S, ca: &'a C, store: &'a T, llm: &'a L, config: OrchestratorConfig) -> Self {
        Self {
            provider,
            ssh,
            ca,
            store,
            llm,
            approval_gate: ApprovalGate::new(),
            config,
            history: Vec::new(),
            session_prepared_cache: HashMap::new(),
            created_sandbox_ids: Vec::new(),
            read_only: false,
        }
    }

    /// Restrict the exposed tool set to the read-only subset, or restore
    /// the full set.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Clear conversation history. Does not affect session-created
    /// sandboxes or the prepared-source cache.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    fn active_tools(&self) -> Vec<&'static str> {
        if self.read_only {
            READ_ONLY_TOOLS.to_vec()
        } else {
            READ_ONLY_TOOLS.iter().chain(WRITE_ONLY_TOOLS.iter()).copied().collect()
        }
    }

    fn tool_schema(&self) -> Value {
        json!(self.active_tools())
    }

    /// Run one turn: append `input`, handle slash commands synchronously,
    /// or drive the LLM tool-calling loop to a final assistant message.
    ///
    /// # Errors
    ///
    /// Propagates any `CoreError` from the LLM client, provider, SSH, or
    /// store collaborators encountered while dispatching tool calls.
    pub async fn run(
        &mut self,
        input: &str,
        ui: &impl ApprovalUi,
        observer: &impl OrchestratorObserver,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, CoreError> {
        if let Some(command) = input.strip_prefix('/') {
            return Ok(RunOutcome::SlashCommand(self.handle_slash_command(command)));
        }

        self.history.push(ChatMessage {
            role: ChatRole::User,
            content: input.to_string(),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        });

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            self.maybe_compact().await;

            let tool_schema = self.tool_schema();
            let mut messages = Vec::with_capacity(self.history.len() + 1);
            messages.push(ChatMessage {
                role: ChatRole::System,
                content: self.config.system_prompt.clone(),
                tool_call_id: None,
                name: None,
                tool_calls: Vec::new(),
            });
            messages.extend(self.history.iter().cloned());

            let request = ChatRequest {
                model: self.config.model.as_deref(),
                messages: &messages,
                tool_schema: &tool_schema,
            };
            let response = self.llm.chat(request).await?;
            let assistant_message = response.message;

            if assistant_message.tool_calls.is_empty() {
                let content = assistant_message.content.clone();
                self.history.push(assistant_message);
                observer.on_event(&OrchestratorEvent::FinalMessage { content: content.clone() });
                return Ok(RunOutcome::Final(content));
            }

            let tool_calls = assistant_message.tool_calls.clone();
            self.history.push(assistant_message);

            for call in tool_calls {
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }

                observer.on_event(&OrchestratorEvent::ToolStart {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                });

                let outcome = self.dispatch_tool(&call, ui, cancel).await;
                let (content, success) = match outcome {
                    Ok(content) => (content, true),
                    Err(e) => (format!("Error: {e}"), false),
                };

                observer.on_event(&OrchestratorEvent::ToolComplete {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    success,
                });

                self.history.push(ChatMessage {
                    role: ChatRole::Tool,
                    content,
                    tool_call_id: Some(call.id),
                    name: Some(call.name),
                    tool_calls: Vec::new(),
                });
            }
        }
    }

    fn handle_slash_command(&mut self, command: &str) -> String {
        match command.trim() {
            "reset" => {
                self.reset();
                "history cleared".to_string()
            }
            "readonly on" => {
                self.set_read_only(true);
                "read-only mode enabled".to_string()
            }
            "readonly off" => {
                self.set_read_only(false);
                "read-only mode disabled".to_string()
            }
            other => format!("unknown command: /{other}"),
        }
    }

    async fn maybe_compact(&mut self) {
        let system_len = self.config.system_prompt.len();
        let message_lens: Vec<usize> = self.history.iter().map(ChatMessage::estimate_len).collect();
        let estimated = estimate_tokens(system_len, &message_lens, self.config.tokens_per_char);

        let threshold = (self.config.compact_threshold * self.config.context_ceiling_tokens as f64) as u64;
        if estimated < threshold {
            return;
        }

        match self.compact().await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(error = %e, "context compaction failed, continuing with uncompacted history");
            }
        }
    }

    async fn compact(&mut self) -> Result<(), CoreError> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage {
            role: ChatRole::System,
            content: "Summarize the conversation so far in a few sentences, preserving any \
                       facts needed to keep working (sandbox names, VM names, outstanding tasks)."
                .to_string(),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        });
        messages.extend(self.history.iter().cloned());

        let empty_schema = json!([]);
        let request = ChatRequest {
            model: self.config.compaction_model.as_deref().or(self.config.model.as_deref()),
            messages: &messages,
            tool_schema: &empty_schema,
        };
        let response = self.llm.chat(request).await?;

        self.history = vec![
            ChatMessage {
                role: ChatRole::System,
                content: format!("Conversation summary: {}", response.message.content),
                tool_call_id: None,
                name: None,
                tool_calls: Vec::new(),
            },
            ChatMessage {
                role: ChatRole::Assistant,
                content: "Understood, continuing from the summary above.".to_string(),
                tool_call_id: None,
                name: None,
                tool_calls: Vec::new(),
            },
        ];
        Ok(())
    }

    async fn dispatch_tool(
        &mut self,
        call: &ToolCall,
        ui: &impl ApprovalUi,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        tracing::debug!(tool = call.name, call_id = call.id, "dispatching tool call");
        let args: Value = if call.arguments.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&call.arguments)
                .map_err(|e| CoreError::ValidationFailed(format!("invalid arguments for {}: {e}", call.name)))?
        };

        match call.name.as_str() {
            "list_sandboxes" => self.tool_list_sandboxes(&args).await,
            "get_sandbox" => self.tool_get_sandbox(&args).await,
            "list_vms" => self.tool_list_vms().await,
            "read_file" => self.tool_read_sandbox_file(&args, cancel).await,
            "list_playbooks" | "get_playbook" => Err(CoreError::NotFound {
                kind: "playbook",
                name: "playbooks are managed by the persistence layer and are not available in this build".to_string(),
            }),
            "run_source_command" => self.tool_run_source_command(&args, ui, cancel).await,
            "read_source_file" => self.tool_read_source_file(&args, ui, cancel).await,
            "create_sandbox" => self.tool_create_sandbox(&args, ui, cancel).await,
            "destroy_sandbox" => self.tool_destroy_sandbox(&args, cancel).await,
            "run_command" => self.tool_run_command(&args, ui, cancel).await,
            other => Err(CoreError::ValidationFailed(format!("unknown tool: {other}"))),
        }
    }

    async fn tool_list_sandboxes(&self, args: &Value) -> Result<String, CoreError> {
        let agent_id = args.get("agent_id").and_then(Value::as_str);
        let sandboxes = self.store.list_sandboxes(agent_id).await?;
        serde_json::to_string(&sandboxes).map_err(|e| CoreError::ProtocolDecode(e.to_string()))
    }

    async fn tool_get_sandbox(&self, args: &Value) -> Result<String, CoreError> {
        let id = require_str(args, "id")?;
        let sandbox = self.store.get_sandbox(id).await?;
        serde_json::to_string(&sandbox).map_err(|e| CoreError::ProtocolDecode(e.to_string()))
    }

    async fn tool_list_vms(&self) -> Result<String, CoreError> {
        let result = self.provider.list_vms().await;
        serde_json::to_string(&result).map_err(|e| CoreError::ProtocolDecode(e.to_string()))
    }

    async fn resolve_sandbox_target(&self, id: &str) -> Result<Sandbox, CoreError> {
        self.store.get_sandbox(id).await?.ok_or_else(|| CoreError::NotFound {
            kind: "sandbox",
            name: id.to_string(),
        })
    }

    async fn tool_read_sandbox_file(&self, args: &Value, _cancel: &CancellationToken) -> Result<String, CoreError> {
        let id = require_str(args, "sandbox_id")?;
        let path = require_str(args, "path")?;
        let sandbox = self.resolve_sandbox_target(id).await?;
        let ip = sandbox.ip_address.ok_or_else(|| {
            CoreError::ValidationFailed(format!("sandbox '{id}' has no known IP address yet"))
        })?;
        let target = SshTarget {
            host: &ip,
            user: &self.config.sandbox_ssh_user,
            port: self.config.sandbox_ssh_port,
            proxy_jump: None,
        };
        let bytes = self.ssh.read_file(&target, path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn source_prepare_protocol(&self) -> SourcePrepareProtocol<'_, P, S, C, T> {
        SourcePrepareProtocol::new(self.provider, self.ssh, self.ca, self.store, &self.approval_gate, &self.config.source_prepare)
    }

    fn source_ssh_target<'t>(&self, ip: &'t str, with_proxy_jump: bool) -> SshTarget<'t> {
        SshTarget {
            host: ip,
            user: &self.config.source_prepare.readonly_user,
            port: self.config.source_prepare.ssh_port,
            proxy_jump: with_proxy_jump
                .then(|| {
                    self.config.source_prepare.proxy_jump_host.as_deref().map(|host| ProxyJump {
                        host,
                        user: self.config.source_prepare.proxy_jump_user.as_deref(),
                        port: self.config.source_prepare.proxy_jump_port,
                    })
                })
                .flatten(),
        }
    }

    async fn run_source_command_once(
        &self,
        vm_name: &str,
        command: &str,
        ui: &impl ApprovalUi,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let addr = self
            .provider
            .get_ip_address(vm_name, self.config.source_prepare.ip_discovery_timeout, cancel)
            .await?;
        let target = self.source_ssh_target(&addr.ip, true);
        let streamer = CommandStreamer::new(self.ssh, &self.approval_gate);
        let result = streamer.run_command(&target, command, ui, &mut |_| {}, cancel).await?;

        if let Some(error) = result.error {
            return Ok(error);
        }
        Ok(format!(
            "exit={}\nstdout:\n{}\nstderr:\n{}",
            result.exit_code,
            String::from_utf8_lossy(&result.stdout),
            String::from_utf8_lossy(&result.stderr)
        ))
    }

    async fn tool_run_source_command(
        &mut self,
        args: &Value,
        ui: &impl ApprovalUi,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let vm_name = require_str(args, "vm_name")?.to_string();
        let command = require_str(args, "command")?.to_string();

        self.source_prepare_protocol()
            .ensure_prepared(&vm_name, &mut self.session_prepared_cache, ui, cancel)
            .await?;

        // Fallback safety net (§4.7): a connection/auth error here means
        // the cached preparation is stale (reboot, CA rotation, host key
        // change, ...). Invalidate it, re-prepare, and retry once.
        match self.run_source_command_once(&vm_name, &command, ui, cancel).await {
            Ok(result) => Ok(result),
            Err(e) if e.matches_connection_pattern() => {
                SourcePrepareProtocol::<P, S, C, T>::invalidate(&mut self.session_prepared_cache, &vm_name);
                self.source_prepare_protocol()
                    .ensure_prepared(&vm_name, &mut self.session_prepared_cache, ui, cancel)
                    .await?;
                self.run_source_command_once(&vm_name, &command, ui, cancel).await
            }
            Err(e) => Err(e),
        }
    }

    async fn read_source_file_once(
        &self,
        vm_name: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let addr = self
            .provider
            .get_ip_address(vm_name, self.config.source_prepare.ip_discovery_timeout, cancel)
            .await?;
        let target = self.source_ssh_target(&addr.ip, false);
        let bytes = self.ssh.read_file(&target, path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn tool_read_source_file(
        &mut self,
        args: &Value,
        ui: &impl ApprovalUi,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let vm_name = require_str(args, "vm_name")?.to_string();
        let path = require_str(args, "path")?.to_string();

        self.source_prepare_protocol()
            .ensure_prepared(&vm_name, &mut self.session_prepared_cache, ui, cancel)
            .await?;

        match self.read_source_file_once(&vm_name, &path, cancel).await {
            Ok(content) => Ok(content),
            Err(e) if e.matches_connection_pattern() => {
                SourcePrepareProtocol::<P, S, C, T>::invalidate(&mut self.session_prepared_cache, &vm_name);
                self.source_prepare_protocol()
                    .ensure_prepared(&vm_name, &mut self.session_prepared_cache, ui, cancel)
                    .await?;
                self.read_source_file_once(&vm_name, &path, cancel).await
            }
            Err(e) => Err(e),
        }
    }

    async fn tool_create_sandbox(
        &mut self,
        args: &Value,
        ui: &impl ApprovalUi,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let source_name = require_str(args, "source_name")?.to_string();
        let cpu = require_u64(args, "cpu")? as u32;
        let memory_mb = require_u64(args, "memory_mb")?;
        let agent_id = args.get("agent_id").and_then(Value::as_str).unwrap_or("default").to_string();
        let network = args.get("network").and_then(Value::as_str).map(str::to_string);
        let new_name = args
            .get("new_name")
            .and_then(Value::as_str)
            .map_or_else(|| Sandbox::name_for(&short_id()), str::to_string);

        let check = self.provider.check_host_resources(cpu, memory_mb).await?;
        if check.needs_approval() {
            let request = ApprovalRequest::Memory(MemoryApprovalRequest { check: check.clone() });
            let approved = self.approval_gate.request(&request, ui, cancel).await?;
            if !approved {
                return Err(CoreError::ResourceInsufficient(format!(
                    "approval denied for cpu={cpu} memory_mb={memory_mb}"
                )));
            }
        }

        let spec = CloneSpec {
            source_name: &source_name,
            new_name: &new_name,
            cpu,
            memory_mb,
            network: network.as_deref(),
        };
        let vm_ref = self.provider.clone_from_vm(&spec, cancel).await?;

        let now = chrono::Utc::now();
        let sandbox = Sandbox {
            id: vm_ref.uuid.clone(),
            sandbox_name: new_name,
            state: SandboxLifecycleState::Creating,
            base_image: source_name,
            network: network.unwrap_or_default(),
            agent_id,
            ip_address: None,
            host_name: None,
            host_address: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_sandbox(&sandbox).await?;
        self.created_sandbox_ids.push(sandbox.id.clone());

        serde_json::to_string(&sandbox).map_err(|e| CoreError::ProtocolDecode(e.to_string()))
    }

    async fn tool_destroy_sandbox(&mut self, args: &Value, cancel: &CancellationToken) -> Result<String, CoreError> {
        let id = require_str(args, "id")?.to_string();
        let sandbox = self.resolve_sandbox_target(&id).await?;

        let state = self.provider.get_vm_state(&sandbox.sandbox_name).await?;
        if matches!(state, vessel_common::VMState::Running) {
            self.provider.stop_vm(&sandbox.sandbox_name, false, cancel).await?;
        }
        self.provider.destroy_vm(&sandbox.sandbox_name, cancel).await?;
        self.store.destroy_sandbox(&id).await?;
        self.created_sandbox_ids.retain(|existing| existing != &id);

        Ok(format!("destroyed sandbox {id}"))
    }

    async fn tool_run_command(
        &mut self,
        args: &Value,
        ui: &impl ApprovalUi,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let id = require_str(args, "sandbox_id")?.to_string();
        let command = require_str(args, "command")?.to_string();
        let sandbox = self.resolve_sandbox_target(&id).await?;
        let ip = sandbox.ip_address.ok_or_else(|| {
            CoreError::ValidationFailed(format!("sandbox '{id}' has no known IP address yet"))
        })?;
        let target = SshTarget {
            host: &ip,
            user: &self.config.sandbox_ssh_user,
            port: self.config.sandbox_ssh_port,
            proxy_jump: None,
        };
        let streamer = CommandStreamer::new(self.ssh, &self.approval_gate);
        let result = streamer.run_command(&target, &command, ui, &mut |_| {}, cancel).await?;

        if let Some(error) = result.error {
            return Ok(error);
        }
        Ok(format!(
            "exit={}\nstdout:\n{}\nstderr:\n{}",
            result.exit_code,
            String::from_utf8_lossy(&result.stdout),
            String::from_utf8_lossy(&result.stderr)
        ))
    }

    /// Destroy every session-created sandbox, silently (no progress
    /// reporter).
    ///
    /// # Errors
    ///
    /// Never fails outright — per-sandbox failures are reported through
    /// the (no-op) progress reporter rather than aborting the batch.
    pub async fn cleanup(&mut self, cancel: &CancellationToken) -> Result<(), CoreError> {
        self.cleanup_with_progress(None, &NoopProgress, cancel).await
    }

    /// Destroy `ids` (or, if `None`, every session-created sandbox), each
    /// under its own bounded timeout, reporting progress through
    /// `reporter`.
    ///
    /// Cancellation aborts remaining destroys but preserves partial
    /// progress; the tracked sandbox-id list is cleared only once, at the
    /// end, regardless of how far the batch got (§5).
    pub async fn cleanup_with_progress(
        &mut self,
        ids: Option<&[String]>,
        reporter: &impl crate::application::ports::ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let targets: Vec<String> = ids.map_or_else(|| self.created_sandbox_ids.clone(), <[String]>::to_vec);
        tracing::info!(count = targets.len(), "starting sandbox cleanup");

        for id in &targets {
            if cancel.is_cancelled() {
                break;
            }

            reporter.report(&SandboxCleanupEvent {
                sandbox_id: id.clone(),
                status: SandboxCleanupStatus::Pending,
                message: None,
            });
            reporter.report(&SandboxCleanupEvent {
                sandbox_id: id.clone(),
                status: SandboxCleanupStatus::Destroying,
                message: None,
            });

            let outcome = timeout(self.config.cleanup_timeout, self.destroy_one(id, cancel)).await;
            match outcome {
                Ok(Ok(())) => {
                    reporter.report(&SandboxCleanupEvent {
                        sandbox_id: id.clone(),
                        status: SandboxCleanupStatus::Destroyed,
                        message: None,
                    });
                }
                Ok(Err(CoreError::NotFound { .. })) => {
                    reporter.report(&SandboxCleanupEvent {
                        sandbox_id: id.clone(),
                        status: SandboxCleanupStatus::Skipped,
                        message: Some("sandbox no longer exists".to_string()),
                    });
                }
                Ok(Err(e)) => {
                    reporter.report(&SandboxCleanupEvent {
                        sandbox_id: id.clone(),
                        status: SandboxCleanupStatus::Failed,
                        message: Some(e.to_string()),
                    });
                }
                Err(_elapsed) => {
                    reporter.report(&SandboxCleanupEvent {
                        sandbox_id: id.clone(),
                        status: SandboxCleanupStatus::Failed,
                        message: Some("cleanup timed out".to_string()),
                    });
                }
            }
        }

        self.created_sandbox_ids.clear();
        Ok(())
    }

    async fn destroy_one(&self, id: &str, cancel: &CancellationToken) -> Result<(), CoreError> {
        let sandbox = self.resolve_sandbox_target(id).await?;

        let state = self.provider.get_vm_state(&sandbox.sandbox_name).await?;
        if matches!(state, vessel_common::VMState::Running) {
            self.provider.stop_vm(&sandbox.sandbox_name, true, cancel).await?;
        }
        self.provider.destroy_vm(&sandbox.sandbox_name, cancel).await?;
        self.store.destroy_sandbox(id).await
    }
}

fn require_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, CoreError> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::ValidationFailed(format!("missing required field: {field}")))
}

fn require_u64(args: &Value, field: &str) -> Result<u64, CoreError> {
    args.get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| CoreError::ValidationFailed(format!("missing required field: {field}")))
}

/// A short, filesystem/hostname-safe identifier for naming a new sandbox
/// when the caller does not supply one. Not a UUID generator — just
/// enough entropy from the process's view of time to avoid collisions
/// within a session; the store is still the source of truth for
/// uniqueness.
fn short_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
    format!("{nanos:08x}")
}
