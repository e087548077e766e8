//! Application layer — port trait definitions and use-case orchestration.
//!
//! Depends only on `crate::domain` and `vessel_common` — never on
//! `crate::infra`.

pub mod ports;
pub mod services;

pub use ports::{
    ApprovalUi, CaKeyReader, ChatMessage, ChatRequest, ChatResponse, ChatRole, CloneSpec,
    ConfigMap, DiscoveredAddress, FsComparePlan, LlmClient, MultiHostList, OrchestratorEvent,
    OrchestratorObserver, OutputEvent, ProgressReporter, Provider, ProxyJump, SandboxCleanupEvent,
    SandboxCleanupStatus, SshSession, SshTarget, Store, TaskStatus, TaskStatusSource, ToolCall,
};
