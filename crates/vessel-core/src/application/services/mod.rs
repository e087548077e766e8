//! Application services — the use cases that sit on top of the ports.

pub mod approval_gate;
pub mod command_streamer;
pub mod orchestrator;
pub mod source_prepare;
pub mod task_waiter;

pub use approval_gate::{ApprovalGate, ApprovalHandle};
pub use command_streamer::CommandStreamer;
pub use orchestrator::{AgentOrchestrator, OrchestratorConfig, RunOutcome};
pub use source_prepare::{SourcePrepareConfig, SourcePrepareProtocol};
pub use task_waiter::TaskWaiter;
