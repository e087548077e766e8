//! Synchronous request/response rendezvous between the orchestrator and a
//! human-facing UI (§4.6).
//!
//! A single-slot bidirectional channel: the orchestrator fills the slot,
//! emits a request message outward, and blocks on the channel; the UI
//! eventually calls back in with a decision. The slot is always cleared —
//! on normal response and on cancellation alike — so it never leaks.

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use vessel_common::{ApprovalKind, ApprovalRequest, CoreError};

use crate::application::ports::ApprovalUi;

/// Introspection handle for whatever approval is currently outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalHandle {
    pub kind: ApprovalKind,
}

struct Pending {
    kind: ApprovalKind,
    responder: oneshot::Sender<bool>,
}

/// A gate permitting exactly one outstanding approval at a time.
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<Option<Pending>>,
}

impl ApprovalGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whatever approval is currently outstanding, if any.
    pub async fn current(&self) -> Option<ApprovalHandle> {
        self.pending
            .lock()
            .await
            .as_ref()
            .map(|p| ApprovalHandle { kind: p.kind })
    }

    /// Open a new approval request, emit it to the UI, and block until a
    /// decision arrives or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationFailed` if another approval is
    /// already outstanding (the UI contract promises at most one; this is
    /// a programming error if hit), or `CoreError::Cancelled` if `cancel`
    /// fires before a response arrives. The slot is cleared in every case.
    pub async fn request(
        &self,
        request: &ApprovalRequest,
        ui: &impl ApprovalUi,
        cancel: &CancellationToken,
    ) -> Result<bool, CoreError> {
        let kind = request.kind();
        let (tx, rx) = oneshot::channel();

        {
            let mut slot = self.pending.lock().await;
            if slot.is_some() {
                return Err(CoreError::ValidationFailed(
                    "an approval is already outstanding".into(),
                ));
            }
            *slot = Some(Pending { kind, responder: tx });
        }

        tracing::debug!(?kind, "approval request opened");
        match request {
            ApprovalRequest::Memory(r) => ui.emit_memory_request(&r.check),
            ApprovalRequest::Network(r) => ui.emit_network_request(&r.command, &r.tool, &r.urls),
            ApprovalRequest::SourcePrepare(r) => ui.emit_source_prepare_request(&r.vm_name),
        }

        let outcome = tokio::select! {
            result = rx => result.map_err(|_| CoreError::Cancelled),
            () = cancel.cancelled() => Err(CoreError::Cancelled),
        };

        // Clear the slot unconditionally, including on cancellation, so it
        // never leaks (§4.6).
        *self.pending.lock().await = None;
        tracing::debug!(?kind, outcome = ?outcome, "approval request closed");

        outcome
    }

    /// Deliver the human's decision for the currently outstanding
    /// approval. No-op if nothing is outstanding (the UI contract
    /// guarantees at most one in flight, but a duplicate/late call must
    /// not panic).
    pub async fn respond(&self, approved: bool) {
        let mut slot = self.pending.lock().await;
        if let Some(pending) = slot.take() {
            let _ = pending.responder.send(approved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use vessel_common::{MemoryApprovalRequest, ResourceCheckResult};

    #[derive(Default)]
    struct RecordingUi {
        memory_requests: StdMutex<usize>,
    }

    impl ApprovalUi for RecordingUi {
        fn emit_memory_request(&self, _check: &ResourceCheckResult) {
            *self.memory_requests.lock().expect("lock poisoned") += 1;
        }
        fn emit_network_request(&self, _command: &str, _tool: &str, _urls: &[String]) {}
        fn emit_source_prepare_request(&self, _vm_name: &str) {}
    }

    #[tokio::test]
    async fn approve_unblocks_with_true() {
        let gate = std::sync::Arc::new(ApprovalGate::new());
        let ui = RecordingUi::default();
        let cancel = CancellationToken::new();
        let req = ApprovalRequest::Memory(MemoryApprovalRequest { check: ResourceCheckResult::default() });

        let responder = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            responder.respond(true).await;
        });

        let result = gate.request(&req, &ui, &cancel).await;

        assert_eq!(result, Ok(true));
        assert_eq!(*ui.memory_requests.lock().expect("lock poisoned"), 1);
        assert!(gate.current().await.is_none());
    }

    #[tokio::test]
    async fn deny_unblocks_with_false() {
        let gate = std::sync::Arc::new(ApprovalGate::new());
        let ui = RecordingUi::default();
        let cancel = CancellationToken::new();
        let req = ApprovalRequest::Memory(MemoryApprovalRequest { check: ResourceCheckResult::default() });

        let responder = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            responder.respond(false).await;
        });

        let result = gate.request(&req, &ui, &cancel).await;
        assert_eq!(result, Ok(false));
    }

    #[tokio::test]
    async fn cancellation_clears_the_slot() {
        let gate = ApprovalGate::new();
        let ui = RecordingUi::default();
        let cancel = CancellationToken::new();
        let req = ApprovalRequest::Memory(MemoryApprovalRequest { check: ResourceCheckResult::default() });

        cancel.cancel();
        let result = gate.request(&req, &ui, &cancel).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
        assert!(gate.current().await.is_none());
    }

    #[tokio::test]
    async fn second_request_while_one_outstanding_is_rejected() {
        let gate = std::sync::Arc::new(ApprovalGate::new());
        let ui = RecordingUi::default();
        let cancel = CancellationToken::new();
        let req = ApprovalRequest::Memory(MemoryApprovalRequest { check: ResourceCheckResult::default() });

        let first_gate = gate.clone();
        let first = tokio::spawn(async move { first_gate.request(&req, &ui, &cancel).await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second_ui = RecordingUi::default();
        let second_cancel = CancellationToken::new();
        let second_req = ApprovalRequest::Memory(MemoryApprovalRequest { check: ResourceCheckResult::default() });
        let second = gate.request(&second_req, &second_ui, &second_cancel).await;
        assert!(matches!(second, Err(CoreError::ValidationFailed(_))));

        gate.respond(true).await;
        let first_result = first.await.expect("task panicked");
        assert_eq!(first_result, Ok(true));
    }
}
