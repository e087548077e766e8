//! Streams SSH stdout/stderr chunks to a callback, with retry semantics
//! and a network-access gate in front of dispatch (§4.8).

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vessel_common::{ApprovalRequest, CoreError, NetworkApprovalRequest};

use crate::application::ports::{ApprovalUi, OutputEvent, SshSession, SshTarget};
use crate::application::services::ApprovalGate;
use crate::domain::detect_network_access;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);

/// Retry policy for transient connection failures mid-command (§4.8).
///
/// Only errors matching `CoreError::matches_connection_pattern` are
/// retried — a non-zero exit code or any other error kind is not.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, base_delay: DEFAULT_BASE_DELAY }
    }
}

/// Result of `run_command`: exit code plus aggregated stdout/stderr.
/// A non-zero exit code is not an error — only transport/auth/signal
/// conditions reaching `CommandStreamer` are (§4.8).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<String>,
}

impl CommandResult {
    fn denied() -> Self {
        Self {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: Vec::new(),
            error: Some("network access denied by user".to_string()),
        }
    }
}

pub struct CommandStreamer<'a, S: SshSession> {
    ssh: &'a S,
    approval_gate: &'a ApprovalGate,
    retry: RetryConfig,
}

impl<'a, S: SshSession> CommandStreamer<'a, S> {
    #[must_use]
    pub fn new(ssh: &'a S, approval_gate: &'a ApprovalGate) -> Self {
        Self { ssh, approval_gate, retry: RetryConfig::default() }
    }

    #[must_use]
    pub fn with_retry_config(ssh: &'a S, approval_gate: &'a ApprovalGate, retry: RetryConfig) -> Self {
        Self { ssh, approval_gate, retry }
    }

    /// Run `command` inside the sandbox at `target`, emitting output
    /// chunks to `on_event`. Network-touching commands (per
    /// `detect_network_access`) require approval before dispatch; on
    /// denial the SSH session is never invoked and the result reports
    /// `exit_code = -1` with the standard denial message.
    pub async fn run_command(
        &self,
        target: &SshTarget<'_>,
        command: &str,
        ui: &impl ApprovalUi,
        on_event: &mut dyn FnMut(OutputEvent),
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CoreError> {
        let (tool, urls) = detect_network_access(command);
        if !tool.is_empty() {
            tracing::debug!(tool, ?urls, "command touches network, requesting approval");
            let request = ApprovalRequest::Network(NetworkApprovalRequest {
                command: command.to_string(),
                tool: tool.clone(),
                urls: urls.clone(),
            });
            let approved = self.approval_gate.request(&request, ui, cancel).await?;
            if !approved {
                tracing::info!(tool, "network command denied by approval gate");
                return Ok(CommandResult::denied());
            }
        }

        let mut attempt = 1;
        loop {
            match self.ssh.run_command(target, command, on_event, cancel).await {
                Ok((exit_code, stdout, stderr)) => {
                    return Ok(CommandResult { exit_code, stdout, stderr, error: None });
                }
                Err(e) if e.matches_connection_pattern() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.base_delay * attempt;
                    on_event(OutputEvent::Retry {
                        attempt,
                        max: self.retry.max_attempts,
                        delay,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(CoreError::Cancelled),
                    }
                    on_event(OutputEvent::Reset);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use vessel_common::ResourceCheckResult;

    #[derive(Default)]
    struct AlwaysDenyUi;
    impl ApprovalUi for AlwaysDenyUi {
        fn emit_memory_request(&self, _check: &ResourceCheckResult) {}
        fn emit_network_request(&self, _command: &str, _tool: &str, _urls: &[String]) {}
        fn emit_source_prepare_request(&self, _vm_name: &str) {}
    }

    struct SpySsh {
        invoked: StdMutex<bool>,
    }
    impl SshSession for SpySsh {
        async fn run_command(
            &self,
            _target: &SshTarget<'_>,
            _command: &str,
            _on_event: &mut dyn FnMut(OutputEvent),
            _cancel: &CancellationToken,
        ) -> Result<(i32, Vec<u8>, Vec<u8>), CoreError> {
            *self.invoked.lock().expect("lock poisoned") = true;
            Ok((0, b"ok".to_vec(), Vec::new()))
        }
        async fn read_file(&self, _target: &SshTarget<'_>, _path: &str) -> Result<Vec<u8>, CoreError> {
            unreachable!("not exercised in this test")
        }
    }

    fn target() -> SshTarget<'static> {
        SshTarget { host: "10.0.0.1", user: "root", port: 22, proxy_jump: None }
    }

    #[tokio::test]
    async fn non_network_command_dispatches_without_approval() {
        let ssh = SpySsh { invoked: StdMutex::new(false) };
        let gate = ApprovalGate::new();
        let ui = AlwaysDenyUi;
        let streamer = CommandStreamer::new(&ssh, &gate);
        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        let result = streamer
            .run_command(&target(), "ls /tmp", &ui, &mut |e| events.push(e), &cancel)
            .await
            .expect("should not error");
        assert_eq!(result.exit_code, 0);
        assert!(*ssh.invoked.lock().expect("lock poisoned"));
    }

    #[tokio::test]
    async fn network_command_denied_reports_sentinel_result() {
        let ssh = SpySsh { invoked: StdMutex::new(false) };
        let gate = std::sync::Arc::new(ApprovalGate::new());
        let ui = AlwaysDenyUi;
        let streamer = CommandStreamer::new(&ssh, &gate);
        let cancel = CancellationToken::new();

        let responder = gate.clone();
        let deny_task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            responder.respond(false).await;
        });

        let mut events = Vec::new();
        let result = streamer
            .run_command(
                &target(),
                "curl https://api.example.com",
                &ui,
                &mut |e| events.push(e),
                &cancel,
            )
            .await
            .expect("should not error at the transport layer");

        deny_task.await.expect("task panicked");
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.error.as_deref(), Some("network access denied by user"));
        assert!(!*ssh.invoked.lock().expect("lock poisoned"));
    }

    struct FlakySsh {
        attempts: StdMutex<u32>,
        fail_until: u32,
    }
    impl SshSession for FlakySsh {
        async fn run_command(
            &self,
            _target: &SshTarget<'_>,
            _command: &str,
            _on_event: &mut dyn FnMut(OutputEvent),
            _cancel: &CancellationToken,
        ) -> Result<(i32, Vec<u8>, Vec<u8>), CoreError> {
            let mut n = self.attempts.lock().expect("lock poisoned");
            *n += 1;
            if *n <= self.fail_until {
                Err(CoreError::ConnectionError("connection refused".into()))
            } else {
                Ok((0, b"ok".to_vec(), Vec::new()))
            }
        }
        async fn read_file(&self, _target: &SshTarget<'_>, _path: &str) -> Result<Vec<u8>, CoreError> {
            unreachable!("not exercised in this test")
        }
    }

    #[tokio::test]
    async fn transient_connection_error_retries_with_retry_and_reset_events() {
        let ssh = FlakySsh { attempts: StdMutex::new(0), fail_until: 1 };
        let gate = ApprovalGate::new();
        let ui = AlwaysDenyUi;
        let streamer = CommandStreamer::with_retry_config(
            &ssh,
            &gate,
            RetryConfig { max_attempts: 3, base_delay: std::time::Duration::from_millis(1) },
        );
        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        let result = streamer
            .run_command(&target(), "uname -a", &ui, &mut |e| events.push(e), &cancel)
            .await
            .expect("should eventually succeed");

        assert_eq!(result.exit_code, 0);
        assert_eq!(*ssh.attempts.lock().expect("lock poisoned"), 2);
        assert!(matches!(events[0], OutputEvent::Retry { attempt: 1, max: 3, .. }));
        assert!(matches!(events[1], OutputEvent::Reset));
    }

    #[tokio::test]
    async fn exhausting_retries_propagates_the_connection_error() {
        let ssh = FlakySsh { attempts: StdMutex::new(0), fail_until: 10 };
        let gate = ApprovalGate::new();
        let ui = AlwaysDenyUi;
        let streamer = CommandStreamer::with_retry_config(
            &ssh,
            &gate,
            RetryConfig { max_attempts: 3, base_delay: std::time::Duration::from_millis(1) },
        );
        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        let err = streamer
            .run_command(&target(), "uname -a", &ui, &mut |e| events.push(e), &cancel)
            .await
            .expect_err("should fail after exhausting retries");

        assert!(matches!(err, CoreError::ConnectionError(_)));
        assert_eq!(*ssh.attempts.lock().expect("lock poisoned"), 3);
    }

    #[tokio::test]
    async fn non_connection_error_is_not_retried() {
        struct AuthFailSsh;
        impl SshSession for AuthFailSsh {
            async fn run_command(
                &self,
                _target: &SshTarget<'_>,
                _command: &str,
                _on_event: &mut dyn FnMut(OutputEvent),
                _cancel: &CancellationToken,
            ) -> Result<(i32, Vec<u8>, Vec<u8>), CoreError> {
                Err(CoreError::ValidationFailed("bad arguments".into()))
            }
            async fn read_file(
                &self,
                _target: &SshTarget<'_>,
                _path: &str,
            ) -> Result<Vec<u8>, CoreError> {
                unreachable!("not exercised in this test")
            }
        }
        let ssh = AuthFailSsh;
        let gate = ApprovalGate::new();
        let ui = AlwaysDenyUi;
        let streamer = CommandStreamer::new(&ssh, &gate);
        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        let err = streamer
            .run_command(&target(), "uname -a", &ui, &mut |e| events.push(e), &cancel)
            .await
            .expect_err("should fail immediately");

        assert!(matches!(err, CoreError::ValidationFailed(_)));
        assert!(events.is_empty());
    }
}
