//! Polls asynchronous provider tasks to completion (§4.2).

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use vessel_common::{CoreError, TaskHandle};

use crate::application::ports::{TaskStatus, TaskStatusSource};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Generic poller: any provider client that implements `TaskStatusSource`
/// can be waited on through this one piece of logic, rather than every
/// call site duplicating its own poll loop (§9 design notes).
pub struct TaskWaiter {
    poll_interval: Duration,
}

impl Default for TaskWaiter {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl TaskWaiter {
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Wait for `handle` to reach a terminal state.
    ///
    /// An empty handle (the synchronous-completion sentinel) returns
    /// success immediately without issuing any poll call. Otherwise polls
    /// every `poll_interval` until the task leaves the running state, the
    /// deadline passes, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TaskFailed` if the task's terminal exit status
    /// is not `"OK"`, `CoreError::Cancelled` if `cancel` fires first, or
    /// `CoreError::Transport`/timeout-shaped errors surfaced by `source`.
    pub async fn wait_for_task<T: TaskStatusSource>(
        &self,
        source: &T,
        handle: &TaskHandle,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        if handle.is_sync() {
            return Ok(());
        }

        let start = tokio::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if start.elapsed() >= deadline {
                return Err(CoreError::Transport(format!(
                    "timed out waiting for task {}",
                    handle.handle
                )));
            }

            match source.get_task_status(handle).await? {
                TaskStatus::Running => {
                    tracing::debug!(upid = %handle.handle, "task still running, polling again");
                    tokio::select! {
                        () = sleep(self.poll_interval) => {}
                        () = cancel.cancelled() => return Err(CoreError::Cancelled),
                    }
                }
                TaskStatus::Stopped { exit_status } => {
                    return if exit_status == "OK" {
                        tracing::debug!(upid = %handle.handle, "task completed");
                        Ok(())
                    } else {
                        tracing::warn!(upid = %handle.handle, exit_status, "task failed");
                        Err(CoreError::TaskFailed {
                            upid: handle.handle.clone(),
                            exit_status,
                        })
                    };
                }
            }
        }
    }
}
