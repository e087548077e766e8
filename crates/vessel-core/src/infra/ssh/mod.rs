//! `SshSession`/`CaKeyReader` adapters that shell out to the system `ssh`
//! binary (§4.7, §4.8).
//!
//! Grounded in the teacher's `TokioCommandRunner`/`ssh_proxy`: a private
//! identity key, `BatchMode=yes`, `kill_on_drop(true)` as a backstop
//! against leaked child processes, and draining stdout/stderr
//! concurrently with the child's exit so neither pipe can block the
//! other. There is no SFTP or libssh dependency here — `run_command`
//! drives the actual `ssh` client as a subprocess, and `read_file` is a
//! `cat` invoked the same way, which is all the read-only preparation
//! protocol ever needs.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vessel_common::CoreError;

use crate::application::ports::{CaKeyReader, OutputEvent, SshSession, SshTarget};

const READ_CHUNK_SIZE: usize = 8192;

/// Shells out to the system `ssh` client with a dedicated identity key.
/// One instance is shared across every `SshSession` call in a process —
/// it holds no per-connection state.
pub struct ProcessSshSession {
    identity_key_path: PathBuf,
    connect_timeout: Duration,
}

impl ProcessSshSession {
    #[must_use]
    pub fn new(identity_key_path: PathBuf, connect_timeout: Duration) -> Self {
        Self { identity_key_path, connect_timeout }
    }

    fn base_args(&self, target: &SshTarget<'_>) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.identity_key_path.to_string_lossy().into_owned(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", devnull()),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            target.port.to_string(),
        ];
        if let Some(jump) = &target.proxy_jump {
            let mut spec = String::new();
            if let Some(user) = jump.user {
                spec.push_str(user);
                spec.push('@');
            }
            spec.push_str(jump.host);
            if let Some(port) = jump.port {
                spec.push(':');
                spec.push_str(&port.to_string());
            }
            args.push("-J".to_string());
            args.push(spec);
        }
        args.push(format!("{}@{}", target.user, target.host));
        args
    }
}

#[cfg(windows)]
fn devnull() -> &'static str {
    "NUL"
}
#[cfg(not(windows))]
fn devnull() -> &'static str {
    "/dev/null"
}

/// Any failure spawning or waiting on the `ssh` process is reported as a
/// connection error — the safety net in §4.7 is specifically built to
/// retry these.
fn spawn_or_io_error(context: &str, err: std::io::Error) -> CoreError {
    CoreError::ConnectionError(format!("{context}: {err}"))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Drains one pipe into `tx` chunk-by-chunk until EOF or a read error.
async fn drain_pipe(mut pipe: impl tokio::io::AsyncRead + Unpin, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

impl SshSession for ProcessSshSession {
    async fn run_command(
        &self,
        target: &SshTarget<'_>,
        command: &str,
        on_event: &mut dyn FnMut(OutputEvent),
        cancel: &CancellationToken,
    ) -> Result<(i32, Vec<u8>, Vec<u8>), CoreError> {
        let mut args = self.base_args(target);
        args.push(command.to_string());

        tracing::debug!(host = target.host, user = target.user, "spawning ssh command");
        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_or_io_error("failed to spawn ssh", e))?;

        let stdout_pipe = child.stdout.take().ok_or_else(|| {
            CoreError::Transport("ssh child spawned without a stdout pipe".to_string())
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| {
            CoreError::Transport("ssh child spawned without a stderr pipe".to_string())
        })?;

        let (stdout_tx, mut stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, mut stderr_rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(drain_pipe(stdout_pipe, stdout_tx));
        let stderr_task = tokio::spawn(drain_pipe(stderr_pipe, stderr_tx));

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                chunk = stdout_rx.recv(), if stdout_open => {
                    match chunk {
                        Some(data) => {
                            stdout_buf.extend_from_slice(&data);
                            on_event(OutputEvent::Data { data, is_stderr: false });
                        }
                        None => stdout_open = false,
                    }
                }
                chunk = stderr_rx.recv(), if stderr_open => {
                    match chunk {
                        Some(data) => {
                            stderr_buf.extend_from_slice(&data);
                            on_event(OutputEvent::Data { data, is_stderr: true });
                        }
                        None => stderr_open = false,
                    }
                }
                () = cancel.cancelled() => {
                    tracing::debug!(host = target.host, "cancelling in-flight ssh command");
                    let _ = child.kill().await;
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    return Err(CoreError::Cancelled);
                }
            }
        }
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let status = child.wait().await.map_err(|e| spawn_or_io_error("waiting for ssh", e))?;
        Ok((status.code().unwrap_or(-1), stdout_buf, stderr_buf))
    }

    async fn read_file(&self, target: &SshTarget<'_>, path: &str) -> Result<Vec<u8>, CoreError> {
        let mut args = self.base_args(target);
        args.push(format!("cat -- {}", shell_quote(path)));

        let output = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_or_io_error("failed to spawn ssh", e))?;

        if !output.status.success() {
            return Err(CoreError::ConnectionError(format!(
                "reading '{path}' over ssh failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output.stdout)
    }
}

/// Reads the CA public key from a local path — the key manager itself is
/// out of scope; this is a plain file read (§4.7 step 6).
pub struct FileCaKeyReader {
    path: PathBuf,
}

impl FileCaKeyReader {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CaKeyReader for FileCaKeyReader {
    fn read_ca_public_key(&self) -> Result<Vec<u8>, CoreError> {
        std::fs::read(&self.path).map_err(|e| {
            CoreError::Transport(format!("failed to read CA public key at {}: {e}", self.path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget<'static> {
        SshTarget { host: "10.0.0.5", user: "fluid-readonly", port: 2222, proxy_jump: None }
    }

    #[test]
    fn base_args_include_identity_port_and_user_host() {
        let session = ProcessSshSession::new(PathBuf::from("/etc/fluid/id_ed25519"), Duration::from_secs(5));
        let args = session.base_args(&target());
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"/etc/fluid/id_ed25519".to_string()));
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert_eq!(args.last(), Some(&"fluid-readonly@10.0.0.5".to_string()));
    }

    #[test]
    fn base_args_include_proxy_jump_when_configured() {
        let session = ProcessSshSession::new(PathBuf::from("/etc/fluid/id_ed25519"), Duration::from_secs(5));
        let target = SshTarget {
            host: "10.0.0.5",
            user: "fluid-readonly",
            port: 22,
            proxy_jump: Some(crate::application::ports::ProxyJump {
                host: "bastion.example.com",
                user: Some("jumpuser"),
                port: Some(2022),
            }),
        };
        let args = session.base_args(&target);
        let jump_index = args.iter().position(|a| a == "-J").expect("expected a -J flag");
        assert_eq!(args[jump_index + 1], "jumpuser@bastion.example.com:2022");
    }

    #[test]
    fn shell_quote_escapes_embedded_single_quotes() {
        assert_eq!(shell_quote("it's a file"), "'it'\\''s a file'");
    }

    #[test]
    fn file_ca_key_reader_surfaces_missing_file_as_transport_error() {
        let reader = FileCaKeyReader::new(PathBuf::from("/nonexistent/path/does-not-exist.pub"));
        let err = reader.read_ca_public_key().expect_err("path does not exist");
        assert!(matches!(err, CoreError::Transport(_)));
    }

    #[test]
    fn file_ca_key_reader_reads_real_file_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ca.pub");
        std::fs::write(&path, b"ssh-ed25519 AAAAC3 fluid-ca").expect("write fixture");
        let reader = FileCaKeyReader::new(path);
        let bytes = reader.read_ca_public_key().expect("should read fixture");
        assert_eq!(bytes, b"ssh-ed25519 AAAAC3 fluid-ca");
    }
}
