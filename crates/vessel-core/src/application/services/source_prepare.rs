//! One-shot read-only preparation of a source VM: restricted shell,
//! dedicated user, SSH certificate-authority trust anchor (§4.7).

use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use vessel_common::{
    ApprovalRequest, CoreError, PreparationResult, SourcePrepareApprovalRequest, SourceVM,
    VMState,
};

use crate::application::ports::{ApprovalUi, CaKeyReader, Provider, ProxyJump, SshSession, SshTarget, Store};
use crate::application::services::ApprovalGate;

/// Deployment-specific knobs for the preparation protocol. Values are
/// supplied by the external config loader (out of scope) and handed in by
/// value — this crate never reads env vars or files for these (§1.1).
pub struct SourcePrepareConfig {
    pub privileged_user: String,
    pub ssh_port: u16,
    pub proxy_jump_host: Option<String>,
    pub proxy_jump_user: Option<String>,
    pub proxy_jump_port: Option<u16>,
    pub ip_discovery_timeout: Duration,
    pub boot_wait: Duration,
    pub readonly_user: String,
    pub restricted_shell_path: String,
    pub allowed_commands: Vec<String>,
    pub trusted_ca_keys_path: String,
    pub principals_path: String,
    pub sshd_config_path: String,
}

impl Default for SourcePrepareConfig {
    fn default() -> Self {
        Self {
            privileged_user: "root".to_string(),
            ssh_port: 22,
            proxy_jump_host: None,
            proxy_jump_user: None,
            proxy_jump_port: None,
            ip_discovery_timeout: Duration::from_secs(30),
            boot_wait: Duration::from_secs(10),
            readonly_user: "fluid-readonly".to_string(),
            restricted_shell_path: "/usr/local/bin/fluid-rshell".to_string(),
            allowed_commands: vec![
                "cat".into(), "ls".into(), "grep".into(), "head".into(), "tail".into(),
                "find".into(), "stat".into(), "uname".into(), "ps".into(), "df".into(),
            ],
            trusted_ca_keys_path: "/etc/ssh/fluid_ca.pub".to_string(),
            principals_path: "/etc/ssh/fluid_principals".to_string(),
            sshd_config_path: "/etc/ssh/sshd_config.d/50-fluid-readonly.conf".to_string(),
        }
    }
}

/// Orchestrates the one-shot preparation sequence. Generic over its
/// collaborators, the teacher's pattern for swapping infra behind ports
/// without dynamic dispatch.
pub struct SourcePrepareProtocol<'a, P: Provider, S: SshSession, C: CaKeyReader, T: Store> {
    provider: &'a P,
    ssh: &'a S,
    ca: &'a C,
    store: &'a T,
    approval_gate: &'a ApprovalGate,
    config: &'a SourcePrepareConfig,
}

impl<'a, P: Provider, S: SshSession, C: CaKeyReader, T: Store> SourcePrepareProtocol<'a, P, S, C, T> {
    #[must_use]
    pub fn new(
        provider: &'a P,
        ssh: &'a S,
        ca: &'a C,
        store: &'a T,
        approval_gate: &'a ApprovalGate,
        config: &'a SourcePrepareConfig,
    ) -> Self {
        Self { provider, ssh, ca, store, approval_gate, config }
    }

    fn ca_fingerprint(&self) -> Result<String, CoreError> {
        let key_bytes = self.ca.read_ca_public_key()?;
        let digest = Sha256::digest(&key_bytes);
        Ok(hex_encode(&digest))
    }

    fn proxy_jump(&self) -> Option<ProxyJump<'_>> {
        self.config.proxy_jump_host.as_deref().map(|host| ProxyJump {
            host,
            user: self.config.proxy_jump_user.as_deref(),
            port: self.config.proxy_jump_port,
        })
    }

    /// Steps 1-9 of §4.7. `session_cache` is owned by the caller (the
    /// orchestrator); this protocol only reads and writes through the
    /// reference it is given (Ownership, §3).
    ///
    /// # Errors
    ///
    /// Returns `CoreError::SourceNotPrepared` if approval is denied, or
    /// any provider/SSH/store error encountered while preparing.
    pub async fn ensure_prepared(
        &self,
        vm_name: &str,
        session_cache: &mut HashMap<String, bool>,
        ui: &impl ApprovalUi,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        // 1. Session cache says prepared — short-circuit.
        if session_cache.get(vm_name).copied().unwrap_or(false) {
            tracing::debug!(vm = vm_name, "source vm already prepared this session");
            return Ok(());
        }

        // 2. Persisted record, validated against the current CA fingerprint.
        let current_fingerprint = self.ca_fingerprint()?;
        if let Some(record) = self.store.get_source_vm(vm_name).await? {
            if record.is_prepared_under(&current_fingerprint) {
                session_cache.insert(vm_name.to_string(), true);
                return Ok(());
            }
        }

        // 3. Approval gate.
        let request = ApprovalRequest::SourcePrepare(SourcePrepareApprovalRequest {
            vm_name: vm_name.to_string(),
        });
        let approved = self.approval_gate.request(&request, ui, cancel).await?;
        if !approved {
            return Err(CoreError::SourceNotPrepared(format!(
                "preparation of '{vm_name}' was denied"
            )));
        }

        // 4. Ensure running.
        let state = self.provider.get_vm_state(vm_name).await?;
        if matches!(state, VMState::ShutOff | VMState::Paused) {
            self.provider.start_vm(vm_name, cancel).await?;
            sleep(self.config.boot_wait).await;
        }

        // 5. Discover IPv4.
        let addr = self
            .provider
            .get_ip_address(vm_name, self.config.ip_discovery_timeout, cancel)
            .await?;

        // 6. CA public key is already read (step 2); re-read for the SSH
        // install step so a rotated key mid-flight is picked up exactly
        // once more.
        let ca_key_bytes = self.ca.read_ca_public_key()?;

        // 7. Prepare over SSH.
        let target = SshTarget {
            host: &addr.ip,
            user: &self.config.privileged_user,
            port: self.config.ssh_port,
            proxy_jump: self.proxy_jump(),
        };
        let result = self.run_preparation_sequence(&target, &ca_key_bytes, cancel).await?;

        // 8. Persist (store errors are warnings, not failures).
        let prepare_json = serde_json::to_string(&result).unwrap_or_default();
        let record = SourceVM {
            name: vm_name.to_string(),
            prepared: true,
            prepared_at: Some(chrono::Utc::now()),
            prepare_json: Some(prepare_json),
            ca_fingerprint: Some(current_fingerprint),
            host_name: None,
            host_address: Some(addr.ip.clone()),
        };
        if let Err(e) = self.store.upsert_source_vm(&record).await {
            tracing::warn!(vm = vm_name, error = %e, "failed to persist source VM preparation record");
        }

        // 9. Session cache.
        tracing::info!(vm = vm_name, ip = %addr.ip, "source vm prepared");
        session_cache.insert(vm_name.to_string(), true);
        Ok(())
    }

    /// Invalidate the session cache entry for `vm_name`, forcing the next
    /// `ensure_prepared` call to re-run preparation. Used by the
    /// orchestrator's connection-failure safety net (§4.7 fallback).
    pub fn invalidate(session_cache: &mut HashMap<String, bool>, vm_name: &str) {
        session_cache.remove(vm_name);
    }

    async fn run_preparation_sequence(
        &self,
        target: &SshTarget<'_>,
        ca_key_bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<PreparationResult, CoreError> {
        let mut result = PreparationResult::default();

        result.user_created = self
            .exec_ok(target, &create_user_script(&self.config.readonly_user), cancel)
            .await?;

        result.shell_installed = self
            .exec_ok(
                target,
                &install_shell_script(&self.config.restricted_shell_path, &self.config.allowed_commands),
                cancel,
            )
            .await?;

        let ca_key_text = String::from_utf8_lossy(ca_key_bytes);
        result.ca_key_installed = self
            .exec_ok(target, &install_ca_key_script(&self.config.trusted_ca_keys_path, &ca_key_text), cancel)
            .await?;

        result.principals_created = self
            .exec_ok(
                target,
                &write_principals_script(&self.config.principals_path, &self.config.readonly_user),
                cancel,
            )
            .await?;

        result.sshd_configured = self
            .exec_ok(
                target,
                &configure_sshd_script(
                    &self.config.sshd_config_path,
                    &self.config.readonly_user,
                    &self.config.trusted_ca_keys_path,
                    &self.config.principals_path,
                    &self.config.restricted_shell_path,
                ),
                cancel,
            )
            .await?;

        result.sshd_restarted = self.exec_ok(target, "systemctl restart sshd", cancel).await?;

        Ok(result)
    }

    async fn exec_ok(&self, target: &SshTarget<'_>, command: &str, cancel: &CancellationToken) -> Result<bool, CoreError> {
        let (exit_code, _stdout, _stderr) =
            self.ssh.run_command(target, command, &mut |_| {}, cancel).await?;
        Ok(exit_code == 0)
    }
}

fn create_user_script(user: &str) -> String {
    format!("id -u {user} >/dev/null 2>&1 || useradd --system --no-create-home --shell /usr/sbin/nologin {user}")
}

fn install_shell_script(path: &str, allowed: &[String]) -> String {
    let allow_list = allowed.join(" ");
    format!(
        "cat > {path} <<'EOF'\n\
         #!/bin/sh\n\
         case \"$1\" in\n\
         -c) shift ;;\n\
         esac\n\
         cmd=$(printf '%s' \"$1\" | awk '{{print $1}}')\n\
         for allowed in {allow_list}; do\n\
         if [ \"$cmd\" = \"$allowed\" ]; then exec /bin/sh -c \"$1\"; fi\n\
         done\n\
         echo \"command not permitted: $cmd\" >&2\n\
         exit 126\n\
         EOF\n\
         chmod 755 {path}"
    )
}

fn install_ca_key_script(path: &str, ca_key_text: &str) -> String {
    format!("cat > {path} <<'EOF'\n{ca_key_text}\nEOF\nchmod 644 {path}")
}

fn write_principals_script(path: &str, user: &str) -> String {
    format!("echo '{user}' > {path} && chmod 644 {path}")
}

fn configure_sshd_script(conf_path: &str, user: &str, ca_keys_path: &str, principals_path: &str, shell: &str) -> String {
    format!(
        "cat > {conf_path} <<EOF\n\
         TrustedUserCAKeys {ca_keys_path}\n\
         AuthorizedPrincipalsFile {principals_path}\n\
         Match User {user}\n\
         \u{20}\u{20}\u{20}\u{20}ForceCommand {shell}\n\
         \u{20}\u{20}\u{20}\u{20}PasswordAuthentication no\n\
         EOF"
    )
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(char::from(HEX[(b >> 4) as usize]));
        out.push(char::from(HEX[(b & 0xf) as usize]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use vessel_common::{ResourceCheckResult, SnapshotRef, VMRef, VMValidationResult};
    use crate::application::ports::{CloneSpec, DiscoveredAddress, FsComparePlan};

    struct FakeProvider {
        state: VMState,
        ip: String,
    }
    impl Provider for FakeProvider {
        async fn clone_from_vm(&self, _s: &CloneSpec<'_>, _c: &CancellationToken) -> Result<VMRef, CoreError> { unreachable!() }
        async fn clone_vm(&self, _s: &CloneSpec<'_>, _c: &CancellationToken) -> Result<VMRef, CoreError> { unreachable!() }
        async fn start_vm(&self, _name: &str, _c: &CancellationToken) -> Result<(), CoreError> { Ok(()) }
        async fn stop_vm(&self, _name: &str, _force: bool, _c: &CancellationToken) -> Result<(), CoreError> { unreachable!() }
        async fn destroy_vm(&self, _name: &str, _c: &CancellationToken) -> Result<(), CoreError> { unreachable!() }
        async fn create_snapshot(&self, _n: &str, _s: &str, _e: bool, _c: &CancellationToken) -> Result<SnapshotRef, CoreError> { unreachable!() }
        async fn diff_snapshot(&self, _n: &str, _f: &str, _t: &str) -> Result<FsComparePlan, CoreError> { unreachable!() }
        async fn get_ip_address(&self, _name: &str, _timeout: Duration, _c: &CancellationToken) -> Result<DiscoveredAddress, CoreError> {
            Ok(DiscoveredAddress { ip: self.ip.clone(), mac: "aa:bb:cc:dd:ee:ff".into() })
        }
        async fn get_vm_state(&self, _name: &str) -> Result<VMState, CoreError> { Ok(self.state) }
        async fn validate_source_vm(&self, _name: &str) -> Result<VMValidationResult, CoreError> { unreachable!() }
        async fn check_host_resources(&self, _cpus: u32, _mem: u64) -> Result<ResourceCheckResult, CoreError> { unreachable!() }
        async fn inject_ssh_key(&self, _name: &str, _user: &str, _key: &str) -> Result<(), CoreError> { unreachable!() }
    }

    struct FakeSsh {
        exec_count: StdMutex<usize>,
    }
    impl SshSession for FakeSsh {
        async fn run_command(
            &self,
            _target: &SshTarget<'_>,
            _command: &str,
            _on_event: &mut dyn FnMut(crate::application::ports::OutputEvent),
            _cancel: &CancellationToken,
        ) -> Result<(i32, Vec<u8>, Vec<u8>), CoreError> {
            *self.exec_count.lock().expect("lock poisoned") += 1;
            Ok((0, Vec::new(), Vec::new()))
        }
        async fn read_file(&self, _target: &SshTarget<'_>, _path: &str) -> Result<Vec<u8>, CoreError> {
            Ok(b"NAME=fake".to_vec())
        }
    }

    struct FakeCa;
    impl CaKeyReader for FakeCa {
        fn read_ca_public_key(&self) -> Result<Vec<u8>, CoreError> {
            Ok(b"ssh-ed25519 AAAA fake-ca".to_vec())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        record: StdMutex<Option<SourceVM>>,
    }
    impl Store for FakeStore {
        async fn get_source_vm(&self, name: &str) -> Result<Option<SourceVM>, CoreError> {
            let r = self.record.lock().expect("lock poisoned");
            Ok(r.clone().filter(|v| v.name == name))
        }
        async fn upsert_source_vm(&self, vm: &SourceVM) -> Result<(), CoreError> {
            *self.record.lock().expect("lock poisoned") = Some(vm.clone());
            Ok(())
        }
        async fn get_sandbox(&self, _id: &str) -> Result<Option<vessel_common::Sandbox>, CoreError> { unreachable!() }
        async fn list_sandboxes(&self, _agent_id: Option<&str>) -> Result<Vec<vessel_common::Sandbox>, CoreError> { unreachable!() }
        async fn create_sandbox(&self, _sandbox: &vessel_common::Sandbox) -> Result<(), CoreError> { unreachable!() }
        async fn update_sandbox(&self, _sandbox: &vessel_common::Sandbox) -> Result<(), CoreError> { unreachable!() }
        async fn destroy_sandbox(&self, _id: &str) -> Result<(), CoreError> { unreachable!() }
    }

    #[derive(Default)]
    struct ApproveAllUi;
    impl ApprovalUi for ApproveAllUi {
        fn emit_memory_request(&self, _check: &ResourceCheckResult) {}
        fn emit_network_request(&self, _command: &str, _tool: &str, _urls: &[String]) {}
        fn emit_source_prepare_request(&self, _vm_name: &str) {}
    }

    #[tokio::test]
    async fn second_call_within_session_skips_preparation() {
        let provider = FakeProvider { state: VMState::Running, ip: "10.0.0.5".into() };
        let ssh = FakeSsh { exec_count: StdMutex::new(0) };
        let ca = FakeCa;
        let store = FakeStore::default();
        let gate = std::sync::Arc::new(ApprovalGate::new());
        let config = SourcePrepareConfig::default();
        let protocol = SourcePrepareProtocol::new(&provider, &ssh, &ca, &store, &gate, &config);
        let mut cache = HashMap::new();
        let cancel = CancellationToken::new();
        let ui = ApproveAllUi;

        let responder = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            responder.respond(true).await;
        });

        protocol.ensure_prepared("golden", &mut cache, &ui, &cancel).await.expect("first prepare");
        let count_after_first = *ssh.exec_count.lock().expect("lock poisoned");
        assert!(count_after_first > 0);

        protocol.ensure_prepared("golden", &mut cache, &ui, &cancel).await.expect("second prepare, cached");
        let count_after_second = *ssh.exec_count.lock().expect("lock poisoned");
        assert_eq!(count_after_first, count_after_second, "no new SSH calls on cached path");
    }

    #[tokio::test]
    async fn ca_rotation_forces_reprepare() {
        let provider = FakeProvider { state: VMState::Running, ip: "10.0.0.5".into() };
        let ssh = FakeSsh { exec_count: StdMutex::new(0) };
        let ca = FakeCa;
        let store = FakeStore::default();
        let gate = std::sync::Arc::new(ApprovalGate::new());
        let config = SourcePrepareConfig::default();
        let protocol = SourcePrepareProtocol::new(&provider, &ssh, &ca, &store, &gate, &config);
        let mut cache = HashMap::new();
        let cancel = CancellationToken::new();
        let ui = ApproveAllUi;

        let responder = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            responder.respond(true).await;
        });
        protocol.ensure_prepared("golden", &mut cache, &ui, &cancel).await.expect("first prepare");

        // Simulate CA rotation: stored fingerprint no longer matches, and
        // the session cache entry for a *new* orchestrator session would
        // be empty. We directly clear the cache to model a new session.
        cache.clear();
        store.record.lock().expect("lock poisoned").as_mut().expect("record").ca_fingerprint = Some("stale".into());

        let responder2 = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            responder2.respond(true).await;
        });
        protocol.ensure_prepared("golden", &mut cache, &ui, &cancel).await.expect("re-prepare after rotation");
        assert!(cache.get("golden").copied().unwrap_or(false));
    }
}
