//! Implements the cross-hypervisor `Provider` contract over
//! `ProxmoxClient` + `VMResolver` + `TaskWaiter` (§4.4).

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use vessel_common::{
    CoreError, ResourceCheckResult, SnapshotKind, SnapshotRef, VMRef, VMState, VMValidationResult,
};

use crate::application::ports::{CloneSpec, DiscoveredAddress, FsComparePlan, Provider};
use crate::application::services::TaskWaiter;
use crate::domain::evaluate_resource_check;
use crate::infra::proxmox::client::ProxmoxClient;
use crate::infra::proxmox::resolver::VMResolver;
use crate::infra::proxmox::transport::HttpTransport;

const TASK_DEADLINE: Duration = Duration::from_secs(300);
const IP_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Maps Proxmox's raw status string to the canonical enum (§3). Unknown
/// strings map to `Unknown` rather than erroring — the driver boundary is
/// the one place this mapping happens (§4.4).
fn map_vm_state(raw: &str) -> VMState {
    match raw {
        "running" => VMState::Running,
        "stopped" => VMState::ShutOff,
        "paused" | "suspended" => VMState::Paused,
        _ => VMState::Unknown,
    }
}

/// The Proxmox VE driver: one node, reachable through `client`, with its
/// own name/id cache and VMID-allocation mutex.
pub struct ProxmoxDriver<'a, T: HttpTransport> {
    client: &'a ProxmoxClient<T>,
    resolver: VMResolver<'a, T>,
    task_waiter: TaskWaiter,
    vmid_mutex: AsyncMutex<()>,
}

impl<'a, T: HttpTransport> ProxmoxDriver<'a, T> {
    #[must_use]
    pub fn new(client: &'a ProxmoxClient<T>) -> Self {
        Self {
            client,
            resolver: VMResolver::new(client),
            task_waiter: TaskWaiter::default(),
            vmid_mutex: AsyncMutex::new(()),
        }
    }

    async fn wait(&self, handle: &vessel_common::TaskHandle, cancel: &CancellationToken) -> Result<(), CoreError> {
        self.task_waiter.wait_for_task(self.client, handle, TASK_DEADLINE, cancel).await
    }
}

impl<'a, T: HttpTransport> Provider for ProxmoxDriver<'a, T> {
    async fn clone_from_vm(&self, spec: &CloneSpec<'_>, cancel: &CancellationToken) -> Result<VMRef, CoreError> {
        let src_id = self.resolver.resolve_id(spec.source_name).await?;

        // The VMID-allocation mutex serializes nextVMID+cloneVM pairs so
        // two concurrent clones never race onto the same id; it is held
        // only across the allocate-and-submit step, not across the wait
        // for task completion (§4.4).
        let (new_id, handle) = {
            let _guard = self.vmid_mutex.lock().await;
            let new_id = self.client.next_vmid().await?;
            let handle = self.client.clone_vm(src_id, new_id, spec.new_name, true).await?;
            (new_id, handle)
        };
        tracing::info!(source = spec.source_name, new_vm = spec.new_name, vmid = new_id, "cloning vm");
        self.wait(&handle, cancel).await?;

        let cpu_str = spec.cpu.to_string();
        let memory_str = spec.memory_mb.to_string();
        let mut config: Vec<(&str, &str)> = Vec::new();
        if spec.cpu > 0 {
            config.push(("cores", &cpu_str));
        }
        if spec.memory_mb > 0 {
            config.push(("memory", &memory_str));
        }
        let net0;
        if let Some(bridge) = spec.network.or(self.client.config().default_bridge.as_deref()) {
            net0 = format!("virtio,bridge={bridge}");
            config.push(("net0", &net0));
        }
        // Only submit setVMConfig when there is something to configure
        // (§4.4 step 4) — cpu/memory of 0 and no network/default bridge is
        // a valid `CloneSpec`, and an empty form body must not overwrite
        // the clone's inherited config with zeros.
        if !config.is_empty() {
            self.client.set_vm_config(new_id, &config).await?;
        }

        self.resolver.refresh().await?;
        Ok(VMRef { name: spec.new_name.to_string(), uuid: new_id.to_string() })
    }

    async fn clone_vm(&self, spec: &CloneSpec<'_>, cancel: &CancellationToken) -> Result<VMRef, CoreError> {
        // Proxmox's "base images" are themselves VMs/templates, so this
        // aliases unconditionally to `clone_from_vm` (§4.4, resolving
        // Open Question #2 — see DESIGN.md).
        self.clone_from_vm(spec, cancel).await
    }

    async fn start_vm(&self, name: &str, cancel: &CancellationToken) -> Result<(), CoreError> {
        let id = self.resolver.resolve_id(name).await?;
        let handle = self.client.start_vm(id).await?;
        self.wait(&handle, cancel).await
    }

    async fn stop_vm(&self, name: &str, force: bool, cancel: &CancellationToken) -> Result<(), CoreError> {
        let id = self.resolver.resolve_id(name).await?;
        let handle = if force { self.client.stop_vm(id).await? } else { self.client.shutdown_vm(id).await? };
        self.wait(&handle, cancel).await
    }

    async fn destroy_vm(&self, name: &str, cancel: &CancellationToken) -> Result<(), CoreError> {
        tracing::info!(vm = name, "destroying vm");
        let id = self.resolver.resolve_id(name).await?;
        let status = self.client.get_vm_status(id).await?;
        let raw_state = status.get("status").and_then(Value::as_str).unwrap_or("");
        if map_vm_state(raw_state) == VMState::Running {
            let stop_handle = self.client.stop_vm(id).await?;
            self.wait(&stop_handle, cancel).await?;
        }
        let delete_handle = self.client.delete_vm(id).await?;
        self.wait(&delete_handle, cancel).await?;
        // Best-effort: a failed refresh here must not fail the destroy
        // that already succeeded (§4.4 step 5).
        let _ = self.resolver.refresh().await;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        name: &str,
        snapshot_name: &str,
        _external: bool,
        cancel: &CancellationToken,
    ) -> Result<SnapshotRef, CoreError> {
        let id = self.resolver.resolve_id(name).await?;
        let handle = self.client.create_snapshot(id, snapshot_name, None).await?;
        self.wait(&handle, cancel).await?;
        Ok(SnapshotRef {
            name: snapshot_name.to_string(),
            // Proxmox QEMU snapshots are always internal (disk-state)
            // snapshots; the driver must not claim an external snapshot
            // it did not create (§4.4).
            kind: SnapshotKind::Internal,
            reference: format!("proxmox:{id}:{snapshot_name}"),
        })
    }

    async fn diff_snapshot(&self, _name: &str, from: &str, to: &str) -> Result<FsComparePlan, CoreError> {
        Ok(FsComparePlan {
            notes: vec![format!(
                "Proxmox QEMU has no native filesystem diff between snapshots '{from}' and '{to}'; \
                 compare at the guest level (e.g. checksums over a mounted path) instead of trusting this plan."
            )],
        })
    }

    async fn get_ip_address(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DiscoveredAddress, CoreError> {
        let id = self.resolver.resolve_id(name).await?;
        let start = tokio::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if start.elapsed() >= timeout {
                tracing::warn!(vm = name, "timed out discovering ip address");
                return Err(CoreError::Transport(format!("timed out discovering IP address for '{name}'")));
            }

            if let Ok(interfaces) = self.client.get_guest_agent_interfaces(id).await {
                if let Some(addr) = pick_address(&interfaces) {
                    tracing::debug!(vm = name, ip = %addr.ip, "discovered ip address");
                    return Ok(addr);
                }
            }

            tokio::select! {
                () = sleep(IP_POLL_INTERVAL) => {}
                () = cancel.cancelled() => return Err(CoreError::Cancelled),
            }
        }
    }

    async fn get_vm_state(&self, name: &str) -> Result<VMState, CoreError> {
        let id = self.resolver.resolve_id(name).await?;
        let status = self.client.get_vm_status(id).await?;
        let raw = status.get("status").and_then(Value::as_str).unwrap_or("");
        Ok(map_vm_state(raw))
    }

    async fn validate_source_vm(&self, name: &str) -> Result<VMValidationResult, CoreError> {
        let mut result = VMValidationResult { vm_name: name.to_string(), ..VMValidationResult::default() };

        let id = match self.resolver.resolve_id(name).await {
            Ok(id) => id,
            Err(_) => {
                result.valid = false;
                result.errors.push(format!("source VM '{name}' does not exist"));
                return Ok(result);
            }
        };

        let status = self.client.get_vm_status(id).await;
        match status {
            Ok(status) => {
                let raw = status.get("status").and_then(Value::as_str).unwrap_or("");
                result.state = Some(map_vm_state(raw));
            }
            Err(e) => {
                // Config-read failures degrade to warnings, not hard
                // errors (§4.4).
                result.warnings.push(format!("could not read VM status: {e}"));
            }
        }

        match self.client.get_vm_config(id).await {
            Ok(config) => {
                result.has_network = config.get("net0").is_some();
                if !result.has_network {
                    result.warnings.push("no net0 interface configured".to_string());
                }
                let agent_enabled = config
                    .get("agent")
                    .and_then(Value::as_str)
                    .map(|v| v.starts_with('1'))
                    .unwrap_or(false);
                if !agent_enabled {
                    result.warnings.push("QEMU guest agent is not enabled in VM config".to_string());
                }
            }
            Err(e) => {
                result.warnings.push(format!("could not read VM config: {e}"));
            }
        }

        result.valid = result.errors.is_empty();
        Ok(result)
    }

    async fn check_host_resources(&self, cpus: u32, memory_mb: u64) -> Result<ResourceCheckResult, CoreError> {
        let status = self.client.get_node_status().await?;
        let total_memory = status.get("memory").and_then(|m| m.get("total")).and_then(Value::as_u64).unwrap_or(0);
        let free_memory = status.get("memory").and_then(|m| m.get("free")).and_then(Value::as_u64).unwrap_or(0);
        let total_cpus = status.get("cpuinfo").and_then(|c| c.get("cpus")).and_then(Value::as_u64).unwrap_or(1) as u32;
        let cpu_utilization = status.get("cpu").and_then(Value::as_f64).unwrap_or(0.0);
        let available_disk_mb = status
            .get("rootfs")
            .and_then(|r| r.get("avail"))
            .and_then(Value::as_u64)
            .map(|b| b / (1024 * 1024))
            .unwrap_or(0);

        Ok(evaluate_resource_check(
            cpus,
            memory_mb,
            total_memory,
            free_memory,
            total_cpus,
            cpu_utilization,
            available_disk_mb,
        ))
    }

    async fn inject_ssh_key(&self, name: &str, user: &str, public_key: &str) -> Result<(), CoreError> {
        let id = self.resolver.resolve_id(name).await?;
        // Proxmox's cloud-init `sshkeys` field is itself a URL-encoded
        // value; the transport layer (`form_urlencoded_body`) applies its
        // own percent-encoding on top when building the HTTP body, so the
        // key ends up URL-encoded end-to-end (§4.4).
        let encoded_key = urlencoding::encode(public_key).into_owned();
        self.client.set_vm_config(id, &[("ciuser", user), ("sshkeys", &encoded_key)]).await
    }
}

/// Pick the first acceptable IPv4 address from a guest-agent interface
/// list: non-loopback, non-link-local, parseable (§4.4, §8 IP filtering).
fn pick_address(interfaces: &[Value]) -> Option<DiscoveredAddress> {
    for iface in interfaces {
        let name = iface.get("name").and_then(Value::as_str).unwrap_or("");
        if name == "lo" {
            continue;
        }
        let mac = iface.get("hardware-address").and_then(Value::as_str).unwrap_or("").to_string();
        let addrs = iface.get("ip-addresses").and_then(Value::as_array)?;
        for addr in addrs {
            let ip_type = addr.get("ip-address-type").and_then(Value::as_str).unwrap_or("");
            if ip_type != "ipv4" {
                continue;
            }
            let Some(ip_str) = addr.get("ip-address").and_then(Value::as_str) else { continue };
            let Ok(ip) = Ipv4Addr::from_str(ip_str) else { continue };
            if ip.is_loopback() || ip.is_link_local() {
                continue;
            }
            return Some(DiscoveredAddress { ip: ip.to_string(), mac: mac.clone() });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    use crate::infra::proxmox::client::ProxmoxNodeConfig;
    use crate::infra::proxmox::transport::{HttpMethod, RawResponse};

    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<Vec<(u16, String)>>,
        calls: Mutex<Vec<(HttpMethod, String)>>,
    }

    impl HttpTransport for ScriptedTransport {
        async fn send(
            &self,
            method: HttpMethod,
            path: &str,
            _form_body: Option<&str>,
        ) -> Result<RawResponse, CoreError> {
            self.calls.lock().expect("lock poisoned").push((method, path.to_string()));
            let (status, body) = self.responses.lock().expect("lock poisoned").remove(0);
            Ok(RawResponse { status, body })
        }
    }

    fn node_config() -> ProxmoxNodeConfig {
        ProxmoxNodeConfig { node: "pve1".into(), vmid_range: (9000, 9999), default_bridge: None }
    }

    #[tokio::test]
    async fn clone_from_vm_skips_set_vm_config_when_nothing_to_configure() {
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![
                (200, r#"{"data":[{"vmid":100,"name":"golden"}]}"#.to_string()),
                (200, r#"{"data":[{"vmid":100,"name":"golden"}]}"#.to_string()),
                (200, r#"{"data":null}"#.to_string()),
                (200, r#"{"data":[{"vmid":100,"name":"golden"},{"vmid":101,"name":"new1"}]}"#.to_string()),
            ]),
            calls: Mutex::new(Vec::new()),
        };
        let client = ProxmoxClient::new(transport, node_config());
        let driver = ProxmoxDriver::new(&client);
        let cancel = CancellationToken::new();
        let spec = CloneSpec { source_name: "golden", new_name: "new1", cpu: 0, memory_mb: 0, network: None };

        driver.clone_from_vm(&spec, &cancel).await.expect("clone should succeed");

        let calls = client.transport().calls.lock().expect("lock poisoned");
        assert!(
            !calls.iter().any(|(method, _)| *method == HttpMethod::Put),
            "set_vm_config must not be submitted when cpu/memory/network are all absent and there is no default bridge"
        );
    }

    #[tokio::test]
    async fn clone_from_vm_submits_set_vm_config_when_cpu_is_set() {
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![
                (200, r#"{"data":[{"vmid":100,"name":"golden"}]}"#.to_string()),
                (200, r#"{"data":[{"vmid":100,"name":"golden"}]}"#.to_string()),
                (200, r#"{"data":null}"#.to_string()),
                (200, r#"{"data":null}"#.to_string()),
                (200, r#"{"data":[{"vmid":100,"name":"golden"},{"vmid":101,"name":"new2"}]}"#.to_string()),
            ]),
            calls: Mutex::new(Vec::new()),
        };
        let client = ProxmoxClient::new(transport, node_config());
        let driver = ProxmoxDriver::new(&client);
        let cancel = CancellationToken::new();
        let spec = CloneSpec { source_name: "golden", new_name: "new2", cpu: 2, memory_mb: 0, network: None };

        driver.clone_from_vm(&spec, &cancel).await.expect("clone should succeed");

        let calls = client.transport().calls.lock().expect("lock poisoned");
        assert!(calls.iter().any(|(method, _)| *method == HttpMethod::Put), "expected a set_vm_config PUT");
    }

    #[test]
    fn maps_running_and_stopped_and_unknown_states() {
        assert_eq!(map_vm_state("running"), VMState::Running);
        assert_eq!(map_vm_state("stopped"), VMState::ShutOff);
        assert_eq!(map_vm_state("paused"), VMState::Paused);
        assert_eq!(map_vm_state("whatever-this-is"), VMState::Unknown);
    }

    #[test]
    fn picks_first_non_loopback_ipv4_and_its_mac() {
        let interfaces = vec![
            json!({"name": "lo", "ip-addresses": [{"ip-address-type": "ipv4", "ip-address": "127.0.0.1"}]}),
            json!({
                "name": "eth0",
                "hardware-address": "52:54:00:aa:bb:cc",
                "ip-addresses": [
                    {"ip-address-type": "ipv4", "ip-address": "10.0.0.50"},
                    {"ip-address-type": "ipv6", "ip-address": "fe80::1"}
                ]
            }),
        ];
        let addr = pick_address(&interfaces).expect("should find an address");
        assert_eq!(addr.ip, "10.0.0.50");
        assert_eq!(addr.mac, "52:54:00:aa:bb:cc");
    }

    #[test]
    fn rejects_loopback_only_interfaces() {
        let interfaces =
            vec![json!({"name": "lo", "ip-addresses": [{"ip-address-type": "ipv4", "ip-address": "127.0.0.1"}]})];
        assert!(pick_address(&interfaces).is_none());
    }

    #[test]
    fn rejects_link_local_addresses() {
        let interfaces = vec![json!({
            "name": "eth0",
            "ip-addresses": [{"ip-address-type": "ipv4", "ip-address": "169.254.1.1"}]
        })];
        assert!(pick_address(&interfaces).is_none());
    }

    #[test]
    fn rejects_ipv6_only_interfaces() {
        let interfaces = vec![json!({
            "name": "eth0",
            "ip-addresses": [{"ip-address-type": "ipv6", "ip-address": "fe80::1"}]
        })];
        assert!(pick_address(&interfaces).is_none());
    }
}
