//! Aggregates `listVMs()` across every configured Proxmox node, isolating
//! per-host failures instead of letting one bad node fail the whole call
//! (§4.5).

use serde_json::Value;
use vessel_common::{HostError, MultiHostListResult, MultiHostVMInfo, VMState};

use crate::application::ports::MultiHostList;
use crate::infra::proxmox::client::ProxmoxClient;
use crate::infra::proxmox::transport::HttpTransport;

/// One configured host: a reachable name/address pair plus the client that
/// talks to it.
pub struct ProxmoxHost<T: HttpTransport> {
    pub name: String,
    pub address: String,
    pub client: ProxmoxClient<T>,
}

/// Lists VMs across every configured host. Hosts are queried in
/// configuration order; a per-host failure is recorded in `host_errors`
/// rather than aborting the aggregate (§4.5).
pub struct MultiHostLister<T: HttpTransport> {
    hosts: Vec<ProxmoxHost<T>>,
}

impl<T: HttpTransport> MultiHostLister<T> {
    #[must_use]
    pub fn new(hosts: Vec<ProxmoxHost<T>>) -> Self {
        Self { hosts }
    }
}

fn vm_info(raw: &Value, host: &ProxmoxHost<impl HttpTransport>) -> Option<MultiHostVMInfo> {
    let name = raw.get("name").and_then(Value::as_str)?.to_string();
    let uuid = raw.get("vmid").and_then(Value::as_u64)?.to_string();
    let state = match raw.get("status").and_then(Value::as_str).unwrap_or("") {
        "running" => VMState::Running,
        "stopped" => VMState::ShutOff,
        "paused" | "suspended" => VMState::Paused,
        _ => VMState::Unknown,
    };
    Some(MultiHostVMInfo {
        name,
        uuid,
        state,
        // VMs surfaced through this path are hypervisor-managed, not
        // agent-ephemeral (§4.5).
        persistent: true,
        host_name: host.name.clone(),
        host_address: host.address.clone(),
    })
}

impl<T: HttpTransport> MultiHostList for MultiHostLister<T> {
    async fn list_vms(&self) -> MultiHostListResult {
        let mut result = MultiHostListResult::default();
        for host in &self.hosts {
            match host.client.list_vms().await {
                Ok(vms) => {
                    result.vms.extend(vms.iter().filter_map(|vm| vm_info(vm, host)));
                }
                Err(e) => {
                    tracing::warn!(host = %host.name, error = %e, "host excluded from multi-host vm listing");
                    result.host_errors.push(HostError {
                        host_name: host.name.clone(),
                        host_address: host.address.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        result
    }

    async fn find_host_for_vm(&self, name: &str) -> Option<String> {
        for host in &self.hosts {
            if let Ok(vms) = host.client.list_vms().await {
                if vms.iter().any(|vm| vm.get("name").and_then(Value::as_str) == Some(name)) {
                    return Some(host.name.clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::proxmox::client::ProxmoxNodeConfig;
    use crate::infra::proxmox::transport::{HttpMethod, RawResponse};

    struct FixedTransport(String, u16);

    impl HttpTransport for FixedTransport {
        async fn send(
            &self,
            _method: HttpMethod,
            _path: &str,
            _form_body: Option<&str>,
        ) -> Result<RawResponse, vessel_common::CoreError> {
            if self.1 != 200 {
                return Err(vessel_common::CoreError::Forbidden(self.0.clone()));
            }
            Ok(RawResponse { status: self.1, body: self.0.clone() })
        }
    }

    fn node_config(name: &str) -> ProxmoxNodeConfig {
        ProxmoxNodeConfig { node: name.to_string(), vmid_range: (9000, 9999), default_bridge: None }
    }

    fn host(name: &str, address: &str, body: &str, status: u16) -> ProxmoxHost<FixedTransport> {
        ProxmoxHost {
            name: name.to_string(),
            address: address.to_string(),
            client: ProxmoxClient::new(FixedTransport(body.to_string(), status), node_config(name)),
        }
    }

    #[tokio::test]
    async fn partial_failure_across_three_hosts_isolates_one_error() {
        let hosts = vec![
            host("pve1", "10.0.0.1", r#"{"data":[{"vmid":100,"name":"a","status":"running"}]}"#, 200),
            host("pve2", "10.0.0.2", "forbidden", 403),
            host("pve3", "10.0.0.3", r#"{"data":[{"vmid":200,"name":"b","status":"stopped"}]}"#, 200),
        ];
        let lister = MultiHostLister::new(hosts);
        let result = lister.list_vms().await;

        assert_eq!(result.vms.len(), 2);
        assert_eq!(result.host_errors.len(), 1);
        assert_eq!(result.host_errors[0].host_name, "pve2");
        assert!(result.vms.iter().all(|vm| vm.persistent));
    }

    #[tokio::test]
    async fn find_host_for_vm_returns_first_match_in_configuration_order() {
        let hosts = vec![
            host("pve1", "10.0.0.1", r#"{"data":[{"vmid":100,"name":"other"}]}"#, 200),
            host("pve2", "10.0.0.2", r#"{"data":[{"vmid":200,"name":"target"}]}"#, 200),
        ];
        let lister = MultiHostLister::new(hosts);
        assert_eq!(lister.find_host_for_vm("target").await, Some("pve2".to_string()));
    }

    #[tokio::test]
    async fn find_host_for_vm_returns_none_when_absent_everywhere() {
        let hosts = vec![host("pve1", "10.0.0.1", r#"{"data":[]}"#, 200)];
        let lister = MultiHostLister::new(hosts);
        assert_eq!(lister.find_host_for_vm("missing").await, None);
    }
}
