//! Authenticated transport over Proxmox VE's HTTP API, decoding the
//! `{ data, errors? }` response envelope (§4.1, §6).

use serde_json::Value;
use vessel_common::{CoreError, TaskHandle};

use crate::application::ports::TaskStatus;
use crate::infra::proxmox::transport::{form_urlencoded_body, HttpMethod, HttpTransport};

/// Deployment knobs for one Proxmox node. Handed in by value — this crate
/// never reads configuration ambiently (§1.1).
#[derive(Debug, Clone)]
pub struct ProxmoxNodeConfig {
    pub node: String,
    pub vmid_range: (u32, u32),
    pub default_bridge: Option<String>,
}

/// Thin client over one Proxmox node's `/api2/json/nodes/<node>/...`
/// surface. Generic over `HttpTransport` so the real `reqwest` transport
/// can be swapped for a scripted fake in tests.
pub struct ProxmoxClient<T: HttpTransport> {
    transport: T,
    config: ProxmoxNodeConfig,
}

fn decode_envelope(body: &str) -> Result<Value, CoreError> {
    let envelope: Value =
        serde_json::from_str(body).map_err(|e| CoreError::ProtocolDecode(format!("{e}: {body}")))?;
    let Some(obj) = envelope.as_object() else {
        return Err(CoreError::ProtocolDecode(format!(
            "expected a JSON object envelope, got: {body}"
        )));
    };
    if let Some(errors) = obj.get("errors") {
        if !errors.is_null() {
            return Err(CoreError::ProtocolDecode(format!("provider reported errors: {errors}")));
        }
    }
    obj.get("data")
        .cloned()
        .ok_or_else(|| CoreError::ProtocolDecode(format!("envelope missing 'data' field: {body}")))
}

impl<T: HttpTransport> ProxmoxClient<T> {
    #[must_use]
    pub fn new(transport: T, config: ProxmoxNodeConfig) -> Self {
        Self { transport, config }
    }

    fn node_path(&self, suffix: &str) -> String {
        format!("/api2/json/nodes/{}/{suffix}", self.config.node)
    }

    /// `do(method, path, body?) -> rawJson` (§4.1): issues the request and
    /// returns the decoded `data` field. Status codes outside `[200,300)`
    /// and envelope decode failures both surface as errors here; no retry
    /// is performed at this layer.
    async fn do_request(
        &self,
        method: HttpMethod,
        path: &str,
        form: Option<&[(&str, &str)]>,
    ) -> Result<Value, CoreError> {
        tracing::debug!(?method, path, "proxmox request");
        let body = form.map(|pairs| form_urlencoded_body(pairs));
        let response = self.transport.send(method, path, body.as_deref()).await?;

        if !(200..300).contains(&response.status) {
            let message = format!("HTTP {} from {path}: {}", response.status, response.body);
            tracing::warn!(status = response.status, path, "proxmox request failed");
            return Err(match response.status {
                401 => CoreError::Unauthorized(message),
                403 => CoreError::Forbidden(message),
                404 => CoreError::NotFound { kind: "resource", name: path.to_string() },
                _ => CoreError::Transport(message),
            });
        }

        decode_envelope(&response.body)
    }

    fn as_task_handle(data: Value) -> Result<TaskHandle, CoreError> {
        // `createSnapshot` may tolerate a `null` data envelope on
        // synchronous completion (§4.1); other task-producing endpoints
        // always return the UPID string.
        if data.is_null() {
            return Ok(TaskHandle::sync());
        }
        match data.as_str() {
            Some(upid) => Ok(TaskHandle { handle: upid.to_string(), empty_means_sync: upid.is_empty() }),
            None => Err(CoreError::ProtocolDecode(format!("expected a UPID string, got: {data}"))),
        }
    }

    pub async fn list_vms(&self) -> Result<Vec<Value>, CoreError> {
        let data = self.do_request(HttpMethod::Get, &self.node_path("qemu"), None).await?;
        data.as_array()
            .cloned()
            .ok_or_else(|| CoreError::ProtocolDecode(format!("expected a VM array, got: {data}")))
    }

    pub async fn get_vm_status(&self, id: u32) -> Result<Value, CoreError> {
        self.do_request(HttpMethod::Get, &self.node_path(&format!("qemu/{id}/status/current")), None)
            .await
    }

    pub async fn get_vm_config(&self, id: u32) -> Result<Value, CoreError> {
        self.do_request(HttpMethod::Get, &self.node_path(&format!("qemu/{id}/config")), None).await
    }

    /// `full=true` submits a form containing `full=1`; `full=false` omits
    /// the field entirely (§8 clone parameter contract).
    pub async fn clone_vm(&self, src_id: u32, new_id: u32, name: &str, full: bool) -> Result<TaskHandle, CoreError> {
        let new_id_str = new_id.to_string();
        let mut form: Vec<(&str, &str)> = vec![("newid", &new_id_str), ("name", name)];
        if full {
            form.push(("full", "1"));
        }
        let data = self
            .do_request(HttpMethod::Post, &self.node_path(&format!("qemu/{src_id}/clone")), Some(&form))
            .await?;
        Self::as_task_handle(data)
    }

    pub async fn set_vm_config(&self, id: u32, params: &[(&str, &str)]) -> Result<(), CoreError> {
        self.do_request(HttpMethod::Put, &self.node_path(&format!("qemu/{id}/config")), Some(params))
            .await?;
        Ok(())
    }

    pub async fn start_vm(&self, id: u32) -> Result<TaskHandle, CoreError> {
        let data = self
            .do_request(HttpMethod::Post, &self.node_path(&format!("qemu/{id}/status/start")), Some(&[]))
            .await?;
        Self::as_task_handle(data)
    }

    pub async fn stop_vm(&self, id: u32) -> Result<TaskHandle, CoreError> {
        let data = self
            .do_request(HttpMethod::Post, &self.node_path(&format!("qemu/{id}/status/stop")), Some(&[]))
            .await?;
        Self::as_task_handle(data)
    }

    pub async fn shutdown_vm(&self, id: u32) -> Result<TaskHandle, CoreError> {
        let data = self
            .do_request(HttpMethod::Post, &self.node_path(&format!("qemu/{id}/status/shutdown")), Some(&[]))
            .await?;
        Self::as_task_handle(data)
    }

    /// Always issued with `purge=1&destroy-unreferenced-disks=1` (§4.1).
    pub async fn delete_vm(&self, id: u32) -> Result<TaskHandle, CoreError> {
        let path = self.node_path(&format!("qemu/{id}?purge=1&destroy-unreferenced-disks=1"));
        let data = self.do_request(HttpMethod::Delete, &path, None).await?;
        Self::as_task_handle(data)
    }

    pub async fn create_snapshot(&self, id: u32, name: &str, description: Option<&str>) -> Result<TaskHandle, CoreError> {
        let mut form: Vec<(&str, &str)> = vec![("snapname", name)];
        if let Some(desc) = description {
            form.push(("description", desc));
        }
        let data = self
            .do_request(HttpMethod::Post, &self.node_path(&format!("qemu/{id}/snapshot")), Some(&form))
            .await?;
        Self::as_task_handle(data)
    }

    /// Tolerates both envelope shapes: `{ result: [...] }` and a bare
    /// array (§4.1).
    pub async fn get_guest_agent_interfaces(&self, id: u32) -> Result<Vec<Value>, CoreError> {
        let data = self
            .do_request(
                HttpMethod::Get,
                &self.node_path(&format!("qemu/{id}/agent/network-get-interfaces")),
                None,
            )
            .await?;
        if let Some(array) = data.as_array() {
            return Ok(array.clone());
        }
        if let Some(result) = data.get("result").and_then(Value::as_array) {
            return Ok(result.clone());
        }
        Err(CoreError::ProtocolDecode(format!(
            "expected an interface array or {{result: [...]}}, got: {data}"
        )))
    }

    pub async fn get_node_status(&self) -> Result<Value, CoreError> {
        self.do_request(HttpMethod::Get, &self.node_path("status"), None).await
    }

    pub async fn get_task_status_raw(&self, upid: &str) -> Result<TaskStatus, CoreError> {
        let escaped = urlencoding::encode(upid);
        let data = self
            .do_request(HttpMethod::Get, &self.node_path(&format!("tasks/{escaped}/status")), None)
            .await?;
        let status = data.get("status").and_then(Value::as_str).unwrap_or("");
        if status == "running" {
            return Ok(TaskStatus::Running);
        }
        let exit_status = data
            .get("exitstatus")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Ok(TaskStatus::Stopped { exit_status })
    }

    /// Smallest unused id in `[start, end]`, scanning the current VM
    /// list (§4.1, §8 VMID allocation monotonicity).
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ResourceInsufficient` if every id in the
    /// configured range is already in use.
    pub async fn next_vmid(&self) -> Result<u32, CoreError> {
        let (start, end) = self.config.vmid_range;
        let vms = self.list_vms().await?;
        let used: std::collections::BTreeSet<u32> = vms
            .iter()
            .filter_map(|vm| vm.get("vmid").and_then(Value::as_u64))
            .map(|id| id as u32)
            .collect();
        crate::domain::next_free_vmid(&used, start, end)
            .ok_or_else(|| CoreError::ResourceInsufficient("no available VMID".to_string()))
    }

    #[must_use]
    pub fn config(&self) -> &ProxmoxNodeConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: HttpTransport> crate::application::ports::TaskStatusSource for ProxmoxClient<T> {
    async fn get_task_status(&self, handle: &TaskHandle) -> Result<TaskStatus, CoreError> {
        self.get_task_status_raw(&handle.handle).await
    }
}
