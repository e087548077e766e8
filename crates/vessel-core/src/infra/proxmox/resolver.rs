//! Bidirectional name/id cache over a `ProxmoxClient` (§4.3).
//!
//! Readers (`resolve_id`/`resolve_name`/`list_all`) may run concurrently
//! with each other; `refresh` takes the write side of an
//! `RwLock<ResolverMaps>` and swaps both maps atomically so no reader ever
//! observes a partially populated cache.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;
use vessel_common::CoreError;

use crate::infra::proxmox::client::ProxmoxClient;
use crate::infra::proxmox::transport::HttpTransport;

#[derive(Debug, Clone, Default)]
struct ResolverMaps {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
}

/// Caches the name<->id mapping for one Proxmox node, refreshing from
/// `listVMs()` on a cache miss (§4.3).
pub struct VMResolver<'a, T: HttpTransport> {
    client: &'a ProxmoxClient<T>,
    maps: RwLock<ResolverMaps>,
}

impl<'a, T: HttpTransport> VMResolver<'a, T> {
    #[must_use]
    pub fn new(client: &'a ProxmoxClient<T>) -> Self {
        Self { client, maps: RwLock::new(ResolverMaps::default()) }
    }

    /// Rebuild both maps from a fresh `listVMs()` call. Replaces the
    /// previous maps atomically under the write lock.
    ///
    /// # Errors
    ///
    /// Propagates any error from the underlying `listVMs()` call.
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let vms = self.client.list_vms().await?;
        let mut by_name = HashMap::with_capacity(vms.len());
        let mut by_id = HashMap::with_capacity(vms.len());
        for vm in &vms {
            let (Some(id), Some(name)) = (vm_id(vm), vm_name(vm)) else {
                continue;
            };
            by_name.insert(name.clone(), id);
            by_id.insert(id, name);
        }
        tracing::debug!(count = vms.len(), "refreshed vm name/id cache");
        let mut maps = self.maps.write().await;
        *maps = ResolverMaps { by_name, by_id };
        Ok(())
    }

    /// Resolve `name` to its provider id. A cache miss triggers a full
    /// refresh, then retries the lookup once; still missing is
    /// `CoreError::NotFound`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if `name` does not exist after a
    /// refresh, or propagates a `refresh` failure.
    pub async fn resolve_id(&self, name: &str) -> Result<u32, CoreError> {
        if let Some(id) = self.maps.read().await.by_name.get(name).copied() {
            return Ok(id);
        }
        self.refresh().await?;
        self.maps.read().await.by_name.get(name).copied().ok_or_else(|| CoreError::NotFound {
            kind: "vm",
            name: name.to_string(),
        })
    }

    /// Symmetric to `resolve_id`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if `id` does not exist after a
    /// refresh, or propagates a `refresh` failure.
    pub async fn resolve_name(&self, id: u32) -> Result<String, CoreError> {
        if let Some(name) = self.maps.read().await.by_id.get(&id).cloned() {
            return Ok(name);
        }
        self.refresh().await?;
        self.maps
            .read()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound { kind: "vm", name: id.to_string() })
    }

    /// Always re-fetches fresh data; refreshes first only if the cache is
    /// currently empty (§4.3).
    ///
    /// # Errors
    ///
    /// Propagates any error from `listVMs()`.
    pub async fn list_all(&self) -> Result<Vec<Value>, CoreError> {
        if self.maps.read().await.by_name.is_empty() {
            self.refresh().await?;
        }
        self.client.list_vms().await
    }
}

fn vm_id(vm: &Value) -> Option<u32> {
    vm.get("vmid").and_then(Value::as_u64).map(|id| id as u32)
}

fn vm_name(vm: &Value) -> Option<String> {
    vm.get("name").and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::proxmox::client::ProxmoxNodeConfig;
    use crate::infra::proxmox::transport::RawResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingTransport {
        body: String,
        calls: AtomicUsize,
    }

    impl HttpTransport for CountingTransport {
        async fn send(
            &self,
            _method: crate::infra::proxmox::transport::HttpMethod,
            _path: &str,
            _form_body: Option<&str>,
        ) -> Result<RawResponse, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawResponse { status: 200, body: self.body.clone() })
        }
    }

    fn config() -> ProxmoxNodeConfig {
        ProxmoxNodeConfig { node: "pve1".into(), vmid_range: (9000, 9999), default_bridge: None }
    }

    #[tokio::test]
    async fn two_sequential_resolves_issue_one_list_call() {
        let transport = CountingTransport {
            body: r#"{"data":[{"vmid":100,"name":"ubuntu-template"}]}"#.to_string(),
            calls: AtomicUsize::new(0),
        };
        let client = ProxmoxClient::new(transport, config());
        let resolver = VMResolver::new(&client);

        let id1 = resolver.resolve_id("ubuntu-template").await.expect("first resolve");
        let id2 = resolver.resolve_id("ubuntu-template").await.expect("second resolve");
        assert_eq!(id1, 100);
        assert_eq!(id2, 100);
        assert_eq!(client.transport().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_id_not_found_after_refresh() {
        let transport = CountingTransport {
            body: r#"{"data":[{"vmid":100,"name":"ubuntu-template"}]}"#.to_string(),
            calls: AtomicUsize::new(0),
        };
        let client = ProxmoxClient::new(transport, config());
        let resolver = VMResolver::new(&client);
        let err = resolver.resolve_id("does-not-exist").await.expect_err("expected not found");
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn refresh_replaces_stale_entries() {
        let transport = Mutex::new(vec![
            r#"{"data":[{"vmid":100,"name":"old-name"}]}"#.to_string(),
            r#"{"data":[{"vmid":100,"name":"new-name"}]}"#.to_string(),
        ]);
        struct ScriptedTransport<'a>(&'a Mutex<Vec<String>>);
        impl HttpTransport for ScriptedTransport<'_> {
            async fn send(
                &self,
                _method: crate::infra::proxmox::transport::HttpMethod,
                _path: &str,
                _form_body: Option<&str>,
            ) -> Result<RawResponse, CoreError> {
                let body = self.0.lock().expect("lock poisoned").remove(0);
                Ok(RawResponse { status: 200, body })
            }
        }
        let client = ProxmoxClient::new(ScriptedTransport(&transport), config());
        let resolver = VMResolver::new(&client);

        resolver.refresh().await.expect("first refresh");
        assert_eq!(resolver.resolve_name(100).await.expect("resolve"), "old-name");

        resolver.refresh().await.expect("second refresh");
        assert_eq!(resolver.resolve_name(100).await.expect("resolve"), "new-name");
    }
}
