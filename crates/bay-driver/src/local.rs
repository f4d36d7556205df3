use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bay_domain::{ContainerStatus, SessionId};
use tokio::sync::Mutex;
use tracing::debug;

use crate::driver::{
    ContainerCreateSpec, Driver, ManagedResource, ResourceKind, ResourceLabels, VolumeEntry,
};
use crate::error::DriverError;

#[derive(Debug, Clone)]
struct NetworkState {
    labels: HashMap<String, String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct VolumeState {
    labels: HashMap<String, String>,
    /// Path → contents. Directories are implied by prefixes.
    files: HashMap<String, Vec<u8>>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ContainerState {
    hostname: String,
    network_ref: String,
    labels: HashMap<String, String>,
    status: ContainerStatus,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    networks: HashMap<String, NetworkState>,
    volumes: HashMap<String, VolumeState>,
    containers: HashMap<String, ContainerState>,
    /// Operation names whose next invocation fails with `Transient`.
    fail_next: HashSet<String>,
    /// Test hook: hostname → endpoint returned by start_container.
    endpoint_overrides: HashMap<String, String>,
}

/// A fabric simulated entirely in memory.
///
/// - Networks, volumes, and containers are plain maps; volume contents are an
///   in-memory file tree, so direct volume I/O is supported.
/// - Endpoints default to `http://<hostname>:<port>`; tests point individual
///   hostnames at mock servers via [`LocalDriver::set_endpoint`].
/// - [`LocalDriver::fail_next`] makes the next named operation fail with a
///   `Transient` error; [`LocalDriver::set_container_status`] simulates
///   container exits.
#[derive(Debug, Clone, Default)]
pub struct LocalDriver {
    inner: Arc<Mutex<Inner>>,
    seq: Arc<AtomicU64>,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_ref(&self, prefix: &str) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("local-{prefix}-{n}")
    }

    pub async fn set_endpoint(&self, hostname: impl Into<String>, endpoint: impl Into<String>) {
        let mut guard = self.inner.lock().await;
        guard.endpoint_overrides.insert(hostname.into(), endpoint.into());
    }

    pub async fn fail_next(&self, operation: impl Into<String>) {
        let mut guard = self.inner.lock().await;
        guard.fail_next.insert(operation.into());
    }

    pub async fn set_container_status(&self, container_id: &str, status: ContainerStatus) {
        let mut guard = self.inner.lock().await;
        if let Some(c) = guard.containers.get_mut(container_id) {
            c.status = status;
        }
    }

    pub async fn container_count(&self) -> usize {
        self.inner.lock().await.containers.len()
    }

    pub async fn network_count(&self) -> usize {
        self.inner.lock().await.networks.len()
    }

    pub async fn volume_count(&self) -> usize {
        self.inner.lock().await.volumes.len()
    }

    /// Plant a resource directly in the fabric, bypassing the normal create
    /// path. Used to simulate leftovers for orphan-reaper tests.
    pub async fn plant_container(
        &self,
        container_id: impl Into<String>,
        labels: HashMap<String, String>,
        created_at: DateTime<Utc>,
    ) {
        let mut guard = self.inner.lock().await;
        guard.containers.insert(
            container_id.into(),
            ContainerState {
                hostname: "planted".into(),
                network_ref: String::new(),
                labels,
                status: ContainerStatus::Running,
                created_at,
            },
        );
    }

    async fn check_fail(&self, operation: &str) -> Result<(), DriverError> {
        let mut guard = self.inner.lock().await;
        if guard.fail_next.remove(operation) {
            return Err(DriverError::Transient(format!(
                "injected failure in {operation}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports_volume_io(&self) -> bool {
        true
    }

    async fn create_network(
        &self,
        session_id: &SessionId,
        labels: &ResourceLabels,
    ) -> Result<String, DriverError> {
        self.check_fail("create_network").await?;
        let network_ref = self.next_ref("net");
        debug!(session_id = %session_id, network_ref = %network_ref, "LocalDriver: create_network");
        let mut guard = self.inner.lock().await;
        guard.networks.insert(
            network_ref.clone(),
            NetworkState { labels: labels.to_map(), created_at: Utc::now() },
        );
        Ok(network_ref)
    }

    async fn delete_network(&self, network_ref: &str) -> Result<(), DriverError> {
        self.check_fail("delete_network").await?;
        debug!(network_ref = %network_ref, "LocalDriver: delete_network");
        let mut guard = self.inner.lock().await;
        guard.networks.remove(network_ref);
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &ResourceLabels,
    ) -> Result<String, DriverError> {
        self.check_fail("create_volume").await?;
        debug!(name = %name, "LocalDriver: create_volume");
        let mut guard = self.inner.lock().await;
        if guard.volumes.contains_key(name) {
            return Err(DriverError::Conflict(format!("volume '{name}' exists")));
        }
        guard.volumes.insert(
            name.to_string(),
            VolumeState {
                labels: labels.to_map(),
                files: HashMap::new(),
                created_at: Some(Utc::now()),
            },
        );
        Ok(name.to_string())
    }

    async fn delete_volume(&self, driver_ref: &str) -> Result<(), DriverError> {
        self.check_fail("delete_volume").await?;
        debug!(driver_ref = %driver_ref, "LocalDriver: delete_volume");
        let mut guard = self.inner.lock().await;
        guard.volumes.remove(driver_ref);
        Ok(())
    }

    async fn volume_exists(&self, driver_ref: &str) -> Result<bool, DriverError> {
        let guard = self.inner.lock().await;
        Ok(guard.volumes.contains_key(driver_ref))
    }

    async fn create_container(&self, spec: &ContainerCreateSpec) -> Result<String, DriverError> {
        self.check_fail("create_container").await?;
        let container_id = self.next_ref("ctr");
        debug!(
            container_id = %container_id,
            hostname = %spec.hostname,
            image = %spec.image,
            "LocalDriver: create_container"
        );
        let mut guard = self.inner.lock().await;
        if !guard.networks.contains_key(&spec.network_ref) {
            return Err(DriverError::NotFound(format!(
                "network '{}' not found",
                spec.network_ref
            )));
        }
        if let Some(vol) = &spec.volume_ref {
            if !guard.volumes.contains_key(vol) {
                return Err(DriverError::NotFound(format!("volume '{vol}' not found")));
            }
        }
        guard.containers.insert(
            container_id.clone(),
            ContainerState {
                hostname: spec.hostname.clone(),
                network_ref: spec.network_ref.clone(),
                labels: spec.labels.to_map(),
                status: ContainerStatus::Created,
                created_at: Utc::now(),
            },
        );
        Ok(container_id)
    }

    async fn start_container(
        &self,
        container_id: &str,
        runtime_port: u16,
    ) -> Result<String, DriverError> {
        self.check_fail("start_container").await?;
        let mut guard = self.inner.lock().await;
        let container = guard
            .containers
            .get_mut(container_id)
            .ok_or_else(|| DriverError::NotFound(format!("container '{container_id}'")))?;
        container.status = ContainerStatus::Running;
        let hostname = container.hostname.clone();
        let endpoint = guard
            .endpoint_overrides
            .get(&hostname)
            .cloned()
            .unwrap_or_else(|| format!("http://{hostname}:{runtime_port}"));
        debug!(container_id = %container_id, endpoint = %endpoint, "LocalDriver: start_container");
        Ok(endpoint)
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), DriverError> {
        self.check_fail("stop_container").await?;
        let mut guard = self.inner.lock().await;
        if let Some(container) = guard.containers.get_mut(container_id) {
            container.status = ContainerStatus::Exited;
        }
        Ok(())
    }

    async fn destroy_container(&self, container_id: &str) -> Result<(), DriverError> {
        self.check_fail("destroy_container").await?;
        debug!(container_id = %container_id, "LocalDriver: destroy_container");
        let mut guard = self.inner.lock().await;
        guard.containers.remove(container_id);
        Ok(())
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus, DriverError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .containers
            .get(container_id)
            .map(|c| c.status)
            .unwrap_or(ContainerStatus::Missing))
    }

    async fn list_managed_resources(&self) -> Result<Vec<ManagedResource>, DriverError> {
        let guard = self.inner.lock().await;
        let mut resources = Vec::new();
        for (id, c) in &guard.containers {
            resources.push(ManagedResource {
                kind: ResourceKind::Container,
                reference: id.clone(),
                labels: c.labels.clone(),
                created_at: Some(c.created_at),
            });
        }
        for (name, v) in &guard.volumes {
            resources.push(ManagedResource {
                kind: ResourceKind::Volume,
                reference: name.clone(),
                labels: v.labels.clone(),
                created_at: v.created_at,
            });
        }
        for (name, n) in &guard.networks {
            resources.push(ManagedResource {
                kind: ResourceKind::Network,
                reference: name.clone(),
                labels: n.labels.clone(),
                created_at: Some(n.created_at),
            });
        }
        Ok(resources)
    }

    async fn destroy_resource(&self, resource: &ManagedResource) -> Result<(), DriverError> {
        let mut guard = self.inner.lock().await;
        match resource.kind {
            ResourceKind::Container => {
                guard.containers.remove(&resource.reference);
            }
            ResourceKind::Volume => {
                guard.volumes.remove(&resource.reference);
            }
            ResourceKind::Network => {
                guard.networks.remove(&resource.reference);
            }
        }
        Ok(())
    }

    // ── Direct volume I/O ─────────────────────────────────────────────────────

    async fn volume_read(&self, driver_ref: &str, path: &str) -> Result<Vec<u8>, DriverError> {
        let guard = self.inner.lock().await;
        let volume = guard
            .volumes
            .get(driver_ref)
            .ok_or_else(|| DriverError::NotFound(format!("volume '{driver_ref}'")))?;
        volume
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("file '{path}'")))
    }

    async fn volume_write(
        &self,
        driver_ref: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), DriverError> {
        let mut guard = self.inner.lock().await;
        let volume = guard
            .volumes
            .get_mut(driver_ref)
            .ok_or_else(|| DriverError::NotFound(format!("volume '{driver_ref}'")))?;
        volume.files.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn volume_list(
        &self,
        driver_ref: &str,
        path: &str,
    ) -> Result<Vec<VolumeEntry>, DriverError> {
        let guard = self.inner.lock().await;
        let volume = guard
            .volumes
            .get(driver_ref)
            .ok_or_else(|| DriverError::NotFound(format!("volume '{driver_ref}'")))?;

        let prefix = if path.is_empty() || path == "." {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };

        let mut seen = HashMap::new();
        for (file, contents) in &volume.files {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    seen.entry(dir.to_string()).or_insert(VolumeEntry {
                        name: dir.to_string(),
                        size: 0,
                        is_dir: true,
                    });
                }
                None => {
                    seen.insert(
                        rest.to_string(),
                        VolumeEntry {
                            name: rest.to_string(),
                            size: contents.len() as u64,
                            is_dir: false,
                        },
                    );
                }
            }
        }
        let mut entries: Vec<VolumeEntry> = seen.into_values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn volume_delete_path(&self, driver_ref: &str, path: &str) -> Result<(), DriverError> {
        let mut guard = self.inner.lock().await;
        let volume = guard
            .volumes
            .get_mut(driver_ref)
            .ok_or_else(|| DriverError::NotFound(format!("volume '{driver_ref}'")))?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let before = volume.files.len();
        volume
            .files
            .retain(|file, _| file != path && !file.starts_with(&prefix));
        if volume.files.len() == before {
            return Err(DriverError::NotFound(format!("path '{path}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bay_domain::{OwnerId, SandboxId};

    fn labels(sandbox: &str) -> ResourceLabels {
        ResourceLabels {
            owner: Some(OwnerId::new("acme")),
            sandbox_id: Some(SandboxId::new(sandbox)),
            ..Default::default()
        }
    }

    fn spec(network: &str, volume: Option<&str>, hostname: &str) -> ContainerCreateSpec {
        ContainerCreateSpec {
            name: format!("bay-{hostname}"),
            hostname: hostname.to_string(),
            image: "bay/runtime:latest".into(),
            env: HashMap::new(),
            cpu: 1.0,
            memory_mb: 512,
            network_ref: network.to_string(),
            volume_ref: volume.map(String::from),
            labels: labels("sb-1"),
        }
    }

    #[tokio::test]
    async fn container_lifecycle() {
        let driver = LocalDriver::new();
        let net = driver
            .create_network(&SessionId::new("sess-1"), &labels("sb-1"))
            .await
            .unwrap();
        let ctr = driver.create_container(&spec(&net, None, "ship")).await.unwrap();

        assert_eq!(
            driver.container_status(&ctr).await.unwrap(),
            ContainerStatus::Created
        );

        let endpoint = driver.start_container(&ctr, 8700).await.unwrap();
        assert_eq!(endpoint, "http://ship:8700");
        assert_eq!(
            driver.container_status(&ctr).await.unwrap(),
            ContainerStatus::Running
        );

        driver.stop_container(&ctr).await.unwrap();
        assert_eq!(
            driver.container_status(&ctr).await.unwrap(),
            ContainerStatus::Exited
        );

        driver.destroy_container(&ctr).await.unwrap();
        assert_eq!(
            driver.container_status(&ctr).await.unwrap(),
            ContainerStatus::Missing
        );
    }

    #[tokio::test]
    async fn create_container_requires_network_and_volume() {
        let driver = LocalDriver::new();
        let err = driver
            .create_container(&spec("no-such-net", None, "ship"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let net = driver
            .create_network(&SessionId::new("sess-1"), &labels("sb-1"))
            .await
            .unwrap();
        let err = driver
            .create_container(&spec(&net, Some("no-such-vol"), "ship"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn endpoint_override_wins() {
        let driver = LocalDriver::new();
        driver.set_endpoint("ship", "http://127.0.0.1:9999").await;
        let net = driver
            .create_network(&SessionId::new("sess-1"), &labels("sb-1"))
            .await
            .unwrap();
        let ctr = driver.create_container(&spec(&net, None, "ship")).await.unwrap();
        let endpoint = driver.start_container(&ctr, 8700).await.unwrap();
        assert_eq!(endpoint, "http://127.0.0.1:9999");
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let driver = LocalDriver::new();
        driver.fail_next("create_network").await;
        let err = driver
            .create_network(&SessionId::new("sess-1"), &labels("sb-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Transient(_)));

        // Second attempt succeeds.
        driver
            .create_network(&SessionId::new("sess-1"), &labels("sb-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn volume_io_round_trip() {
        let driver = LocalDriver::new();
        let vol = driver.create_volume("cargo-1", &labels("sb-1")).await.unwrap();

        driver.volume_write(&vol, "a.txt", b"hello").await.unwrap();
        driver
            .volume_write(&vol, "data/state.txt", b"keep")
            .await
            .unwrap();

        assert_eq!(driver.volume_read(&vol, "a.txt").await.unwrap(), b"hello");

        let root = driver.volume_list(&vol, "").await.unwrap();
        let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "data"]);
        assert!(root[1].is_dir);

        let sub = driver.volume_list(&vol, "data").await.unwrap();
        assert_eq!(sub.len(), 1);
        assert_eq!(sub[0].name, "state.txt");
        assert_eq!(sub[0].size, 4);

        driver.volume_delete_path(&vol, "data").await.unwrap();
        assert!(driver.volume_read(&vol, "data/state.txt").await.is_err());
    }

    #[tokio::test]
    async fn managed_resources_carry_labels() {
        let driver = LocalDriver::new();
        let net = driver
            .create_network(&SessionId::new("sess-9"), &labels("sb-9"))
            .await
            .unwrap();
        driver.create_volume("cargo-9", &labels("sb-9")).await.unwrap();
        driver.create_container(&spec(&net, None, "ship")).await.unwrap();

        let resources = driver.list_managed_resources().await.unwrap();
        assert_eq!(resources.len(), 3);
        for r in &resources {
            assert_eq!(r.labels.get(crate::driver::LABEL_MANAGED).unwrap(), "true");
            assert_eq!(r.sandbox_id(), Some(SandboxId::new("sb-9")));
        }
    }
}
