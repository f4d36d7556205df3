use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use bay_domain::{ContainerStatus, SessionId};
use tracing::{debug, info};

use crate::driver::{
    ContainerCreateSpec, Driver, ManagedResource, ResourceKind, ResourceLabels, LABEL_MANAGED,
    WORKSPACE_MOUNT,
};
use crate::error::DriverError;

/// Driver over a local Docker daemon (or anything speaking its API).
///
/// Each session gets a user-defined bridge network; containers join it with
/// their logical name as hostname, so the group resolves peers by name.
/// Endpoints returned from [`Driver::start_container`] use the container's
/// address on that network.
#[derive(Clone)]
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect using the environment's defaults (unix socket or
    /// DOCKER_HOST) and verify the daemon responds. Handshake failure is
    /// fatal — the server refuses to start without a usable fabric.
    pub async fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::Fatal(format!("docker connect: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| DriverError::Fatal(format!("docker ping: {e}")))?;
        info!("docker daemon handshake ok");
        Ok(Self { docker })
    }

    fn label_filter() -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{LABEL_MANAGED}=true")]);
        filters
    }
}

fn map_err(context: &str, e: bollard::errors::Error) -> DriverError {
    use bollard::errors::Error as E;
    match e {
        E::DockerResponseServerError { status_code, message } => match status_code {
            404 => DriverError::NotFound(format!("{context}: {message}")),
            409 => DriverError::Conflict(format!("{context}: {message}")),
            500..=599 => DriverError::Transient(format!("{context}: {message}")),
            code => DriverError::Fatal(format!("{context}: HTTP {code}: {message}")),
        },
        other => DriverError::Transient(format!("{context}: {other}")),
    }
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
            ContainerStatus::Exited
        }
        _ => ContainerStatus::Unknown,
    }
}

#[async_trait]
impl Driver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_network(
        &self,
        session_id: &SessionId,
        labels: &ResourceLabels,
    ) -> Result<String, DriverError> {
        let name = format!("bay-net-{session_id}");
        debug!(session_id = %session_id, network = %name, "DockerDriver: create_network");
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.clone(),
                driver: "bridge".to_string(),
                labels: labels.to_map(),
                ..Default::default()
            })
            .await
            .map_err(|e| map_err("create_network", e))?;
        Ok(name)
    }

    async fn delete_network(&self, network_ref: &str) -> Result<(), DriverError> {
        debug!(network = %network_ref, "DockerDriver: delete_network");
        match self.docker.remove_network(network_ref).await {
            Ok(()) => Ok(()),
            Err(e) => match map_err("delete_network", e) {
                DriverError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &ResourceLabels,
    ) -> Result<String, DriverError> {
        debug!(volume = %name, "DockerDriver: create_volume");
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                labels: labels.to_map(),
                ..Default::default()
            })
            .await
            .map_err(|e| map_err("create_volume", e))?;
        Ok(volume.name)
    }

    async fn delete_volume(&self, driver_ref: &str) -> Result<(), DriverError> {
        debug!(volume = %driver_ref, "DockerDriver: delete_volume");
        match self
            .docker
            .remove_volume(driver_ref, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match map_err("delete_volume", e) {
                DriverError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn volume_exists(&self, driver_ref: &str) -> Result<bool, DriverError> {
        match self.docker.inspect_volume(driver_ref).await {
            Ok(_) => Ok(true),
            Err(e) => match map_err("inspect_volume", e) {
                DriverError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_container(&self, spec: &ContainerCreateSpec) -> Result<String, DriverError> {
        debug!(
            name = %spec.name,
            hostname = %spec.hostname,
            image = %spec.image,
            "DockerDriver: create_container"
        );
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mounts = spec.volume_ref.as_ref().map(|vol| {
            vec![Mount {
                target: Some(WORKSPACE_MOUNT.to_string()),
                source: Some(vol.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            }]
        });

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            env: Some(env),
            labels: Some(spec.labels.to_map()),
            host_config: Some(HostConfig {
                network_mode: Some(spec.network_ref.clone()),
                mounts,
                nano_cpus: Some((spec.cpu * 1_000_000_000.0) as i64),
                memory: Some(spec.memory_mb as i64 * 1024 * 1024),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions { name: spec.name.clone(), platform: None }),
                config,
            )
            .await
            .map_err(|e| map_err("create_container", e))?;
        Ok(created.id)
    }

    async fn start_container(
        &self,
        container_id: &str,
        runtime_port: u16,
    ) -> Result<String, DriverError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err("start_container", e))?;

        // The runtime is reached on the session bridge network; resolve the
        // container's address there.
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err("inspect_container", e))?;
        let ip = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .and_then(|nets| {
                nets.values()
                    .filter_map(|n| n.ip_address.clone())
                    .find(|ip| !ip.is_empty())
            })
            .ok_or_else(|| {
                DriverError::Invariant(format!(
                    "container '{container_id}' has no address on its session network"
                ))
            })?;
        Ok(format!("http://{ip}:{runtime_port}"))
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), DriverError> {
        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match map_err("stop_container", e) {
                DriverError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn destroy_container(&self, container_id: &str) -> Result<(), DriverError> {
        debug!(container_id = %container_id, "DockerDriver: destroy_container");
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match map_err("destroy_container", e) {
                DriverError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus, DriverError> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(map_status(inspect.state.and_then(|s| s.status))),
            Err(e) => match map_err("inspect_container", e) {
                DriverError::NotFound(_) => Ok(ContainerStatus::Missing),
                other => Err(other),
            },
        }
    }

    async fn list_managed_resources(&self) -> Result<Vec<ManagedResource>, DriverError> {
        let mut resources = Vec::new();

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: Self::label_filter(),
                ..Default::default()
            }))
            .await
            .map_err(|e| map_err("list_containers", e))?;
        for c in containers {
            let Some(id) = c.id else { continue };
            resources.push(ManagedResource {
                kind: ResourceKind::Container,
                reference: id,
                labels: c.labels.unwrap_or_default(),
                created_at: c.created.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)),
            });
        }

        let volumes = self
            .docker
            .list_volumes(Some(ListVolumesOptions::<String> {
                filters: Self::label_filter(),
            }))
            .await
            .map_err(|e| map_err("list_volumes", e))?;
        for v in volumes.volumes.unwrap_or_default() {
            resources.push(ManagedResource {
                kind: ResourceKind::Volume,
                reference: v.name,
                labels: v.labels,
                created_at: v
                    .created_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc)),
            });
        }

        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions::<String> {
                filters: Self::label_filter(),
            }))
            .await
            .map_err(|e| map_err("list_networks", e))?;
        for n in networks {
            let Some(name) = n.name else { continue };
            resources.push(ManagedResource {
                kind: ResourceKind::Network,
                reference: name,
                labels: n.labels.unwrap_or_default(),
                created_at: n
                    .created
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc)),
            });
        }

        Ok(resources)
    }

    async fn destroy_resource(&self, resource: &ManagedResource) -> Result<(), DriverError> {
        match resource.kind {
            ResourceKind::Container => self.destroy_container(&resource.reference).await,
            ResourceKind::Volume => self.delete_volume(&resource.reference).await,
            ResourceKind::Network => self.delete_network(&resource.reference).await,
        }
    }
}

// Daemon-dependent tests. Run with a local Docker available:
//   cargo test -p bay-driver -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use bay_domain::{OwnerId, SandboxId};

    fn labels() -> ResourceLabels {
        ResourceLabels {
            owner: Some(OwnerId::new("bay-test")),
            sandbox_id: Some(SandboxId::new("sb-docker-test")),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "requires a running docker daemon"]
    async fn network_round_trip() {
        let driver = DockerDriver::connect().await.unwrap();
        let session = SessionId::new(format!("test-{}", uuid::Uuid::new_v4()));
        let net = driver.create_network(&session, &labels()).await.unwrap();

        let listed = driver.list_managed_resources().await.unwrap();
        assert!(listed
            .iter()
            .any(|r| r.kind == ResourceKind::Network && r.reference == net));

        driver.delete_network(&net).await.unwrap();
        // Deleting again is a no-op.
        driver.delete_network(&net).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running docker daemon"]
    async fn volume_round_trip() {
        let driver = DockerDriver::connect().await.unwrap();
        let name = format!("bay-test-{}", uuid::Uuid::new_v4());
        let vol = driver.create_volume(&name, &labels()).await.unwrap();
        assert!(driver.volume_exists(&vol).await.unwrap());
        driver.delete_volume(&vol).await.unwrap();
        assert!(!driver.volume_exists(&vol).await.unwrap());
    }
}
