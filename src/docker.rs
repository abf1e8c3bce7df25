//! Docker implementation of the container runtime port

use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerState, PortBindingInfo, RuntimeError,
};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StartContainerOptions, StopContainerOptions};
use bollard::Docker;
use std::time::Duration;
use tracing::debug;

/// Compose label carrying the stack a container belongs to.
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon.
    ///
    /// Connection priority:
    /// 1. DOCKER_HOST environment variable
    /// 2. Common socket paths (platform-specific)
    /// 3. bollard's built-in default
    pub async fn connect() -> anyhow::Result<Self> {
        let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid DOCKER_HOST format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue; // Skip invalid paths from empty env vars
            }
            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. \
                 Start dockerd or set the DOCKER_HOST environment variable. \
                 Underlying error: {}",
                e
            )
        })
    }

    fn map_error(name: &str, err: bollard::errors::Error) -> RuntimeError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound(name.to_string()),
            other => RuntimeError::Transport(other.to_string()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<ContainerState, RuntimeError> {
        let inspected = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(|e| Self::map_error(name, e))?;

        let running = inspected
            .state
            .and_then(|s| s.running)
            .unwrap_or(false);
        Ok(ContainerState { running })
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                // Already running
                debug!(container = name, "container was already started");
                Ok(())
            }
            Err(e) => Err(Self::map_error(name, e)),
        }
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.client.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                // Already stopped
                debug!(container = name, "container was already stopped");
                Ok(())
            }
            Err(e) => Err(Self::map_error(name, e)),
        }
    }

    async fn list(&self, include_stopped: bool) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: include_stopped,
            ..Default::default()
        };
        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;

        let mut out = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let id = summary.id.unwrap_or_default();
            let name = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let state = summary.state.unwrap_or_default();

            let mut ports: Vec<PortBindingInfo> = summary
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| PortBindingInfo {
                    ip: p.ip.unwrap_or_default(),
                    private_port: p.private_port as u16,
                    public_port: p.public_port.unwrap_or_default() as u16,
                    proto: p.typ.map(|t| t.to_string()).unwrap_or_else(|| "tcp".into()),
                })
                .collect();

            // A stopped container reports no port bindings; recover them
            // from its declared exposed ports and host-side bindings so
            // the listing stays useful.
            if ports.is_empty() && matches!(state.as_str(), "exited" | "stopped" | "created") {
                ports = self.recover_ports(&id).await;
            }

            let stack = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get(COMPOSE_PROJECT_LABEL))
                .cloned()
                .unwrap_or_default();

            out.push(ContainerInfo {
                id,
                name,
                image: summary.image.unwrap_or_default(),
                state,
                status: summary.status.unwrap_or_default(),
                ports,
                stack,
            });
        }

        Ok(out)
    }
}

impl DockerRuntime {
    /// Best-effort port recovery for a container that is not running.
    async fn recover_ports(&self, id: &str) -> Vec<PortBindingInfo> {
        let Ok(inspected) = self.client.inspect_container(id, None).await else {
            return Vec::new();
        };

        let exposed = inspected
            .config
            .and_then(|c| c.exposed_ports)
            .unwrap_or_default();
        let bindings = inspected
            .host_config
            .and_then(|hc| hc.port_bindings)
            .unwrap_or_default();

        for port_spec in exposed.keys() {
            let (port_str, proto) = port_spec
                .split_once('/')
                .unwrap_or((port_spec.as_str(), "tcp"));
            let Ok(private_port) = port_str.parse::<u16>() else {
                continue;
            };
            if private_port == 0 {
                continue;
            }

            if let Some(Some(host_bindings)) = bindings.get(port_spec) {
                if let Some(binding) = host_bindings.first() {
                    if let Some(public_port) = binding
                        .host_port
                        .as_deref()
                        .and_then(|p| p.parse::<u16>().ok())
                        .filter(|p| *p > 0)
                    {
                        return vec![PortBindingInfo {
                            ip: binding.host_ip.clone().unwrap_or_default(),
                            private_port,
                            public_port,
                            proto: proto.to_string(),
                        }];
                    }
                }
            }

            return vec![PortBindingInfo {
                ip: "0.0.0.0".to_string(),
                private_port,
                public_port: private_port,
                proto: proto.to_string(),
            }];
        }

        Vec::new()
    }
}
