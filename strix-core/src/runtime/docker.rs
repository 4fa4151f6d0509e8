//! Docker container management for scan sandboxes
//!
//! One container per scan, created with elevated network capabilities and a
//! tool-server worker bound to a host-local port. Creation and destruction
//! take the runtime's container lock; `execute` is lock-free and relies on
//! the in-container worker for per-agent serialisation.

use std::collections::HashMap;

use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SandboxSettings;
use crate::{Error, Result};

use super::client::SandboxClient;
use super::{mint_token, Sandbox};

/// Total deadline for a new sandbox to become healthy
const HEALTH_DEADLINE: Duration = Duration::from_secs(60);

/// Window after which a previously healthy sandbox is recreated
const RECOVERY_WINDOW: Duration = Duration::from_secs(30);

const CREATE_RETRIES: usize = 3;

/// Per-scan sandbox container manager
pub struct SandboxRuntime {
    docker: Docker,
    image: String,
    docker_host: Option<String>,
    client: SandboxClient,
    sandboxes: Mutex<HashMap<String, Sandbox>>,
}

impl SandboxRuntime {
    pub fn connect(settings: &SandboxSettings) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        let client = SandboxClient::new(settings.execution_timeout)?;

        Ok(Self {
            docker,
            image: settings.image.clone(),
            docker_host: settings.docker_host.clone(),
            client,
            sandboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Verify the Docker daemon is reachable before any scan work starts.
    pub async fn preflight(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| Error::SandboxUnavailable(format!("Cannot reach Docker daemon: {e}")))?;
        Ok(())
    }

    pub fn client(&self) -> &SandboxClient {
        &self.client
    }

    /// Create (or return) the sandbox for a scan: pull the image if absent,
    /// launch the container with a minted bearer token, and wait for the
    /// tool server to become healthy.
    pub async fn create(&self, scan_id: &str) -> Result<Sandbox> {
        let mut sandboxes = self.sandboxes.lock().await;
        if let Some(existing) = sandboxes.get(scan_id) {
            return Ok(existing.clone());
        }

        self.pull_image_if_absent().await?;

        let mut last_error = None;
        for attempt in 0..CREATE_RETRIES {
            match self.create_once(scan_id).await {
                Ok(sandbox) => match self.wait_ready(&sandbox).await {
                    Ok(()) => {
                        info!(scan_id, container = %sandbox.container_id, "Sandbox ready");
                        sandboxes.insert(scan_id.to_string(), sandbox.clone());
                        return Ok(sandbox);
                    }
                    Err(error) => {
                        warn!(scan_id, %error, "Sandbox failed health check, removing");
                        let _ = self.remove_container(&sandbox.container_id).await;
                        last_error = Some(error);
                    }
                },
                Err(error) => {
                    warn!(
                        scan_id,
                        attempt = attempt + 1,
                        %error,
                        "Sandbox creation attempt failed"
                    );
                    last_error = Some(error);
                }
            }
            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
        }

        Err(Error::SandboxUnavailable(format!(
            "failed to create sandbox for {scan_id} after {CREATE_RETRIES} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn pull_image_if_absent(&self) -> Result<()> {
        match self.docker.inspect_image(&self.image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(error) => return Err(error.into()),
        }

        info!(image = %self.image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: Some(self.image.clone()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!(image = %self.image, status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create_once(&self, scan_id: &str) -> Result<Sandbox> {
        let name = format!("strix-scan-{scan_id}");

        // A stale container with our name blocks creation; remove it
        if self
            .docker
            .inspect_container(&name, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .is_ok()
        {
            warn!(container = %name, "Removing stale sandbox container");
            let _ = self
                .docker
                .stop_container(
                    &name,
                    Some(StopContainerOptions {
                        t: Some(5),
                        ..Default::default()
                    }),
                )
                .await;
            let _ = self
                .docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
        }

        let port = find_available_port()?;
        let token = mint_token();
        let port_key = format!("{port}/tcp");

        let host_config = HostConfig {
            cap_add: Some(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]),
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            )])),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(self.image.clone()),
            hostname: Some(name.clone()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(
                "strix-scan-id".to_string(),
                scan_id.to_string(),
            )])),
            env: Some(vec![
                "STRIX_SANDBOX_MODE=true".to_string(),
                format!("TOOL_SERVER_PORT={port}"),
                format!("TOOL_SERVER_TOKEN={token}"),
            ]),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        self.docker
            .start_container(&name, None::<StartContainerOptions>)
            .await?;

        info!(container = %response.id, scan_id, "Sandbox container started");

        let host = resolve_docker_host(self.docker_host.as_deref());
        Ok(Sandbox {
            container_id: response.id,
            scan_id: scan_id.to_string(),
            url: format!("http://{host}:{port}"),
            token,
            port,
        })
    }

    /// Poll `/health` with exponential backoff until ready or the deadline.
    async fn wait_ready(&self, sandbox: &Sandbox) -> Result<()> {
        let deadline = Instant::now() + HEALTH_DEADLINE;
        let mut delay = Duration::from_millis(500);

        while Instant::now() < deadline {
            if self.client.health(sandbox).await {
                return Ok(());
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(5));
        }

        Err(Error::SandboxUnavailable(format!(
            "tool server in {} not healthy within {}s",
            sandbox.container_id,
            HEALTH_DEADLINE.as_secs()
        )))
    }

    /// Probe an existing sandbox; recreate it when health has been failing
    /// for the recovery window.
    pub async fn recover(&self, sandbox: &Sandbox) -> Result<Sandbox> {
        let deadline = Instant::now() + RECOVERY_WINDOW;
        while Instant::now() < deadline {
            if self.client.health(sandbox).await {
                return Ok(sandbox.clone());
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        warn!(container = %sandbox.container_id, "Sandbox unhealthy, recreating");
        self.destroy(sandbox).await?;
        self.create(&sandbox.scan_id).await
    }

    /// Register a dedicated worker for an agent inside the sandbox.
    pub async fn register_agent(&self, sandbox: &Sandbox, agent_id: &str) -> Result<String> {
        self.client.register_agent(sandbox, agent_id).await
    }

    /// Route a tool call to the agent's in-container worker. Lock-free.
    pub async fn execute(
        &self,
        sandbox: &Sandbox,
        agent_id: &str,
        tool: &str,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.client.execute(sandbox, agent_id, tool, args).await
    }

    /// Tear down one sandbox. Idempotent: a container that is already gone
    /// is not an error.
    pub async fn destroy(&self, sandbox: &Sandbox) -> Result<()> {
        let mut sandboxes = self.sandboxes.lock().await;
        sandboxes.remove(&sandbox.scan_id);
        self.remove_container(&sandbox.container_id).await
    }

    /// Tear down every container created by this runtime. Used on all exit
    /// paths, including cancellation.
    pub async fn destroy_all(&self) -> Result<()> {
        let drained: Vec<Sandbox> = {
            let mut sandboxes = self.sandboxes.lock().await;
            sandboxes.drain().map(|(_, sandbox)| sandbox).collect()
        };
        for sandbox in drained {
            if let Err(error) = self.remove_container(&sandbox.container_id).await {
                warn!(container = %sandbox.container_id, %error, "Failed to destroy sandbox");
            }
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: Some(5),
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 304,
                ..
            }) => {}
            Err(error) => warn!(%error, container_id, "Failed to stop container"),
        }

        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

fn find_available_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Host portion of the tool-server URL. A TCP `DOCKER_HOST` points at a
/// remote daemon; everything else is loopback.
fn resolve_docker_host(docker_host: Option<&str>) -> String {
    let Some(docker_host) = docker_host else {
        return "127.0.0.1".to_string();
    };
    match reqwest::Url::parse(docker_host) {
        Ok(url) if matches!(url.scheme(), "tcp" | "http" | "https") => url
            .host_str()
            .map(ToString::to_string)
            .unwrap_or_else(|| "127.0.0.1".to_string()),
        _ => "127.0.0.1".to_string(),
    }
}
