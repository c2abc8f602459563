//! Service container orchestration for workflow jobs.
//!
//! Each workflow job with services gets a dedicated network
//! (`orcaops-wf-<workflow_id>-<job_name>`); service containers attach to
//! it with their alias, are health-gated before the job starts, and are
//! torn down with the network after the job reaches a terminal state.
//! Teardown errors are logged and never alter the job's status.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::backend::{with_retries, BackendError, ContainerBackend, CreateOptions};
use crate::error::{OrcaError, Result};
use crate::workflow_schema::ServiceDefinition;

/// Wall-clock bound for one service to become healthy.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Initial backoff between health probes; doubles per attempt.
const HEALTH_BACKOFF: Duration = Duration::from_millis(250);

/// Handle to the services started for one workflow job.
#[derive(Debug, Clone)]
pub struct StartedServices {
    pub network: String,
    /// alias -> container id
    pub containers: HashMap<String, String>,
    /// `{ALIAS}_HOST` / `{ALIAS}_PORT` injections for the job.
    pub env: HashMap<String, String>,
}

/// Starts and tears down service containers through the backend.
pub struct ServiceManager {
    backend: Arc<dyn ContainerBackend>,
}

impl ServiceManager {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self { backend }
    }

    /// Network name for a workflow job's services.
    pub fn network_name(workflow_id: &str, job_name: &str) -> String {
        format!("orcaops-wf-{}-{}", workflow_id, job_name)
    }

    /// Start every service, gate on health, and return the handle. On any
    /// failure the partial set is torn down before the error surfaces.
    pub async fn start(
        &self,
        workflow_id: &str,
        job_name: &str,
        services: &BTreeMap<String, ServiceDefinition>,
    ) -> Result<StartedServices> {
        let network = Self::network_name(workflow_id, job_name);
        self.backend
            .create_network(&network)
            .await
            .map_err(OrcaError::Backend)?;

        let mut started = StartedServices {
            network: network.clone(),
            containers: HashMap::new(),
            env: HashMap::new(),
        };

        for (alias, definition) in services {
            match self.start_one(workflow_id, job_name, alias, definition, &network).await {
                Ok(container_id) => {
                    let container_name = service_container_name(workflow_id, job_name, alias);
                    let prefix = env_prefix(alias);
                    started.env.insert(format!("{}_HOST", prefix), container_name);
                    if let Some(port) = definition.port {
                        started.env.insert(format!("{}_PORT", prefix), port.to_string());
                    }
                    started.containers.insert(alias.clone(), container_id);
                }
                Err(e) => {
                    warn!(alias, error = %e, "service startup failed, tearing down");
                    self.stop(&started).await;
                    return Err(e);
                }
            }
        }

        for (alias, definition) in services {
            let Some(container_id) = started.containers.get(alias) else {
                continue;
            };
            if let Err(e) = self.wait_healthy(container_id, alias, definition).await {
                warn!(alias, error = %e, "service failed its health gate, tearing down");
                self.stop(&started).await;
                return Err(e);
            }
        }

        info!(network = %started.network, services = started.containers.len(), "services ready");
        Ok(started)
    }

    async fn start_one(
        &self,
        workflow_id: &str,
        job_name: &str,
        alias: &str,
        definition: &ServiceDefinition,
        network: &str,
    ) -> Result<String> {
        with_retries("service pull", || self.backend.pull(&definition.image)).await?;

        let mut labels = HashMap::new();
        labels.insert("orcaops.workflow_id".to_string(), workflow_id.to_string());
        labels.insert("orcaops.service".to_string(), alias.to_string());

        let opts = CreateOptions {
            image: definition.image.clone(),
            command: Vec::new(),
            env: definition.env.clone(),
            name: Some(service_container_name(workflow_id, job_name, alias)),
            network: None,
            security_opts: Vec::new(),
            cpu_limit: None,
            memory_limit_mb: None,
            labels,
        };
        let container_id = with_retries("service create", || self.backend.create(&opts)).await?;

        self.backend
            .connect(
                &container_id,
                network,
                &[
                    alias.to_string(),
                    service_container_name(workflow_id, job_name, alias),
                ],
            )
            .await?;
        self.backend.start(&container_id).await?;
        Ok(container_id)
    }

    /// Exponential-backoff probe until the health command passes, the port
    /// answers, or the wall-clock bound expires. Services without either
    /// gate count as healthy once running.
    async fn wait_healthy(
        &self,
        container_id: &str,
        alias: &str,
        definition: &ServiceDefinition,
    ) -> Result<()> {
        let probe: String = match (&definition.health_check, definition.port) {
            (Some(command), _) => command.clone(),
            (None, Some(port)) => format!("nc -z 127.0.0.1 {}", port),
            (None, None) => return Ok(()),
        };

        let deadline = Instant::now() + HEALTH_TIMEOUT;
        let mut backoff = HEALTH_BACKOFF;
        let mut last_failure = String::new();

        loop {
            match self
                .backend
                .exec(
                    container_id,
                    &["/bin/sh".to_string(), "-c".to_string(), probe.clone()],
                )
                .await
            {
                Ok(out) if out.exit_code == 0 => {
                    info!(alias, "service healthy");
                    return Ok(());
                }
                Ok(out) => {
                    last_failure = format!("exit {}: {}", out.exit_code, out.stderr.trim());
                }
                Err(e) => last_failure = e.to_string(),
            }

            if Instant::now() + backoff > deadline {
                return Err(OrcaError::Backend(BackendError::Other(format!(
                    "service '{}' failed health gate within {:?}: {}",
                    alias, HEALTH_TIMEOUT, last_failure
                ))));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    /// Remove all service containers, then the network. Best-effort.
    pub async fn stop(&self, services: &StartedServices) {
        for (alias, container_id) in &services.containers {
            if let Err(e) = self.backend.remove(container_id, true).await {
                warn!(alias, error = %e, "failed to remove service container");
            }
        }
        if let Err(e) = self.backend.remove_network(&services.network).await {
            warn!(network = %services.network, error = %e, "failed to remove service network");
        }
    }
}

fn service_container_name(workflow_id: &str, job_name: &str, alias: &str) -> String {
    format!("orcaops-wf-{}-{}-{}", workflow_id, job_name, alias)
}

/// `postgres-main` -> `POSTGRES_MAIN`
fn env_prefix(alias: &str) -> String {
    alias
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
