//! External collaborators consumed through narrow traits, never owned
//! directly by the core subsystems.

use async_trait::async_trait;
use octocrab::Octocrab;
use tracing::instrument;

use crate::config::GitHubConfig;

/// Remote runner deregistration only — the one GitHub operation the core
/// itself needs, grounded directly in the teacher's `GitHub::delete_runner`.
#[async_trait]
pub trait GitHubRunnerApi: Send + Sync {
    async fn deregister_runner(&self, github_runner_id: i64) -> Result<(), octocrab::Error>;
}

pub struct OctocrabRunnerApi {
    org: String,
    client: Octocrab,
}

impl OctocrabRunnerApi {
    pub fn new(config: &GitHubConfig) -> octocrab::Result<Self> {
        let client = Octocrab::builder()
            .personal_token(config.token.clone())
            .build()?;
        Ok(Self {
            org: config.org.clone(),
            client,
        })
    }
}

#[async_trait]
impl GitHubRunnerApi for OctocrabRunnerApi {
    #[instrument(skip(self), fields(org = %self.org, github_runner_id))]
    async fn deregister_runner(&self, github_runner_id: i64) -> Result<(), octocrab::Error> {
        match self
            .client
            .actions()
            .delete_org_runner(&self.org, octocrab::models::RunnerId(github_runner_id as u64))
            .await
        {
            Ok(_) => {
                tracing::info!("deregistered github runner");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to deregister github runner, continuing");
                Err(e)
            }
        }
    }
}

/// Wildcard-pool (`*`) worker lifecycle, used only by the Pool Manager's
/// scale-up/down for the default proxy-runner fleet.
#[async_trait]
pub trait ProxyRunnerManager: Send + Sync {
    async fn spawn_proxy(&self, labels: &[String]) -> Result<String, anyhow::Error>;
    async fn terminate_proxy(&self, proxy_id: &str) -> Result<(), anyhow::Error>;
}

/// No-op implementation for deployments that run no wildcard pool: proxy
/// runner fleets are provisioned by a separate system this crate never
/// drives directly.
pub struct NullProxyRunnerManager;

#[async_trait]
impl ProxyRunnerManager for NullProxyRunnerManager {
    async fn spawn_proxy(&self, _labels: &[String]) -> Result<String, anyhow::Error> {
        Err(anyhow::anyhow!(
            "no proxy-runner manager configured for the wildcard pool"
        ))
    }

    async fn terminate_proxy(&self, _proxy_id: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn record(&self, action: &str, details: &str);
}

pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn record(&self, action: &str, details: &str) {
        tracing::info!(target: "audit", action, details, "audit event");
    }
}

#[async_trait]
pub trait MetricsRecorder: Send + Sync {
    async fn record_gauge(&self, name: &str, value: f64);
    async fn record_counter(&self, name: &str, delta: u64);
}

pub struct TracingMetricsRecorder;

#[async_trait]
impl MetricsRecorder for TracingMetricsRecorder {
    async fn record_gauge(&self, name: &str, value: f64) {
        tracing::debug!(target: "metrics", metric = name, value, "gauge");
    }

    async fn record_counter(&self, name: &str, delta: u64) {
        tracing::debug!(target: "metrics", metric = name, delta, "counter");
    }
}

/// Archives the last N lines of a container's logs, used by the Cleanup
/// Engine's `archive_logs` action.
#[async_trait]
pub trait LogArchiver: Send + Sync {
    async fn archive(&self, container_id: &str, container_name: &str, logs: &str) -> Result<(), anyhow::Error>;
}

pub struct DatabaseLogArchiver {
    store: std::sync::Arc<dyn crate::db::RelationalStore>,
}

impl DatabaseLogArchiver {
    pub fn new(store: std::sync::Arc<dyn crate::db::RelationalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LogArchiver for DatabaseLogArchiver {
    async fn archive(&self, container_id: &str, container_name: &str, logs: &str) -> Result<(), anyhow::Error> {
        self.store
            .archive_log(container_id, container_name, logs)
            .await
            .map_err(anyhow::Error::from)
    }
}
