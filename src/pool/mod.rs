//! Runner Pool Manager, per spec.md §4.4.
//!
//! Exclusively owns Pool rows and Runner rows (§3). Exposes a
//! `RunnerRemovalCapability` to the Cleanup Engine so that module can null
//! out a runner's `container_id` without holding a reference back into this
//! one (§9).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::cleanup::RunnerRemovalCapability;
use crate::collaborators::{AuditLogger, GitHubRunnerApi, MetricsRecorder, ProxyRunnerManager};
use crate::config::PoolDefaults;
use crate::db::RelationalStore;
use crate::error::PoolError;
use crate::events::ControlPlaneEvents;
use crate::models::{
    Pool, PoolMetrics, Runner, RunnerRequest, RunnerStatus, RunnerType, ScalingDecision,
};

pub struct RunnerPoolManager {
    store: Arc<dyn RelationalStore>,
    github: Arc<dyn GitHubRunnerApi>,
    proxy: Arc<dyn ProxyRunnerManager>,
    events: Arc<dyn ControlPlaneEvents>,
    audit: Arc<dyn AuditLogger>,
    metrics: Arc<dyn MetricsRecorder>,
    defaults: PoolDefaults,
    scaling_in_progress: Mutex<HashSet<String>>,
}

impl RunnerPoolManager {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        github: Arc<dyn GitHubRunnerApi>,
        proxy: Arc<dyn ProxyRunnerManager>,
        events: Arc<dyn ControlPlaneEvents>,
        audit: Arc<dyn AuditLogger>,
        metrics: Arc<dyn MetricsRecorder>,
        defaults: PoolDefaults,
    ) -> Self {
        Self {
            store,
            github,
            proxy,
            events,
            audit,
            metrics,
            defaults,
            scaling_in_progress: Mutex::new(HashSet::new()),
        }
    }

    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn get_or_create_pool(&self, repository: &str) -> Result<Pool, PoolError> {
        if let Some(pool) = self.store.get_pool(repository).await? {
            return Ok(pool);
        }

        let pool = Pool {
            repository: repository.to_string(),
            min_runners: self.defaults.min_runners,
            max_runners: self.defaults.max_runners,
            scale_increment: self.defaults.scale_increment,
            scale_threshold: self.defaults.scale_threshold,
            current_runners: 0,
            last_scaled_at: None,
        };

        if pool.min_runners > pool.max_runners {
            return Err(PoolError::InvalidBounds {
                min: pool.min_runners,
                max: pool.max_runners,
            });
        }

        self.store.upsert_pool(&pool).await?;
        Ok(pool)
    }

    /// `total` here is all rows for the repository per §4.4's "Metrics
    /// semantics", not the non-offline count the scaling invariant uses
    /// internally (see `PoolCounts::total` in `db.rs`).
    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn get_pool_metrics(&self, repository: &str) -> Result<PoolMetrics, PoolError> {
        let counts = self.store.count_runners(repository).await?;
        let utilization = if counts.all == 0 {
            0.0
        } else {
            counts.active as f64 / counts.all as f64
        };

        self.metrics
            .record_gauge(&format!("pool.utilization.{repository}"), utilization)
            .await;

        Ok(PoolMetrics {
            total: counts.all,
            active: counts.active,
            idle: counts.idle,
            utilization,
        })
    }

    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn check_scaling(&self, repository: &str) -> Result<ScalingDecision, PoolError> {
        let pool = self.get_or_create_pool(repository).await?;
        let metrics = self.get_pool_metrics(repository).await?;

        if metrics.total >= pool.max_runners as i64 {
            return Ok(ScalingDecision {
                should_scale: false,
                runners_to_add: 0,
                reason: "Already at maximum capacity".to_string(),
            });
        }

        if metrics.utilization >= pool.scale_threshold {
            let headroom = pool.max_runners as i64 - metrics.total;
            let to_add = (pool.scale_increment as i64).min(headroom).max(0) as i32;
            return Ok(ScalingDecision {
                should_scale: true,
                runners_to_add: to_add,
                reason: format!(
                    "{:.0}% exceeds threshold {:.0}%",
                    metrics.utilization * 100.0,
                    pool.scale_threshold * 100.0
                ),
            });
        }

        Ok(ScalingDecision {
            should_scale: false,
            runners_to_add: 0,
            reason: "utilization below threshold".to_string(),
        })
    }

    /// Guards same-repository concurrent scale-up with an in-memory set per
    /// §4.4/§5. Inserts `n` EPHEMERAL runner rows for a concrete repository,
    /// or spawns `n` proxy runners for the wildcard pool.
    #[instrument(skip(self), fields(repository = %repository, n))]
    pub async fn scale_up(&self, repository: &str, n: i32) -> Result<Vec<Runner>, PoolError> {
        if n <= 0 {
            return Ok(Vec::new());
        }

        {
            let mut in_progress = self.scaling_in_progress.lock().await;
            if in_progress.contains(repository) {
                return Err(PoolError::ScalingInProgress(repository.to_string()));
            }
            in_progress.insert(repository.to_string());
        }

        let result = self.scale_up_inner(repository, n).await;

        self.scaling_in_progress
            .lock()
            .await
            .remove(repository);

        result
    }

    async fn scale_up_inner(&self, repository: &str, n: i32) -> Result<Vec<Runner>, PoolError> {
        let pool = self.get_or_create_pool(repository).await?;
        let counts = self.store.count_runners(repository).await?;
        // Clamp here too, not just in `check_scaling`'s recommendation: the
        // invariant in spec.md §8 ("total ≤ max_runners after scale_up
        // completes") must hold regardless of what a caller asks for.
        let headroom = (pool.max_runners as i64 - counts.total).max(0);
        let n = (n as i64).min(headroom) as i32;

        let mut created = Vec::with_capacity(n.max(0) as usize);
        let now = Utc::now();

        for _ in 0..n {
            let runner = if pool.is_wildcard() {
                let proxy_id = self
                    .proxy
                    .spawn_proxy(&[])
                    .await
                    .map_err(|e| PoolError::Collaborator(e.to_string()))?;

                Runner {
                    id: Uuid::new_v4().to_string(),
                    name: format!("proxy-{proxy_id}"),
                    runner_type: RunnerType::Proxy,
                    status: RunnerStatus::Idle,
                    repository: repository.to_string(),
                    labels: sqlx::types::Json(vec![]),
                    github_runner_id: None,
                    current_job_id: None,
                    container_id: Some(proxy_id),
                    last_heartbeat: now,
                    created_at: now,
                    updated_at: now,
                }
            } else {
                Runner {
                    id: Uuid::new_v4().to_string(),
                    name: format!("gha-{}", &Uuid::new_v4().to_string()[..8]),
                    runner_type: RunnerType::Ephemeral,
                    status: RunnerStatus::Idle,
                    repository: repository.to_string(),
                    labels: sqlx::types::Json(vec![]),
                    github_runner_id: None,
                    current_job_id: None,
                    container_id: None,
                    last_heartbeat: now,
                    created_at: now,
                    updated_at: now,
                }
            };

            self.store.insert_runner(&runner).await?;
            created.push(runner);
        }

        let counts = self.store.count_runners(repository).await?;
        self.store
            .set_pool_current_runners(repository, counts.total as i32)
            .await?;
        self.store.touch_pool_scaled(repository, now).await?;

        tracing::info!(repository, created = created.len(), "scaled up pool");
        self.audit
            .record(
                "pool.scale_up",
                &format!("repository={repository} created={}", created.len()),
            )
            .await;
        Ok(created)
    }

    /// Never reduces `total` below `min_runners`; selects IDLE EPHEMERAL rows
    /// whose `last_heartbeat` exceeds `idle_timeout`, per §4.4.
    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn scale_down(&self, repository: &str) -> Result<usize, PoolError> {
        let pool = self.get_or_create_pool(repository).await?;
        let counts = self.store.count_runners(repository).await?;

        let budget = counts.total - pool.min_runners as i64;
        if budget <= 0 {
            return Ok(0);
        }

        let older_than = Utc::now() - chrono::Duration::seconds(self.defaults.idle_timeout_secs);
        let candidates = self
            .store
            .list_idle_runners_older_than(repository, older_than, budget)
            .await?;

        let mut removed = 0;
        for runner in candidates {
            if self.remove_runner(&runner.id).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            let counts = self.store.count_runners(repository).await?;
            self.store
                .set_pool_current_runners(repository, counts.total as i32)
                .await?;
            self.audit
                .record("pool.scale_down", &format!("repository={repository} removed={removed}"))
                .await;
        }

        Ok(removed)
    }

    /// Ensures IDLE/BUSY counts never fall below `min_runners` for every pool
    /// — the monitoring loop's complement to `scale_down`, per §4.4.
    #[instrument(skip(self, pool), fields(repository = %pool.repository))]
    pub async fn ensure_minimum_runners(&self, pool: &Pool) -> Result<usize, PoolError> {
        let counts = self.store.count_runners(&pool.repository).await?;
        let deficit = pool.min_runners as i64 - counts.total;
        if deficit <= 0 {
            return Ok(0);
        }
        let created = self
            .scale_up(&pool.repository, deficit as i32)
            .await?
            .len();
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn cleanup_offline_runners(&self) -> Result<u64, PoolError> {
        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        Ok(self.store.delete_offline_runners_older_than(cutoff).await?)
    }

    /// Finds an active IDLE runner and atomically flips it to BUSY; otherwise
    /// evaluates `check_scaling` and triggers a scale-up, returning only a
    /// request id for the (soon to exist) runner, per §4.4.
    #[instrument(skip(self, labels), fields(repository = %repository))]
    pub async fn request_runner(
        &self,
        repository: &str,
        labels: &[String],
    ) -> Result<RunnerRequest, PoolError> {
        let _ = labels; // label-based matching is a later refinement; scope per §4.4.
        self.get_or_create_pool(repository).await?;

        if let Some(runner) = self.store.claim_idle_runner(repository).await? {
            return Ok(RunnerRequest {
                request_id: Uuid::new_v4().to_string(),
                runner: Some(runner),
            });
        }

        let decision = self.check_scaling(repository).await?;
        if decision.should_scale {
            let to_add = decision.runners_to_add.max(1);
            if let Err(e) = self.scale_up(repository, to_add).await {
                tracing::warn!(error = %e, repository, "scale-up triggered by request_runner failed");
            }
        }

        Ok(RunnerRequest {
            request_id: Uuid::new_v4().to_string(),
            runner: None,
        })
    }

    /// Flips a runner back to IDLE and clears `current_job_id`; opportunistically
    /// scales down if more than one IDLE runner remains for the repository.
    #[instrument(skip(self), fields(runner_id = %runner_id))]
    pub async fn release_runner(&self, runner_id: &str) -> Result<(), PoolError> {
        let runner = self
            .store
            .get_runner(runner_id)
            .await?
            .ok_or_else(|| PoolError::RunnerNotFound(runner_id.to_string()))?;

        self.store
            .set_runner_status(runner_id, RunnerStatus::Idle, None)
            .await?;

        let counts = self.store.count_runners(&runner.repository).await?;
        if counts.idle > 1 {
            if let Err(e) = self.scale_down(&runner.repository).await {
                tracing::warn!(error = %e, repository = %runner.repository, "opportunistic scale-down failed");
            }
        }

        Ok(())
    }

    /// Deletes a runner row. For a PROXY row, terminates its proxy worker
    /// first; for an EPHEMERAL row, deregisters it from GitHub first. Both
    /// are best effort — collaborator failure never blocks the row
    /// deletion, per §7.
    #[instrument(skip(self), fields(runner_id = %runner_id))]
    pub async fn remove_runner(&self, runner_id: &str) -> Result<(), PoolError> {
        let runner = self
            .store
            .get_runner(runner_id)
            .await?
            .ok_or_else(|| PoolError::RunnerNotFound(runner_id.to_string()))?;

        match runner.runner_type {
            RunnerType::Proxy => {
                if let Some(proxy_id) = &runner.container_id {
                    if let Err(e) = self.proxy.terminate_proxy(proxy_id).await {
                        tracing::warn!(error = %e, runner_id, proxy_id, "proxy termination failed, continuing");
                    }
                }
            }
            RunnerType::Ephemeral => {
                if let Some(github_id) = runner.github_runner_id {
                    if let Err(e) = self.github.deregister_runner(github_id).await {
                        tracing::warn!(error = %e, runner_id, "github deregistration failed, continuing");
                    }
                }
            }
        }

        let deleted = self.store.delete_runner(runner_id).await?;
        if !deleted {
            return Err(PoolError::RunnerNotFound(runner_id.to_string()));
        }

        self.events.health_updated().await;
        Ok(())
    }

    pub async fn list_pools(&self) -> Result<Vec<Pool>, PoolError> {
        Ok(self.store.list_pools().await?)
    }

    /// The leader-only monitoring loop: scale-up/down, enforce minimums, and
    /// reap long-offline rows, every `interval` (default 30s per §4.4/§5).
    pub async fn run_monitoring_loop(self: Arc<Self>, interval: std::time::Duration) {
        loop {
            tokio::time::sleep(interval).await;

            let pools = match self.list_pools().await {
                Ok(pools) => pools,
                Err(e) => {
                    tracing::error!(error = %e, "failed to list pools in monitoring loop");
                    continue;
                }
            };

            for pool in &pools {
                match self.check_scaling(&pool.repository).await {
                    Ok(decision) if decision.should_scale => {
                        if let Err(e) = self.scale_up(&pool.repository, decision.runners_to_add).await {
                            tracing::warn!(error = %e, repository = %pool.repository, "monitoring loop scale-up failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, repository = %pool.repository, "check_scaling failed"),
                }

                if let Err(e) = self.scale_down(&pool.repository).await {
                    tracing::warn!(error = %e, repository = %pool.repository, "scale_down failed");
                }

                if let Err(e) = self.ensure_minimum_runners(pool).await {
                    tracing::warn!(error = %e, repository = %pool.repository, "ensure_minimum_runners failed");
                }
            }

            if let Err(e) = self.cleanup_offline_runners().await {
                tracing::warn!(error = %e, "cleanup_offline_runners failed");
            }
        }
    }
}

#[async_trait]
impl RunnerRemovalCapability for RunnerPoolManager {
    async fn null_container_id(&self, runner_id: &str) {
        if let Err(e) = self.store.set_runner_container(runner_id, None).await {
            tracing::warn!(error = %e, runner_id, "failed to null container_id");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NullProxyRunnerManager, TracingAuditLogger, TracingMetricsRecorder};
    use crate::db::tests_support::InMemoryStore;
    use crate::events::NoopEvents;

    struct FakeGitHub;

    #[async_trait]
    impl GitHubRunnerApi for FakeGitHub {
        async fn deregister_runner(&self, _github_runner_id: i64) -> Result<(), octocrab::Error> {
            Ok(())
        }
    }

    fn manager(defaults: PoolDefaults) -> (RunnerPoolManager, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::default());
        let manager = RunnerPoolManager::new(
            store.clone(),
            Arc::new(FakeGitHub),
            Arc::new(NullProxyRunnerManager),
            Arc::new(NoopEvents),
            Arc::new(TracingAuditLogger),
            Arc::new(TracingMetricsRecorder),
            defaults,
        );
        (manager, store)
    }

    fn busy_runner(repository: &str, idx: usize) -> Runner {
        let now = Utc::now();
        Runner {
            id: format!("r{idx}"),
            name: format!("r{idx}"),
            runner_type: RunnerType::Ephemeral,
            status: RunnerStatus::Busy,
            repository: repository.to_string(),
            labels: sqlx::types::Json(vec![]),
            github_runner_id: None,
            current_job_id: Some("job".to_string()),
            container_id: None,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn scale_up_on_saturation_matches_scenario_1() {
        let (manager, store) = manager(PoolDefaults {
            min_runners: 1,
            max_runners: 10,
            scale_increment: 5,
            scale_threshold: 0.8,
            idle_timeout_secs: 600,
            monitor_interval_secs: 30,
        });
        manager.get_or_create_pool("org/repo").await.unwrap();
        for i in 0..5 {
            store.seed_runner(busy_runner("org/repo", i));
        }

        let decision = manager.check_scaling("org/repo").await.unwrap();
        assert!(decision.should_scale);
        assert_eq!(decision.runners_to_add, 5);
        assert!(decision.reason.contains("100% exceeds threshold 80%"));
    }

    #[tokio::test]
    async fn at_maximum_refuses_to_scale_matches_scenario_2() {
        let (manager, store) = manager(PoolDefaults {
            min_runners: 1,
            max_runners: 10,
            scale_increment: 5,
            scale_threshold: 0.8,
            idle_timeout_secs: 600,
            monitor_interval_secs: 30,
        });
        manager.get_or_create_pool("org/repo").await.unwrap();
        for i in 0..10 {
            store.seed_runner(busy_runner("org/repo", i));
        }

        let decision = manager.check_scaling("org/repo").await.unwrap();
        assert!(!decision.should_scale);
        assert_eq!(decision.reason, "Already at maximum capacity");
    }

    #[tokio::test]
    async fn request_runner_assigns_idle_runner_matches_scenario_6() {
        let (manager, store) = manager(PoolDefaults::default());
        manager.get_or_create_pool("org/repo").await.unwrap();

        let now = Utc::now();
        store.seed_runner(Runner {
            id: "x".to_string(),
            name: "x".to_string(),
            runner_type: RunnerType::Ephemeral,
            status: RunnerStatus::Idle,
            repository: "org/repo".to_string(),
            labels: sqlx::types::Json(vec![]),
            github_runner_id: None,
            current_job_id: None,
            container_id: None,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        });

        let response = manager.request_runner("org/repo", &[]).await.unwrap();
        let runner = response.runner.expect("expected an assigned runner");
        assert_eq!(runner.id, "x");
        assert_eq!(runner.status, RunnerStatus::Busy);

        let stored = store.get_runner("x").await.unwrap().unwrap();
        assert_eq!(stored.status, RunnerStatus::Busy);
    }

    #[tokio::test]
    async fn scale_up_never_exceeds_max() {
        let (manager, _store) = manager(PoolDefaults {
            min_runners: 0,
            max_runners: 3,
            scale_increment: 10,
            scale_threshold: 0.8,
            idle_timeout_secs: 600,
            monitor_interval_secs: 30,
        });
        manager.get_or_create_pool("org/repo").await.unwrap();
        let created = manager.scale_up("org/repo", 10).await.unwrap();
        assert_eq!(created.len(), 3, "scale_up clamps to max_runners regardless of requested n");

        let metrics = manager.get_pool_metrics("org/repo").await.unwrap();
        assert_eq!(metrics.total, 3);
    }

    #[tokio::test]
    async fn scale_down_never_drops_below_min() {
        let (manager, store) = manager(PoolDefaults {
            min_runners: 2,
            max_runners: 10,
            scale_increment: 1,
            scale_threshold: 0.8,
            idle_timeout_secs: 0,
            monitor_interval_secs: 30,
        });
        manager.get_or_create_pool("org/repo").await.unwrap();

        let stale = Utc::now() - chrono::Duration::seconds(3600);
        for i in 0..4 {
            let mut runner = busy_runner("org/repo", i);
            runner.status = RunnerStatus::Idle;
            runner.last_heartbeat = stale;
            store.seed_runner(runner);
        }

        let removed = manager.scale_down("org/repo").await.unwrap();
        assert_eq!(removed, 2);

        let metrics = manager.get_pool_metrics("org/repo").await.unwrap();
        assert_eq!(metrics.total, 2);
    }

    #[tokio::test]
    async fn double_remove_runner_is_not_found_second_time() {
        let (manager, store) = manager(PoolDefaults::default());
        store.seed_runner(busy_runner("org/repo", 1));

        manager.remove_runner("r1").await.unwrap();
        let err = manager.remove_runner("r1").await.unwrap_err();
        assert!(matches!(err, PoolError::RunnerNotFound(_)));
    }
}
