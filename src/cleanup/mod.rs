//! Container Cleanup Engine.
//!
//! Owns Policy records; never writes runner rows directly — it only calls
//! into a `RunnerRemovalCapability` handed to it at composition, keeping the
//! dependency on the Pool Manager one-way instead of a back pointer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::instrument;

use crate::collaborators::{AuditLogger, LogArchiver, MetricsRecorder};
use crate::container_runtime::ContainerRuntime;
use crate::db::RelationalStore;
use crate::error::CleanupError;
use crate::events::ControlPlaneEvents;
use crate::models::{
    CleanupAction, CleanupDetail, CleanupPolicy, CleanupResult, ContainerState, ContainerView,
    PolicyActions, PolicyConditions, PolicyType,
};
use crate::network::NetworkIsolationManager;

/// Disk reclaimed per removal is a coarse constant — auditable, not
/// accurate. Replace with a real measurement if the container runtime ever
/// exposes one cheaply.
const DISK_RECLAIMED_PER_REMOVAL_BYTES: u64 = 100 * 1024 * 1024;

/// One-way capability the Pool Manager hands to the Cleanup Engine at
/// composition, instead of the engine holding a back-reference to the pool
/// manager itself.
#[async_trait]
pub trait RunnerRemovalCapability: Send + Sync {
    async fn null_container_id(&self, runner_id_by_container: &str);
}

pub struct CleanupEngine {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RelationalStore>,
    network: Arc<NetworkIsolationManager>,
    runner_removal: Arc<dyn RunnerRemovalCapability>,
    events: Arc<dyn ControlPlaneEvents>,
    log_archiver: Arc<dyn LogArchiver>,
    audit: Arc<dyn AuditLogger>,
    metrics: Arc<dyn MetricsRecorder>,
    policies: RwLock<HashMap<String, CleanupPolicy>>,
    is_running: AtomicBool,
    last_result: RwLock<Option<CleanupResult>>,
    history: RwLock<Vec<CleanupResult>>,
}

impl CleanupEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RelationalStore>,
        network: Arc<NetworkIsolationManager>,
        runner_removal: Arc<dyn RunnerRemovalCapability>,
        events: Arc<dyn ControlPlaneEvents>,
        log_archiver: Arc<dyn LogArchiver>,
        audit: Arc<dyn AuditLogger>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            runtime,
            store,
            network,
            runner_removal,
            events,
            log_archiver,
            audit,
            metrics,
            policies: RwLock::new(default_policies()),
            is_running: AtomicBool::new(false),
            last_result: RwLock::new(None),
            history: RwLock::new(Vec::new()),
        }
    }

    pub async fn get_policies(&self) -> Vec<CleanupPolicy> {
        self.policies.read().await.values().cloned().collect()
    }

    pub async fn update_policy(
        &self,
        id: &str,
        patch: impl FnOnce(&mut CleanupPolicy),
    ) -> Result<CleanupPolicy, CleanupError> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .get_mut(id)
            .ok_or_else(|| CleanupError::UnknownPolicy(id.to_string()))?;
        patch(policy);
        self.events.policy_updated(id).await;
        Ok(policy.clone())
    }

    pub async fn last_result(&self) -> Option<CleanupResult> {
        self.last_result.read().await.clone()
    }

    pub async fn get_history(&self, hours: i64) -> Vec<CleanupResult> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        self.history
            .read()
            .await
            .iter()
            .filter(|r| r.timestamp.map(|t| t >= cutoff).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Manual trigger; same semantics as the scheduled sweep.
    pub async fn trigger_cleanup(&self) -> Result<CleanupResult, CleanupError> {
        self.run_cleanup().await
    }

    /// Runs a single sweep. Concurrent entry is refused with a reentrancy
    /// guard that returns the prior result instead of erroring the caller
    /// out entirely.
    #[instrument(skip(self))]
    pub async fn run_cleanup(&self) -> Result<CleanupResult, CleanupError> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return self
                .last_result()
                .await
                .ok_or(CleanupError::AlreadyRunning);
        }

        let result = self.sweep().await;
        self.is_running.store(false, Ordering::SeqCst);

        match &result {
            Ok(r) => {
                *self.last_result.write().await = Some(r.clone());
                self.history.write().await.push(r.clone());
                if let Err(e) = self.store.insert_cleanup_history(r).await {
                    tracing::warn!(error = %e, "failed to persist cleanup history row");
                }
                self.events.cleanup_completed(r).await;
                self.audit
                    .record(
                        "cleanup.sweep",
                        &format!(
                            "inspected={} cleaned={} errors={}",
                            r.containers_inspected, r.containers_cleaned, r.errors
                        ),
                    )
                    .await;
                self.metrics
                    .record_counter("cleanup.containers_cleaned", r.containers_cleaned as u64)
                    .await;
                self.metrics
                    .record_gauge("cleanup.last_sweep_errors", r.errors as f64)
                    .await;
            }
            Err(e) => tracing::error!(error = %e, "cleanup sweep failed"),
        }

        result
    }

    async fn sweep(&self) -> Result<CleanupResult, CleanupError> {
        let now = Utc::now();
        let enabled_policies: Vec<CleanupPolicy> = self
            .policies
            .read()
            .await
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();

        let runners = self.store.list_all_runners().await?;

        let mut inspected = 0usize;
        let mut details = Vec::new();
        let mut errors = 0usize;
        let mut removed_containers: std::collections::HashSet<String> = Default::default();

        for runner in &runners {
            let Some(container_id) = &runner.container_id else {
                continue;
            };

            let view = match self.runtime.inspect_container(container_id).await {
                Ok(Some(view)) => view,
                Ok(None) => continue,
                Err(e) => {
                    errors += 1;
                    tracing::warn!(error = %e, container_id, "failed to inspect container during sweep");
                    continue;
                }
            };
            inspected += 1;

            for policy in &enabled_policies {
                if removed_containers.contains(container_id) {
                    details.push(CleanupDetail {
                        container_id: container_id.clone(),
                        policy_id: policy.id.clone(),
                        action: CleanupAction::Skipped,
                        reason: "already removed by an earlier policy this sweep".to_string(),
                    });
                    continue;
                }

                if !matches(policy, &view, now) {
                    continue;
                }

                match self
                    .apply_actions(policy, &view, runner.id.as_str())
                    .await
                {
                    Ok(action) => {
                        if action == CleanupAction::Removed {
                            removed_containers.insert(container_id.clone());
                        }
                        details.push(CleanupDetail {
                            container_id: container_id.clone(),
                            policy_id: policy.id.clone(),
                            action,
                            reason: reason_for(policy.policy_type),
                        });
                    }
                    Err(e) => {
                        errors += 1;
                        tracing::warn!(error = %e, container_id, policy = %policy.id, "cleanup action failed");
                        details.push(CleanupDetail {
                            container_id: container_id.clone(),
                            policy_id: policy.id.clone(),
                            action: CleanupAction::Skipped,
                            reason: e.to_string(),
                        });
                    }
                }

                // Only an actual removal retires the container for the rest
                // of the sweep; a stop-only or failed policy still lets
                // later matching policies run against it this round.
            }
        }

        let cleaned = removed_containers.len();
        let disk_reclaimed = cleaned as u64 * DISK_RECLAIMED_PER_REMOVAL_BYTES;

        {
            let mut policies = self.policies.write().await;
            for policy in policies.values_mut() {
                if !policy.enabled {
                    continue;
                }
                let policy_cleaned = details
                    .iter()
                    .filter(|d| d.policy_id == policy.id && d.action == CleanupAction::Removed)
                    .count() as u64;
                policy.statistics.containers_cleaned_total += policy_cleaned;
                policy.statistics.last_cleanup_count = policy_cleaned;
                policy.statistics.disk_space_reclaimed +=
                    policy_cleaned * DISK_RECLAIMED_PER_REMOVAL_BYTES;
                policy.last_run = Some(now);
            }
        }

        Ok(CleanupResult {
            timestamp: Some(now),
            policies_executed: enabled_policies.len(),
            containers_inspected: inspected,
            containers_cleaned: cleaned,
            errors,
            disk_space_reclaimed: disk_reclaimed,
            details,
        })
    }

    async fn apply_actions(
        &self,
        policy: &CleanupPolicy,
        view: &ContainerView,
        runner_id: &str,
    ) -> Result<CleanupAction, CleanupError> {
        let actions = &policy.actions;

        if actions.archive_logs && view.state == ContainerState::Running {
            match self.runtime.container_logs(&view.id, 1000).await {
                Ok(logs) => {
                    if let Err(e) = self.log_archiver.archive(&view.id, &view.name, &logs).await {
                        tracing::warn!(error = %e, container_id = %view.id, "failed to persist archived logs");
                    }
                }
                Err(e) => tracing::warn!(error = %e, container_id = %view.id, "failed to fetch logs for archival"),
            }
        }

        let mut action = CleanupAction::Skipped;

        if actions.stop_container && view.state == ContainerState::Running {
            self.runtime.stop_container(&view.id).await?;
            action = CleanupAction::Stopped;
        }

        if actions.remove_container {
            if let Some(repo) = &view.repository {
                self.network.detach_container(&view.id, repo).await;
            }
            self.runtime.remove_container(&view.id).await?;
            self.runner_removal.null_container_id(runner_id).await;
            action = CleanupAction::Removed;
        }

        if actions.notify_on_cleanup {
            self.events.container_cleaned(&view.id).await;
        }

        Ok(action)
    }
}

fn matches(policy: &CleanupPolicy, view: &ContainerView, now: DateTime<Utc>) -> bool {
    let PolicyConditions {
        idle_minutes,
        max_lifetime_hours,
    } = policy.conditions;

    match policy.policy_type {
        PolicyType::Idle => {
            view.state == ContainerState::Running
                && view.job_id.is_none()
                && view
                    .started
                    .is_some_and(|s| now - s > chrono::Duration::seconds(idle_minutes * 60))
        }
        PolicyType::Failed => {
            view.state == ContainerState::Stopped
                && view.exit_code.is_some_and(|c| c != 0)
                && view
                    .finished
                    .is_some_and(|f| now - f > chrono::Duration::seconds(idle_minutes * 60))
        }
        PolicyType::Orphaned => {
            view.runner_id.is_none()
                && view.job_id.is_none()
                && now - view.created > chrono::Duration::seconds(idle_minutes * 60)
        }
        PolicyType::Expired => now - view.created > chrono::Duration::hours(max_lifetime_hours),
    }
}

fn reason_for(policy_type: PolicyType) -> String {
    match policy_type {
        PolicyType::Idle => "idle beyond threshold".to_string(),
        PolicyType::Failed => "failed and past grace period".to_string(),
        PolicyType::Orphaned => "orphaned beyond threshold".to_string(),
        PolicyType::Expired => "exceeded maximum lifetime".to_string(),
    }
}

fn default_policies() -> HashMap<String, CleanupPolicy> {
    let mut policies = HashMap::new();

    policies.insert(
        "idle".to_string(),
        CleanupPolicy {
            id: "idle".to_string(),
            name: "Idle runner reclamation".to_string(),
            enabled: true,
            policy_type: PolicyType::Idle,
            conditions: PolicyConditions {
                idle_minutes: 30,
                max_lifetime_hours: 24,
            },
            actions: PolicyActions::default(),
            statistics: Default::default(),
            last_run: None,
        },
    );
    policies.insert(
        "failed".to_string(),
        CleanupPolicy {
            id: "failed".to_string(),
            name: "Failed container reclamation".to_string(),
            enabled: true,
            policy_type: PolicyType::Failed,
            conditions: PolicyConditions {
                idle_minutes: 10,
                max_lifetime_hours: 24,
            },
            actions: PolicyActions::default(),
            statistics: Default::default(),
            last_run: None,
        },
    );
    policies.insert(
        "orphaned".to_string(),
        CleanupPolicy {
            id: "orphaned".to_string(),
            name: "Orphaned container reclamation".to_string(),
            enabled: true,
            policy_type: PolicyType::Orphaned,
            conditions: PolicyConditions {
                idle_minutes: 60,
                max_lifetime_hours: 24,
            },
            actions: PolicyActions::default(),
            statistics: Default::default(),
            last_run: None,
        },
    );
    policies.insert(
        "expired".to_string(),
        CleanupPolicy {
            id: "expired".to_string(),
            name: "Maximum lifetime enforcement".to_string(),
            enabled: true,
            policy_type: PolicyType::Expired,
            conditions: PolicyConditions {
                idle_minutes: 30,
                max_lifetime_hours: 24,
            },
            actions: PolicyActions::default(),
            statistics: Default::default(),
            last_run: None,
        },
    );

    policies
}

/// Runs `run_cleanup()` on `sweep_interval`, with the first run delayed by
/// `initial_delay` after start. Only spawned on the elected leader.
pub async fn run_sweep_loop(
    engine: Arc<CleanupEngine>,
    initial_delay: std::time::Duration,
    sweep_interval: std::time::Duration,
) {
    tokio::time::sleep(initial_delay).await;
    loop {
        if let Err(e) = engine.run_cleanup().await {
            tracing::error!(error = %e, "scheduled cleanup sweep failed");
        }
        tokio::time::sleep(sweep_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container_runtime::fake::FakeContainerRuntime;
    use crate::db::tests_support::InMemoryStore;
    use crate::events::NoopEvents;
    use crate::models::{ContainerState, ContainerView};

    struct NullRemovalCapability;

    #[async_trait]
    impl RunnerRemovalCapability for NullRemovalCapability {
        async fn null_container_id(&self, _runner_id: &str) {}
    }

    fn engine() -> (CleanupEngine, Arc<FakeContainerRuntime>) {
        let runtime = Arc::new(FakeContainerRuntime::default());
        let store = Arc::new(InMemoryStore::default());
        let network = Arc::new(NetworkIsolationManager::new(
            runtime.clone(),
            store.clone(),
            Arc::new(NoopEvents),
            "runnerhub",
            20,
            3600,
        ));
        let engine = CleanupEngine::new(
            runtime.clone(),
            store.clone(),
            network,
            Arc::new(NullRemovalCapability),
            Arc::new(NoopEvents),
            Arc::new(crate::collaborators::DatabaseLogArchiver::new(store)),
            Arc::new(crate::collaborators::TracingAuditLogger),
            Arc::new(crate::collaborators::TracingMetricsRecorder),
        );
        (engine, runtime)
    }

    #[tokio::test]
    async fn empty_sweep_reports_zero_and_still_records_history() {
        let (engine, _runtime) = engine();
        let result = engine.run_cleanup().await.unwrap();
        assert_eq!(result.containers_cleaned, 0);
        assert_eq!(result.containers_inspected, 0);
    }

    #[tokio::test]
    async fn idle_container_past_threshold_is_removed() {
        let (engine, runtime) = engine();
        runtime.insert_container(ContainerView {
            id: "c1".to_string(),
            name: "c1".to_string(),
            state: ContainerState::Running,
            exit_code: None,
            created: Utc::now() - chrono::Duration::minutes(40),
            started: Some(Utc::now() - chrono::Duration::minutes(31)),
            finished: None,
            runner_id: Some("r1".to_string()),
            job_id: None,
            repository: Some("org/repo".to_string()),
        });

        engine.store.insert_runner(&test_runner("r1", Some("c1"))).await.unwrap();

        let result = engine.run_cleanup().await.unwrap();
        assert_eq!(result.containers_cleaned, 1);
        assert_eq!(result.details[0].action, CleanupAction::Removed);
        assert!(runtime.containers.lock().unwrap().get("c1").is_none());
    }

    #[tokio::test]
    async fn non_removing_policy_still_lets_a_second_matching_policy_run() {
        let (engine, runtime) = engine();
        runtime.insert_container(ContainerView {
            id: "c1".to_string(),
            name: "c1".to_string(),
            state: ContainerState::Running,
            exit_code: None,
            created: Utc::now() - chrono::Duration::minutes(90),
            started: Some(Utc::now() - chrono::Duration::minutes(31)),
            finished: None,
            runner_id: None,
            job_id: None,
            repository: Some("org/repo".to_string()),
        });
        engine.store.insert_runner(&test_runner("r1", Some("c1"))).await.unwrap();

        // Patched to stop-only: this container also matches `idle`
        // (running, no job, past the 30-minute threshold) as well as
        // `orphaned` (no runner/job id, past the 60-minute threshold). A
        // stop-only policy matching first must not stop the sweep from
        // also evaluating the other, still-default (remove-on-match) policy
        // against the same container.
        engine
            .update_policy("idle", |p| p.actions.remove_container = false)
            .await
            .unwrap();

        let result = engine.run_cleanup().await.unwrap();

        assert_eq!(result.containers_cleaned, 1, "exactly one policy actually removes the container");
        assert_eq!(result.details.len(), 2, "both matching policies must be evaluated, not just the first");
        assert!(
            result
                .details
                .iter()
                .any(|d| d.policy_id == "idle"),
            "the stop-only policy must still have been given a turn"
        );
        assert!(
            result
                .details
                .iter()
                .any(|d| d.policy_id == "orphaned" && d.action == CleanupAction::Removed),
            "the still-default policy must be the one that actually removes the container"
        );
    }

    #[tokio::test]
    async fn concurrent_entry_returns_prior_result() {
        let (engine, _runtime) = engine();
        let first = engine.run_cleanup().await.unwrap();
        engine.is_running.store(true, Ordering::SeqCst);
        let second = engine.run_cleanup().await.unwrap();
        engine.is_running.store(false, Ordering::SeqCst);
        assert_eq!(first.containers_cleaned, second.containers_cleaned);
    }

    fn test_runner(id: &str, container_id: Option<&str>) -> crate::models::Runner {
        crate::models::Runner {
            id: id.to_string(),
            name: id.to_string(),
            runner_type: crate::models::RunnerType::Ephemeral,
            status: crate::models::RunnerStatus::Busy,
            repository: "org/repo".to_string(),
            labels: sqlx::types::Json(vec![]),
            github_runner_id: None,
            current_job_id: None,
            container_id: container_id.map(|s| s.to_string()),
            last_heartbeat: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
