//! Domain types shared across the pool, network, cleanup and leader subsystems.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The wildcard repository key used for the default proxy-runner pool.
pub const WILDCARD_REPOSITORY: &str = "*";

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Pool {
    pub repository: String,
    pub min_runners: i32,
    pub max_runners: i32,
    pub scale_increment: i32,
    pub scale_threshold: f64,
    pub current_runners: i32,
    pub last_scaled_at: Option<DateTime<Utc>>,
}

impl Pool {
    pub fn is_wildcard(&self) -> bool {
        self.repository == WILDCARD_REPOSITORY
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum RunnerType {
    Ephemeral,
    Proxy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum RunnerStatus {
    Idle,
    Busy,
    Offline,
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Runner {
    pub id: String,
    pub name: String,
    #[sqlx(rename = "type")]
    pub runner_type: RunnerType,
    pub status: RunnerStatus,
    pub repository: String,
    /// Stored as a JSON array column; see `RelationalStore` for the (de)serialization boundary.
    pub labels: sqlx::types::Json<Vec<String>>,
    pub github_runner_id: Option<i64>,
    pub current_job_id: Option<String>,
    pub container_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Runner {
    pub fn labels_set(&self) -> HashSet<String> {
        self.labels.0.iter().cloned().collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Other,
}

/// A read-only view of a container as surfaced by the container-lifecycle collaborator.
#[derive(Clone, Debug)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub runner_id: Option<String>,
    pub job_id: Option<String>,
    pub repository: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub repository: String,
    pub subnet: String,
    pub gateway: String,
    pub driver: String,
    pub internal: bool,
    pub containers: HashSet<String>,
    pub created: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    pub total_networks: usize,
    pub total_containers: usize,
    pub repositories: Vec<String>,
}

/// The value encoded into the coordination store's leader key.
///
/// Pinned schema per DESIGN.md: unknown fields are tolerated and ignored by
/// `#[serde(default)]`/optional fields rather than rejected outright.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderLockValue {
    pub node_id: String,
    pub timestamp: i64,
    pub pid: i32,
    #[serde(default)]
    pub renewal_count: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    Idle,
    Failed,
    Orphaned,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConditions {
    /// Minutes of idleness/age required before the policy matches.
    /// Interpreted per `PolicyType`: idle/failed/orphaned use this directly;
    /// expired uses `max_lifetime_hours` instead.
    pub idle_minutes: i64,
    pub max_lifetime_hours: i64,
}

impl Default for PolicyConditions {
    fn default() -> Self {
        Self {
            idle_minutes: 30,
            max_lifetime_hours: 24,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyActions {
    pub stop_container: bool,
    pub remove_container: bool,
    pub archive_logs: bool,
    pub notify_on_cleanup: bool,
}

impl Default for PolicyActions {
    fn default() -> Self {
        Self {
            stop_container: true,
            remove_container: true,
            archive_logs: false,
            notify_on_cleanup: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyStatistics {
    pub containers_cleaned_total: u64,
    pub last_cleanup_count: u64,
    pub disk_space_reclaimed: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupPolicy {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub policy_type: PolicyType,
    pub conditions: PolicyConditions,
    pub actions: PolicyActions,
    pub statistics: PolicyStatistics,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupAction {
    Removed,
    Stopped,
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupDetail {
    pub container_id: String,
    pub policy_id: String,
    pub action: CleanupAction,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CleanupResult {
    pub timestamp: Option<DateTime<Utc>>,
    pub policies_executed: usize,
    pub containers_inspected: usize,
    pub containers_cleaned: usize,
    pub errors: usize,
    pub disk_space_reclaimed: u64,
    pub details: Vec<CleanupDetail>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total: i64,
    pub active: i64,
    pub idle: i64,
    pub utilization: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub should_scale: bool,
    pub runners_to_add: i32,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerRequest {
    pub request_id: String,
    pub runner: Option<Runner>,
}
