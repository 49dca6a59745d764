//! Relational store wiring. A single `sqlx::PgPool` sits at the bottom, but
//! the four subsystems only ever see typed methods on `RelationalStore` so
//! none of them hand-roll SQL at their call sites — the same split a
//! sqlx-backed server package draws between its pool and its
//! repository-style query modules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::StoreError;
use crate::models::{
    NetworkInfo, Pool, Runner, RunnerStatus, RunnerType, WILDCARD_REPOSITORY,
};

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn get_pool(&self, repository: &str) -> Result<Option<Pool>, StoreError>;
    async fn upsert_pool(&self, pool: &Pool) -> Result<(), StoreError>;
    async fn list_pools(&self) -> Result<Vec<Pool>, StoreError>;
    async fn set_pool_current_runners(
        &self,
        repository: &str,
        current_runners: i32,
    ) -> Result<(), StoreError>;
    async fn touch_pool_scaled(&self, repository: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn insert_runner(&self, runner: &Runner) -> Result<(), StoreError>;
    async fn get_runner(&self, id: &str) -> Result<Option<Runner>, StoreError>;
    async fn list_runners_for_repository(&self, repository: &str) -> Result<Vec<Runner>, StoreError>;
    async fn list_all_runners(&self) -> Result<Vec<Runner>, StoreError>;
    async fn count_runners(&self, repository: &str) -> Result<PoolCounts, StoreError>;
    /// Atomically flips an IDLE runner for `repository` to BUSY. Returns `None`
    /// if no IDLE runner was available (lost the race or none exist) — the
    /// `UPDATE ... WHERE status = 'IDLE' RETURNING *` pattern that makes the
    /// database the final arbiter over which replica wins a race for the
    /// same runner.
    async fn claim_idle_runner(&self, repository: &str) -> Result<Option<Runner>, StoreError>;
    async fn set_runner_status(
        &self,
        id: &str,
        status: RunnerStatus,
        current_job_id: Option<&str>,
    ) -> Result<bool, StoreError>;
    async fn set_runner_container(&self, id: &str, container_id: Option<&str>) -> Result<bool, StoreError>;
    async fn delete_runner(&self, id: &str) -> Result<bool, StoreError>;
    async fn delete_offline_runners_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
    async fn list_idle_runners_older_than(
        &self,
        repository: &str,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Runner>, StoreError>;

    async fn upsert_network(&self, network: &NetworkInfo) -> Result<(), StoreError>;
    async fn delete_network(&self, repository: &str) -> Result<(), StoreError>;
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, StoreError>;

    async fn archive_log(
        &self,
        container_id: &str,
        container_name: &str,
        logs: &str,
    ) -> Result<(), StoreError>;

    async fn insert_cleanup_history(&self, result: &crate::models::CleanupResult) -> Result<(), StoreError>;
}

pub struct PoolCounts {
    /// Non-offline rows for the repository. Used internally for the §3
    /// `current_runners` cache and the scaling invariant (`total ≤
    /// max_runners` after `scale_up` excludes rows already reaped by
    /// `cleanup_offline_runners`).
    pub total: i64,
    pub active: i64,
    pub idle: i64,
    /// All rows for the repository regardless of status — the `total` the
    /// Pool Manager's public metrics contract documents in §4.4.
    pub all: i64,
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn runner_type_str(t: RunnerType) -> &'static str {
    match t {
        RunnerType::Ephemeral => "EPHEMERAL",
        RunnerType::Proxy => "PROXY",
    }
}

fn runner_status_str(s: RunnerStatus) -> &'static str {
    match s {
        RunnerStatus::Idle => "IDLE",
        RunnerStatus::Busy => "BUSY",
        RunnerStatus::Offline => "OFFLINE",
    }
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn get_pool(&self, repository: &str) -> Result<Option<Pool>, StoreError> {
        let row = sqlx::query_as::<_, Pool>(
            "SELECT repository, min_runners, max_runners, scale_increment, scale_threshold, \
             current_runners, last_scaled_at FROM runnerhub.runner_pools WHERE repository = $1",
        )
        .bind(repository)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_pool(&self, pool: &Pool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO runnerhub.runner_pools \
             (repository, min_runners, max_runners, scale_increment, scale_threshold, current_runners, last_scaled_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (repository) DO UPDATE SET \
             min_runners = EXCLUDED.min_runners, max_runners = EXCLUDED.max_runners, \
             scale_increment = EXCLUDED.scale_increment, scale_threshold = EXCLUDED.scale_threshold, \
             current_runners = EXCLUDED.current_runners, last_scaled_at = EXCLUDED.last_scaled_at",
        )
        .bind(&pool.repository)
        .bind(pool.min_runners)
        .bind(pool.max_runners)
        .bind(pool.scale_increment)
        .bind(pool.scale_threshold)
        .bind(pool.current_runners)
        .bind(pool.last_scaled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<Pool>, StoreError> {
        let rows = sqlx::query_as::<_, Pool>(
            "SELECT repository, min_runners, max_runners, scale_increment, scale_threshold, \
             current_runners, last_scaled_at FROM runnerhub.runner_pools",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_pool_current_runners(
        &self,
        repository: &str,
        current_runners: i32,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE runnerhub.runner_pools SET current_runners = $2 WHERE repository = $1")
            .bind(repository)
            .bind(current_runners)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_pool_scaled(&self, repository: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE runnerhub.runner_pools SET last_scaled_at = $2 WHERE repository = $1")
            .bind(repository)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_runner(&self, runner: &Runner) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO runnerhub.runners \
             (id, name, type, status, repository, labels, github_runner_id, current_job_id, \
              container_id, last_heartbeat, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&runner.id)
        .bind(&runner.name)
        .bind(runner_type_str(runner.runner_type))
        .bind(runner_status_str(runner.status))
        .bind(&runner.repository)
        .bind(&runner.labels)
        .bind(runner.github_runner_id)
        .bind(&runner.current_job_id)
        .bind(&runner.container_id)
        .bind(runner.last_heartbeat)
        .bind(runner.created_at)
        .bind(runner.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_runner(&self, id: &str) -> Result<Option<Runner>, StoreError> {
        let row = sqlx::query_as::<_, Runner>(
            "SELECT id, name, type, status, repository, labels, github_runner_id, current_job_id, \
             container_id, last_heartbeat, created_at, updated_at FROM runnerhub.runners WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_runners_for_repository(&self, repository: &str) -> Result<Vec<Runner>, StoreError> {
        let rows = sqlx::query_as::<_, Runner>(
            "SELECT id, name, type, status, repository, labels, github_runner_id, current_job_id, \
             container_id, last_heartbeat, created_at, updated_at FROM runnerhub.runners WHERE repository = $1",
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_all_runners(&self) -> Result<Vec<Runner>, StoreError> {
        let rows = sqlx::query_as::<_, Runner>(
            "SELECT id, name, type, status, repository, labels, github_runner_id, current_job_id, \
             container_id, last_heartbeat, created_at, updated_at FROM runnerhub.runners",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_runners(&self, repository: &str) -> Result<PoolCounts, StoreError> {
        let row = sqlx::query(
            "SELECT \
               count(*) FILTER (WHERE status <> 'OFFLINE') AS total, \
               count(*) FILTER (WHERE status = 'BUSY') AS active, \
               count(*) FILTER (WHERE status = 'IDLE') AS idle, \
               count(*) AS all_rows \
             FROM runnerhub.runners WHERE repository = $1",
        )
        .bind(repository)
        .fetch_one(&self.pool)
        .await?;

        Ok(PoolCounts {
            total: row.try_get::<i64, _>("total")?,
            active: row.try_get::<i64, _>("active")?,
            idle: row.try_get::<i64, _>("idle")?,
            all: row.try_get::<i64, _>("all_rows")?,
        })
    }

    async fn claim_idle_runner(&self, repository: &str) -> Result<Option<Runner>, StoreError> {
        let row = sqlx::query_as::<_, Runner>(
            "UPDATE runnerhub.runners SET status = 'BUSY', updated_at = now() \
             WHERE id = ( \
               SELECT id FROM runnerhub.runners \
               WHERE repository = $1 AND status = 'IDLE' \
               ORDER BY created_at ASC \
               LIMIT 1 \
               FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, name, type, status, repository, labels, github_runner_id, current_job_id, \
                       container_id, last_heartbeat, created_at, updated_at",
        )
        .bind(repository)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_runner_status(
        &self,
        id: &str,
        status: RunnerStatus,
        current_job_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE runnerhub.runners SET status = $2, current_job_id = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(runner_status_str(status))
        .bind(current_job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_runner_container(&self, id: &str, container_id: Option<&str>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE runnerhub.runners SET container_id = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(container_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_runner(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM runnerhub.runners WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_offline_runners_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM runnerhub.runners WHERE status = 'OFFLINE' AND last_heartbeat < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_idle_runners_older_than(
        &self,
        repository: &str,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Runner>, StoreError> {
        let rows = sqlx::query_as::<_, Runner>(
            "SELECT id, name, type, status, repository, labels, github_runner_id, current_job_id, \
             container_id, last_heartbeat, created_at, updated_at FROM runnerhub.runners \
             WHERE repository = $1 AND status = 'IDLE' AND type = 'EPHEMERAL' AND last_heartbeat < $2 \
             ORDER BY last_heartbeat ASC LIMIT $3",
        )
        .bind(repository)
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_network(&self, network: &NetworkInfo) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO runnerhub.network_isolation \
             (network_id, name, repository, subnet, gateway, driver, internal, created_at, last_used) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (network_id) DO UPDATE SET \
             last_used = EXCLUDED.last_used",
        )
        .bind(&network.id)
        .bind(&network.name)
        .bind(&network.repository)
        .bind(&network.subnet)
        .bind(&network.gateway)
        .bind(&network.driver)
        .bind(network.internal)
        .bind(network.created)
        .bind(network.last_used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_network(&self, repository: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM runnerhub.network_isolation WHERE repository = $1")
            .bind(repository)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, StoreError> {
        let rows = sqlx::query(
            "SELECT network_id, name, repository, subnet, gateway, driver, internal, created_at, last_used \
             FROM runnerhub.network_isolation",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(NetworkInfo {
                    id: row.try_get("network_id")?,
                    name: row.try_get("name")?,
                    repository: row.try_get("repository")?,
                    subnet: row.try_get("subnet")?,
                    gateway: row.try_get("gateway")?,
                    driver: row.try_get("driver")?,
                    internal: row.try_get("internal")?,
                    containers: Default::default(),
                    created: row.try_get("created_at")?,
                    last_used: row.try_get("last_used")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn archive_log(
        &self,
        container_id: &str,
        container_name: &str,
        logs: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO runnerhub.archived_logs (container_id, container_name, logs) VALUES ($1, $2, $3)",
        )
        .bind(container_id)
        .bind(container_name)
        .bind(logs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_cleanup_history(&self, result: &crate::models::CleanupResult) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO runnerhub.cleanup_history \
             (policies_executed, containers_inspected, containers_cleaned, errors, disk_space_reclaimed) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(result.policies_executed as i32)
        .bind(result.containers_inspected as i32)
        .bind(result.containers_cleaned as i32)
        .bind(result.errors as i32)
        .bind(result.disk_space_reclaimed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Ensures the wildcard pool row exists with sane bounds; called once at startup.
pub async fn ensure_wildcard_pool(
    store: &dyn RelationalStore,
    defaults: &crate::config::PoolDefaults,
) -> Result<(), StoreError> {
    if store.get_pool(WILDCARD_REPOSITORY).await?.is_none() {
        store
            .upsert_pool(&Pool {
                repository: WILDCARD_REPOSITORY.to_string(),
                min_runners: defaults.min_runners,
                max_runners: defaults.max_runners,
                scale_increment: defaults.scale_increment,
                scale_threshold: defaults.scale_threshold,
                current_runners: 0,
                last_scaled_at: None,
            })
            .await?;
    }
    Ok(())
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::models::CleanupResult;
    use std::collections::HashMap as Map;
    use std::sync::Mutex;

    /// Hand-rolled in-memory `RelationalStore` fake shared across the pool,
    /// network and cleanup subsystems' unit tests.
    #[derive(Default)]
    pub struct InMemoryStore {
        pools: Mutex<Map<String, Pool>>,
        runners: Mutex<Map<String, Runner>>,
        networks: Mutex<Map<String, NetworkInfo>>,
        archived_logs: Mutex<Vec<(String, String, String)>>,
        cleanup_history: Mutex<Vec<CleanupResult>>,
    }

    #[async_trait]
    impl RelationalStore for InMemoryStore {
        async fn get_pool(&self, repository: &str) -> Result<Option<Pool>, StoreError> {
            Ok(self.pools.lock().unwrap().get(repository).cloned())
        }

        async fn upsert_pool(&self, pool: &Pool) -> Result<(), StoreError> {
            self.pools
                .lock()
                .unwrap()
                .insert(pool.repository.clone(), pool.clone());
            Ok(())
        }

        async fn list_pools(&self) -> Result<Vec<Pool>, StoreError> {
            Ok(self.pools.lock().unwrap().values().cloned().collect())
        }

        async fn set_pool_current_runners(
            &self,
            repository: &str,
            current_runners: i32,
        ) -> Result<(), StoreError> {
            if let Some(p) = self.pools.lock().unwrap().get_mut(repository) {
                p.current_runners = current_runners;
            }
            Ok(())
        }

        async fn touch_pool_scaled(&self, repository: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
            if let Some(p) = self.pools.lock().unwrap().get_mut(repository) {
                p.last_scaled_at = Some(at);
            }
            Ok(())
        }

        async fn insert_runner(&self, runner: &Runner) -> Result<(), StoreError> {
            self.runners
                .lock()
                .unwrap()
                .insert(runner.id.clone(), runner.clone());
            Ok(())
        }

        async fn get_runner(&self, id: &str) -> Result<Option<Runner>, StoreError> {
            Ok(self.runners.lock().unwrap().get(id).cloned())
        }

        async fn list_runners_for_repository(&self, repository: &str) -> Result<Vec<Runner>, StoreError> {
            Ok(self
                .runners
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.repository == repository)
                .cloned()
                .collect())
        }

        async fn list_all_runners(&self) -> Result<Vec<Runner>, StoreError> {
            Ok(self.runners.lock().unwrap().values().cloned().collect())
        }

        async fn count_runners(&self, repository: &str) -> Result<PoolCounts, StoreError> {
            let runners = self.runners.lock().unwrap();
            let for_repo: Vec<&Runner> = runners.values().filter(|r| r.repository == repository).collect();
            let total = for_repo
                .iter()
                .filter(|r| r.status != RunnerStatus::Offline)
                .count() as i64;
            let active = for_repo
                .iter()
                .filter(|r| r.status == RunnerStatus::Busy)
                .count() as i64;
            let idle = for_repo
                .iter()
                .filter(|r| r.status == RunnerStatus::Idle)
                .count() as i64;
            let all = for_repo.len() as i64;
            Ok(PoolCounts { total, active, idle, all })
        }

        async fn claim_idle_runner(&self, repository: &str) -> Result<Option<Runner>, StoreError> {
            let mut runners = self.runners.lock().unwrap();
            let mut candidate_ids: Vec<String> = runners
                .values()
                .filter(|r| r.repository == repository && r.status == RunnerStatus::Idle)
                .map(|r| r.id.clone())
                .collect();
            candidate_ids.sort();
            let Some(id) = candidate_ids.into_iter().next() else {
                return Ok(None);
            };
            let runner = runners.get_mut(&id).unwrap();
            runner.status = RunnerStatus::Busy;
            runner.updated_at = Utc::now();
            Ok(Some(runner.clone()))
        }

        async fn set_runner_status(
            &self,
            id: &str,
            status: RunnerStatus,
            current_job_id: Option<&str>,
        ) -> Result<bool, StoreError> {
            let mut runners = self.runners.lock().unwrap();
            match runners.get_mut(id) {
                Some(r) => {
                    r.status = status;
                    r.current_job_id = current_job_id.map(|s| s.to_string());
                    r.updated_at = Utc::now();
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn set_runner_container(&self, id: &str, container_id: Option<&str>) -> Result<bool, StoreError> {
            let mut runners = self.runners.lock().unwrap();
            match runners.get_mut(id) {
                Some(r) => {
                    r.container_id = container_id.map(|s| s.to_string());
                    r.updated_at = Utc::now();
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn delete_runner(&self, id: &str) -> Result<bool, StoreError> {
            Ok(self.runners.lock().unwrap().remove(id).is_some())
        }

        async fn delete_offline_runners_older_than(
            &self,
            older_than: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            let mut runners = self.runners.lock().unwrap();
            let before = runners.len();
            runners.retain(|_, r| !(r.status == RunnerStatus::Offline && r.last_heartbeat < older_than));
            Ok((before - runners.len()) as u64)
        }

        async fn list_idle_runners_older_than(
            &self,
            repository: &str,
            older_than: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<Runner>, StoreError> {
            let runners = self.runners.lock().unwrap();
            let mut matches: Vec<Runner> = runners
                .values()
                .filter(|r| {
                    r.repository == repository
                        && r.status == RunnerStatus::Idle
                        && r.runner_type == RunnerType::Ephemeral
                        && r.last_heartbeat < older_than
                })
                .cloned()
                .collect();
            matches.sort_by_key(|r| r.last_heartbeat);
            matches.truncate(limit.max(0) as usize);
            Ok(matches)
        }

        async fn upsert_network(&self, network: &NetworkInfo) -> Result<(), StoreError> {
            self.networks
                .lock()
                .unwrap()
                .insert(network.repository.clone(), network.clone());
            Ok(())
        }

        async fn delete_network(&self, repository: &str) -> Result<(), StoreError> {
            self.networks.lock().unwrap().remove(repository);
            Ok(())
        }

        async fn list_networks(&self) -> Result<Vec<NetworkInfo>, StoreError> {
            Ok(self.networks.lock().unwrap().values().cloned().collect())
        }

        async fn archive_log(
            &self,
            container_id: &str,
            container_name: &str,
            logs: &str,
        ) -> Result<(), StoreError> {
            self.archived_logs.lock().unwrap().push((
                container_id.to_string(),
                container_name.to_string(),
                logs.to_string(),
            ));
            Ok(())
        }

        async fn insert_cleanup_history(&self, result: &CleanupResult) -> Result<(), StoreError> {
            self.cleanup_history.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    impl InMemoryStore {
        pub fn seed_runner(&self, runner: Runner) {
            self.runners.lock().unwrap().insert(runner.id.clone(), runner);
        }

        pub fn cleanup_history_len(&self) -> usize {
            self.cleanup_history.lock().unwrap().len()
        }
    }
}
