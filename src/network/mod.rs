//! Network Isolation Manager, per spec.md §4.2.
//!
//! Owns Network records and the in-memory subnet counter exclusively, per
//! §3's ownership rules. Naming and subnet allocation are pure functions
//! (tested directly); CRUD operations are async and go through
//! `ContainerRuntime` + `RelationalStore`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::instrument;

use crate::container_runtime::{ContainerRuntime, NetworkCreateRequest};
use crate::db::RelationalStore;
use crate::error::NetworkError;
use crate::events::ControlPlaneEvents;
use crate::models::{NetworkInfo, NetworkStats};

const NETWORK_LABEL: &str = "runnerhub.network";
const REPOSITORY_LABEL: &str = "runnerhub.repository";
const CREATED_LABEL: &str = "runnerhub.created";
const TYPE_LABEL: &str = "runnerhub.type";

/// Normalizes a repository name for use in a Docker network name: lowercase,
/// non-`[a-z0-9-]` replaced with `-`, runs collapsed, leading/trailing `-`
/// trimmed. Idempotent by construction (re-running it on its own output is a
/// no-op), which is asserted directly in the tests below and required by
/// spec.md §8.
pub fn normalize(repository: &str) -> String {
    let lower = repository.to_lowercase();
    let mut collapsed = String::with_capacity(lower.len());
    let mut last_was_dash = false;
    for c in lower.chars() {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if mapped == '-' {
            if last_was_dash {
                continue;
            }
            last_was_dash = true;
        } else {
            last_was_dash = false;
        }
        collapsed.push(mapped);
    }
    collapsed.trim_matches('-').to_string()
}

fn hash8(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Derives the stable Docker network name for a repository: `<prefix>-<normalized>-<hash8>`.
pub fn network_name(prefix: &str, repository: &str) -> String {
    let normalized = normalize(repository);
    format!("{prefix}-{normalized}-{}", hash8(&normalized))
}

fn subnet_for(base_octet: u8, k: u32) -> (String, String) {
    let third_octet = base_octet as u32 + (k % 236);
    let subnet = format!("172.{third_octet}.0.0/24");
    let gateway = format!("172.{third_octet}.0.1");
    (subnet, gateway)
}

pub struct NetworkIsolationManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RelationalStore>,
    events: Arc<dyn ControlPlaneEvents>,
    prefix: String,
    base_octet: u8,
    max_idle: chrono::Duration,
    counter: AtomicU32,
    cache: RwLock<HashMap<String, NetworkInfo>>,
}

impl NetworkIsolationManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RelationalStore>,
        events: Arc<dyn ControlPlaneEvents>,
        prefix: impl Into<String>,
        base_octet: u8,
        max_idle_secs: i64,
    ) -> Self {
        Self {
            runtime,
            store,
            events,
            prefix: prefix.into(),
            base_octet,
            max_idle: chrono::Duration::seconds(max_idle_secs),
            counter: AtomicU32::new(0),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Loads existing system-owned networks from the container runtime and
    /// the durable store, then initializes the subnet counter beyond the
    /// maximum already in use — per §4.2's startup rescan, which also makes
    /// failover safe without persisting the counter (§9 Open Questions).
    #[instrument(skip(self))]
    pub async fn restore_from_runtime(&self) -> Result<(), NetworkError> {
        let runtime_networks = self.runtime.list_networks_by_label(NETWORK_LABEL).await?;
        let durable = self.store.list_networks().await?;
        let durable_by_repo: HashMap<_, _> = durable
            .into_iter()
            .map(|n| (n.repository.clone(), n))
            .collect();

        let mut max_k = 0i64;
        let mut cache = self.cache.write().await;
        for net in runtime_networks {
            let Some(repo) = net.labels.get(REPOSITORY_LABEL).cloned() else {
                continue;
            };
            let info = durable_by_repo.get(&repo).cloned().unwrap_or(NetworkInfo {
                id: net.id.clone(),
                name: net.name.clone(),
                repository: repo.clone(),
                subnet: String::new(),
                gateway: String::new(),
                driver: "bridge".to_string(),
                internal: true,
                containers: Default::default(),
                created: Utc::now(),
                last_used: Utc::now(),
            });

            if let Some(third_octet) = info
                .subnet
                .split('.')
                .nth(1)
                .and_then(|v| v.parse::<i64>().ok())
            {
                let k = third_octet - self.base_octet as i64;
                if k > max_k {
                    max_k = k;
                }
            }

            cache.insert(repo, info);
        }
        drop(cache);

        self.counter
            .store((max_k + 1).max(0) as u32, Ordering::SeqCst);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, repository: &str) -> Option<NetworkInfo> {
        self.cache.read().await.get(repository).cloned()
    }

    pub async fn list(&self) -> Vec<NetworkInfo> {
        self.cache.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> NetworkStats {
        let cache = self.cache.read().await;
        NetworkStats {
            total_networks: cache.len(),
            total_containers: cache.values().map(|n| n.containers.len()).sum(),
            repositories: cache.keys().cloned().collect(),
        }
    }

    #[instrument(skip(self), fields(repository = %repository))]
    pub async fn create_repository_network(
        &self,
        repository: &str,
    ) -> Result<NetworkInfo, NetworkError> {
        if let Some(existing) = self.cache.read().await.get(repository).cloned() {
            return Ok(existing);
        }

        let name = network_name(&self.prefix, repository);
        let k = self.counter.fetch_add(1, Ordering::SeqCst);
        let (subnet, gateway) = subnet_for(self.base_octet, k);

        let mut labels = HashMap::new();
        labels.insert(NETWORK_LABEL.to_string(), "true".to_string());
        labels.insert(REPOSITORY_LABEL.to_string(), repository.to_string());
        labels.insert(CREATED_LABEL.to_string(), Utc::now().to_rfc3339());
        labels.insert(TYPE_LABEL.to_string(), "isolated".to_string());

        let id = self
            .runtime
            .create_network(NetworkCreateRequest {
                name: name.clone(),
                subnet: subnet.clone(),
                gateway: gateway.clone(),
                labels,
            })
            .await?;

        let info = NetworkInfo {
            id,
            name,
            repository: repository.to_string(),
            subnet,
            gateway,
            driver: "bridge".to_string(),
            internal: true,
            containers: Default::default(),
            created: Utc::now(),
            last_used: Utc::now(),
        };

        self.store.upsert_network(&info).await?;
        self.cache
            .write()
            .await
            .insert(repository.to_string(), info.clone());

        tracing::info!(repository, network_id = %info.id, subnet = %info.subnet, "created repository network");
        self.events.network_created(repository).await;
        Ok(info)
    }

    #[instrument(skip(self), fields(repository = %repository, container_id = %container_id))]
    pub async fn attach_container(
        &self,
        container_id: &str,
        repository: &str,
        aliases: Option<Vec<String>>,
    ) -> Result<(), NetworkError> {
        let info = match self.cache.read().await.get(repository).cloned() {
            Some(info) => info,
            None => self.create_repository_network(repository).await?,
        };

        // Leave the default bridge so the repository network is the
        // container's only route; ignore "not connected" per §7.
        let _ = self
            .runtime
            .disconnect_network("bridge", container_id, false)
            .await;

        let short12: String = container_id.chars().take(12).collect();
        let alias = aliases
            .and_then(|a| a.into_iter().next())
            .unwrap_or_else(|| format!("runner-{short12}"));

        self.runtime
            .connect_network(&info.id, container_id, &alias)
            .await?;

        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get_mut(repository) {
            entry.containers.insert(container_id.to_string());
            entry.last_used = Utc::now();
            self.store.upsert_network(entry).await?;
        }

        tracing::info!(repository, container_id, alias = %alias, "attached container to repository network");
        self.events.container_attached(container_id).await;
        Ok(())
    }

    /// Best-effort: per §4.2, detach errors are logged per network but the
    /// overall operation succeeds as long as none are fatal.
    #[instrument(skip(self), fields(repository = %repository, container_id = %container_id))]
    pub async fn detach_container(&self, container_id: &str, repository: &str) {
        let network_id = {
            let cache = self.cache.read().await;
            cache.get(repository).map(|n| n.id.clone())
        };

        let Some(network_id) = network_id else {
            return;
        };

        if let Err(e) = self
            .runtime
            .disconnect_network(&network_id, container_id, true)
            .await
        {
            tracing::warn!(error = %e, repository, container_id, "detach failed, continuing");
        }

        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get_mut(repository) {
            entry.containers.remove(container_id);
            entry.last_used = Utc::now();
            let _ = self.store.upsert_network(entry).await;
        }
        drop(cache);
        self.events.container_detached(container_id).await;
    }

    #[instrument(skip(self), fields(repository = %repository, force = force))]
    pub async fn remove_repository_network(
        &self,
        repository: &str,
        force: bool,
    ) -> Result<(), NetworkError> {
        let info = self
            .cache
            .read()
            .await
            .get(repository)
            .cloned()
            .ok_or_else(|| NetworkError::NotFound(repository.to_string()))?;

        if !info.containers.is_empty() && !force {
            return Err(NetworkError::InUse(repository.to_string(), info.containers.len()));
        }

        self.runtime.remove_network(&info.id).await?;
        self.store.delete_network(repository).await?;
        self.cache.write().await.remove(repository);

        tracing::info!(repository, network_id = %info.id, "removed repository network");
        self.events.network_removed(repository).await;
        Ok(())
    }

    /// Per-network errors are logged and skipped; they never abort the sweep.
    #[instrument(skip(self))]
    pub async fn cleanup_unused_networks(&self) -> usize {
        let now = Utc::now();
        let candidates: Vec<String> = {
            let cache = self.cache.read().await;
            cache
                .iter()
                .filter(|(_, n)| n.containers.is_empty() && now - n.last_used > self.max_idle)
                .map(|(repo, _)| repo.clone())
                .collect()
        };

        let mut removed = 0;
        for repo in candidates {
            match self.remove_repository_network(&repo, false).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(error = %e, repository = %repo, "failed to reclaim idle network"),
            }
        }
        if removed > 0 {
            self.events.network_cleaned(removed).await;
        }
        removed
    }

    /// Two containers are isolated iff no network record shows both attached.
    pub async fn verify_isolation(&self, container_a: &str, container_b: &str) -> bool {
        let cache = self.cache.read().await;
        !cache
            .values()
            .any(|n| n.containers.contains(container_a) && n.containers.contains(container_b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container_runtime::fake::FakeContainerRuntime;
    use crate::db::tests_support::InMemoryStore;

    fn manager() -> NetworkIsolationManager {
        NetworkIsolationManager::new(
            Arc::new(FakeContainerRuntime::default()),
            Arc::new(InMemoryStore::default()),
            Arc::new(crate::events::NoopEvents),
            "runnerhub",
            20,
            3600,
        )
    }

    #[test]
    fn normalize_is_idempotent() {
        let cases = ["Org/Repo.Name", "--weird__chars--", "already-normal"];
        for c in cases {
            let once = normalize(c);
            let twice = normalize(&once);
            assert_eq!(once, twice, "normalize not idempotent for {c:?}");
        }
    }

    #[test]
    fn normalize_collapses_and_trims() {
        assert_eq!(normalize("Org/Repo Name--"), "org-repo-name");
    }

    #[test]
    fn network_name_is_a_function_and_matches_pattern() {
        let a = network_name("runnerhub", "org/repo");
        let b = network_name("runnerhub", "org/repo");
        assert_eq!(a, b);

        let suffix = a.trim_start_matches("runnerhub-");
        let hash_part = &suffix[suffix.len() - 8..];
        assert!(hash_part.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash_part.len(), 8);
    }

    #[test]
    fn subnet_allocation_wraps_and_derives_gateway() {
        let (subnet, gateway) = subnet_for(20, 2);
        assert_eq!(subnet, "172.22.0.0/24");
        assert_eq!(gateway, "172.22.0.1");
    }

    #[tokio::test]
    async fn double_create_returns_same_network_no_duplicate() {
        let mgr = manager();
        let first = mgr.create_repository_network("org/repo").await.unwrap();
        let second = mgr.create_repository_network("org/repo").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(mgr.list().await.len(), 1);
    }

    #[tokio::test]
    async fn attach_then_detach_restores_empty_containers() {
        let mgr = manager();
        mgr.attach_container("c1", "org/repo", None).await.unwrap();
        assert_eq!(mgr.get("org/repo").await.unwrap().containers.len(), 1);

        mgr.detach_container("c1", "org/repo").await;
        assert!(mgr.get("org/repo").await.unwrap().containers.is_empty());
    }

    #[tokio::test]
    async fn removal_refused_while_containers_attached() {
        let mgr = manager();
        mgr.attach_container("c1", "org/repo", None).await.unwrap();

        let err = mgr.remove_repository_network("org/repo", false).await.unwrap_err();
        assert!(matches!(err, NetworkError::InUse(_, 1)));
    }

    #[tokio::test]
    async fn verify_isolation_detects_shared_network() {
        let mgr = manager();
        mgr.attach_container("c1", "org/repo-a", None).await.unwrap();
        mgr.attach_container("c2", "org/repo-a", None).await.unwrap();
        mgr.attach_container("c3", "org/repo-b", None).await.unwrap();

        assert!(!mgr.verify_isolation("c1", "c2").await);
        assert!(mgr.verify_isolation("c1", "c3").await);
    }
}
