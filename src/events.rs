//! Narrow event surface: typed channels rather than an in-process emitter
//! singleton. Subsystems depend on `Arc<dyn ControlPlaneEvents>`,
//! constructed once at the composition root.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::models::CleanupResult;

#[derive(Clone, Debug)]
pub enum ControlPlaneEvent {
    NetworkCreated { repository: String },
    NetworkRemoved { repository: String },
    NetworkCleaned { count: usize },
    ContainerAttached { container_id: String },
    ContainerDetached { container_id: String },
    ContainerCleaned { container_id: String },
    CleanupCompleted { cleaned: usize },
    PolicyUpdated { policy_id: String },
    HealthUpdated,
}

#[async_trait]
pub trait ControlPlaneEvents: Send + Sync {
    async fn network_created(&self, _repository: &str) {}
    async fn network_removed(&self, _repository: &str) {}
    async fn network_cleaned(&self, _count: usize) {}
    async fn container_attached(&self, _container_id: &str) {}
    async fn container_detached(&self, _container_id: &str) {}
    async fn container_cleaned(&self, _container_id: &str) {}
    async fn cleanup_completed(&self, _result: &CleanupResult) {}
    async fn policy_updated(&self, _policy_id: &str) {}
    async fn health_updated(&self) {}
}

pub struct NoopEvents;

#[async_trait]
impl ControlPlaneEvents for NoopEvents {}

/// Drains onto a broadcast channel, the pattern used where a caller wants to
/// observe events as a stream instead of implementing the trait directly.
pub struct BroadcastEvents {
    sender: broadcast::Sender<ControlPlaneEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlPlaneEvent> {
        self.sender.subscribe()
    }

    fn emit(&self, event: ControlPlaneEvent) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl ControlPlaneEvents for BroadcastEvents {
    async fn network_created(&self, repository: &str) {
        self.emit(ControlPlaneEvent::NetworkCreated {
            repository: repository.to_string(),
        });
    }

    async fn network_removed(&self, repository: &str) {
        self.emit(ControlPlaneEvent::NetworkRemoved {
            repository: repository.to_string(),
        });
    }

    async fn network_cleaned(&self, count: usize) {
        self.emit(ControlPlaneEvent::NetworkCleaned { count });
    }

    async fn container_attached(&self, container_id: &str) {
        self.emit(ControlPlaneEvent::ContainerAttached {
            container_id: container_id.to_string(),
        });
    }

    async fn container_detached(&self, container_id: &str) {
        self.emit(ControlPlaneEvent::ContainerDetached {
            container_id: container_id.to_string(),
        });
    }

    async fn container_cleaned(&self, container_id: &str) {
        self.emit(ControlPlaneEvent::ContainerCleaned {
            container_id: container_id.to_string(),
        });
    }

    async fn cleanup_completed(&self, result: &CleanupResult) {
        self.emit(ControlPlaneEvent::CleanupCompleted {
            cleaned: result.containers_cleaned,
        });
    }

    async fn policy_updated(&self, policy_id: &str) {
        self.emit(ControlPlaneEvent::PolicyUpdated {
            policy_id: policy_id.to_string(),
        });
    }

    async fn health_updated(&self) {
        self.emit(ControlPlaneEvent::HealthUpdated);
    }
}
