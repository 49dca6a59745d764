//! Container-lifecycle collaborator. The core subsystems depend only on
//! `ContainerRuntime` — never on `bollard` directly — so the Cleanup Engine
//! can hold Pool Manager capabilities and Network Isolation capabilities
//! without a single concrete infrastructure dependency leaking into their
//! signatures.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{LogsOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions,
};
use bollard::secret::{EndpointSettings, Ipam, IpamConfig};
use chrono::{DateTime, Utc};
use futures::StreamExt;

use crate::models::{ContainerState, ContainerView};

#[derive(Clone, Debug)]
pub struct NetworkCreateRequest {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct RuntimeNetwork {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), bollard::errors::Error>;

    async fn list_networks_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<RuntimeNetwork>, bollard::errors::Error>;

    async fn create_network(&self, req: NetworkCreateRequest) -> Result<String, bollard::errors::Error>;

    async fn remove_network(&self, network_id: &str) -> Result<(), bollard::errors::Error>;

    async fn connect_network(
        &self,
        network_id: &str,
        container_id: &str,
        alias: &str,
    ) -> Result<(), bollard::errors::Error>;

    /// Disconnecting a container that is not attached is treated as success
    /// at this layer — a container not being on a network is the desired end state.
    async fn disconnect_network(
        &self,
        network_id: &str,
        container_id: &str,
        force: bool,
    ) -> Result<(), bollard::errors::Error>;

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerView>, bollard::errors::Error>;

    async fn stop_container(&self, id: &str) -> Result<(), bollard::errors::Error>;

    async fn remove_container(&self, id: &str) -> Result<(), bollard::errors::Error>;

    async fn container_logs(&self, id: &str, tail_lines: usize) -> Result<String, bollard::errors::Error>;
}

pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    pub fn connect(socket_path: Option<&str>) -> Result<Self, bollard::errors::Error> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_socket_defaults()?,
        };
        Ok(Self { docker })
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn ping(&self) -> Result<(), bollard::errors::Error> {
        self.docker.ping().await.map(|_| ())
    }

    async fn list_networks_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<RuntimeNetwork>, bollard::errors::Error> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;

        Ok(networks
            .into_iter()
            .filter_map(|n| {
                Some(RuntimeNetwork {
                    id: n.id?,
                    name: n.name.unwrap_or_default(),
                    labels: n.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn create_network(&self, req: NetworkCreateRequest) -> Result<String, bollard::errors::Error> {
        let ipam = Ipam {
            driver: Some("default".to_string()),
            config: Some(vec![IpamConfig {
                subnet: Some(req.subnet),
                gateway: Some(req.gateway),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let mut options = HashMap::new();
        options.insert(
            "com.docker.network.bridge.enable_icc".to_string(),
            "true".to_string(),
        );
        options.insert(
            "com.docker.network.bridge.enable_ip_masquerade".to_string(),
            "false".to_string(),
        );

        let response = self
            .docker
            .create_network(CreateNetworkOptions {
                name: req.name,
                driver: "bridge".to_string(),
                internal: true,
                attachable: true,
                enable_ipv6: Some(false),
                ipam,
                options,
                labels: req.labels,
                ..Default::default()
            })
            .await?;

        Ok(response.id.unwrap_or_else(|| {
            tracing::error!("docker network create returned no id");
            uuid::Uuid::new_v4().to_string()
        }))
    }

    async fn remove_network(&self, network_id: &str) -> Result<(), bollard::errors::Error> {
        match self.docker.remove_network(network_id).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn connect_network(
        &self,
        network_id: &str,
        container_id: &str,
        alias: &str,
    ) -> Result<(), bollard::errors::Error> {
        self.docker
            .connect_network(
                network_id,
                ConnectNetworkOptions {
                    container: container_id.to_string(),
                    endpoint_config: EndpointSettings {
                        aliases: Some(vec![alias.to_string()]),
                        ..Default::default()
                    },
                },
            )
            .await
    }

    async fn disconnect_network(
        &self,
        network_id: &str,
        container_id: &str,
        force: bool,
    ) -> Result<(), bollard::errors::Error> {
        match self
            .docker
            .disconnect_network(
                network_id,
                DisconnectNetworkOptions {
                    container: container_id.to_string(),
                    force,
                },
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerView>, bollard::errors::Error> {
        let inspect = match self.docker.inspect_container(id, None).await {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        let state = inspect.state.as_ref();
        let running = state.and_then(|s| s.running).unwrap_or(false);
        let exit_code = state.and_then(|s| s.exit_code);

        let parse = |s: Option<&String>| -> Option<DateTime<Utc>> {
            s.filter(|v| !v.starts_with("0001-01-01"))
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|v| v.with_timezone(&Utc))
        };

        let config = inspect.config.clone().unwrap_or_default();
        let labels = config.labels.unwrap_or_default();

        Ok(Some(ContainerView {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            name: inspect.name.unwrap_or_default(),
            state: if running {
                ContainerState::Running
            } else if state.is_some() {
                ContainerState::Stopped
            } else {
                ContainerState::Other
            },
            exit_code,
            created: parse(inspect.created.as_ref()).unwrap_or_else(Utc::now),
            started: state.and_then(|s| parse(s.started_at.as_ref())),
            finished: state.and_then(|s| parse(s.finished_at.as_ref())),
            runner_id: labels.get("runnerhub.runner_id").cloned(),
            job_id: labels.get("runnerhub.job_id").cloned(),
            repository: labels.get("runnerhub.repository").cloned(),
        }))
    }

    async fn stop_container(&self, id: &str) -> Result<(), bollard::errors::Error> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), bollard::errors::Error> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn container_logs(&self, id: &str, tail_lines: usize) -> Result<String, bollard::errors::Error> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                timestamps: true,
                tail: tail_lines.to_string(),
                ..Default::default()
            }),
        );

        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(e) if is_not_found(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeContainerRuntime {
        pub containers: Mutex<HashMap<String, ContainerView>>,
        pub networks: Mutex<HashMap<String, RuntimeNetwork>>,
        pub disconnected: Mutex<Vec<(String, String)>>,
        next_id: std::sync::atomic::AtomicU64,
    }

    impl FakeContainerRuntime {
        pub fn insert_container(&self, view: ContainerView) {
            self.containers.lock().unwrap().insert(view.id.clone(), view);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeContainerRuntime {
        async fn ping(&self) -> Result<(), bollard::errors::Error> {
            Ok(())
        }

        async fn list_networks_by_label(
            &self,
            _label: &str,
        ) -> Result<Vec<RuntimeNetwork>, bollard::errors::Error> {
            Ok(self.networks.lock().unwrap().values().cloned().collect())
        }

        async fn create_network(&self, req: NetworkCreateRequest) -> Result<String, bollard::errors::Error> {
            let id = format!(
                "net-{}",
                self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            );
            self.networks.lock().unwrap().insert(
                id.clone(),
                RuntimeNetwork {
                    id: id.clone(),
                    name: req.name,
                    labels: req.labels,
                },
            );
            Ok(id)
        }

        async fn remove_network(&self, network_id: &str) -> Result<(), bollard::errors::Error> {
            self.networks.lock().unwrap().remove(network_id);
            Ok(())
        }

        async fn connect_network(
            &self,
            _network_id: &str,
            _container_id: &str,
            _alias: &str,
        ) -> Result<(), bollard::errors::Error> {
            Ok(())
        }

        async fn disconnect_network(
            &self,
            network_id: &str,
            container_id: &str,
            _force: bool,
        ) -> Result<(), bollard::errors::Error> {
            self.disconnected
                .lock()
                .unwrap()
                .push((network_id.to_string(), container_id.to_string()));
            Ok(())
        }

        async fn inspect_container(
            &self,
            id: &str,
        ) -> Result<Option<ContainerView>, bollard::errors::Error> {
            Ok(self.containers.lock().unwrap().get(id).cloned())
        }

        async fn stop_container(&self, id: &str) -> Result<(), bollard::errors::Error> {
            if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
                c.state = ContainerState::Stopped;
            }
            Ok(())
        }

        async fn remove_container(&self, id: &str) -> Result<(), bollard::errors::Error> {
            self.containers.lock().unwrap().remove(id);
            Ok(())
        }

        async fn container_logs(&self, _id: &str, _tail_lines: usize) -> Result<String, bollard::errors::Error> {
            Ok(String::new())
        }
    }
}
