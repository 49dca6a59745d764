//! Application configuration, loaded the way the teacher's `Config::load`
//! layers a file source through the `config` crate — here with an
//! environment-variable overlay (`RUNNERHUB_*`) on top.

use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub coordination: CoordinationConfig,
    pub container_runtime: ContainerRuntimeConfig,
    pub github: GitHubConfig,
    #[serde(default)]
    pub leader: LeaderConfig,
    #[serde(default)]
    pub pools: PoolDefaults,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Clone, Debug, Deserialize)]
pub struct CoordinationConfig {
    pub url: String,
    #[serde(default = "default_lock_key")]
    pub lock_key: String,
}

fn default_lock_key() -> String {
    "runnerhub:leader:lock".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContainerRuntimeConfig {
    #[serde(default)]
    pub socket_path: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GitHubConfig {
    pub org: String,
    pub token: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LeaderConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_renewal_interval_secs")]
    pub renewal_interval_secs: u64,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_lock_ttl_secs() -> u64 {
    30
}
fn default_renewal_interval_secs() -> u64 {
    10
}
fn default_retry_interval_secs() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    5
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            renewal_interval_secs: default_renewal_interval_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PoolDefaults {
    #[serde(default = "default_min_runners")]
    pub min_runners: i32,
    #[serde(default = "default_max_runners")]
    pub max_runners: i32,
    #[serde(default = "default_scale_increment")]
    pub scale_increment: i32,
    #[serde(default = "default_scale_threshold")]
    pub scale_threshold: f64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: i64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

fn default_min_runners() -> i32 {
    0
}
fn default_max_runners() -> i32 {
    10
}
fn default_scale_increment() -> i32 {
    1
}
fn default_scale_threshold() -> f64 {
    0.8
}
fn default_idle_timeout_secs() -> i64 {
    600
}
fn default_monitor_interval_secs() -> u64 {
    30
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            min_runners: default_min_runners(),
            max_runners: default_max_runners(),
            scale_increment: default_scale_increment(),
            scale_threshold: default_scale_threshold(),
            idle_timeout_secs: default_idle_timeout_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_initial_delay_secs() -> u64 {
    60
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_subnet_base_octet")]
    pub subnet_base_octet: u8,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: i64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_prefix() -> String {
    "runnerhub".to_string()
}
fn default_subnet_base_octet() -> u8 {
    20
}
fn default_max_idle_secs() -> i64 {
    3600
}
fn default_cleanup_interval_secs() -> u64 {
    1800
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            subnet_base_octet: default_subnet_base_octet(),
            max_idle_secs: default_max_idle_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LoggingConfig {
    /// When set, logs roll daily into this directory via `tracing-appender`
    /// instead of going to stdout.
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file")]
    ConfigFile(#[from] config::ConfigError),
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("RUNNERHUB").separator("__"))
            .build()?;

        Ok(settings.try_deserialize::<AppConfig>()?)
    }
}
