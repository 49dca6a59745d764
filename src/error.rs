//! Error taxonomy: transient / not-found-as-success / contention /
//! invariant-violation / collaborator-failure. Each subsystem error type
//! classifies itself so callers (loops, HTTP handlers) can branch on the
//! kind rather than re-deriving it from the variant at every call site.

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    NotFound,
    Contention,
    Invariant,
    Collaborator,
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("coordination store error: {0}")]
    Coordination(#[from] redis::RedisError),
    #[error("row not found")]
    NotFound,
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound => ErrorKind::NotFound,
            StoreError::Database(e) if e.as_database_error().is_none() => ErrorKind::Transient,
            StoreError::Coordination(_) => ErrorKind::Transient,
            _ => ErrorKind::Invariant,
        }
    }
}

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("lock held by another node")]
    NotLeader,
    #[error("compare-and-set renewal failed: {reason}")]
    RenewalFailed { reason: String },
    #[error("lock value failed to deserialize: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Classify for LeaderError {
    fn kind(&self) -> ErrorKind {
        match self {
            LeaderError::Store(e) => e.kind(),
            LeaderError::NotLeader => ErrorKind::Contention,
            LeaderError::RenewalFailed { .. } => ErrorKind::Contention,
            LeaderError::Malformed(_) => ErrorKind::Invariant,
        }
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),
    #[error("network for repository {0:?} not found")]
    NotFound(String),
    #[error("network for repository {0:?} still has {1} attached container(s)")]
    InUse(String, usize),
    #[error("subnet space exhausted")]
    SubnetExhausted,
}

impl Classify for NetworkError {
    fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::Store(e) => e.kind(),
            NetworkError::Runtime(_) => ErrorKind::Transient,
            NetworkError::NotFound(_) => ErrorKind::NotFound,
            NetworkError::InUse(..) => ErrorKind::Invariant,
            NetworkError::SubnetExhausted => ErrorKind::Invariant,
        }
    }
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),
    #[error("a cleanup sweep is already running")]
    AlreadyRunning,
    #[error("unknown policy {0:?}")]
    UnknownPolicy(String),
}

impl Classify for CleanupError {
    fn kind(&self) -> ErrorKind {
        match self {
            CleanupError::Store(e) => e.kind(),
            CleanupError::Network(e) => e.kind(),
            CleanupError::Runtime(_) => ErrorKind::Transient,
            CleanupError::AlreadyRunning => ErrorKind::Contention,
            CleanupError::UnknownPolicy(_) => ErrorKind::NotFound,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("pool config invalid: min_runners ({min}) > max_runners ({max})")]
    InvalidBounds { min: i32, max: i32 },
    #[error("a scale operation is already in progress for {0:?}")]
    ScalingInProgress(String),
    #[error("runner {0:?} not found")]
    RunnerNotFound(String),
    #[error("collaborator failure: {0}")]
    Collaborator(String),
}

impl Classify for PoolError {
    fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Store(e) => e.kind(),
            PoolError::InvalidBounds { .. } => ErrorKind::Invariant,
            PoolError::ScalingInProgress(_) => ErrorKind::Contention,
            PoolError::RunnerNotFound(_) => ErrorKind::NotFound,
            PoolError::Collaborator(_) => ErrorKind::Collaborator,
        }
    }
}

/// Aggregates subsystem errors for the HTTP layer.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Leader(#[from] LeaderError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for ControlPlaneError {
    fn kind(&self) -> ErrorKind {
        match self {
            ControlPlaneError::Leader(e) => e.kind(),
            ControlPlaneError::Network(e) => e.kind(),
            ControlPlaneError::Cleanup(e) => e.kind(),
            ControlPlaneError::Pool(e) => e.kind(),
            ControlPlaneError::Store(e) => e.kind(),
        }
    }
}

impl axum::response::IntoResponse for ControlPlaneError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Contention => StatusCode::CONFLICT,
            ErrorKind::Invariant => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Collaborator => StatusCode::BAD_GATEWAY,
        };

        tracing::error!(error = %self, kind = ?self.kind(), "request failed");
        (status, self.to_string()).into_response()
    }
}
