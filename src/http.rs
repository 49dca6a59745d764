//! HTTP surface beyond the webhook ingress: health, status, and a thin
//! REST face over the Pool Manager's existing CRUD contract.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ControlPlaneError;
use crate::models::Pool;

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
}

pub async fn healthz() -> impl IntoResponse {
    Json(HealthResponse { ok: true })
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub is_leader: bool,
    pub current_leader: Option<String>,
    pub pool_count: usize,
    pub last_cleanup: Option<crate::models::CleanupResult>,
    pub network_stats: crate::models::NetworkStats,
}

pub async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, ControlPlaneError> {
    let pools = state.pool.list_pools().await?;
    Ok(Json(StatusResponse {
        node_id: state.leader.node_id().to_string(),
        is_leader: state.leader.is_current_leader(),
        current_leader: state.leader.current_leader().await,
        pool_count: pools.len(),
        last_cleanup: state.cleanup.last_result().await,
        network_stats: state.network.stats().await,
    }))
}

pub async fn get_pool(
    State(state): State<AppState>,
    Path(repository): Path<String>,
) -> Result<impl IntoResponse, ControlPlaneError> {
    let pool = state.pool.get_or_create_pool(&repository).await?;
    Ok(Json(pool))
}

#[derive(Deserialize)]
pub struct ScaleRequest {
    pub n: i32,
}

pub async fn scale_pool(
    State(state): State<AppState>,
    Path(repository): Path<String>,
    Json(req): Json<ScaleRequest>,
) -> Result<impl IntoResponse, ControlPlaneError> {
    let created = state.pool.scale_up(&repository, req.n).await?;
    Ok((StatusCode::ACCEPTED, Json(created)))
}

pub async fn put_pool(
    State(state): State<AppState>,
    Path(repository): Path<String>,
    Json(mut pool): Json<Pool>,
) -> Result<impl IntoResponse, ControlPlaneError> {
    pool.repository = repository;
    if pool.min_runners > pool.max_runners {
        return Err(crate::error::PoolError::InvalidBounds {
            min: pool.min_runners,
            max: pool.max_runners,
        }
        .into());
    }
    state.store.upsert_pool(&pool).await?;
    Ok(Json(pool))
}
