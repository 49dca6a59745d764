//! GitHub `workflow_job` webhook ingress, wiring the
//! `axum_github_hooks::GithubWebhook` extractor to `request_runner`/
//! `release_runner` ("queued" -> request, "completed" -> release). All other
//! event kinds are acknowledged and ignored — dispatch ordering and retries
//! are the upstream hosting service's job, not ours.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum_github_hooks::GithubWebhook;
use octocrab::models::webhook_events::{WebhookEvent, WebhookEventPayload};
use tracing::instrument;

use crate::AppState;

#[instrument(skip(state, hook))]
pub async fn webhook(State(state): State<AppState>, GithubWebhook(hook): GithubWebhook) -> impl IntoResponse {
    if let Err(e) = handle_event(&state, &hook).await {
        tracing::error!(error = %e, "failed to handle webhook event");
    }
    StatusCode::OK
}

async fn handle_event(state: &AppState, event: &WebhookEvent) -> Result<(), crate::error::PoolError> {
    let WebhookEventPayload::WorkflowJob(job) = &event.specific else {
        return Ok(());
    };

    let repository = event
        .repository
        .as_ref()
        .map(|r| r.full_name.clone().unwrap_or_else(|| r.name.clone()))
        .unwrap_or_else(|| crate::models::WILDCARD_REPOSITORY.to_string());

    let labels: Vec<String> = job.workflow_job.labels.clone();

    let action = serde_json::to_value(&job.action)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    match action.as_str() {
        "queued" => {
            let response = state.pool.request_runner(&repository, &labels).await?;
            tracing::info!(repository = %repository, request_id = %response.request_id, assigned = response.runner.is_some(), "workflow_job queued");
        }
        "completed" => {
            if let Some(runner_id) = resolve_runner_for_job(state, &repository, job.workflow_job.id).await {
                state.pool.release_runner(&runner_id).await?;
                tracing::info!(repository = %repository, runner_id = %runner_id, "workflow_job completed, runner released");
            }
        }
        _ => {}
    }

    Ok(())
}

/// `workflow_job` payloads carry GitHub's job id, not our runner id;
/// resolve by scanning the pool's busy runners for a matching `current_job_id`.
/// A production deployment would index this; the scan is fine at the scale
/// a single repository's pool runs at.
async fn resolve_runner_for_job(state: &AppState, repository: &str, job_id: u64) -> Option<String> {
    let runners = state.store.list_runners_for_repository(repository).await.ok()?;
    runners
        .into_iter()
        .find(|r| r.current_job_id.as_deref() == Some(&job_id.to_string()))
        .map(|r| r.id)
}
