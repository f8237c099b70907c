//! Vacuum control handlers.

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, now_ms};
use crate::vacuum;
use axum::Json;
use axum::extract::{Path, State};
use iotafs_catalog::CatalogError;
use iotafs_catalog::sqlite::VacuumJobStatus;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct StartVacuumResponse {
    pub id: String,
}

/// POST /v1/vacuum - start a background vacuum pass.
///
/// Only one vacuum may be in flight; a second call while one is running
/// fails with a conflict.
#[tracing::instrument(skip(state))]
pub async fn start_vacuum(State(state): State<AppState>) -> ApiResult<Json<StartVacuumResponse>> {
    let job_id = Uuid::new_v4();
    match state.catalog.create_vacuum_job(job_id, now_ms()).await {
        Ok(()) => {}
        Err(CatalogError::Constraint(_)) => {
            return Err(ApiError::Conflict(
                "a vacuum is already running".to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    }

    tracing::info!(job_id = %job_id, "Vacuum started");
    let task_state = state.clone();
    tokio::spawn(async move {
        let status = match vacuum::run(&task_state).await {
            Ok(stats) => {
                tracing::info!(
                    job_id = %job_id,
                    packs_deleted = stats.packs_deleted,
                    packs_rewritten = stats.packs_rewritten,
                    bytes_reclaimed = stats.bytes_reclaimed,
                    "Vacuum completed"
                );
                VacuumJobStatus::Completed
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Vacuum failed");
                VacuumJobStatus::Failed
            }
        };
        if let Err(e) = task_state
            .catalog
            .finish_vacuum_job(job_id, status, now_ms())
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record vacuum job state");
        }
    });

    Ok(Json(StartVacuumResponse {
        id: job_id.to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct VacuumStatusResponse {
    pub status: String,
    /// Epoch milliseconds.
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// GET /v1/vacuum/{id} - poll a vacuum job.
#[tracing::instrument(skip(state), fields(id = %id))]
pub async fn vacuum_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VacuumStatusResponse>> {
    let job_id = Uuid::parse_str(&id)
        .map_err(|e| ApiError::BadRequest(format!("invalid vacuum job id: {e}")))?;

    let job = state
        .catalog
        .get_vacuum_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("vacuum job {job_id}")))?;

    Ok(Json(VacuumStatusResponse {
        status: job.status,
        started_at: job.started_at,
        completed_at: job.completed_at,
    }))
}
