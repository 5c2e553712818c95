//! Backfill routes

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};

use super::{CancelBackfillResponse, StartBackfillRequest, StartBackfillResponse};
use crate::api::response::ApiResponse;
use crate::covers::{BackfillMode, BackfillProgress, BackfillService};
use crate::error::{AppError, AppResult};

pub fn backfill_routes() -> Router<BackfillService> {
    Router::new()
        .route("/start", post(start_backfill))
        .route("/cancel", post(cancel_backfill))
        .route("/status", get(backfill_status))
}

/// Start a run
///
/// POST /backfill/start {"mode": "MISSING", "limit": 100}
async fn start_backfill(
    State(service): State<BackfillService>,
    Json(request): Json<StartBackfillRequest>,
) -> AppResult<ApiResponse<StartBackfillResponse>> {
    let mode: BackfillMode = request.mode.parse().map_err(AppError::Validation)?;
    let limit = service.config().effective_limit(request.limit);

    service.start(mode, limit)?;

    Ok(ApiResponse::accepted(StartBackfillResponse {
        mode: mode.to_string(),
        limit,
    }))
}

/// Cancel the active run, if any
///
/// POST /backfill/cancel
async fn cancel_backfill(State(service): State<BackfillService>) -> Json<CancelBackfillResponse> {
    Json(CancelBackfillResponse {
        cancelled: service.cancel(),
    })
}

/// Current progress snapshot
///
/// GET /backfill/status
async fn backfill_status(State(service): State<BackfillService>) -> Json<BackfillProgress> {
    Json(service.progress().as_ref().clone())
}
