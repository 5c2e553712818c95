//! Batch backfill control

pub mod routes;

use serde::{Deserialize, Serialize};

pub use routes::backfill_routes;

/// POST /backfill/start body
#[derive(Debug, Clone, Deserialize)]
pub struct StartBackfillRequest {
    pub mode: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Accepted run parameters, after defaults and clamping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartBackfillResponse {
    pub mode: String,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelBackfillResponse {
    pub cancelled: bool,
}
