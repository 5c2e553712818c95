//! Feature modules implementing the Coverfill admin API
//!
//! Each feature is a vertical slice with its own request types and routes.
//!
//! # Features
//!
//! - **backfill**: start, cancel, and poll the batch cover backfill
//! - **cover_events**: ingestion hook that schedules event-triggered uploads

pub mod backfill;
pub mod cover_events;

use axum::Router;

use crate::covers::{BackfillService, CoverUploadCoordinator};

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    pub backfill: BackfillService,
    pub uploads: CoverUploadCoordinator,
}

/// Creates the API router with all feature routes mounted
///
/// - `/backfill` - Batch backfill control and status
/// - `/covers` - Ingestion events
pub fn router(state: FeatureState) -> Router<()> {
    Router::new()
        .nest("/backfill", backfill::backfill_routes().with_state(state.backfill.clone()))
        .nest("/covers", cover_events::cover_event_routes().with_state(state.uploads.clone()))
}
