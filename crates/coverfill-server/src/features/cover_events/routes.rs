//! Cover event routes

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;

use crate::covers::{BookUpsertedEvent, CoverUploadCoordinator};

pub fn cover_event_routes() -> Router<CoverUploadCoordinator> {
    Router::new().route("/events", post(book_upserted))
}

/// Schedule a cover upload for an ingested book
///
/// POST /covers/events {"bookId": "...", "imageUrl": "...", "source": "GOOGLE_BOOKS"}
async fn book_upserted(
    State(coordinator): State<CoverUploadCoordinator>,
    Json(event): Json<BookUpsertedEvent>,
) -> Response {
    let book_id = event.book_id;

    match coordinator.on_book_upserted(event) {
        Some(_handle) => (
            StatusCode::ACCEPTED,
            Json(json!({ "scheduled": true, "bookId": book_id })),
        )
            .into_response(),
        None => (
            StatusCode::OK,
            Json(json!({ "scheduled": false, "bookId": book_id })),
        )
            .into_response(),
    }
}
