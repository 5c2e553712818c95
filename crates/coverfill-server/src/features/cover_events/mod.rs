//! Ingestion hook for event-triggered cover uploads

pub mod routes;

pub use routes::cover_event_routes;
