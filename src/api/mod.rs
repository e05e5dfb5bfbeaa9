//! HTTP surface (spec §6). Routes are served at their literal spec paths
//! directly off the root router, wrapped in `CorsLayer`/`TraceLayer`.
pub mod error;
pub mod handlers;
pub mod response;

use axum::routing::{get, post};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use handlers::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/json/optimize_request.json", get(handlers::optimize_request))
        .route("/json/optimize_response.json", get(handlers::optimize_response))
        .route("/json/current_controls.json", get(handlers::current_controls))
        .route("/controls/mode_override", post(handlers::mode_override))
        .route("/logs", get(handlers::logs))
        .route("/logs/alerts", get(handlers::log_alerts))
        .route("/logs/clear", post(handlers::logs_clear))
        .route("/logs/alerts/clear", post(handlers::log_alerts_clear))
        .route("/logs/stats", get(handlers::logs_stats))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
