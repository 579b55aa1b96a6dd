pub mod config;
pub mod database;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod services;
pub mod state;
pub mod utils;
pub mod vault;
pub mod webhook;

use axum::{
    routing::get,
    Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use state::AppState;

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route(
            "/webhook",
            get(handlers::webhook::verify_handler).post(handlers::webhook::event_handler),
        )
        .route("/ws", get(handlers::realtime::ws_handler));

    let admin_routes = Router::new().route(
        "/admin/jobs/failed",
        get(handlers::admin::failed_jobs_handler),
    );

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .with_state(state)
        // CORS
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Tracing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
}
