//! HTTP surface
//!
//! Thin axum layer over the ledger services. Handlers only parse input and
//! shape output; every rule lives in `crate::audit`.

pub mod handlers;
pub mod params;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::audit::AuditLedger;
use crate::config::AppConfig;

#[derive(Clone, Debug)]
pub struct AppState {
    pub ledger: AuditLedger,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(ledger: AuditLedger, config: AppConfig) -> Self {
        Self {
            ledger,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::stats))
        .route("/verify/:id", post(handlers::verify_entry))
        .route("/verify-chain", post(handlers::verify_chain))
        .route("/metadata/:id", get(handlers::metadata))
        .route("/list", get(handlers::list))
        .route("/export", get(handlers::export))
        .route("/events", post(handlers::append_event))
        .route("/archive", post(handlers::archive))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}
