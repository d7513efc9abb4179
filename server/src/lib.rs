//! HTTP front end of the spam classifier.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sms_spam::SpamService;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod routes;

/// Shared by every request.
#[derive(Clone)]
pub struct AppState {
    /// The classifier.
    pub service: Arc<SpamService>,
}

impl AppState {
    /// Wraps the service.
    pub fn new(service: SpamService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

/// `GET /` and `POST /predict`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/predict", post(routes::predict))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
