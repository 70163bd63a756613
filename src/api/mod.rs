//! Approval API: REST routes for the operator plus a WebSocket that streams
//! queue events to connected approval UIs.

mod routes;
mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use crate::error::{Error, LeadError, QueueError};
use crate::queue::ApprovalQueue;
use crate::reconciler::Reconciler;
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<ApprovalQueue>,
    pub reconciler: Arc<Reconciler>,
    pub db: Arc<dyn Database>,
}

/// Build the router with every API and WebSocket route.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(routes::health))
        .route("/api/actions", get(routes::list_actions))
        .route("/api/actions/{id}", get(routes::get_action))
        .route("/api/actions/{id}/approve", post(routes::approve_action))
        .route("/api/actions/{id}/reject", post(routes::reject_action))
        .route("/api/leads", get(routes::list_leads).post(routes::ingest_lead))
        .route("/api/leads/scrape", post(routes::scrape_lead))
        .route("/api/leads/{id}", get(routes::get_lead))
        .route("/api/leads/{id}/outcome", post(routes::record_outcome))
        .route("/api/leads/{id}/booking", post(routes::record_booking))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body: `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

fn queue_status(e: &QueueError) -> StatusCode {
    match e {
        QueueError::NotFound { .. } => StatusCode::NOT_FOUND,
        QueueError::AlreadyDecided { .. }
        | QueueError::DuplicateAction { .. }
        | QueueError::DuplicateContent { .. }
        | QueueError::InvalidTransition { .. } => StatusCode::CONFLICT,
        QueueError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self {
            status: queue_status(&e),
            message: e.to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::Queue(q) => queue_status(q),
            Error::Lead(LeadError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Lead(LeadError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            Error::External(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<crate::error::DatabaseError> for ApiError {
    fn from(e: crate::error::DatabaseError) -> Self {
        Error::from(e).into()
    }
}
