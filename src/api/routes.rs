//! REST handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::error::{Error, LeadError, QueueError};
use crate::integrations::Booking;
use crate::leads::{LeadProfile, LeadState};
use crate::queue::model::{ActionStatus, Decision};

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid {what} ID")))
}

// ── Health ──────────────────────────────────────────────────────────────

pub(super) async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "outreach-agent"
    }))
}

// ── Actions ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct ActionFilter {
    status: Option<String>,
}

pub(super) async fn list_actions(
    State(state): State<AppState>,
    Query(filter): Query<ActionFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let status = filter
        .status
        .as_deref()
        .map(str::parse::<ActionStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    Ok(Json(state.queue.list(status).await?))
}

pub(super) async fn get_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "action")?;
    match state.queue.get(id).await? {
        Some(action) => Ok(Json(action)),
        None => Err(QueueError::NotFound { id }.into()),
    }
}

pub(super) async fn approve_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "action")?;
    let action = state.queue.decide(id, Decision::Approve).await?;
    info!(action_id = %id, "Action approved via API");
    Ok(Json(action))
}

pub(super) async fn reject_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "action")?;
    let action = state.queue.decide(id, Decision::Reject).await?;
    info!(action_id = %id, "Action rejected via API");
    Ok(Json(action))
}

// ── Leads ───────────────────────────────────────────────────────────────

pub(super) async fn list_leads(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_leads().await?))
}

pub(super) async fn get_lead(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "lead")?;
    match state.db.get_lead(id).await? {
        Some(lead) => Ok(Json(lead)),
        None => Err(Error::from(LeadError::NotFound { id }).into()),
    }
}

pub(super) async fn ingest_lead(
    State(state): State<AppState>,
    Json(profile): Json<LeadProfile>,
) -> Result<impl IntoResponse, ApiError> {
    if profile.profile_url.trim().is_empty() {
        return Err(ApiError::bad_request("profile_url is required"));
    }
    let lead = state.reconciler.ingest_lead(&profile).await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

#[derive(Deserialize)]
pub(super) struct ScrapeRequest {
    profile_url: String,
}

/// Scrape a profile through the automation backend and ingest it.
pub(super) async fn scrape_lead(
    State(state): State<AppState>,
    Json(body): Json<ScrapeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let profile_url = body.profile_url.trim();
    if profile_url.is_empty() {
        return Err(ApiError::bad_request("profile_url is required"));
    }
    let lead = state.reconciler.ingest_profile_url(profile_url).await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

#[derive(Deserialize)]
pub(super) struct OutcomeRequest {
    outcome: LeadState,
}

pub(super) async fn record_outcome(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<OutcomeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "lead")?;
    let lead = state.reconciler.record_outcome(id, body.outcome).await?;
    Ok(Json(lead))
}

#[derive(Deserialize)]
pub(super) struct BookingRequest {
    scheduled_for: DateTime<Utc>,
    #[serde(default)]
    note: Option<String>,
}

/// Record a calendar booking and move the lead to `MeetingScheduled` if it
/// is in conversation.
pub(super) async fn record_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<BookingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "lead")?;
    if state.db.get_lead(id).await?.is_none() {
        return Err(Error::from(LeadError::NotFound { id }).into());
    }

    state
        .db
        .record_booking(&Booking {
            lead_id: id,
            scheduled_for: body.scheduled_for,
            note: body.note,
        })
        .await?;
    let scheduled = state.reconciler.confirm_booking(id).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "lead_id": id, "meeting_scheduled": scheduled })),
    ))
}
