//! API route definitions.

use super::state::AppState;
use crate::coordinator::{CoordinatorError, RunOutcome};
use crate::run::TriggerKind;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

type ApiResponse = (StatusCode, Json<Value>);

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/trigger", post(trigger))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/status", get(status))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

/// Request a run now. Any request body is ignored.
async fn trigger(State(state): State<AppState>) -> ApiResponse {
    info!("trigger request received");

    // Detached so a dropped connection cannot cancel a run mid-flight.
    let coordinator = state.coordinator.clone();
    let handle = tokio::spawn(async move { coordinator.request_run(TriggerKind::Request).await });

    match handle.await {
        Ok(Ok(outcome)) => outcome_response(outcome),
        Ok(Err(CoordinatorError::Busy)) => outcome_response(RunOutcome::Rejected),
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "halted", "message": e.to_string() })),
        ),
        Err(e) => {
            error!(error = %e, "trigger task failed");
            internal(e)
        }
    }
}

fn outcome_response(outcome: RunOutcome) -> ApiResponse {
    let label = outcome.label();
    match outcome {
        RunOutcome::Completed(run) => (
            StatusCode::OK,
            Json(json!({ "data": { "outcome": label, "run": run } })),
        ),
        RunOutcome::NoOp(reason) => (
            StatusCode::OK,
            Json(json!({ "data": { "outcome": label, "detail": reason } })),
        ),
        RunOutcome::Rejected => (
            StatusCode::CONFLICT,
            Json(json!({
                "data": { "outcome": label },
                "meta": { "message": "another run is in progress" }
            })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn list_runs(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> ApiResponse {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.coordinator.ledger().list(limit) {
        Ok(runs) => (
            StatusCode::OK,
            Json(json!({ "data": runs, "meta": { "total": runs.len(), "limit": limit } })),
        ),
        Err(e) => internal(e),
    }
}

async fn get_run(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResponse {
    match state.coordinator.ledger().get(id) {
        Ok(Some(run)) => (StatusCode::OK, Json(json!({ "data": run }))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "message": format!("run {id} not found") })),
        ),
        Err(e) => internal(e),
    }
}

async fn status(State(state): State<AppState>) -> ApiResponse {
    match state.coordinator.status() {
        Ok(s) => (StatusCode::OK, Json(json!({ "data": s }))),
        Err(e) => internal(e),
    }
}

fn internal(e: impl std::fmt::Display) -> ApiResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal", "message": e.to_string() })),
    )
}
