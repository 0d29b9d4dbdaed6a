// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admin API for the watchdog.
//!
//! Everything an operator needs without shelling into the host: target
//! status, pause/unpause, manual restart with audit fields, the global
//! restart switch, and config reload.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{apply_file, FileConfig, ReloadReport, SharedSettings};
use crate::docker::ContainerSummary;
use crate::monitor::{Monitor, RestartSkip};
use crate::state::{RestartAudit, TargetState};

/// Shared context for all admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub monitor: Arc<Monitor>,
    pub settings: SharedSettings,
    pub trigger_tx: mpsc::Sender<()>,
    pub config_file: Option<PathBuf>,
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
struct TargetRow {
    name: String,
    #[serde(flatten)]
    state: TargetState,
}

#[derive(Debug, Serialize)]
struct TargetDetail {
    name: String,
    watchdog: TargetState,
    container: Option<ContainerSummary>,
}

#[derive(Debug, Deserialize)]
struct RestartRequest {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    requested_by: Option<String>,
}

#[derive(Debug, Serialize)]
struct RestartResponse {
    name: String,
    #[serde(flatten)]
    audit: RestartAudit,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/targets", get(list_targets))
        .route("/api/v1/targets/{name}", get(get_target))
        .route("/api/v1/targets/{name}/pause", post(pause_target))
        .route("/api/v1/targets/{name}/unpause", post(unpause_target))
        .route("/api/v1/targets/{name}/restart", post(restart_target))
        .route("/api/v1/enable", post(enable))
        .route("/api/v1/disable", post(disable))
        .route("/api/v1/reload", post(reload))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_auth(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.token else {
        return next.run(request).await;
    };
    // Liveness stays probeable without credentials.
    if request.uri().path() == "/api/v1/health" {
        return next.run(request).await;
    }
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {expected}"));
    if authorized {
        next.run(request).await
    } else {
        error_response(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_targets(State(state): State<AdminState>) -> Json<Vec<TargetRow>> {
    let rows = state
        .monitor
        .state()
        .snapshot()
        .into_iter()
        .map(|(name, target)| TargetRow { name, state: target })
        .collect();
    Json(rows)
}

async fn get_target(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    let Some(watchdog) = state.monitor.state().get(&name) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown target {name}"));
    };
    let container = state.monitor.docker().inspect_target(&name).await.unwrap_or(None);
    Json(TargetDetail { name, watchdog, container }).into_response()
}

async fn pause_target(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    set_paused(&state, &name, true)
}

async fn unpause_target(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    set_paused(&state, &name, false)
}

fn set_paused(state: &AdminState, name: &str, paused: bool) -> Response {
    if !state.monitor.state().set_paused(name, paused) {
        return error_response(StatusCode::NOT_FOUND, format!("unknown target {name}"));
    }
    info!(target = name, paused, "monitoring pause changed");
    Json(serde_json::json!({ "name": name, "monitoringPaused": paused })).into_response()
}

async fn restart_target(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(request): Json<RestartRequest>,
) -> Response {
    let by = request.requested_by.as_deref().unwrap_or("admin");
    let reason = request.reason.as_deref().unwrap_or("manual restart");

    match state.monitor.restart_target(&name, by, reason, true).await {
        Ok(audit) => Json(RestartResponse { name, audit }).into_response(),
        Err(RestartSkip::UnknownTarget) => {
            error_response(StatusCode::NOT_FOUND, format!("unknown target {name}"))
        }
        Err(skip) => error_response(StatusCode::CONFLICT, skip.as_str()),
    }
}

async fn enable(State(state): State<AdminState>) -> Json<serde_json::Value> {
    set_enabled(&state, true)
}

async fn disable(State(state): State<AdminState>) -> Json<serde_json::Value> {
    set_enabled(&state, false)
}

fn set_enabled(state: &AdminState, enabled: bool) -> Json<serde_json::Value> {
    if let Ok(mut settings) = state.settings.write() {
        settings.enabled = enabled;
    }
    info!(enabled, "global restart switch changed");
    Json(serde_json::json!({ "enabled": enabled }))
}

async fn reload(State(state): State<AdminState>) -> Response {
    let Some(path) = &state.config_file else {
        return error_response(StatusCode::BAD_REQUEST, "no config file configured");
    };
    let file = match FileConfig::load(path) {
        Ok(file) => file,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("{e:#}")),
    };

    let report: ReloadReport = match state.settings.write() {
        Ok(mut settings) => {
            let report = apply_file(&mut settings, &file);
            if report.applied.contains(&"containers") {
                state.monitor.state().rebuild(&settings.containers);
            }
            report
        }
        Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "settings lock poisoned"),
    };

    info!(applied = ?report.applied, requires_restart = ?report.requires_restart, "config reloaded");
    // Nudge the monitor so new thresholds apply without waiting a tick.
    let _ = state.trigger_tx.try_send(());
    Json(report).into_response()
}

#[cfg(test)]
#[path = "admin_tests.rs"]
mod tests;
