use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use core_types::{CoreError, GameStateSnapshot, ReloadKind};
use macro_registry::MacroRunner;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::state::AppState;

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/state", post(post_state))
        .route("/decide", post(decide))
        .route("/reload/model", post(reload_model))
        .route("/promote", post(promote))
        .route("/reload/macro", post(reload_macro))
        .route("/macro/:name", get(get_macro))
        .route("/macro/:name/execute", post(execute_macro))
        .route("/macros", get(list_macros))
        .route("/commands", get(drain_commands))
        .route("/model", get(get_model))
        .route("/cycle", get(get_cycle).post(trigger_cycle))
        .route("/stats", get(stats))
        .with_state(state)
}

pub(crate) enum ApiError {
    Core(CoreError),
    BadRequest(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::StaleUpdate { .. }
        | CoreError::NothingStaged
        | CoreError::CycleAlreadyRunning => StatusCode::CONFLICT,
        CoreError::UnknownMacro(_) => StatusCode::NOT_FOUND,
        CoreError::Staging(_) | CoreError::MacroSyntax(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::PromotionTimedOut { .. }
        | CoreError::ReloadTimedOut { .. }
        | CoreError::WorkerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Core(err) => (status_for(&err), err.to_string()),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    model_version: u64,
    state_tick: Option<u64>,
    cycle_running: bool,
    uptime_sec: u64,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResp {
        status: "ok",
        model_version: state.core.model_metrics().version,
        state_tick: state.core.store_stats().tick,
        cycle_running: state.core.cycle_status().running,
        uptime_sec: state.started_at.elapsed().as_secs(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

async fn post_state(
    State(state): State<AppState>,
    Json(snapshot): Json<GameStateSnapshot>,
) -> Result<impl IntoResponse, ApiError> {
    let version = state.core.on_state_received(snapshot)?;
    Ok(Json(json!({ "version": version })))
}

#[derive(Debug, Default, Deserialize)]
struct DecideReq {
    /// Overrides the routine/emergency budget.
    budget_ms: Option<u64>,
}

async fn decide(State(state): State<AppState>, body: Option<Json<DecideReq>>) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let budget = req.budget_ms.map(|ms| Duration::from_millis(ms.clamp(1, 10_000)));
    Json(state.core.decide(budget).await)
}

#[derive(Debug, Deserialize)]
struct ReloadModelReq {
    path: String,
    /// Stage only when false; the candidate waits for `POST /promote`.
    #[serde(default = "default_true")]
    promote: bool,
}

fn default_true() -> bool {
    true
}

async fn reload_model(
    State(state): State<AppState>,
    Json(req): Json<ReloadModelReq>,
) -> Result<Response, ApiError> {
    let path = PathBuf::from(req.path);
    if req.promote {
        let outcome = state.core.on_reload_trigger(ReloadKind::Model, path).await?;
        Ok(Json(outcome).into_response())
    } else {
        let staged = state.core.stage_model(path).await?;
        Ok(Json(staged).into_response())
    }
}

async fn promote(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let version = state.core.promote_model().await?;
    Ok(Json(json!({ "version": version })))
}

#[derive(Debug, Deserialize)]
struct ReloadMacroReq {
    name: Option<String>,
    /// Inline macro text; takes precedence over `path`.
    body: Option<String>,
    path: Option<String>,
}

async fn reload_macro(
    State(state): State<AppState>,
    Json(req): Json<ReloadMacroReq>,
) -> Result<Response, ApiError> {
    match (req.name, req.body, req.path) {
        (Some(name), Some(body), _) => {
            let version = state.core.reload_macro(&name, body).await?;
            Ok(Json(json!({ "kind": "macro", "name": name, "version": version })).into_response())
        }
        (_, None, Some(path)) => {
            let outcome = state
                .core
                .on_reload_trigger(ReloadKind::Macro, PathBuf::from(path))
                .await?;
            Ok(Json(outcome).into_response())
        }
        _ => Err(ApiError::BadRequest(
            "expected `name` with `body`, or `path`".to_string(),
        )),
    }
}

async fn get_macro(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .core
        .macro_info(&name)
        .map(Json)
        .ok_or(ApiError::Core(CoreError::UnknownMacro(name)))
}

async fn execute_macro(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let runner: Arc<dyn MacroRunner> = state.outbox.clone();
    let run = state.core.execute_macro(&name, runner).await?;
    Ok(Json(run))
}

async fn list_macros(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.macro_names())
}

async fn drain_commands(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.outbox.drain())
}

async fn get_model(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.model_metrics())
}

async fn get_cycle(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.cycle_status())
}

#[derive(Debug, Default, Deserialize)]
struct CycleReq {
    reason: Option<String>,
}

async fn trigger_cycle(
    State(state): State<AppState>,
    body: Option<Json<CycleReq>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "manual".to_string());
    match state.core.on_cycle_trigger(&reason) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "started": true, "reason": reason })),
        ),
        // Coalesced into the running cycle; not a failure.
        Err(err) => (
            StatusCode::OK,
            Json(json!({ "started": false, "reason": reason, "detail": err.to_string() })),
        ),
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.core.pool();
    Json(json!({
        "decisions": state.core.decision_stats(),
        "store": state.core.store_stats(),
        "model": state.core.model_metrics(),
        "cycle": state.core.cycle_status(),
        "workers": { "size": pool.size(), "available": pool.available() },
        "outbox_pending": state.outbox.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_the_failure_kind() {
        let cases = [
            (CoreError::StaleUpdate { incoming: 1, current: 2 }, StatusCode::CONFLICT),
            (CoreError::NothingStaged, StatusCode::CONFLICT),
            (CoreError::UnknownMacro("x".into()), StatusCode::NOT_FOUND),
            (CoreError::Staging("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                CoreError::PromotionTimedOut { waited_ms: 10, inflight: 1 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (CoreError::Inference("nan".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{err}");
        }
    }
}
