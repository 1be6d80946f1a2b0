use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::launcher::{ScriptMonitor, ScriptStatus};
use crate::native::file;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Lines returned by `GET /logs` when `lines` is not given.
const DEFAULT_LOG_LINES: usize = 20;

pub struct AppState {
    pub landing_message: String,
    pub subscription_path: PathBuf,
    pub monitor: Arc<ScriptMonitor>,
}

type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/sub", get(subscription))
        .route("/status", get(status))
        .route("/logs", get(logs))
        .fallback(not_found)
        .with_state(state)
}

async fn landing(State(state): State<SharedState>) -> Response {
    plain_text(StatusCode::OK, state.landing_message.clone())
}

async fn subscription(State(state): State<SharedState>) -> Result<Response, AppError> {
    match file::read_text(&state.subscription_path).await {
        Ok(content) => Ok(plain_text(StatusCode::OK, content)),
        Err(e) => {
            tracing::error!("Error reading {}: {}", state.subscription_path.display(), e);
            Err(AppError::Unreadable(state.subscription_path.clone()))
        }
    }
}

async fn status(State(state): State<SharedState>) -> Json<ScriptStatus> {
    Json(state.monitor.snapshot().await)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn logs(State(state): State<SharedState>, Query(query): Query<LogsQuery>) -> impl IntoResponse {
    let count = query
        .lines
        .unwrap_or(DEFAULT_LOG_LINES)
        .min(state.monitor.capacity());
    let lines = state.monitor.recent_lines(count).await;
    Json(json!({ "lines": lines }))
}

async fn not_found() -> Response {
    plain_text(StatusCode::NOT_FOUND, "404 Not Found".to_string())
}

fn plain_text(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

// ── Error handling ──────────────────────────────────────────────────────

enum AppError {
    Unreadable(PathBuf),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unreadable(path) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error reading {}", path.display()),
            ),
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
