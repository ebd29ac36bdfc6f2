//! The execution endpoint that runs inside the isolated environment.
//!
//! The agent's remote isolation mode posts `{"command": ...}` to
//! `POST /execute` and reads back an execution result.  Commands go through
//! the same safety checks as on the host.

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use termagent_config::{AppConfig, ExecTarget};
use termagent_exec::ToolExecutor;

use super::shutdown_signal;

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    command: String,
    /// Seconds; the configured default applies when absent.
    #[serde(default)]
    timeout: Option<u64>,
}

pub fn build_sandbox_router(executor: Arc<ToolExecutor>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/execute", post(execute))
        .layer(TraceLayer::new_for_http())
        .with_state(executor)
}

async fn health() -> Json<Value> {
    Json(json!({"message": "Sandbox API is running."}))
}

async fn execute(
    State(executor): State<Arc<ToolExecutor>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"message": rejection.body_text()})))
                .into_response();
        }
    };
    let command = request.command.trim();
    if command.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"message": "command must not be empty"})))
            .into_response();
    }

    // Already inside the isolated environment: run directly.
    match executor
        .run_shell(command, Some(ExecTarget::Host), request.timeout)
        .await
    {
        Ok(result) => {
            info!(%command, status = ?result.status, returncode = result.returncode, "sandbox command finished");
            Json(result).into_response()
        }
        Err(violation) => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "status": "denied",
                "command": command,
                "message": violation.to_string(),
            })),
        )
            .into_response(),
    }
}

pub async fn run_sandbox_api(config: AppConfig) -> Result<()> {
    let executor = Arc::new(ToolExecutor::from_config(&config)?);
    let bind = config.server.sandbox_api_bind.clone();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind sandbox API to {bind}"))?;
    info!(addr = %listener.local_addr()?, "sandbox API listening");

    tokio::select! {
        result = axum::serve(listener, build_sandbox_router(executor)).into_future() => {
            result.context("sandbox API failed")?
        }
        _ = shutdown_signal() => {}
    }
    info!("sandbox API stopped");
    Ok(())
}
