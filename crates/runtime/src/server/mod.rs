//! HTTP surface of the agent: `POST /chat` submits work, `GET /sse` streams
//! the resulting events, `GET /` answers health checks.

pub mod sandbox_api;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{Span, info, info_span, warn};

use termagent_config::AppConfig;

use crate::context::AppContext;
use crate::dispatcher::{DEFAULT_SESSION_ID, DispatchError};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let protected = Router::new()
        .route("/chat", post(chat))
        .route("/sse", get(events))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), require_api_key));

    Router::new()
        .route("/", get(health))
        .merge(protected)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    info_span!("http", method = %req.method(), path = %req.uri().path())
                })
                .on_response(|res: &Response, latency: Duration, span: &Span| {
                    info!(parent: span, status = %res.status(), latency_ms = latency.as_millis());
                }),
        )
        .with_state(ctx)
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

async fn require_api_key(State(ctx): State<Arc<AppContext>>, req: Request, next: Next) -> Response {
    let expected = ctx.config.server.api_key.trim();
    if expected.is_empty() {
        return next.run(req).await;
    }
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented == Some(expected) {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "rejected request with missing or wrong API key");
        reply(
            StatusCode::UNAUTHORIZED,
            json!({"message": "Invalid or missing API key"}),
        )
    }
}

/// Liveness plus queue and execution state.
async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let rules: Vec<&str> = ctx.executor.guard().rule_names().collect();
    Json(json!({
        "message": format!("{} backend is running.", ctx.config.agent.name),
        "queued_events": ctx.bus.len(),
        "dropped_events": ctx.bus.dropped(),
        "consumer_attached": ctx.bus.has_consumer(),
        "active_plans": ctx.tasks.active(),
        "default_target": ctx.executor.policy().default_target,
        "safety_rules": rules,
    }))
}

async fn chat(
    State(ctx): State<Arc<AppContext>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return reply(StatusCode::BAD_REQUEST, json!({"message": rejection.body_text()}));
        }
    };
    let session_id = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(DEFAULT_SESSION_ID);

    match ctx.dispatcher.handle(session_id, &request.message).await {
        Ok(ack) => (StatusCode::ACCEPTED, Json(ack)).into_response(),
        Err(err @ DispatchError::EmptyMessage) => {
            reply(StatusCode::BAD_REQUEST, json!({"message": err.to_string()}))
        }
        Err(err @ (DispatchError::Decision(_) | DispatchError::Upstream(_))) => reply(
            StatusCode::BAD_GATEWAY,
            json!({"status": "error", "message": err.to_string()}),
        ),
        Err(err @ DispatchError::History(_)) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": "error", "message": err.to_string()}),
        ),
    }
}

/// Drains the event queue.  Only one stream may be attached at a time.
async fn events(State(ctx): State<Arc<AppContext>>) -> Response {
    let drain = match ctx.bus.drain() {
        Ok(drain) => drain,
        Err(err) => return reply(StatusCode::CONFLICT, json!({"message": err.to_string()})),
    };
    info!(queued = ctx.bus.len(), "event stream attached");

    let stream = drain
        .into_stream()
        .map(|event| SseEvent::default().json_data(event));
    let interval = Duration::from_secs(ctx.config.server.keep_alive_secs.max(1));
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(interval))
        .into_response()
}

/// Serve until Ctrl-C, then abort running plans.
pub async fn serve(ctx: Arc<AppContext>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "agent server listening");
    let tasks = Arc::clone(&ctx.tasks);
    let server = axum::serve(listener, build_router(ctx)).into_future();

    // Attached /sse streams never end by themselves; do not wait for them.
    tokio::select! {
        result = server => result.context("agent server failed")?,
        _ = shutdown_signal() => {}
    }
    tasks.abort_all();
    info!("agent server stopped");
    Ok(())
}

pub async fn run_server(config: AppConfig) -> Result<()> {
    let bind = config.server.bind.clone();
    let ctx = Arc::new(AppContext::from_config(config)?);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind agent server to {bind}"))?;
    serve(ctx, listener).await
}

pub(crate) async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "cannot listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use termagent_llm::Generator;
    use termagent_tools::{SearchHit, SearchProvider};

    struct FixedReply(&'static str);

    #[async_trait]
    impl Generator for FixedReply {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct OneHit;

    #[async_trait]
    impl SearchProvider for OneHit {
        async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
            Ok(vec![SearchHit {
                title: format!("{query} docs"),
                link: "https://docs.rs".into(),
                snippet: String::new(),
            }])
        }
    }

    const SEARCH_REPLY: &str = r#"{"mode":"tool_use","tool":"search","params":{"query":"axum"}}"#;

    struct TestServer {
        base: String,
        _workspace: tempfile::TempDir,
    }

    async fn start(reply: &'static str, api_key: &str) -> TestServer {
        let workspace = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.agent.workspace_path = workspace.path().display().to_string();
        config.server.api_key = api_key.to_string();
        config.server.keep_alive_secs = 1;

        let ctx = AppContext::new(
            config,
            Arc::new(FixedReply(reply)),
            Arc::new(OneHit),
            Arc::new(MemoryHistoryStore::default()),
            "system".to_string(),
        )
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, build_router(Arc::new(ctx))).await.unwrap();
        });
        TestServer {
            base,
            _workspace: workspace,
        }
    }

    async fn read_until(response: &mut reqwest::Response, needle: &str) -> String {
        let mut text = String::new();
        while !text.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
                .await
                .expect("timed out waiting for SSE data")
                .unwrap()
                .expect("stream ended early");
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        text
    }

    #[tokio::test]
    async fn health_check() {
        let server = start(SEARCH_REPLY, "").await;
        let body: Value = reqwest::get(format!("{}/", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["message"], "Termagent backend is running.");
        assert_eq!(body["queued_events"], 0);
        assert_eq!(body["consumer_attached"], false);
        assert_eq!(body["active_plans"], 0);
        assert_eq!(body["default_target"], "host");
        let rules = body["safety_rules"].as_array().unwrap();
        assert!(rules.iter().any(|rule| rule == "rm-rf"));
    }

    #[tokio::test]
    async fn health_reports_queue_state() {
        let server = start(SEARCH_REPLY, "").await;
        let client = reqwest::Client::new();
        client
            .post(format!("{}/chat", server.base))
            .json(&json!({"message": "find axum docs"}))
            .send()
            .await
            .unwrap();
        let _stream = client
            .get(format!("{}/sse", server.base))
            .send()
            .await
            .unwrap();

        let body: Value = client
            .get(format!("{}/", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["consumer_attached"], true);
        assert_eq!(body["dropped_events"], 0);
    }

    #[tokio::test]
    async fn chat_is_acknowledged_and_events_stream() {
        let server = start(SEARCH_REPLY, "").await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/chat", server.base))
            .json(&json!({"message": "find axum docs"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let ack: Value = response.json().await.unwrap();
        assert_eq!(ack["status"], "accepted");
        assert!(ack["request_id"].as_str().is_some());

        let mut stream = client
            .get(format!("{}/sse", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::OK);
        let text = read_until(&mut stream, "axum docs").await;
        assert!(text.contains("data: {\"type\":\"result\""));
        assert!(text.contains("\"tool_name\":\"search\""));
    }

    #[tokio::test]
    async fn second_event_stream_is_refused() {
        let server = start(SEARCH_REPLY, "").await;
        let client = reqwest::Client::new();
        let first = client
            .get(format!("{}/sse", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = client
            .get(format!("{}/sse", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        drop(first);
    }

    #[tokio::test]
    async fn bad_requests_are_400() {
        let server = start(SEARCH_REPLY, "").await;
        let client = reqwest::Client::new();

        let empty = client
            .post(format!("{}/chat", server.base))
            .json(&json!({"message": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

        let missing = client
            .post(format!("{}/chat", server.base))
            .json(&json!({"text": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        let body: Value = missing.json().await.unwrap();
        assert!(body["message"].as_str().unwrap().contains("message"));
    }

    #[tokio::test]
    async fn unusable_model_reply_is_502() {
        let server = start("let me think about that", "").await;
        let response = reqwest::Client::new()
            .post(format!("{}/chat", server.base))
            .json(&json!({"message": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn api_key_guards_chat_and_events_only() {
        let server = start(SEARCH_REPLY, "secret").await;
        let client = reqwest::Client::new();

        let denied = client
            .post(format!("{}/chat", server.base))
            .json(&json!({"message": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let wrong = client
            .get(format!("{}/sse", server.base))
            .header(API_KEY_HEADER, "guess")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let health = client.get(format!("{}/", server.base)).send().await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let allowed = client
            .post(format!("{}/chat", server.base))
            .header(API_KEY_HEADER, "secret")
            .json(&json!({"message": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::ACCEPTED);
    }
}
