//! Request dispatcher: `Idle → Evaluating → {ToolDispatch | Planning | Error} → Idle`.
//!
//! Each message is turned into one model call whose reply is decoded strictly
//! into a [`ToolCall`].  Tool calls run before `handle` returns and report
//! through the [`EventBus`]; plans run as background tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use termagent_config::ExecTarget;
use termagent_exec::{ExecChunk, ToolExecutor};
use termagent_llm::Generator;
use termagent_tools::SearchProvider;

use crate::bus::EventBus;
use crate::events::{Event, EventKind};
use crate::history::{HistoryEntry, HistoryStore, render_recent};
use crate::planning::PlanningWorkflow;
use crate::tasks::TaskRegistry;
use crate::tool_call::{DecisionError, ToolCall, parse_decision};

pub const DEFAULT_SESSION_ID: &str = "default_session";

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are Termagent, an autonomous coding agent that works in a terminal.
Decide how to handle the user's request and reply with exactly one JSON object and nothing else.

To run a single shell command:
{"mode": "tool_use", "tool": "shell", "params": {"command": "<command>", "target": "host", "timeout": 60}}
"target" is "host" or "isolated" (a sandboxed Linux distro) and is optional, as is "timeout" (seconds).

To run a single web search:
{"mode": "tool_use", "tool": "search", "params": {"query": "<query>"}}

For research that needs several searches before answering:
{"mode": "planning", "plan": ["<query 1>", "<query 2>"]}

Prefer one simple command over a clever one. Never use eval, nested shells, command
substitution or destructive deletes; such commands are refused."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    Evaluating,
    ToolDispatch,
    Planning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Planning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub status: AckStatus,
    pub request_id: Uuid,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error("upstream call failed: {0:#}")]
    Upstream(anyhow::Error),
    #[error("history store failed: {0:#}")]
    History(anyhow::Error),
}

pub struct RequestDispatcher {
    generator: Arc<dyn Generator>,
    search: Arc<dyn SearchProvider>,
    executor: Arc<ToolExecutor>,
    history: Arc<dyn HistoryStore>,
    bus: EventBus,
    tasks: Arc<TaskRegistry>,
    system_prompt: String,
    max_turns_in_prompt: usize,
    state: Mutex<DispatchState>,
    session_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RequestDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generator: Arc<dyn Generator>,
        search: Arc<dyn SearchProvider>,
        executor: Arc<ToolExecutor>,
        history: Arc<dyn HistoryStore>,
        bus: EventBus,
        tasks: Arc<TaskRegistry>,
        system_prompt: impl Into<String>,
        max_turns_in_prompt: usize,
    ) -> Self {
        Self {
            generator,
            search,
            executor,
            history,
            bus,
            tasks,
            system_prompt: system_prompt.into(),
            max_turns_in_prompt,
            state: Mutex::new(DispatchState::Idle),
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Most recent state transition.  With concurrent requests this is the
    /// last one any of them made.
    pub fn state(&self) -> DispatchState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, next: DispatchState) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(from = ?*state, to = ?next, "dispatch state");
        *state = next;
    }

    pub async fn handle(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<Acknowledgement, DispatchError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(DispatchError::EmptyMessage);
        }
        let request_id = Uuid::new_v4();
        let span = info_span!("dispatch", %request_id, session_id);

        let outcome = self
            .dispatch(request_id, session_id, message)
            .instrument(span)
            .await;
        if outcome.is_err() {
            self.transition(DispatchState::Error);
        }
        self.transition(DispatchState::Idle);
        outcome
    }

    async fn dispatch(
        &self,
        request_id: Uuid,
        session_id: &str,
        message: &str,
    ) -> Result<Acknowledgement, DispatchError> {
        self.transition(DispatchState::Evaluating);

        let history = match self.history.get(session_id).await {
            Ok(history) => history,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "history read failed");
                self.bus
                    .publish(Event::error(format!("Could not load session history: {err:#}")));
                return Err(DispatchError::History(err));
            }
        };

        let prompt = self.build_prompt(&history, message);
        let raw = match self.generator.generate(&prompt).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "model call failed");
                self.bus
                    .publish(Event::error(format!("Model call failed: {err:#}")));
                return Err(DispatchError::Upstream(err));
            }
        };

        let call = match parse_decision(&raw) {
            Ok(call) => call,
            Err(err) => {
                warn!(%err, "model reply rejected");
                self.bus.publish(Event::new(
                    EventKind::Error,
                    json!({"message": err.to_string(), "raw": err.raw()}),
                ));
                return Err(err.into());
            }
        };
        info!(tool = call.tool_name(), "decision parsed");

        let status = match &call {
            ToolCall::Shell {
                command,
                target,
                timeout_secs,
            } => {
                self.transition(DispatchState::ToolDispatch);
                self.run_shell(command, *target, *timeout_secs).await;
                AckStatus::Accepted
            }
            ToolCall::Search { query } => {
                self.transition(DispatchState::ToolDispatch);
                self.run_search(query).await?;
                AckStatus::Accepted
            }
            ToolCall::Planning { plan } => {
                self.transition(DispatchState::Planning);
                let workflow = PlanningWorkflow::new(
                    Arc::clone(&self.generator),
                    Arc::clone(&self.search),
                    self.bus.clone(),
                );
                let plan = plan.clone();
                let request = message.to_string();
                let span = info_span!("planning", %request_id);
                self.tasks.spawn(
                    request_id,
                    async move { workflow.run(plan, &request).await }.instrument(span),
                );
                AckStatus::Planning
            }
        };

        self.append_turn(session_id, HistoryEntry::new(message, call.to_json()))
            .await;
        Ok(Acknowledgement { status, request_id })
    }

    /// Re-read and extend the session's history under its lock, so turns from
    /// overlapping requests on one session are all kept.
    async fn append_turn(&self, session_id: &str, entry: HistoryEntry) {
        let lock = {
            let mut locks = self
                .session_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };

        {
            let _guard = lock.lock().await;
            let written = match self.history.get(session_id).await {
                Ok(mut history) => {
                    history.push(entry);
                    self.history.set(session_id, &history).await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                warn!(error = %format!("{err:#}"), "history write failed; turn not recorded");
            }
        }

        drop(lock);
        self.session_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn build_prompt(&self, history: &[HistoryEntry], message: &str) -> String {
        format!(
            "{}\n\n## Recent conversation\n{}\n\n## User request\n{message}\n",
            self.system_prompt,
            render_recent(history, self.max_turns_in_prompt),
        )
    }

    /// Events: `status` "Executing: …", one `result` per output line, the
    /// `status` exit marker, then a `result` with the full execution result.
    /// A refused command yields a single `denied` result.
    async fn run_shell(&self, command: &str, target: Option<ExecTarget>, timeout_secs: Option<u64>) {
        let mut output = match self.executor.shell(command, target, timeout_secs) {
            Ok(output) => output,
            Err(violation) => {
                self.bus.publish(
                    Event::result(json!({
                        "status": "denied",
                        "command": command,
                        "reason": violation.to_string(),
                    }))
                    .with_tool("shell"),
                );
                return;
            }
        };

        self.bus.publish(Event::status(format!("Executing: {command}")));
        let mut finished = false;
        while let Some(chunk) = output.next().await {
            match chunk {
                ExecChunk::Line { text, .. } => {
                    self.bus.publish(Event::result(text).with_tool("shell"));
                }
                ExecChunk::Finished(result) => {
                    finished = true;
                    self.bus.publish(Event::status(result.summary_line()));
                    let data = serde_json::to_value(&result).unwrap_or_else(|err| {
                        json!({"status": "error", "command": command, "message": err.to_string()})
                    });
                    self.bus.publish(Event::result(data).with_tool("shell"));
                }
            }
        }
        if !finished {
            self.bus
                .publish(Event::error(format!("Execution of '{command}' ended without a result")));
        }
    }

    async fn run_search(&self, query: &str) -> Result<(), DispatchError> {
        match self.search.search(query).await {
            Ok(hits) => {
                self.bus.publish(
                    Event::result(json!({"status": "success", "query": query, "results": hits}))
                        .with_tool("search"),
                );
                Ok(())
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), %query, "search failed");
                self.bus
                    .publish(Event::error(format!("Search failed: {err:#}")).with_tool("search"));
                Err(DispatchError::Upstream(err))
            }
        }
    }
}
