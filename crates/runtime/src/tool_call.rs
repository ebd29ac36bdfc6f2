//! Strict decoding of the model's routing decision.
//!
//! The reply must be exactly one JSON object (optionally fence-wrapped) of
//! the form
//!
//! ```json
//! {"mode": "tool_use", "tool": "shell",  "params": {"command": "ls", "target": "host", "timeout": 30}}
//! {"mode": "tool_use", "tool": "search", "params": {"query": "..."}}
//! {"mode": "planning", "plan": ["query 1", "query 2"]}
//! ```
//!
//! Anything else is rejected whole; no field of an invalid decision is used.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

use termagent_config::ExecTarget;
use termagent_llm::strip_code_fences;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    Shell {
        command: String,
        target: Option<ExecTarget>,
        timeout_secs: Option<u64>,
    },
    Search {
        query: String,
    },
    Planning {
        plan: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("model reply is not a valid decision: {reason}")]
    Malformed { raw: String, reason: String },
    #[error("model chose unknown mode '{mode}'")]
    UnknownMode { raw: String, mode: String },
    #[error("model chose unknown tool '{tool}'")]
    UnknownTool { raw: String, tool: String },
}

impl DecisionError {
    /// The model reply exactly as received.
    pub fn raw(&self) -> &str {
        match self {
            Self::Malformed { raw, .. }
            | Self::UnknownMode { raw, .. }
            | Self::UnknownTool { raw, .. } => raw,
        }
    }
}

impl ToolCall {
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "shell",
            Self::Search { .. } => "search",
            Self::Planning { .. } => "planning",
        }
    }

    /// Canonical JSON form, as stored in session history.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Shell {
                command,
                target,
                timeout_secs,
            } => {
                let mut params = Map::new();
                params.insert("command".into(), json!(command));
                if let Some(target) = target {
                    params.insert("target".into(), json!(target));
                }
                if let Some(timeout) = timeout_secs {
                    params.insert("timeout".into(), json!(timeout));
                }
                json!({"mode": "tool_use", "tool": "shell", "params": params})
            }
            Self::Search { query } => {
                json!({"mode": "tool_use", "tool": "search", "params": {"query": query}})
            }
            Self::Planning { plan } => json!({"mode": "planning", "plan": plan}),
        }
    }
}

/// Wire shape of a decision.  Field types are checked here; emptiness and
/// tool names in [`TryFrom`].
#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum WireDecision {
    ToolUse {
        tool: String,
        #[serde(default)]
        params: Option<WireParams>,
    },
    Planning {
        plan: Vec<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Union of the parameters every tool accepts; unrelated keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct WireParams {
    command: Option<String>,
    query: Option<String>,
    target: Option<ExecTarget>,
    /// Older replies select the target with a boolean.
    in_vm: Option<bool>,
    timeout: Option<u64>,
}

#[derive(Debug)]
enum Rejection {
    Invalid(&'static str),
    UnknownMode,
    UnknownTool(String),
}

impl TryFrom<WireDecision> for ToolCall {
    type Error = Rejection;

    fn try_from(wire: WireDecision) -> Result<Self, Rejection> {
        match wire {
            WireDecision::ToolUse { tool, params } => {
                let params = params.unwrap_or_default();
                match tool.as_str() {
                    "shell" => Ok(ToolCall::Shell {
                        command: non_empty(params.command).ok_or(Rejection::Invalid(
                            "shell call needs a non-empty params.command",
                        ))?,
                        target: params.target.or(params.in_vm.map(|isolated| {
                            if isolated {
                                ExecTarget::Isolated
                            } else {
                                ExecTarget::Host
                            }
                        })),
                        timeout_secs: params.timeout,
                    }),
                    "search" | "google_search" => Ok(ToolCall::Search {
                        query: non_empty(params.query).ok_or(Rejection::Invalid(
                            "search call needs a non-empty params.query",
                        ))?,
                    }),
                    _ => Err(Rejection::UnknownTool(tool)),
                }
            }
            WireDecision::Planning { plan } => {
                let plan = plan
                    .into_iter()
                    .map(|step| non_empty(Some(step)))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(Rejection::Invalid("every plan step must be a non-empty string"))?;
                if plan.is_empty() {
                    return Err(Rejection::Invalid("plan must contain at least one step"));
                }
                Ok(ToolCall::Planning { plan })
            }
            WireDecision::Unknown => Err(Rejection::UnknownMode),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse_decision(raw: &str) -> Result<ToolCall, DecisionError> {
    let malformed = |reason: String| DecisionError::Malformed {
        raw: raw.to_string(),
        reason,
    };

    let value: Value = serde_json::from_str(strip_code_fences(raw))
        .map_err(|err| malformed(format!("invalid JSON ({err})")))?;
    let wire = WireDecision::deserialize(&value).map_err(|err| malformed(err.to_string()))?;

    ToolCall::try_from(wire).map_err(|rejection| match rejection {
        Rejection::Invalid(reason) => malformed(reason.to_string()),
        Rejection::UnknownMode => DecisionError::UnknownMode {
            raw: raw.to_string(),
            mode: value
                .get("mode")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        Rejection::UnknownTool(tool) => DecisionError::UnknownTool {
            raw: raw.to_string(),
            tool,
        },
    })
}
