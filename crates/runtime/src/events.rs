use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Result,
    Error,
    Plan,
    PlanStepResult,
    FinalReport,
}

/// One frame on the event stream.  Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    /// 1-based plan step, for `plan_step_result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, data: impl Into<Value>) -> Self {
        Self {
            kind,
            data: data.into(),
            step: None,
            tool_name: None,
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::new(EventKind::Status, message.into())
    }

    pub fn result(data: impl Into<Value>) -> Self {
        Self::new(EventKind::Result, data)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, message.into())
    }

    pub fn plan(plan: &[String]) -> Self {
        Self::new(EventKind::Plan, plan.to_vec())
    }

    pub fn plan_step_result(step: usize, data: impl Into<Value>) -> Self {
        Self {
            step: Some(step),
            ..Self::new(EventKind::PlanStepResult, data)
        }
    }

    pub fn final_report(report: impl Into<String>) -> Self {
        Self::new(EventKind::FinalReport, report.into())
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn optional_fields_are_omitted() {
        let json = serde_json::to_value(Event::status("Executing: ls")).unwrap();
        assert_eq!(json, json!({"type": "status", "data": "Executing: ls"}));
    }

    #[test]
    fn step_and_tool_are_serialized() {
        let event = Event::plan_step_result(2, json!({"query": "q2"})).with_tool("search");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "plan_step_result");
        assert_eq!(json["step"], 2);
        assert_eq!(json["tool_name"], "search");
    }

    #[test]
    fn plan_carries_queries() {
        let event = Event::plan(&["a".to_string(), "b".to_string()]);
        assert_eq!(event.data, json!(["a", "b"]));
        assert_eq!(
            serde_json::to_value(EventKind::FinalReport).unwrap(),
            json!("final_report")
        );
    }
}
