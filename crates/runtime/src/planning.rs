//! Multi-step research: run each planned search in order, then ask the model
//! for one synthesized report.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use termagent_llm::Generator;
use termagent_tools::{SearchHit, SearchProvider, render_hits};

use crate::bus::EventBus;
use crate::events::Event;

pub struct PlanningWorkflow {
    generator: Arc<dyn Generator>,
    search: Arc<dyn SearchProvider>,
    bus: EventBus,
}

impl PlanningWorkflow {
    pub fn new(generator: Arc<dyn Generator>, search: Arc<dyn SearchProvider>, bus: EventBus) -> Self {
        Self {
            generator,
            search,
            bus,
        }
    }

    /// Emits `plan`, one `plan_step_result` per step, then either
    /// `final_report` or, if synthesis fails, `error`.
    pub async fn run(&self, plan: Vec<String>, original_request: &str) {
        info!(steps = plan.len(), "planning workflow started");
        self.bus.publish(Event::plan(&plan));

        let mut findings: Vec<(usize, &str, Vec<SearchHit>)> = Vec::new();
        for (index, query) in plan.iter().enumerate() {
            let step = index + 1;
            match self.search.search(query).await {
                Ok(hits) => {
                    self.bus.publish(
                        Event::plan_step_result(
                            step,
                            json!({"query": query, "status": "success", "results": hits}),
                        )
                        .with_tool("search"),
                    );
                    findings.push((step, query.as_str(), hits));
                }
                Err(err) => {
                    warn!(step, %query, error = %format!("{err:#}"), "plan step failed");
                    self.bus.publish(
                        Event::plan_step_result(
                            step,
                            json!({"query": query, "status": "error", "message": format!("{err:#}")}),
                        )
                        .with_tool("search"),
                    );
                }
            }
        }

        let prompt = synthesis_prompt(original_request, &findings);
        match self.generator.generate(&prompt).await {
            Ok(report) => {
                info!(succeeded = findings.len(), "planning workflow finished");
                self.bus.publish(Event::final_report(report.trim()));
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "report synthesis failed");
                self.bus
                    .publish(Event::error(format!("Failed to synthesize final report: {err:#}")));
            }
        }
    }
}

/// Only successful steps are included.
fn synthesis_prompt(original_request: &str, findings: &[(usize, &str, Vec<SearchHit>)]) -> String {
    let body = if findings.is_empty() {
        "None of the searches succeeded.".to_string()
    } else {
        findings
            .iter()
            .map(|(step, query, hits)| format!("### Step {step}: {query}\n{}", render_hits(hits)))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    format!(
        "You are a research assistant. The user asked:\n\n{original_request}\n\n\
         You ran a series of web searches. Using only the findings below, write a \
         concise, well-structured report that answers the request. Cite links \
         where they support a claim, and say plainly if the findings are not enough.\n\n\
         ## Findings\n\n{body}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingGenerator {
        prompts: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Generator for RecordingGenerator {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail {
                bail!("model unavailable");
            }
            Ok("Final answer.".to_string())
        }
    }

    /// Fails for any query named in `failing`.
    struct ScriptedSearch {
        failing: Vec<&'static str>,
    }

    #[async_trait]
    impl SearchProvider for ScriptedSearch {
        async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
            if self.failing.iter().any(|failing| *failing == query) {
                bail!("quota exceeded");
            }
            Ok(vec![SearchHit {
                title: format!("about {query}"),
                link: format!("https://example.com/{query}"),
                snippet: "snippet".to_string(),
            }])
        }
    }

    async fn collect(bus: &EventBus, count: usize) -> Vec<Event> {
        let mut drain = bus.drain().unwrap();
        let mut events = Vec::new();
        for _ in 0..count {
            events.push(drain.recv().await);
        }
        assert!(bus.is_empty(), "unexpected extra events");
        events
    }

    #[tokio::test]
    async fn failed_step_is_reported_but_excluded_from_synthesis() {
        let bus = EventBus::new(64);
        let generator = Arc::new(RecordingGenerator {
            prompts: Mutex::new(Vec::new()),
            fail: false,
        });
        let workflow = PlanningWorkflow::new(
            generator.clone(),
            Arc::new(ScriptedSearch { failing: vec!["q1"] }),
            bus.clone(),
        );

        workflow
            .run(vec!["q1".into(), "q2".into()], "compare things")
            .await;

        let events = collect(&bus, 4).await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [
                EventKind::Plan,
                EventKind::PlanStepResult,
                EventKind::PlanStepResult,
                EventKind::FinalReport
            ]
        );
        assert_eq!(events[1].step, Some(1));
        assert_eq!(events[1].data["status"], "error");
        assert_eq!(events[2].step, Some(2));
        assert_eq!(events[2].data["status"], "success");
        assert_eq!(events[3].data, "Final answer.");

        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("about q2"));
        assert!(!prompts[0].contains("q1"));
    }

    #[tokio::test]
    async fn synthesis_failure_ends_with_error() {
        let bus = EventBus::new(64);
        let workflow = PlanningWorkflow::new(
            Arc::new(RecordingGenerator {
                prompts: Mutex::new(Vec::new()),
                fail: true,
            }),
            Arc::new(ScriptedSearch { failing: vec![] }),
            bus.clone(),
        );
        workflow.run(vec!["only".into()], "question").await;

        let events = collect(&bus, 3).await;
        assert_eq!(events[2].kind, EventKind::Error);
        assert!(events[2].data.as_str().unwrap().contains("model unavailable"));
    }

    #[tokio::test]
    async fn all_steps_failing_still_synthesizes_once() {
        let bus = EventBus::new(64);
        let generator = Arc::new(RecordingGenerator {
            prompts: Mutex::new(Vec::new()),
            fail: false,
        });
        let workflow = PlanningWorkflow::new(
            generator.clone(),
            Arc::new(ScriptedSearch {
                failing: vec!["a", "b"],
            }),
            bus.clone(),
        );
        workflow.run(vec!["a".into(), "b".into()], "question").await;

        let events = collect(&bus, 4).await;
        assert_eq!(events[3].kind, EventKind::FinalReport);
        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("None of the searches succeeded."));
    }
}
