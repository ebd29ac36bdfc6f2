use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use termagent_config::AppConfig;
use termagent_exec::ToolExecutor;
use termagent_llm::{Generator, LlmRouter};
use termagent_tools::SearchProvider;
use termagent_tools::google::GoogleSearch;

use crate::bus::EventBus;
use crate::dispatcher::{DEFAULT_SYSTEM_PROMPT, RequestDispatcher};
use crate::history::{HistoryStore, store_from_config};
use crate::tasks::TaskRegistry;

/// Everything a server process shares between requests.
pub struct AppContext {
    pub config: AppConfig,
    pub bus: EventBus,
    pub dispatcher: Arc<RequestDispatcher>,
    pub executor: Arc<ToolExecutor>,
    pub tasks: Arc<TaskRegistry>,
}

impl AppContext {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let generator: Arc<dyn Generator> = Arc::new(LlmRouter::from_config(&config.llm)?);
        let search: Arc<dyn SearchProvider> = Arc::new(GoogleSearch::from_config(&config.search)?);
        let history = store_from_config(&config.history)?;
        let system_prompt = load_system_prompt(&config);
        info!(
            provider = %config.llm.provider,
            model = %config.active_model(),
            history = %config.history.backend,
            "agent context ready"
        );
        Self::new(config, generator, search, history, system_prompt)
    }

    /// Assemble a context around the given collaborators.
    pub fn new(
        config: AppConfig,
        generator: Arc<dyn Generator>,
        search: Arc<dyn SearchProvider>,
        history: Arc<dyn HistoryStore>,
        system_prompt: String,
    ) -> Result<Self> {
        let executor = Arc::new(ToolExecutor::from_config(&config)?);
        let bus = EventBus::new(config.server.event_queue_capacity);
        let tasks = Arc::new(TaskRegistry::new());
        let dispatcher = Arc::new(RequestDispatcher::new(
            generator,
            search,
            Arc::clone(&executor),
            history,
            bus.clone(),
            Arc::clone(&tasks),
            system_prompt,
            config.history.max_turns_in_prompt,
        ));
        Ok(Self {
            config,
            bus,
            dispatcher,
            executor,
            tasks,
        })
    }
}

/// The configured prompt file, or the built-in instruction when none is set
/// or it cannot be read.
fn load_system_prompt(config: &AppConfig) -> String {
    let Some(path) = config
        .agent
        .system_prompt_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    else {
        return DEFAULT_SYSTEM_PROMPT.to_string();
    };
    match std::fs::read_to_string(path) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(%path, %err, "cannot read system prompt; using the built-in one");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_falls_back_to_builtin() {
        let config = AppConfig::default();
        assert_eq!(load_system_prompt(&config), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn system_prompt_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.md");
        std::fs::write(&path, "Be brief.").unwrap();
        let mut config = AppConfig::default();
        config.agent.system_prompt_path = Some(path.display().to_string());
        assert_eq!(load_system_prompt(&config), "Be brief.");
    }

    #[test]
    fn unreadable_system_prompt_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.agent.system_prompt_path = Some(dir.path().join("missing.md").display().to_string());
        assert_eq!(load_system_prompt(&config), DEFAULT_SYSTEM_PROMPT);
    }
}
