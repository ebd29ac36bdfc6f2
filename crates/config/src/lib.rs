use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ── Execution target ─────────────────────────────────────────────────────────

/// Where a shell command runs.
///
/// | Target     | Behaviour                                                   |
/// |------------|-------------------------------------------------------------|
/// | `host`     | `sh -c <command>` directly on the host.                     |
/// | `isolated` | Wrapped with the isolation tool, or sent to the remote API. |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecTarget {
    #[default]
    Host,
    Isolated,
}

impl std::str::FromStr for ExecTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "isolated" | "vm" | "sandbox" => Ok(Self::Isolated),
            other => anyhow::bail!("unknown execution target '{other}' (expected host or isolated)"),
        }
    }
}

/// How the `isolated` target is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Prefix the command with `sandbox.isolation_command` and run it locally.
    #[default]
    Wrap,
    /// POST the command to the isolated collaborator at `sandbox.remote_url`.
    Remote,
}

// ── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Root directory for patch targets and shell commands.
    pub workspace_path: String,
    /// Optional markdown file replacing the built-in dispatcher instruction.
    pub system_prompt_path: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Termagent".to_string(),
            workspace_path: ".".to_string(),
            system_prompt_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `gemini`, `ollama` or `openrouter`.
    pub provider: String,
    pub gemini_model: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    /// Overridden by `GEMINI_API_KEY` when set.
    pub gemini_api_key: String,
    /// Overridden by `OPENROUTER_API_KEY` when set.
    pub openrouter_api_key: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            gemini_model: "gemini-1.5-pro".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            gemini_api_key: String::new(),
            openrouter_api_key: String::new(),
            ollama_base_url: "http://localhost:11434".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub google_api_key: String,
    pub google_cse_id: String,
    pub num_results: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            google_api_key: String::new(),
            google_cse_id: String::new(),
            num_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Target used when the model does not name one.
    pub default_target: ExecTarget,
    pub isolation: IsolationMode,
    /// Argument vector prepended to `sh -c <command>` for the isolated target.
    pub isolation_command: Vec<String>,
    /// Base URL of the isolated `/execute` API (used when `isolation = "remote"`).
    pub remote_url: String,
    /// Applied when the model does not supply a timeout.  `0` disables it.
    pub default_timeout_secs: u64,
    /// Cap on captured stdout/stderr bytes.  Streaming is not capped.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_target: ExecTarget::Host,
            isolation: IsolationMode::Wrap,
            isolation_command: vec![
                "proot-distro".to_string(),
                "login".to_string(),
                "ubuntu".to_string(),
                "--".to_string(),
            ],
            remote_url: "http://127.0.0.1:8080".to_string(),
            default_timeout_secs: 120,
            max_output_bytes: 32_768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Additional regular expressions appended to the built-in deny list.
    pub extra_deny_patterns: Vec<String>,
    /// Suffix appended to a file path to derive its backup path.
    pub backup_suffix: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            extra_deny_patterns: vec![],
            backup_suffix: ".bak".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Listen address for `termagent sandbox-api` (inside the isolated distro).
    pub sandbox_api_bind: String,
    /// Queued events kept while no client drains them.  Oldest are dropped
    /// first once the limit is reached.
    pub event_queue_capacity: usize,
    /// When non-empty, `/chat` and `/sse` require a matching `X-API-Key`.
    pub api_key: String,
    pub keep_alive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            sandbox_api_bind: "127.0.0.1:8080".to_string(),
            event_queue_capacity: 10_000,
            api_key: String::new(),
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// `file` or `memory`.
    pub backend: String,
    pub dir: String,
    pub max_turns_in_prompt: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            dir: ".termagent/history".to_string(),
            max_turns_in_prompt: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// When set, logs are also written to daily-rolled `agent.log` files here.
    pub log_dir: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub sandbox: SandboxConfig,
    pub safety: SafetyConfig,
    pub server: ServerConfig,
    pub history: HistoryConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load from a TOML file (defaults when the file is absent) and apply
    /// environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("parse config file {}", path.display()))?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = non_empty_env("OLLAMA_BASE_URL") {
            self.llm.provider = "ollama".to_string();
            self.llm.ollama_base_url = value;
        }
        if let Some(key) = non_empty_env("GEMINI_API_KEY") {
            self.llm.gemini_api_key = key;
        }
        if let Some(key) = non_empty_env("OPENROUTER_API_KEY") {
            self.llm.openrouter_api_key = key;
        }
        if let Some(key) = non_empty_env("GOOGLE_API_KEY") {
            self.search.google_api_key = key;
        }
        if let Some(id) = non_empty_env("GOOGLE_CSE_ID") {
            self.search.google_cse_id = id;
        }
        if let Some(key) = non_empty_env("TERMAGENT_API_KEY") {
            self.server.api_key = key;
        }
        if let Some(bind) = non_empty_env("TERMAGENT_BIND") {
            self.server.bind = bind;
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        match self.llm.provider.to_ascii_lowercase().as_str() {
            "ollama" => &self.llm.ollama_model,
            "openrouter" => &self.llm.openrouter_model,
            _ => &self.llm.gemini_model,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_run_on_host_with_timeout() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.sandbox.default_target, ExecTarget::Host);
        assert_eq!(cfg.sandbox.isolation, IsolationMode::Wrap);
        assert_eq!(cfg.sandbox.default_timeout_secs, 120);
        assert_eq!(cfg.sandbox.isolation_command[0], "proot-distro");
        assert_eq!(cfg.safety.backup_suffix, ".bak");
        assert_eq!(cfg.server.bind, "127.0.0.1:8000");
        assert_eq!(cfg.history.backend, "file");
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.llm.gemini_model, "gemini-1.5-pro");
        assert_eq!(cfg.search.num_results, 5);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[sandbox]
default_target = "isolated"
isolation = "remote"
default_timeout_secs = 5

[server]
event_queue_capacity = 3
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.sandbox.default_target, ExecTarget::Isolated);
        assert_eq!(cfg.sandbox.isolation, IsolationMode::Remote);
        assert_eq!(cfg.sandbox.default_timeout_secs, 5);
        assert_eq!(cfg.sandbox.max_output_bytes, 32_768);
        assert_eq!(cfg.server.event_queue_capacity, 3);
        assert_eq!(cfg.server.bind, "127.0.0.1:8000");
    }

    #[test]
    fn shipped_sample_matches_defaults() {
        let cfg: AppConfig = toml::from_str(include_str!("../../../config/default.toml")).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(cfg.sandbox.isolation_command, defaults.sandbox.isolation_command);
        assert_eq!(cfg.server.event_queue_capacity, defaults.server.event_queue_capacity);
        assert_eq!(cfg.history.dir, defaults.history.dir);
        assert_eq!(cfg.agent.system_prompt_path, None);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[sandbox\nbroken").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("parse config file"));
    }

    #[test]
    fn save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cfg.toml");
        let mut cfg = AppConfig::default();
        cfg.llm.openrouter_model = "deepseek/deepseek-chat".to_string();
        cfg.safety.extra_deny_patterns = vec![r"\bshutdown\b".to_string()];
        cfg.save_to(&path).unwrap();

        let back = AppConfig::load_from(&path).unwrap();
        assert_eq!(back.llm.openrouter_model, "deepseek/deepseek-chat");
        assert_eq!(back.safety.extra_deny_patterns, vec![r"\bshutdown\b"]);
    }

    #[test]
    fn exec_target_parsing() {
        assert_eq!("host".parse::<ExecTarget>().unwrap(), ExecTarget::Host);
        assert_eq!("Isolated".parse::<ExecTarget>().unwrap(), ExecTarget::Isolated);
        assert!("moon".parse::<ExecTarget>().is_err());
        assert_eq!(serde_json::to_string(&ExecTarget::Isolated).unwrap(), "\"isolated\"");
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_google_keys_override_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("search.toml");
        fs::write(
            &path,
            r#"
[search]
google_api_key = "from-file"
google_cse_id = "cse-file"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for these env vars.
        unsafe { env::set_var("GOOGLE_API_KEY", "from-env") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.search.google_api_key, "from-env");
        assert_eq!(cfg.search.google_cse_id, "cse-file");
        unsafe { env::remove_var("GOOGLE_API_KEY") };
    }

    #[test]
    fn env_ollama_base_url_forces_ollama_provider() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(&path, "[llm]\nprovider = \"gemini\"\n").unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("OLLAMA_BASE_URL", "http://custom:11434") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.llm.provider, "ollama");
        assert_eq!(cfg.llm.ollama_base_url, "http://custom:11434");
        unsafe { env::remove_var("OLLAMA_BASE_URL") };
    }
}
