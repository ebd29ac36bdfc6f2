pub mod patch;
pub mod safety;
pub mod sandbox;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use termagent_config::{AppConfig, ExecTarget};

pub use patch::{BackupRecord, PatchError, PatchOutcome, backup_then_apply_patch};
pub use safety::{SafetyGuard, SafetyViolation};
pub use sandbox::{
    ExecChunk, ExecStatus, ExecutionResult, OutputSource, OutputStream, SandboxExecutor,
};

// ── Execution Policy ─────────────────────────────────────────────────────────

/// Built from `[agent]`, `[sandbox]` and `[safety]` in `AppConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Shell commands run here; patch targets must resolve inside it.
    pub workspace_root: PathBuf,
    /// Target used when a tool call does not name one.
    pub default_target: ExecTarget,
    pub backup_suffix: String,
}

impl ExecutionPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workspace_root: PathBuf::from(&config.agent.workspace_path),
            default_target: config.sandbox.default_target,
            backup_suffix: config.safety.backup_suffix.clone(),
        }
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            default_target: ExecTarget::Host,
            backup_suffix: ".bak".to_string(),
        }
    }
}

// ── Tool Executor ────────────────────────────────────────────────────────────

/// The only way the runtime touches the machine: every shell command passes
/// the [`SafetyGuard`] before reaching the [`SandboxExecutor`], and every
/// patch is confined to the workspace and backed up.
pub struct ToolExecutor {
    policy: ExecutionPolicy,
    guard: SafetyGuard,
    sandbox: SandboxExecutor,
}

impl ToolExecutor {
    pub fn new(policy: ExecutionPolicy, guard: SafetyGuard, sandbox: SandboxExecutor) -> Self {
        Self {
            policy,
            guard,
            sandbox,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let policy = ExecutionPolicy::from_config(config);
        let guard = SafetyGuard::new(&config.safety.extra_deny_patterns)?;
        let sandbox = SandboxExecutor::new(config.sandbox.clone(), policy.workspace_root.clone())?;
        Ok(Self::new(policy, guard, sandbox))
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn guard(&self) -> &SafetyGuard {
        &self.guard
    }

    pub fn resolve_timeout(&self, requested_secs: Option<u64>) -> Option<Duration> {
        self.sandbox.resolve_timeout(requested_secs)
    }

    /// Check `command` and, if allowed, start it.
    ///
    /// A denied command never reaches the sandbox.
    pub fn shell(
        &self,
        command: &str,
        target: Option<ExecTarget>,
        timeout_secs: Option<u64>,
    ) -> Result<OutputStream, SafetyViolation> {
        self.guard.check(command)?;
        let target = target.unwrap_or(self.policy.default_target);
        let timeout = self.sandbox.resolve_timeout(timeout_secs);
        info!(%command, ?target, ?timeout, "executing shell tool");
        Ok(self.sandbox.stream(command, target, timeout))
    }

    /// [`shell`](Self::shell), collected.
    pub async fn run_shell(
        &self,
        command: &str,
        target: Option<ExecTarget>,
        timeout_secs: Option<u64>,
    ) -> Result<ExecutionResult, SafetyViolation> {
        Ok(self.shell(command, target, timeout_secs)?.finish().await)
    }

    /// Back up and patch `path` (relative paths resolve against the
    /// workspace).  Targets outside the workspace are refused.
    pub async fn apply_patch(
        &self,
        path: &Path,
        patch_text: &str,
    ) -> Result<PatchOutcome, PatchError> {
        let target = self.contain(path)?;
        let suffix = self.policy.backup_suffix.clone();
        let patch_text = patch_text.to_string();
        info!(path = %target.display(), "applying patch");

        tokio::task::spawn_blocking(move || backup_then_apply_patch(&target, &patch_text, &suffix))
            .await
            .map_err(|err| PatchError::Write {
                path: path.to_path_buf(),
                source: std::io::Error::other(err),
            })?
    }

    /// Canonicalise `path` and verify it lies under the workspace root.
    fn contain(&self, path: &Path) -> Result<PathBuf, PatchError> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.policy.workspace_root.join(path)
        };
        let read_err = |target: &Path| {
            let target = target.to_path_buf();
            move |source: std::io::Error| PatchError::Read {
                path: target,
                source,
            }
        };
        let root = self
            .policy
            .workspace_root
            .canonicalize()
            .map_err(read_err(self.policy.workspace_root.as_path()))?;
        let target = joined.canonicalize().map_err(read_err(joined.as_path()))?;
        if !target.starts_with(&root) {
            return Err(PatchError::OutsideWorkspace(target));
        }
        Ok(target)
    }
}
