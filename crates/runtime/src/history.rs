//! Per-session conversation history behind a get/set contract.
//!
//! The dispatcher reads a session's turns before asking the model and writes
//! the extended list back after a successful dispatch.  Two backends ship: one
//! JSON file per session under `[history].dir`, and an in-process map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use termagent_config::HistoryConfig;

/// One completed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user_message: String,
    /// The decoded decision the model made for this message.
    pub agent_response: Value,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(user_message: impl Into<String>, agent_response: Value) -> Self {
        Self {
            user_message: user_message.into(),
            agent_response,
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// All turns of `session_id`, oldest first.  Unknown sessions are empty.
    async fn get(&self, session_id: &str) -> Result<Vec<HistoryEntry>>;
    /// Replace the stored turns of `session_id`.
    async fn set(&self, session_id: &str, history: &[HistoryEntry]) -> Result<()>;
}

pub fn store_from_config(config: &HistoryConfig) -> Result<Arc<dyn HistoryStore>> {
    match config.backend.trim().to_ascii_lowercase().as_str() {
        "file" => Ok(Arc::new(FileHistoryStore::new(&config.dir))),
        "memory" => Ok(Arc::new(MemoryHistoryStore::default())),
        other => bail!("unknown history backend '{other}' (expected file or memory)"),
    }
}

/// Render the last `max_turns` turns for inclusion in a prompt.
pub fn render_recent(history: &[HistoryEntry], max_turns: usize) -> String {
    let start = history.len().saturating_sub(max_turns);
    let recent = &history[start..];
    if recent.is_empty() {
        return "(no previous turns)".to_string();
    }
    recent
        .iter()
        .map(|entry| format!("User: {}\nAgent: {}", entry.user_message, entry.agent_response))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── File backend ─────────────────────────────────────────────────────────────

/// `<dir>/<session>.json`, one JSON array per session.
pub struct FileHistoryStore {
    dir: PathBuf,
}

impl FileHistoryStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        // Session ids come from clients; keep them to one plain path segment.
        let name: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = if name.is_empty() { "_".to_string() } else { name };
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn get(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        let path = self.session_path(session_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read history file {}", path.display()));
            }
        };
        serde_json::from_str(&text)
            .with_context(|| format!("parse history file {}", path.display()))
    }

    async fn set(&self, session_id: &str, history: &[HistoryEntry]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create history dir {}", self.dir.display()))?;
        let path = self.session_path(session_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(history).context("serialize history")?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("write history file {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replace history file {}", path.display()))?;
        Ok(())
    }
}

// ── Memory backend ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryHistoryStore {
    sessions: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn get(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn set(&self, session_id: &str, history: &[HistoryEntry]) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        sessions.insert(session_id.to_string(), history.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn file_store_roundtrip_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("history"));

        assert!(store.get("s1").await.unwrap().is_empty());

        let turns = vec![HistoryEntry::new("list files", json!({"mode": "tool_use"}))];
        store.set("s1", &turns).await.unwrap();
        assert_eq!(store.get("s1").await.unwrap(), turns);
        assert!(store.get("s2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_confines_session_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path());
        store
            .set("../escape", &[HistoryEntry::new("hi", json!(null))])
            .await
            .unwrap();
        assert!(dir.path().join("___escape.json").exists());
        assert!(!dir.path().parent().unwrap().join("escape.json").exists());
    }

    #[tokio::test]
    async fn corrupt_history_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = FileHistoryStore::new(dir.path());
        let err = store.get("bad").await.unwrap_err();
        assert!(err.to_string().contains("parse history file"));
    }

    #[tokio::test]
    async fn memory_store_replaces_turns() {
        let store = MemoryHistoryStore::default();
        store.set("s", &[HistoryEntry::new("a", json!(1))]).await.unwrap();
        store
            .set("s", &[HistoryEntry::new("a", json!(1)), HistoryEntry::new("b", json!(2))])
            .await
            .unwrap();
        assert_eq!(store.get("s").await.unwrap().len(), 2);
    }

    #[test]
    fn render_keeps_most_recent_turns() {
        let history: Vec<_> = (0..5)
            .map(|i| HistoryEntry::new(format!("m{i}"), json!(i)))
            .collect();
        let text = render_recent(&history, 2);
        assert!(!text.contains("m2"));
        assert!(text.starts_with("User: m3\nAgent: 3"));
        assert_eq!(render_recent(&[], 10), "(no previous turns)");
    }

    #[test]
    fn backend_selection() {
        let mut config = HistoryConfig::default();
        config.backend = "memory".to_string();
        assert!(store_from_config(&config).is_ok());
        config.backend = "redis".to_string();
        assert!(store_from_config(&config).is_err());
    }

    #[test]
    fn entries_without_timestamp_still_load() {
        let entry: HistoryEntry =
            serde_json::from_value(json!({"user_message": "x", "agent_response": {}})).unwrap();
        assert_eq!(entry.user_message, "x");
    }
}
