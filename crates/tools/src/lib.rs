//! External tool collaborators used by the dispatcher and planning workflow.

pub mod google;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use google::GoogleSearch;

// ── Search ───────────────────────────────────────────────────────────────────

/// One formatted search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

/// A web-search backend.
///
/// An empty `Vec` means the query ran and matched nothing; any failure to run
/// it (missing credentials, HTTP error, bad payload) is `Err`.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>>;
}

/// Render hits as a compact plain-text block for inclusion in a prompt.
pub fn render_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "(no results)".to_string();
    }
    hits.iter()
        .map(|hit| format!("- {}\n  {}\n  {}", hit.title, hit.link, hit.snippet))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_empty() {
        assert_eq!(render_hits(&[]), "(no results)");
    }

    #[test]
    fn render_lists_every_hit() {
        let hits = vec![
            SearchHit {
                title: "Rust".into(),
                link: "https://rust-lang.org".into(),
                snippet: "A language".into(),
            },
            SearchHit {
                title: "Tokio".into(),
                link: "https://tokio.rs".into(),
                snippet: "Async runtime".into(),
            },
        ];
        let text = render_hits(&hits);
        assert!(text.starts_with("- Rust\n  https://rust-lang.org"));
        assert!(text.contains("- Tokio"));
        assert_eq!(text.lines().count(), 6);
    }
}
