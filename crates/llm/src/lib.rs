use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use termagent_config::LlmConfig;

// ── Generator trait ──────────────────────────────────────────────────────────

/// A black-box text generator: one prompt in, one completion out.
///
/// Transport failures and non-success responses are `Err`.  Implementations
/// never smuggle error descriptions back as if they were model output.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    Ollama,
    OpenRouter,
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "openrouter" => Ok(Self::OpenRouter),
            other => bail!("unknown llm provider '{other}'"),
        }
    }
}

// ── Clients ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Generator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        if self.api_key.trim().is_empty() {
            bail!("Gemini API key is not configured (set GEMINI_API_KEY)");
        }
        let endpoint = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let payload = json!({
            "contents": [
                {"role": "user", "parts": [{"text": prompt}]}
            ]
        });

        let response = self
            .client
            .post(endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .context("Gemini request failed")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("Gemini response was not JSON")?;
        if !status.is_success() {
            bail!("Gemini error ({status}): {body}");
        }

        let text = body
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                    .collect::<String>()
            })
            .filter(|text| !text.is_empty());

        text.with_context(|| format!("Gemini response missing text: {body}"))
    }
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false
        });

        let response = self
            .client
            .post(endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Ollama unavailable at {}. Start Ollama and ensure model '{}' is installed",
                    self.base_url, self.model
                )
            })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("Ollama error ({status}): {body}");
        }

        body.get("response")
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
            .with_context(|| format!("Ollama response missing text: {body}"))
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Generator for OpenRouterClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        if self.api_key.trim().is_empty() {
            bail!("OpenRouter key missing. Set OPENROUTER_API_KEY or switch provider");
        }
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ]
        });

        let response = self
            .client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", "https://termagent.local")
            .header("X-Title", "Termagent")
            .json(&payload)
            .send()
            .await
            .context("OpenRouter request failed")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("OpenRouter error ({status}): {body}");
        }

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(ToString::to_string)
            .with_context(|| format!("OpenRouter response missing content: {body}"))
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Dispatches to the provider named in `[llm]`.
pub struct LlmRouter {
    provider: Provider,
    inner: Box<dyn Generator>,
}

impl LlmRouter {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let provider: Provider = config.provider.parse()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;

        let inner: Box<dyn Generator> = match provider {
            Provider::Gemini => Box::new(GeminiClient::new(
                client,
                config.gemini_api_key.clone(),
                config.gemini_model.clone(),
            )),
            Provider::Ollama => Box::new(OllamaClient::new(
                client,
                config.ollama_base_url.clone(),
                config.ollama_model.clone(),
            )),
            Provider::OpenRouter => Box::new(OpenRouterClient::new(
                client,
                config.openrouter_api_key.clone(),
                config.openrouter_model.clone(),
            )),
        };
        Ok(Self { provider, inner })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

#[async_trait]
impl Generator for LlmRouter {
    async fn generate(&self, prompt: &str) -> Result<String> {
        debug!(provider = ?self.provider, prompt_len = prompt.len(), "llm generate");
        self.inner.generate(prompt).await
    }
}

// ── Code fences ──────────────────────────────────────────────────────────────

/// Strip a leading ```` ``` ```` / ```` ```json ```` marker and a trailing
/// ```` ``` ```` marker from a model reply.
///
/// Only the outermost fence is removed; text that is not fence-wrapped is
/// returned trimmed but otherwise untouched.  No attempt is made to dig JSON
/// out of surrounding prose.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string (`json`, `JSON`, ...) up to the first newline.
        text = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        };
        text = text.trim_end();
        if let Some(body) = text.strip_suffix("```") {
            text = body;
        }
    }
    text.trim()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"mode\":\"planning\"}\n```";
        assert_eq!(strip_code_fences(raw), "{\"mode\":\"planning\"}");
    }

    #[test]
    fn strips_bare_fence_and_whitespace() {
        let raw = "\n  ```\n{\"a\":1}\n```  \n";
        assert_eq!(strip_code_fences(raw), "{\"a\":1}");
    }

    #[test]
    fn single_line_fence() {
        assert_eq!(strip_code_fences("```json{\"a\":1}```"), "{\"a\":1}");
    }

    #[test]
    fn unfenced_text_is_only_trimmed() {
        assert_eq!(strip_code_fences("  {\"a\":1}\n"), "{\"a\":1}");
        assert_eq!(strip_code_fences("Sure! {\"a\":1}"), "Sure! {\"a\":1}");
    }

    #[test]
    fn unterminated_fence_keeps_body() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn provider_parsing() {
        assert_eq!("gemini".parse::<Provider>().unwrap(), Provider::Gemini);
        assert_eq!("OpenRouter".parse::<Provider>().unwrap(), Provider::OpenRouter);
        assert!("gpt".parse::<Provider>().is_err());
    }

    #[test]
    fn provider_serde_roundtrip() {
        for provider in [Provider::Gemini, Provider::Ollama, Provider::OpenRouter] {
            let json = serde_json::to_string(&provider).unwrap();
            let back: Provider = serde_json::from_str(&json).unwrap();
            assert_eq!(back, provider);
        }
    }

    #[test]
    fn router_uses_configured_provider() {
        let config = LlmConfig {
            provider: "ollama".to_string(),
            ..LlmConfig::default()
        };
        let router = LlmRouter::from_config(&config).unwrap();
        assert_eq!(router.provider(), Provider::Ollama);
    }

    #[tokio::test]
    async fn missing_gemini_key_is_an_error() {
        let client = GeminiClient::new(reqwest::Client::new(), "", "gemini-1.5-pro");
        let err = client.generate("hi").await.unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[tokio::test]
    async fn unreachable_ollama_is_an_error() {
        let client = OllamaClient::new(reqwest::Client::new(), "http://127.0.0.1:1", "llama3.1:8b");
        assert!(client.generate("hi").await.is_err());
    }
}
