//! LLM oracle seam.
//!
//! The engine treats the model as a text-in/text-out oracle behind
//! [`LlmClient`]. The bundled HTTP implementation speaks the
//! OpenAI-compatible chat-completions shape, which every supported provider
//! exposes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::domain::{ExecOptions, MakerError, Result};

/// Text-in/text-out completion oracle.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// HTTP chat-completions client.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpLlmClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("maker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MakerError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// Build a client from options; `None` when no API key is configured.
    pub fn from_options(opts: &ExecOptions) -> Result<Option<Self>> {
        if opts.ai_api_key.is_empty() {
            return Ok(None);
        }
        let base = match opts.ai_provider.as_str() {
            "" | "openai" => "https://api.openai.com/v1",
            "groq" => "https://api.groq.com/openai/v1",
            "ollama" => "http://localhost:11434/v1",
            other if other.starts_with("http") => other,
            other => {
                return Err(MakerError::Llm(format!("unknown ai provider: {other}")));
            }
        };
        let model = if opts.ai_profile.is_empty() {
            "gpt-4o-mini"
        } else {
            &opts.ai_profile
        };
        Ok(Some(Self::new(base, &opts.ai_api_key, model)?))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0,
        });

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(MakerError::Llm(format!("provider returned {status}: {text}")));
        }

        let parsed: ChatResponse = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| MakerError::Llm("empty choices in response".to_string()))
    }
}

/// Extract the first JSON object or array from a completion.
///
/// Tolerates markdown code fences and prose around the payload.
pub fn extract_json_block(text: &str) -> Option<String> {
    let text = text.trim();

    // Fenced block first.
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return Some(inner.to_string());
            }
        }
    }

    // Otherwise the outermost brace/bracket span.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if end > start {
                return Some(text[start..=end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_block_from_fence() {
        let text = "Here is the plan:\n```json\n{\"commands\": []}\n```\nDone.";
        assert_eq!(
            extract_json_block(text).as_deref(),
            Some("{\"commands\": []}")
        );
    }

    #[test]
    fn test_extract_json_block_bare_object() {
        let text = "sure: {\"a\": 1} trailing";
        assert_eq!(extract_json_block(text).as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_block_array() {
        let text = "[\n[\"iam\", \"create-role\"]\n]";
        let block = extract_json_block(text).expect("block");
        let parsed: serde_json::Value = serde_json::from_str(&block).expect("parse");
        assert!(parsed.is_array());
    }

    #[test]
    fn test_extract_json_block_none() {
        assert!(extract_json_block("no json here").is_none());
    }

    #[test]
    fn test_from_options_requires_key() {
        let opts = ExecOptions::default();
        assert!(HttpLlmClient::from_options(&opts)
            .expect("build")
            .is_none());
    }

    #[test]
    fn test_from_options_rejects_unknown_provider() {
        let opts = ExecOptions {
            ai_api_key: "k".to_string(),
            ai_provider: "mystery".to_string(),
            ..Default::default()
        };
        assert!(HttpLlmClient::from_options(&opts).is_err());
    }
}
