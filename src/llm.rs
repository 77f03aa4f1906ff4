use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// A chat-completion backend: one system message, one user message, raw text back.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String>;
}

/// OpenAI-compatible chat-completion client (OpenRouter by default).
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Self::new(
            config.api_key.clone(),
            config.model.clone(),
            config.base_url.clone(),
            config.llm_timeout,
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionModel for LlmClient {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message}
            ]
        });

        debug!("Calling {} ({} prompt chars)", self.model, system_prompt.len());

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Upstream(format!("LLM API call failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AgentError::Upstream(format!("LLM API returned an error: {}", e)))?;

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Upstream(format!("Failed to parse LLM response: {}", e)))?;

        reply_content(&response_json)
    }
}

/// Pull `choices[0].message.content` out of a completion response body.
pub fn reply_content(response_json: &serde_json::Value) -> Result<String> {
    response_json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AgentError::Upstream("No content in LLM response".to_string()))
}
