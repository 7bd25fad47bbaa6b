//! Model provider clients
//!
//! Thin reqwest clients for the embeddings and chat-completions endpoints,
//! behind traits so the pipeline can be driven by test doubles.

use crate::config::SamplingConfig;
use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Token counts reported by the completion provider, when available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

/// A single completion returned by the model.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    /// Provider-reported usage. `None` when the provider omits it, in which
    /// case callers fall back to a length-based estimate.
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<Completion>;
}

/// Embedding client using the OpenAI embeddings API.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String, // e.g., "text-embedding-3-small"
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    pub fn openai(api_key: String) -> Self {
        Self::new(
            api_key,
            "https://api.openai.com/v1".to_string(),
            "text-embedding-3-small".to_string(),
        )
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NlqError::Provider(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NlqError::Provider(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NlqError::Provider(format!("Failed to parse embedding response: {}", e)))?;

        let data = response_json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|arr| arr.first())
            .ok_or_else(|| NlqError::Provider("No embedding data in response".to_string()))?;

        let embedding: Vec<f32> = data
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| NlqError::Provider("No embedding vector in response".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        Ok(embedding)
    }
}

/// Chat-completions client used for SQL generation.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String, // e.g., "gpt-4o"
}

impl OpenAiChatClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    pub fn openai(api_key: String) -> Self {
        Self::new(
            api_key,
            "https://api.openai.com/v1".to_string(),
            "gpt-4o".to_string(),
        )
    }
}

#[async_trait]
impl CompletionProvider for OpenAiChatClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": sampling.temperature,
            "top_p": sampling.top_p,
            "frequency_penalty": sampling.frequency_penalty,
            "presence_penalty": sampling.presence_penalty,
            "max_tokens": sampling.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NlqError::Provider(format!("Completion API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NlqError::Provider(format!(
                "Completion API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NlqError::Provider(format!("Failed to parse completion response: {}", e)))?;

        let text = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| NlqError::Provider("No content in completion response".to_string()))?
            .to_string();

        let usage = response_json
            .get("usage")
            .filter(|u| !u.is_null())
            .map(|u| TokenUsage {
            prompt: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total: u["total_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(Completion { text, usage })
    }
}
