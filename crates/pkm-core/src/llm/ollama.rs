//! Ollama provider
//!
//! Local inference over the Ollama HTTP API: `/api/chat` for completions and
//! `/api/embed` for embeddings. No credentials involved.

use std::time::Duration;

use serde_json::json;

use super::{parse_json_response, LlmClient, LlmError};
use crate::config::LlmConfig;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    embedding_model: String,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(super::LLM_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            embedding_model: config.embedding_model.clone(),
        }
    }

    async fn chat(
        &self,
        prompt: &str,
        system_prompt: &str,
        model: &str,
        force_json: bool,
    ) -> Result<String, LlmError> {
        let mut body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": prompt},
            ],
            "stream": false,
        });
        if force_json {
            body["format"] = json!("json");
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: serde_json::Value = response.json().await?;
        body.get("message")
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(ToString::to_string)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::Empty)
    }
}

#[async_trait::async_trait]
impl LlmClient for OllamaClient {
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: &str,
        model: &str,
    ) -> Result<String, LlmError> {
        self.chat(prompt, system_prompt, model, false).await
    }

    async fn complete_structured(
        &self,
        prompt: &str,
        system_prompt: &str,
        model: &str,
    ) -> Result<serde_json::Value, LlmError> {
        let text = self.chat(prompt, system_prompt, model, true).await?;
        parse_json_response(&text)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut vectors = self
            .embed_documents(std::slice::from_ref(&text.to_string()))
            .await?;
        vectors.pop().ok_or(LlmError::Empty)
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&json!({
                "model": self.embedding_model,
                "input": texts,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: serde_json::Value = response.json().await?;
        let embeddings = body
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or(LlmError::Empty)?;

        let mut vectors = Vec::with_capacity(embeddings.len());
        for row in embeddings {
            let vector = row
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_f64())
                        .map(|v| v as f32)
                        .collect::<Vec<f32>>()
                })
                .ok_or(LlmError::Empty)?;
            vectors.push(vector);
        }
        Ok(vectors)
    }
}
