//! OpenAI-compatible provider
//!
//! Talks to any `/chat/completions` + `/embeddings` endpoint with bearer
//! auth: OpenAI itself, OpenRouter, or a self-hosted gateway. The base URL
//! comes from configuration so the same client covers all of them.

use std::time::Duration;

use serde_json::json;

use super::{parse_json_response, LlmClient, LlmError};
use crate::config::LlmConfig;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    embedding_model: String,
}

impl OpenAiCompatClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LlmError::Config("api_key is required for the openai provider".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(super::LLM_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            embedding_model: config.embedding_model.clone(),
        })
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
        });
        if force_json {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(ToString::to_string)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::Empty)
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.embedding_model,
                "input": inputs,
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
        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or(LlmError::Empty)?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let vector = item
                .get("embedding")
                .and_then(|e| e.as_array())
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

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatClient {
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
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors.pop().ok_or(LlmError::Empty)
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.embed(texts).await
    }
}
