//! LLM Capability
//!
//! The pipeline consumes text completion, structured JSON output and
//! embeddings through one object-safe [`LlmClient`] trait; nothing else in
//! the crate knows which provider is behind it. Structured outputs pass
//! through a single validation gate ([`complete_json`]) so only
//! strongly-typed values travel onward.

mod ollama;
mod openai;
pub mod prompts;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

pub use ollama::OllamaClient;
pub use openai::OpenAiCompatClient;

use crate::config::{LlmConfig, LlmProvider};

/// Hard deadline for a single provider call.
pub const LLM_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// LLM error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider returned a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    /// Response arrived but did not contain usable content
    #[error("Empty response from provider")]
    Empty,
    /// Structured output failed schema validation
    #[error("Schema validation failed: {0}")]
    Schema(String),
    /// The 30 s deadline elapsed
    #[error("LLM call timed out")]
    Timeout,
    /// Provider is not configured (e.g. missing api key)
    #[error("Provider configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Transient failures are worth one retry with a smaller content
    /// window; permanent ones are not.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Api { status, .. } => *status >= 500 || *status == 429,
            LlmError::Timeout => true,
            LlmError::Empty => true,
            LlmError::Schema(_) | LlmError::Config(_) => false,
        }
    }
}

// ============================================================================
// CLIENT TRAIT
// ============================================================================

/// Abstract text-completion + structured-JSON + embedding provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Plain text completion.
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: &str,
        model: &str,
    ) -> Result<String, LlmError>;

    /// Completion that must come back as a single JSON value. Providers are
    /// asked for JSON; code fences around the payload are tolerated and
    /// stripped.
    async fn complete_structured(
        &self,
        prompt: &str,
        system_prompt: &str,
        model: &str,
    ) -> Result<serde_json::Value, LlmError>;

    /// Embed a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// Embed a batch of documents.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

/// The single validation gate for structured outputs: parse the provider's
/// JSON value into `T` or fail with [`LlmError::Schema`].
pub async fn complete_json<T: DeserializeOwned>(
    client: &dyn LlmClient,
    prompt: &str,
    system_prompt: &str,
    model: &str,
) -> Result<T, LlmError> {
    let value = client.complete_structured(prompt, system_prompt, model).await?;
    serde_json::from_value(value.clone())
        .map_err(|e| LlmError::Schema(format!("{} (got: {})", e, truncate_for_log(&value))))
}

/// Build the configured provider.
pub fn client_from_config(config: &LlmConfig) -> Result<Box<dyn LlmClient>, LlmError> {
    match config.provider {
        LlmProvider::OpenAi => Ok(Box::new(OpenAiCompatClient::new(config)?)),
        LlmProvider::Ollama => Ok(Box::new(OllamaClient::new(config))),
    }
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// Strip a surrounding markdown code fence from a model response, if any.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(trimmed)
}

/// Parse a model response as JSON, tolerating code fences and leading prose
/// before the first brace.
pub(crate) fn parse_json_response(text: &str) -> Result<serde_json::Value, LlmError> {
    let cleaned = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str(cleaned) {
        return Ok(value);
    }
    // Models sometimes preface the object; recover from the first brace.
    if let Some(start) = cleaned.find(['{', '[']) {
        if let Ok(value) = serde_json::from_str(&cleaned[start..]) {
            return Ok(value);
        }
    }
    Err(LlmError::Schema(format!(
        "response is not valid JSON: {}",
        truncate_str(cleaned, 200)
    )))
}

fn truncate_for_log(value: &serde_json::Value) -> String {
    truncate_str(&value.to_string(), 200)
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```\n[1, 2]\n```"), "[1, 2]");
    }

    #[test]
    fn test_parse_json_response_recovers_prefixed_prose() {
        let value =
            parse_json_response("Here is the classification:\n{\"page_type\": \"knowledge\"}")
                .unwrap();
        assert_eq!(value["page_type"], "knowledge");
    }

    #[test]
    fn test_parse_json_response_rejects_garbage() {
        assert!(matches!(
            parse_json_response("no json here"),
            Err(LlmError::Schema(_))
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Api {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!LlmError::Api {
            status: 401,
            message: String::new()
        }
        .is_transient());
        assert!(!LlmError::Schema("bad".into()).is_transient());
    }
}
