//! Scripted [`LlmClient`] for pipeline tests.
//!
//! The mock recognises which pipeline step is calling from the system
//! prompt, so one instance serves classification, extraction, analysis and
//! tree-intention calls. Classifications can be scripted per URL substring;
//! everything else is derived deterministically from the inputs, which is
//! what makes idempotence assertions possible.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use pkm_core::{LlmClient, LlmError};
use serde_json::json;

pub struct MockLlm {
    /// URL substring -> scripted classification JSON.
    classifications: Mutex<HashMap<String, serde_json::Value>>,
    /// Calls seen, for assertions on filter soundness.
    pub calls: Mutex<Vec<String>>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            classifications: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script the classification for any URL containing `url_part`.
    pub fn classify_as(
        &self,
        url_part: &str,
        page_type: &str,
        confidence: f64,
        should_process: bool,
    ) {
        self.classifications.lock().unwrap().insert(
            url_part.to_string(),
            json!({
                "page_type": page_type,
                "confidence": confidence,
                "reasoning": format!("scripted as {}", page_type),
                "should_process": should_process,
            }),
        );
    }

    pub fn calls_of(&self, kind: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == kind)
            .count()
    }

    fn record(&self, kind: &str) {
        self.calls.lock().unwrap().push(kind.to_string());
    }

    fn classification_for(&self, prompt: &str) -> serde_json::Value {
        let scripted = self
            .classifications
            .lock()
            .unwrap()
            .iter()
            .find(|(url_part, _)| prompt.contains(url_part.as_str()))
            .map(|(_, value)| value.clone());
        scripted.unwrap_or_else(|| {
            json!({
                "page_type": "knowledge",
                "confidence": 0.85,
                "reasoning": "default mock classification",
                "should_process": true,
            })
        })
    }
}

/// First `<h1>` (or `<title>`) text of an HTML fragment.
fn html_title(html: &str) -> String {
    for tag in ["h1", "title"] {
        let open = format!("<{}>", tag);
        let close = format!("</{}>", tag);
        if let Some(start) = html.find(&open) {
            if let Some(len) = html[start + open.len()..].find(&close) {
                return html[start + open.len()..start + open.len() + len]
                    .trim()
                    .to_string();
            }
        }
    }
    "Untitled".to_string()
}

/// First markdown heading.
fn markdown_title(markdown: &str) -> String {
    markdown
        .lines()
        .find_map(|l| l.strip_prefix("# "))
        .unwrap_or("Untitled")
        .trim()
        .to_string()
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(
        &self,
        prompt: &str,
        _system_prompt: &str,
        _model: &str,
    ) -> Result<String, LlmError> {
        // Content extraction: html -> markdown with the title preserved.
        self.record("extract");
        let title = html_title(prompt);
        Ok(format!("# {}\n\nClean text of the page.\n", title))
    }

    async fn complete_structured(
        &self,
        prompt: &str,
        system_prompt: &str,
        _model: &str,
    ) -> Result<serde_json::Value, LlmError> {
        if system_prompt.contains("classify web pages") {
            self.record("classify");
            return Ok(self.classification_for(prompt));
        }

        if system_prompt.contains("analyse an archived web page") {
            self.record("analyse");
            let title = markdown_title(prompt);
            return Ok(json!({
                "title": title,
                "summary": format!("Short summary of {}.", title),
                "intentions": [format!("read about {}", title.to_lowercase())],
            }));
        }

        if system_prompt.contains("browsing session") {
            self.record("tree-intentions");
            // One intention per page, mentioning the session size so tests
            // can observe rewrites as the tree grows.
            let pages = prompt.lines().filter(|l| l.starts_with('[')).count();
            let mut map = serde_json::Map::new();
            for index in 0..pages {
                map.insert(
                    index.to_string(),
                    json!([format!("session goal across {} pages", pages)]),
                );
            }
            return Ok(serde_json::Value::Object(map));
        }

        Err(LlmError::Schema(format!(
            "mock has no script for system prompt: {}",
            system_prompt
        )))
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.record("embed");
        // Deterministic 8-dim vector derived from the domain part of the
        // text, so same-domain pages land close together.
        let domain_part = text.split("|||").next().unwrap_or(text);
        let domain = pkm_core::domain_of(domain_part);
        let mut vector = vec![0.0f32; 8];
        for (i, byte) in domain.bytes().enumerate() {
            vector[i % 8] += byte as f32 / 255.0;
        }
        Ok(vector)
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_query(text).await?);
        }
        Ok(out)
    }
}
