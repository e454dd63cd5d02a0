//! Configuration
//!
//! One serde-backed [`Config`] with sensible defaults, optionally loaded
//! from `~/.pkm-assistant/config.json`. Secrets come from the environment
//! (`PKM_API_KEY`, falling back to `OPENAI_API_KEY`) so the config file can
//! be committed to dotfiles without leaking keys.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::PageType;

/// Directory under the user's home holding config and the port
/// advertisement.
pub const HOME_DIR_NAME: &str = ".pkm-assistant";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed config file: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Which LLM provider backs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Any OpenAI-compatible endpoint (OpenAI, OpenRouter, gateways).
    #[default]
    OpenAi,
    /// Local Ollama.
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    /// Overrides the provider's default endpoint.
    pub base_url: Option<String>,
    pub default_model: String,
    pub embedding_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            api_key: None,
            base_url: None,
            default_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

/// Filter policy, spec'd options only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    /// Master switch; when off every page is accepted.
    pub enabled: bool,
    pub allowed_types: Vec<PageType>,
    pub min_confidence: f64,
    pub log_decisions: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_types: vec![PageType::Knowledge],
            min_confidence: 0.7,
            log_decisions: true,
        }
    }
}

impl FilterConfig {
    pub fn allows_type(&self, page_type: PageType) -> bool {
        self.allowed_types.contains(&page_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            batch_timeout_ms: 1000,
        }
    }
}

/// Filesystem locations. `None` means the platform default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsConfig {
    pub database: Option<PathBuf>,
    pub vector_dir: Option<PathBuf>,
    /// The host markdown document carrying the `## Webpages` section.
    pub markdown_index: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntakeConfig {
    pub host: String,
    /// 0 = OS-assigned; the chosen port is advertised on disk.
    pub port: u16,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub llm: LlmConfig,
    pub filter: FilterConfig,
    pub queue: QueueConfig,
    pub paths: PathsConfig,
    pub intake: IntakeConfig,
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(HOME_DIR_NAME).join("config.json"))
    }

    /// Load from the given (or default) path, then apply environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };

        let mut config = match resolved {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(&p)?;
                serde_json::from_str(&text)?
            }
            _ => Config::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        for var in ["PKM_API_KEY", "OPENAI_API_KEY"] {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    self.llm.api_key = Some(key);
                    break;
                }
            }
        }
        if let Ok(base_url) = std::env::var("PKM_LLM_BASE_URL") {
            if !base_url.is_empty() {
                self.llm.base_url = Some(base_url);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.filter.enabled);
        assert_eq!(config.filter.allowed_types, vec![PageType::Knowledge]);
        assert_eq!(config.filter.min_confidence, 0.7);
        assert_eq!(config.queue.batch_size, 3);
        assert_eq!(config.queue.batch_timeout_ms, 1000);
        assert_eq!(config.intake.port, 0);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"filter": {"minConfidence": 0.5}, "llm": {"provider": "ollama"}}"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.filter.min_confidence, 0.5);
        assert!(config.filter.enabled);
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.queue.batch_size, 3);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/config.json"))).unwrap();
        assert_eq!(config.queue.batch_size, 3);
    }

    #[test]
    fn test_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Parse(_))
        ));
    }
}
