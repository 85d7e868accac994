//! Optional external classification oracle (an LLM).
//!
//! Oracle calls are slow and unreliable; the engine treats every verdict as an
//! enrichment and never depends on one to produce a decision.

use async_trait::async_trait;
use para_schemas::Category;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{CollaboratorError, Result};

const MAX_PROMPT_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub category: Category,
    pub raw_label: String,
    pub rationale: String,
}

#[async_trait]
pub trait ClassificationOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, text: &str, directive: &str) -> Result<OracleVerdict>;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum OracleProvider {
    Ollama,
    OpenAI,
    Claude,
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub provider: OracleProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: OracleProvider::Ollama,
            api_key: None,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 30,
        }
    }
}

impl OracleConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let provider = match std::env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "ollama".to_string())
            .to_lowercase()
            .as_str()
        {
            "openai" => OracleProvider::OpenAI,
            "claude" | "anthropic" => OracleProvider::Claude,
            _ => OracleProvider::Ollama,
        };

        let (base_url, model, key_var) = match provider {
            OracleProvider::Ollama => (
                std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string()),
                std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string()),
                None,
            ),
            OracleProvider::OpenAI => (
                std::env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com".to_string()),
                std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                Some("OPENAI_API_KEY"),
            ),
            OracleProvider::Claude => (
                std::env::var("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
                std::env::var("CLAUDE_MODEL")
                    .unwrap_or_else(|_| "claude-3-5-haiku-20241022".to_string()),
                Some("ANTHROPIC_API_KEY"),
            ),
        };

        let api_key = match key_var {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                CollaboratorError::Unavailable(format!("{} required for {:?} oracle", var, provider))
            })?),
            None => None,
        };

        let timeout_secs = std::env::var("PARA_ORACLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            provider,
            api_key,
            base_url,
            model,
            timeout_secs,
        })
    }

    /// Config from the environment, only when `PARA_USE_ORACLE` is enabled.
    pub fn from_env_optional() -> Option<Self> {
        let enabled = std::env::var("PARA_USE_ORACLE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !enabled {
            return None;
        }
        match Self::from_env() {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Oracle disabled: {}", e);
                None
            }
        }
    }
}

pub fn build_oracle(config: &OracleConfig) -> Result<Arc<dyn ClassificationOracle>> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    let missing_key =
        || CollaboratorError::Unavailable(format!("{:?} oracle needs an API key", config.provider));

    let oracle: Arc<dyn ClassificationOracle> = match config.provider {
        OracleProvider::Ollama => Arc::new(OllamaOracle {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        }),
        OracleProvider::OpenAI => Arc::new(OpenAIOracle {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone().ok_or_else(missing_key)?,
            model: config.model.clone(),
        }),
        OracleProvider::Claude => Arc::new(ClaudeOracle {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone().ok_or_else(missing_key)?,
            model: config.model.clone(),
        }),
    };

    info!("Classification oracle: {} ({})", oracle.name(), config.model);
    Ok(oracle)
}

// ============================================================================
// Prompting & parsing
// ============================================================================

fn build_prompt(text: &str, directive: &str) -> String {
    let excerpt: String = text.chars().take(MAX_PROMPT_CHARS).collect();
    format!(
        r#"Classify this note into exactly one PARA category: Projects, Areas, Resources or Archive.
{}

Respond with JSON only:
{{"category": "<category>", "rationale": "<one sentence>"}}

Note:
{}"#,
        directive, excerpt
    )
}

#[derive(Deserialize)]
struct RawVerdict {
    category: String,
    #[serde(default)]
    rationale: Option<String>,
}

/// Pull the verdict out of a model response that may wrap JSON in prose.
fn parse_verdict(response: &str) -> Result<OracleVerdict> {
    let start = response.find('{');
    let end = response.rfind('}');
    let raw: RawVerdict = match (start, end) {
        (Some(s), Some(e)) if e > s => serde_json::from_str(&response[s..=e])
            .map_err(|e| CollaboratorError::InvalidResponse(format!("bad verdict JSON: {}", e)))?,
        _ => {
            // Bare label, e.g. "Projects"
            let label = response.trim();
            if label.is_empty() || label.len() > 40 {
                return Err(CollaboratorError::InvalidResponse(
                    "no verdict in oracle response".to_string(),
                ));
            }
            RawVerdict {
                category: label.to_string(),
                rationale: None,
            }
        }
    };

    let category = match map_oracle_label(&raw.category) {
        Some(category) => {
            debug!("Oracle label '{}' mapped to {}", raw.category, category);
            category
        }
        None => {
            // Inbox carries no vote
            warn!("Oracle returned unrecognized label '{}'; ignoring its vote", raw.category);
            Category::Inbox
        }
    };

    Ok(OracleVerdict {
        category,
        raw_label: raw.category,
        rationale: raw.rationale.unwrap_or_default(),
    })
}

/// Map a free-form oracle label onto a PARA category, or `None` when the
/// label is not recognized.
pub fn map_oracle_label(label: &str) -> Option<Category> {
    let normalized = label
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();

    if let Ok(category) = normalized.parse::<Category>() {
        return Some(category);
    }

    const MAPPINGS: &[(&str, Category)] = &[
        ("project", Category::Projects),
        ("proyecto", Category::Projects),
        ("proyectos", Category::Projects),
        ("task", Category::Projects),
        ("tasks", Category::Projects),
        ("goal", Category::Projects),
        ("objetivo", Category::Projects),
        ("deadline", Category::Projects),
        ("client", Category::Projects),
        ("job", Category::Projects),
        ("trabajo", Category::Projects),
        ("development", Category::Projects),
        ("area", Category::Areas),
        ("área", Category::Areas),
        ("áreas", Category::Areas),
        ("health", Category::Areas),
        ("salud", Category::Areas),
        ("finance", Category::Areas),
        ("finanzas", Category::Areas),
        ("career", Category::Areas),
        ("carrera", Category::Areas),
        ("habit", Category::Areas),
        ("personal", Category::Areas),
        ("management", Category::Areas),
        ("fitness", Category::Areas),
        ("resource", Category::Resources),
        ("recurso", Category::Resources),
        ("recursos", Category::Resources),
        ("reference", Category::Resources),
        ("referencia", Category::Resources),
        ("template", Category::Resources),
        ("plantilla", Category::Resources),
        ("guide", Category::Resources),
        ("tutorial", Category::Resources),
        ("documentation", Category::Resources),
        ("docs", Category::Resources),
        ("book", Category::Resources),
        ("article", Category::Resources),
        ("recipe", Category::Resources),
        ("archived", Category::Archive),
        ("archivo", Category::Archive),
        ("archivado", Category::Archive),
        ("completed", Category::Archive),
        ("completado", Category::Archive),
        ("done", Category::Archive),
        ("old", Category::Archive),
        ("deprecated", Category::Archive),
        ("obsoleto", Category::Archive),
        ("backup", Category::Archive),
        ("past", Category::Archive),
    ];

    MAPPINGS
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, category)| *category)
}

// ============================================================================
// Providers
// ============================================================================

pub struct OllamaOracle {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

#[async_trait]
impl ClassificationOracle for OllamaOracle {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn classify(&self, text: &str, directive: &str) -> Result<OracleVerdict> {
        let request_body = json!({
            "model": self.model,
            "prompt": build_prompt(text, directive),
            "stream": false,
            "format": "json"
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(CollaboratorError::Unavailable(format!(
                "Ollama API error: {}",
                error_text
            )));
        }

        let body: OllamaResponse = response.json().await?;
        parse_verdict(&body.response)
    }
}

pub struct OpenAIOracle {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[async_trait]
impl ClassificationOracle for OpenAIOracle {
    fn name(&self) -> &str {
        "openai"
    }

    async fn classify(&self, text: &str, directive: &str) -> Result<OracleVerdict> {
        let request_body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You organize personal notes with the PARA method."},
                {"role": "user", "content": build_prompt(text, directive)}
            ],
            "temperature": 0.0,
            "max_tokens": 200
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(CollaboratorError::Unavailable(format!(
                "OpenAI API error: {}",
                error_text
            )));
        }

        let body: OpenAIResponse = response.json().await?;
        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| CollaboratorError::InvalidResponse("empty response from OpenAI".into()))?;

        parse_verdict(&content)
    }
}

pub struct ClaudeOracle {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
}

#[derive(Deserialize)]
struct ClaudeContent {
    text: Option<String>,
}

#[async_trait]
impl ClassificationOracle for ClaudeOracle {
    fn name(&self) -> &str {
        "claude"
    }

    async fn classify(&self, text: &str, directive: &str) -> Result<OracleVerdict> {
        let request_body = json!({
            "model": self.model,
            "max_tokens": 200,
            "system": "You organize personal notes with the PARA method.",
            "messages": [{
                "role": "user",
                "content": build_prompt(text, directive)
            }]
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(CollaboratorError::Unavailable(format!(
                "Claude API error: {}",
                error_text
            )));
        }

        let body: ClaudeResponse = response.json().await?;
        let content = body
            .content
            .first()
            .and_then(|c| c.text.clone())
            .ok_or_else(|| CollaboratorError::InvalidResponse("empty response from Claude".into()))?;

        parse_verdict(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_oracle_label() {
        assert_eq!(map_oracle_label("Projects"), Some(Category::Projects));
        assert_eq!(map_oracle_label(" task. "), Some(Category::Projects));
        assert_eq!(map_oracle_label("Reference"), Some(Category::Resources));
        assert_eq!(map_oracle_label("done"), Some(Category::Archive));
        assert_eq!(map_oracle_label("salud"), Some(Category::Areas));
        assert_eq!(map_oracle_label("something else"), None);
    }

    #[test]
    fn test_parse_verdict_from_wrapped_json() {
        let response = r#"Sure! {"category": "area", "rationale": "ongoing health routine"} hope it helps"#;
        let verdict = parse_verdict(response).unwrap();
        assert_eq!(verdict.category, Category::Areas);
        assert_eq!(verdict.raw_label, "area");
        assert_eq!(verdict.rationale, "ongoing health routine");
    }

    #[test]
    fn test_parse_verdict_bare_label_and_garbage() {
        assert_eq!(parse_verdict("Archive").unwrap().category, Category::Archive);
        assert!(parse_verdict("").is_err());
        assert!(parse_verdict("{not json}").is_err());
    }

    #[test]
    fn test_unrecognized_label_carries_no_vote() {
        let verdict = parse_verdict(r#"{"category": "miscellaneous"}"#).unwrap();
        assert_eq!(verdict.category, Category::Inbox);
        assert!(!verdict.category.is_scored());
        assert_eq!(verdict.raw_label, "miscellaneous");
    }

    #[test]
    fn test_prompt_truncates_long_notes() {
        let text = "x".repeat(MAX_PROMPT_CHARS * 2);
        let prompt = build_prompt(&text, "Prefer Projects for actionable notes.");
        assert!(prompt.len() < MAX_PROMPT_CHARS + 400);
        assert!(prompt.contains("Prefer Projects"));
    }
}
