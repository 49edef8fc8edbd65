//! Answer synthesis over retrieved threads.
//!
//! The generator is an opaque `prompt -> text` collaborator. Search results
//! are rendered into a grounded prompt by [`build_answer_prompt`]; the
//! model is told to answer only from that context.

use anyhow::bail;
use async_trait::async_trait;
use chrono::DateTime;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::models::SearchHit;

const DEFAULT_URL: &str = "https://openrouter.ai/api/v1";

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(Error::CollaboratorPermanent(
            "Text generation is disabled".to_string(),
        ))
    }
}

/// Chat-completions client for OpenAI-compatible APIs.
pub struct OpenAIGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI generator"))?;
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) => key,
            Err(_) => bail!("{} environment variable not set", config.api_key_env),
        };
        let base = config.url.as_deref().unwrap_or(DEFAULT_URL);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAIGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::CollaboratorTransient(format!("Generation request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("Generation API error {}: {}", status, text);
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(Error::CollaboratorTransient(message));
            }
            return Err(Error::CollaboratorPermanent(message));
        }

        let json: serde_json::Value = response.json().await.map_err(|e| {
            Error::CollaboratorPermanent(format!("Generation returned invalid JSON: {}", e))
        })?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::CollaboratorPermanent("Invalid generation response: missing content".into())
            })
    }
}

pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Box<dyn TextGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "openai" => Ok(Box::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Render retrieved threads and the user query into an answer prompt.
pub fn build_answer_prompt(query: &str, hits: &[SearchHit]) -> String {
    let context = hits
        .iter()
        .map(|hit| {
            let date = hit
                .pub_time
                .and_then(|t| DateTime::from_timestamp(t, 0))
                .map(|d| d.format("%m/%d/%Y, %H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "===\nText:\n{}\nDate: {}\nSource: {}\n===",
                hit.text,
                date,
                hit.source.as_deref().unwrap_or("unknown")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Answer the query strictly on the basis of the chat threads and channel posts below.\n\
         Use only information present in the context.\n\
         If the context does not contain what is needed to answer, say so explicitly.\n\
         Answer in the language of the query, briefly, but use as much of the context as is relevant.\n\
         Do not use Markdown. Do not offer to continue the conversation.\n\
         \n\
         ========\n\
         Context:\n\
         {}\n\
         ========\n\
         \n\
         ========\n\
         Query:\n\
         {}\n\
         ========\n\
         \n\
         Answer:",
        context, query
    )
}
