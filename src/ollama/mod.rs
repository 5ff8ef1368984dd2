//! Ollama integration for embeddings and answer generation
//!
//! Calls the Ollama REST API to embed transcript chunks and questions and
//! to generate grounded answers over retrieved context.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AppError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Ollama client for making API calls
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    embedding_model: String,
    chat_model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, embedding_model: &str, chat_model: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            embedding_model: embedding_model.to_string(),
            chat_model: chat_model.to_string(),
        }
    }

    /// Check if Ollama is running and both models are available
    pub async fn health_check(&self) -> Result<OllamaStatus, AppError> {
        let tags_url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&tags_url)
            .send()
            .await
            .map_err(|e| AppError::Http(format!("Ollama not running: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "Ollama server returned {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response.json().await?;
        let available: Vec<String> = tags.models.iter().map(|m| m.name.clone()).collect();

        Ok(OllamaStatus {
            embedding_model_available: model_available(&available, &self.embedding_model),
            chat_model_available: model_available(&available, &self.chat_model),
            available_models: available,
        })
    }

    /// Embed one text with the embedding model
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let url = format!("{}/api/embeddings", self.base_url);

        let request = EmbeddingsRequest {
            model: self.embedding_model.clone(),
            prompt: text.to_string(),
        };

        log::debug!(
            "Requesting embedding: model={}, text_len={}",
            self.embedding_model,
            text.len()
        );

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(error_for_status(&response.status(), "embeddings", response).await);
        }

        let result: EmbeddingsResponse = response.json().await?;
        Ok(result.embedding)
    }

    /// Generate a completion from Ollama
    pub async fn generate(&self, prompt: &str) -> Result<String, AppError> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: self.chat_model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: Some(GenerateOptions {
                temperature: 0.3,
                num_predict: 2048,
            }),
        };

        log::info!(
            "Sending request to Ollama: model={}, prompt_len={}",
            self.chat_model,
            prompt.len()
        );

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(error_for_status(&response.status(), "generate", response).await);
        }

        let result: GenerateResponse = response.json().await?;

        log::info!(
            "Ollama response received: {} chars, eval_duration={:?}ms",
            result.response.len(),
            result.eval_duration.map(|d| d / 1_000_000)
        );

        Ok(result.response)
    }
}

async fn error_for_status(
    status: &reqwest::StatusCode,
    endpoint: &str,
    response: reqwest::Response,
) -> AppError {
    let body = response.text().await.unwrap_or_default();
    let message = format!("Ollama {} returned {}: {}", endpoint, status, body);
    if status.is_client_error() {
        AppError::Permanent(message)
    } else {
        AppError::Transient(message)
    }
}

/// Match a wanted model against the available tags, ignoring the size tag
/// after the colon.
fn model_available(models: &[String], wanted: &str) -> bool {
    let base = wanted.split(':').next().unwrap_or(wanted);
    models.iter().any(|m| m.starts_with(base))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbeddingsRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct OllamaStatus {
    pub embedding_model_available: bool,
    pub chat_model_available: bool,
    pub available_models: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_available_ignores_size_tag() {
        let models = vec![
            "nomic-embed-text:latest".to_string(),
            "llama2:7b".to_string(),
        ];
        assert!(model_available(&models, "nomic-embed-text"));
        assert!(model_available(&models, "llama2"));
        assert!(model_available(&models, "llama2:7b"));
        assert!(!model_available(&models, "mistral"));
    }
}
