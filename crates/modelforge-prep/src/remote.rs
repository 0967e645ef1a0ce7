//! HTTP embedding provider speaking the common `{model, input} ->
//! {embeddings}` JSON contract of local embedding servers.

use async_trait::async_trait;
use modelforge_core::config::EmbeddingSettings;
use modelforge_core::{EmbeddingProvider, ForgeError, Result};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(settings: &EmbeddingSettings) -> Result<Self> {
        if settings.endpoint.is_empty() {
            return Err(ForgeError::Configuration(
                "embedding endpoint is not configured".into(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            dimension: settings.dimension,
        })
    }

    /// Build from settings only when an endpoint is configured.
    pub fn from_settings(settings: &EmbeddingSettings) -> Option<Self> {
        Self::new(settings).ok()
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/api/embed", self.endpoint))
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await
            .map_err(|e| ForgeError::Storage(format!("embedding request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ForgeError::Storage(format!(
                "embedding service returned {}",
                response.status()
            )));
        }
        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::Storage(format!("embedding response unreadable: {e}")))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(ForgeError::Storage(format!(
                "embedding service returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        for vector in &parsed.embeddings {
            if vector.len() != self.dimension {
                return Err(ForgeError::Storage(format!(
                    "embedding width {} does not match the configured {}",
                    vector.len(),
                    self.dimension
                )));
            }
        }
        debug!(count = texts.len(), "embeddings generated");
        Ok(parsed.embeddings)
    }
}
