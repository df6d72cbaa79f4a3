//! OpenAI embeddings API backend (text only).
//!
//! Used to query conversation chunks that were embedded with an OpenAI text
//! model. It cannot embed images.
//!
//! Retry strategy:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use super::{EmbedError, Embedder};
use crate::config::EmbeddingConfig;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI embedder.
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model_name(),
            dims: config.dims(),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_images(&self, _paths: &[PathBuf]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::Unsupported(format!(
            "{} cannot embed images; use the local provider",
            self.model
        )))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EmbedError::Unsupported("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(OPENAI_EMBEDDINGS_URL)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EmbedError::Model(e.to_string()))?;
                        return parse_openai_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::debug!(%status, attempt, "OpenAI embeddings call failed, retrying");
                        last_err = Some(EmbedError::Model(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    return Err(EmbedError::Model(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(EmbedError::Model(format!(
                        "OpenAI connection error: {}",
                        e
                    )));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| EmbedError::Model("Embedding failed after retries".into())))
    }
}

/// Extract `data[].embedding` arrays, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::Model("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::Model("Invalid OpenAI response: missing embedding".into()))?;

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(position, |i| i as usize);

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_out_of_order_response() {
        let json = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn missing_data_is_an_error() {
        assert!(parse_openai_response(&json!({"error": "nope"})).is_err());
    }
}
