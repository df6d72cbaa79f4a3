//! Embedding backends and the batch-safe embedding engine.
//!
//! An [`Embedder`] is the raw model: it maps image files or texts to vectors
//! and may fail a whole call if any input is bad. [`EmbeddingEngine`] wraps an
//! embedder and adds what the pipeline relies on:
//!
//! - every vector is L2-normalized, so cosine similarity is a dot product
//! - batches keep their input order and length
//! - one unreadable image yields `None` at its position instead of failing
//!   the batch
//! - a vector that normalizes to zero is treated as a failure, never returned
//!
//! # Backends
//!
//! | Config Value | Backend | Images | Text |
//! |-------------|---------|--------|------|
//! | `"local"` | CLIP ViT-B/32 via fastembed | yes | yes |
//! | `"openai"` | OpenAI embeddings API | no | yes |
//! | `"disabled"` | [`DisabledEmbedder`] | no | no |

#[cfg(feature = "local-embeddings-fastembed")]
mod local;
mod openai;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::EmbeddingConfig;

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::ClipEmbedder;
pub use openai::OpenAIEmbedder;

/// Tolerance used when checking that a vector is unit length.
pub const NORM_TOLERANCE: f32 = 1e-4;

/// Per-item embedding failure.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("cannot embed {path}: {reason}")]
    Resource { path: PathBuf, reason: String },
    #[error("embedding model error: {0}")]
    Model(String),
    #[error("embedding model returned a zero vector")]
    ZeroVector,
    #[error("expected {expected}-dimensional vector, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("{0}")]
    Unsupported(String),
}

/// Raw embedding backend.
///
/// Implementations may return unnormalized vectors and may fail an entire
/// call when a single input is bad; [`EmbeddingEngine`] handles both.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"clip-vit-b-32"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `512`).
    fn dims(&self) -> usize;
    /// Embed image files, one vector per path, in order.
    async fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>, EmbedError>;
    /// Embed texts into the same vector space as images (if supported).
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// An L2-normalized embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    /// Normalize `raw` to unit length. Returns `None` for empty, zero, or
    /// non-finite input.
    pub fn normalize(raw: Vec<f32>) -> Option<Self> {
        if raw.is_empty() || raw.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let norm = l2_norm(&raw);
        if norm < f32::EPSILON {
            return None;
        }
        Some(Self(raw.into_iter().map(|v| v / norm).collect()))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.0)
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Dot product of two vectors; `0.0` when lengths differ or are empty.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Embedder wrapper with normalization and per-item failure isolation.
///
/// Cheap to clone; constructed once per process and passed to the pipeline
/// and the query resolver.
#[derive(Clone)]
pub struct EmbeddingEngine {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingEngine {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    /// Embed a single image file.
    pub async fn embed_one(&self, path: &Path) -> Result<EmbeddingVector, EmbedError> {
        let mut vectors = self.embedder.embed_images(&[path.to_path_buf()]).await?;
        let raw = vectors
            .pop()
            .ok_or_else(|| EmbedError::Model("empty embedding response".to_string()))?;
        self.finish(raw)
    }

    /// Embed a batch of image files.
    ///
    /// The result has the same length and order as `paths`. When the backend
    /// rejects the batch as a whole, each image is retried on its own so that
    /// only the bad ones come back as `None`.
    pub async fn embed_batch(&self, paths: &[PathBuf]) -> Vec<Option<EmbeddingVector>> {
        if paths.is_empty() {
            return Vec::new();
        }

        match self.embedder.embed_images(paths).await {
            Ok(vectors) if vectors.len() == paths.len() => {
                return vectors
                    .into_iter()
                    .zip(paths)
                    .map(|(raw, path)| match self.finish(raw) {
                        Ok(v) => Some(v),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "discarding embedding");
                            None
                        }
                    })
                    .collect();
            }
            Ok(vectors) => {
                tracing::warn!(
                    expected = paths.len(),
                    got = vectors.len(),
                    "batch embedding returned wrong count, retrying per image"
                );
            }
            Err(e) => {
                tracing::debug!(error = %e, size = paths.len(), "batch embedding failed, retrying per image");
            }
        }

        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            match self.embed_one(path).await {
                Ok(v) => results.push(Some(v)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to embed image");
                    results.push(None);
                }
            }
        }
        results
    }

    /// Embed a search query into the image vector space.
    pub async fn embed_text(&self, query: &str) -> Result<EmbeddingVector, EmbedError> {
        let mut vectors = self.embedder.embed_texts(&[query.to_string()]).await?;
        let raw = vectors
            .pop()
            .ok_or_else(|| EmbedError::Model("empty embedding response".to_string()))?;
        self.finish(raw)
    }

    fn finish(&self, raw: Vec<f32>) -> Result<EmbeddingVector, EmbedError> {
        let expected = self.embedder.dims();
        if expected != 0 && raw.len() != expected {
            return Err(EmbedError::DimensionMismatch {
                expected,
                got: raw.len(),
            });
        }
        EmbeddingVector::normalize(raw).ok_or(EmbedError::ZeroVector)
    }
}

// ============ Disabled Embedder ============

/// Backend used when `embedding.provider = "disabled"`; every call fails.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_images(&self, _paths: &[PathBuf]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::Unsupported(
            "Embedding provider is disabled".to_string(),
        ))
    }
    async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::Unsupported(
            "Embedding provider is disabled".to_string(),
        ))
    }
}

/// Create the configured embedder.
///
/// Model weights are loaded lazily on first use, so building an engine for a
/// command that never embeds costs nothing.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(ClipEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
