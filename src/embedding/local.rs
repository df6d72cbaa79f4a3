//! Local CLIP inference via fastembed.
//!
//! Image and text towers are separate ONNX models sharing one 512-d space.
//! Each is downloaded from Hugging Face on first use, cached, and kept for
//! the life of the process. Inference runs on the blocking thread pool.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{EmbedError, Embedder};
use crate::config::EmbeddingConfig;

const CLIP_VIT_B32_DIMS: usize = 512;

pub struct ClipEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    image_model: Arc<Mutex<Option<fastembed::ImageEmbedding>>>,
    text_model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

impl ClipEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config.model_name();
        match model_name.as_str() {
            "clip-vit-b-32" => {}
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: clip-vit-b-32",
                other
            ),
        }

        let dims = config.dims.unwrap_or(CLIP_VIT_B32_DIMS);
        if dims != CLIP_VIT_B32_DIMS {
            bail!(
                "clip-vit-b-32 produces {}-dimensional vectors, but embedding.dims = {}",
                CLIP_VIT_B32_DIMS,
                dims
            );
        }

        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            image_model: Arc::new(Mutex::new(None)),
            text_model: Arc::new(Mutex::new(None)),
        })
    }
}

fn model_error(e: impl std::fmt::Display) -> EmbedError {
    EmbedError::Model(e.to_string())
}

#[async_trait]
impl Embedder for ClipEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let slot = Arc::clone(&self.image_model);
        let paths = paths.to_vec();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock().map_err(|_| model_error("image model lock poisoned"))?;
            if guard.is_none() {
                tracing::info!("loading CLIP image model");
                let model = fastembed::ImageEmbedding::try_new(
                    fastembed::ImageInitOptions::new(fastembed::ImageEmbeddingModel::ClipVitB32)
                        .with_show_download_progress(true),
                )
                .map_err(|e| model_error(format!("Failed to initialize CLIP image model: {}", e)))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| model_error("CLIP image model unavailable"))?;

            model.embed(paths, Some(batch_size)).map_err(|e| {
                EmbedError::Model(format!("Local image embedding failed: {}", e))
            })
        })
        .await
        .map_err(model_error)?
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let slot = Arc::clone(&self.text_model);
        let texts = texts.to_vec();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock().map_err(|_| model_error("text model lock poisoned"))?;
            if guard.is_none() {
                tracing::info!("loading CLIP text model");
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed::EmbeddingModel::ClipVitB32)
                        .with_show_download_progress(true),
                )
                .map_err(|e| model_error(format!("Failed to initialize CLIP text model: {}", e)))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| model_error("CLIP text model unavailable"))?;

            model
                .embed(texts, Some(batch_size))
                .map_err(|e| EmbedError::Model(format!("Local text embedding failed: {}", e)))
        })
        .await
        .map_err(model_error)?
    }
}
