use std::sync::Mutex;

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::{
    embedding::{EmbeddingProvider, normalize},
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn model_err(e: impl std::fmt::Display) -> Error {
    Error::Embedding(e.to_string())
}

/// Embeds text with a local ColBERT model.
///
/// ColBERT produces one vector per token; they are mean-pooled into a single
/// fixed-length vector and normalised. Texts are encoded one at a time so
/// that padding never enters the mean, which keeps `embed(t)` equal to the
/// matching row of any batch containing `t`. The model is loaded lazily on first use,
/// downloading it from the HuggingFace Hub if needed.
pub struct ColbertEmbedder {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
}

impl Default for ColbertEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_ID.to_string())
    }
}

impl ColbertEmbedder {
    pub fn new(model_id: String) -> Self {
        Self {
            model: Mutex::new(None),
            model_id,
        }
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.lock().map(|m| m.is_some()).unwrap_or(false)
    }

    /// Token embeddings of one text, shaped `[1, tokens, dim]`.
    fn encode(&self, text: &str) -> Result<Tensor> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| Error::Embedding("model lock poisoned".into()))?;

        if guard.is_none() {
            tracing::info!(model = %self.model_id, "loading ColBERT model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(model_err)?;
            *guard = Some(colbert);
        }

        let Some(model) = guard.as_mut() else {
            return Err(Error::Embedding("model failed to load".into()));
        };
        model.encode(&[text.to_string()], false).map_err(model_err)
    }
}

/// Average the token vectors of a `[1, tokens, dim]` tensor and normalise.
fn mean_pool(tokens: &Tensor) -> Result<Vec<f32>> {
    let (batch, count, _) = tokens.dims3().map_err(model_err)?;
    if batch != 1 || count == 0 {
        return Err(Error::Embedding(format!(
            "expected token embeddings for one text, got shape {:?}",
            tokens.dims()
        )));
    }

    let mut vector: Vec<f32> = tokens
        .squeeze(0)
        .and_then(|t| t.mean(0))
        .and_then(|t| t.to_dtype(candle_core::DType::F32))
        .and_then(|t| t.to_vec1())
        .map_err(model_err)?;
    normalize(&mut vector);
    Ok(vector)
}

impl EmbeddingProvider for ColbertEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        mean_pool(&self.encode(text)?)
    }

    /// The model is behind one lock, so texts are encoded in sequence.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

impl std::fmt::Debug for ColbertEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColbertEmbedder")
            .field("model_id", &self.model_id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
