//! Local BERT embedding engine on Candle.
//!
//! The model loads once at process startup; a missing model file is a
//! startup failure, not something to paper over at ingest time. Forward
//! passes run on the blocking pool behind a 4-permit semaphore, so at
//! most four embeddings are in flight while callers backpressure on the
//! semaphore rather than dropping work.

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use hf_hub::{Repo, RepoType, api::sync::ApiBuilder};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::provider::{Embedder, EmbeddingError};

/// Concurrent forward passes allowed process-wide.
const MAX_CONCURRENT: usize = 4;

/// Supported embedding models. The store schema fixes 768 dimensions,
/// so only 768-wide BERT checkpoints are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingModel {
  /// bge-base-en-v1.5, the default
  BgeBaseEn,
  /// e5-base-v2, same width and architecture
  E5Base,
}

impl EmbeddingModel {
  pub fn hf_repo(&self) -> &'static str {
    match self {
      EmbeddingModel::BgeBaseEn => "BAAI/bge-base-en-v1.5",
      EmbeddingModel::E5Base => "intfloat/e5-base-v2",
    }
  }

  pub fn dimension(&self) -> usize {
    768
  }

  pub fn from_name(name: &str) -> Option<Self> {
    match name.to_lowercase().as_str() {
      "bge-base-en-v1.5" | "bge-base" | "bge" => Some(EmbeddingModel::BgeBaseEn),
      "e5-base-v2" | "e5-base" | "e5" => Some(EmbeddingModel::E5Base),
      _ => None,
    }
  }
}

/// Middle truncation: keep the head and the tail, drop the middle.
/// Operates on already-tokenized ids so the cut is exact.
pub fn middle_truncate<T: Copy>(ids: &[T], max_len: usize) -> Vec<T> {
  if ids.len() <= max_len {
    return ids.to_vec();
  }
  let head = max_len / 2;
  let tail = max_len - head;
  let mut out = Vec::with_capacity(max_len);
  out.extend_from_slice(&ids[..head]);
  out.extend_from_slice(&ids[ids.len() - tail..]);
  out
}

struct Inner {
  model: BertModel,
  device: Device,
}

/// Candle-backed embedder. One model instance, mutex-guarded for the
/// forward pass, semaphore-bounded for callers.
pub struct LocalEmbedder {
  inner: Arc<Mutex<Inner>>,
  tokenizer: Arc<Tokenizer>,
  model_type: EmbeddingModel,
  model_id: String,
  max_length: usize,
  permits: Arc<tokio::sync::Semaphore>,
}

impl LocalEmbedder {
  /// Load the model, caching files under `models_dir`. Fails hard when
  /// the model cannot be fetched or parsed.
  pub fn load(model_type: EmbeddingModel, models_dir: &Path, use_gpu: bool) -> Result<Self, EmbeddingError> {
    info!("loading embedding model {:?} (gpu={})", model_type, use_gpu);

    let device = if use_gpu { select_device() } else { Device::Cpu };

    let api = ApiBuilder::new()
      .with_cache_dir(models_dir.to_path_buf())
      .build()
      .map_err(|e| EmbeddingError::ModelLoading(e.to_string()))?;
    let repo = api.repo(Repo::new(model_type.hf_repo().to_string(), RepoType::Model));

    let tokenizer_path = repo
      .get("tokenizer.json")
      .map_err(|e| EmbeddingError::ModelLoading(format!("tokenizer: {}", e)))?;
    let tokenizer =
      Tokenizer::from_file(tokenizer_path).map_err(|e| EmbeddingError::ModelLoading(format!("tokenizer: {}", e)))?;

    let config_path = repo
      .get("config.json")
      .map_err(|e| EmbeddingError::ModelLoading(format!("config: {}", e)))?;
    let config_str =
      std::fs::read_to_string(&config_path).map_err(|e| EmbeddingError::ModelLoading(format!("config: {}", e)))?;
    let config: BertConfig =
      serde_json::from_str(&config_str).map_err(|e| EmbeddingError::ModelLoading(format!("config: {}", e)))?;

    let weights_path = repo
      .get("model.safetensors")
      .map_err(|e| EmbeddingError::ModelLoading(format!("weights: {}", e)))?;
    let vb = unsafe {
      VarBuilder::from_mmaped_safetensors(&[weights_path], candle_core::DType::F32, &device)
        .map_err(|e| EmbeddingError::ModelLoading(format!("weights: {}", e)))?
    };
    let model = BertModel::load(vb, &config).map_err(|e| EmbeddingError::ModelLoading(e.to_string()))?;

    info!("embedding model loaded on {:?}", device);

    Ok(Self {
      inner: Arc::new(Mutex::new(Inner { model, device })),
      tokenizer: Arc::new(tokenizer),
      model_type,
      model_id: model_type.hf_repo().to_string(),
      max_length: 512,
      permits: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT)),
    })
  }

  fn encode(&self, texts: &[String]) -> Result<(Vec<Vec<u32>>, Vec<Vec<u32>>, usize), EmbeddingError> {
    let mut all_ids = Vec::with_capacity(texts.len());
    let mut all_masks = Vec::with_capacity(texts.len());
    let mut max_len = 0;

    for text in texts {
      let encoding = self
        .tokenizer
        .encode(text.as_str(), true)
        .map_err(|e| EmbeddingError::Tokenization(e.to_string()))?;

      let ids = middle_truncate(encoding.get_ids(), self.max_length);
      let mask: Vec<u32> = middle_truncate(encoding.get_attention_mask(), self.max_length)
        .iter()
        .map(|&m| m as u32)
        .collect();

      max_len = max_len.max(ids.len());
      all_ids.push(ids);
      all_masks.push(mask);
    }

    for (ids, mask) in all_ids.iter_mut().zip(all_masks.iter_mut()) {
      ids.resize(max_len, 0);
      mask.resize(max_len, 0);
    }

    Ok((all_ids, all_masks, max_len))
  }
}

fn select_device() -> Device {
  #[cfg(feature = "metal")]
  {
    match Device::new_metal(0) {
      Ok(d) => {
        info!("using Metal for embeddings");
        return d;
      }
      Err(e) => tracing::warn!("Metal unavailable: {}", e),
    }
  }

  #[cfg(feature = "cuda")]
  {
    match Device::new_cuda(0) {
      Ok(d) => {
        info!("using CUDA for embeddings");
        return d;
      }
      Err(e) => tracing::warn!("CUDA unavailable: {}", e),
    }
  }

  info!("using CPU for embeddings");
  Device::Cpu
}

/// Forward pass + mean pooling + L2 normalisation, all on the compute
/// device; only the final f32 rows cross back.
fn forward(inner: &Inner, ids: Vec<Vec<u32>>, masks: Vec<Vec<u32>>, max_len: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
  let batch_size = ids.len();
  let ids_flat: Vec<u32> = ids.into_iter().flatten().collect();
  let masks_flat: Vec<u32> = masks.into_iter().flatten().collect();

  let err = |e: candle_core::Error| EmbeddingError::Inference(e.to_string());

  let input_ids = Tensor::from_vec(ids_flat, (batch_size, max_len), &inner.device).map_err(err)?;
  let attention_mask = Tensor::from_vec(masks_flat, (batch_size, max_len), &inner.device).map_err(err)?;
  let token_type_ids = Tensor::zeros((batch_size, max_len), candle_core::DType::U32, &inner.device).map_err(err)?;

  let hidden = inner
    .model
    .forward(&input_ids, &token_type_ids, Some(&attention_mask))
    .map_err(err)?;

  // Mean pool over non-padding tokens
  let mask = attention_mask
    .unsqueeze(2)
    .map_err(err)?
    .to_dtype(candle_core::DType::F32)
    .map_err(err)?;
  let summed = hidden.broadcast_mul(&mask).map_err(err)?.sum(1).map_err(err)?;
  let counts = mask.sum(1).map_err(err)?.clamp(1.0, f64::MAX).map_err(err)?;
  let mean = summed.broadcast_div(&counts).map_err(err)?;

  // L2 normalise to unit vectors
  let norm = mean
    .sqr()
    .map_err(err)?
    .sum_keepdim(1)
    .map_err(err)?
    .sqrt()
    .map_err(err)?
    .clamp(1e-12, f64::MAX)
    .map_err(err)?;
  let normalised = mean.broadcast_div(&norm).map_err(err)?;

  let rows = normalised.to_vec2::<f32>().map_err(err)?;
  debug!("embedded {} texts", rows.len());
  Ok(rows)
}

#[async_trait::async_trait]
impl Embedder for LocalEmbedder {
  fn model_id(&self) -> &str {
    &self.model_id
  }

  fn dimensions(&self) -> usize {
    self.model_type.dimension()
  }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let mut rows = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
    rows
      .pop()
      .ok_or_else(|| EmbeddingError::Inference("empty batch result".into()))
  }

  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      return Ok(vec![]);
    }

    let _permit = self
      .permits
      .acquire()
      .await
      .map_err(|_| EmbeddingError::Inference("embedder shut down".into()))?;

    let (ids, masks, max_len) = self.encode(texts)?;
    let inner = Arc::clone(&self.inner);

    tokio::task::spawn_blocking(move || {
      let inner = inner.lock();
      forward(&inner, ids, masks, max_len)
    })
    .await
    .map_err(|e| EmbeddingError::Inference(e.to_string()))?
  }
}
