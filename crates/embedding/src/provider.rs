use async_trait::async_trait;

/// Text-to-vector capability. The daemon and query server share one
/// process-global implementation; tests substitute deterministic fakes.
///
/// Contract: output vectors are unit-normalised and exactly
/// `dimensions()` wide. Inputs longer than the model context are
/// middle-truncated, preserving head and tail.
#[async_trait]
pub trait Embedder: Send + Sync {
  fn model_id(&self) -> &str;
  fn dimensions(&self) -> usize;

  async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  #[error("model loading: {0}")]
  ModelLoading(String),
  #[error("tokenization: {0}")]
  Tokenization(String),
  #[error("inference: {0}")]
  Inference(String),
}
