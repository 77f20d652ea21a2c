pub mod local;
pub mod provider;

pub use local::{EmbeddingModel, LocalEmbedder, middle_truncate};
pub use provider::{Embedder, EmbeddingError};
