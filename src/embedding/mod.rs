//! Async embedding pipeline.
//!
//! Embedding work happens off the write path: repositories enqueue
//! `(entry, version, text)` jobs; a bounded worker pool computes vectors
//! through the provider seam and stores them in the vector side store.
//! The re-embed service watches for model-dimension drift and rebuilds the
//! corpus in the background.

mod provider;
mod queue;
mod reembed;
mod store;

pub use provider::{
    EmbeddingProvider, HashEmbeddingProvider, RemoteEmbeddingConfig, RemoteEmbeddingProvider,
};
pub use queue::{EmbeddingJob, EmbeddingQueue, FailedJob, QueueStats};
pub use reembed::{
    EntryText, EntryTextSource, ReembedProgress, ReembedService, ReembedState, StoredTextSource,
};
pub use store::{EmbeddingMeta, SimilarityHit, StoredEmbedding, VectorStore};
