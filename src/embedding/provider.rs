//! Embedding provider seam.
//!
//! The queue and re-embed service only see this trait; the remote HTTP
//! client and the deterministic offline provider both implement it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Computes vector embeddings for artifact text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one text into a vector of `dimension()` components.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The provider's current output dimension.
    fn dimension(&self) -> usize;

    /// Model identifier recorded alongside stored vectors.
    fn model(&self) -> &str;

    /// Whether the provider can currently serve requests. Queues park
    /// jobs while this is false instead of failing them.
    fn is_available(&self) -> bool {
        true
    }
}

/// Deterministic offline provider: hashes text into a unit vector.
///
/// Not semantically meaningful; used when no remote provider is configured
/// and throughout the test suite.
pub struct HashEmbeddingProvider {
    dimension: usize,
    available: AtomicBool,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            available: AtomicBool::new(true),
        }
    }

    /// Flip availability (tests exercise the parked-job path with this).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimension);
        let mut counter: u32 = 0;
        while out.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(counter.to_le_bytes());
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks(4) {
                if out.len() == self.dimension {
                    break;
                }
                let raw = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
                // Map to [-1, 1]
                out.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        }
        out
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if !self.is_available() {
            return Err(Error::provider("hash-embeddings", "provider unavailable"));
        }
        Ok(self.vector_for(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model(&self) -> &str {
        "hash-v1"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// Configuration for the remote embedding client.
#[derive(Debug, Clone)]
pub struct RemoteEmbeddingConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub timeout: Duration,
}

impl RemoteEmbeddingConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.into(),
            dimension,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingApiDatum>,
}

#[derive(Deserialize)]
struct EmbeddingApiDatum {
    embedding: Vec<f32>,
}

/// HTTP embedding client against an OpenAI-compatible endpoint.
pub struct RemoteEmbeddingProvider {
    config: RemoteEmbeddingConfig,
    client: reqwest::Client,
    available: AtomicBool,
}

impl RemoteEmbeddingProvider {
    pub fn new(config: RemoteEmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("embedding client: {}", e)))?;
        Ok(Self {
            config,
            client,
            available: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "input": text,
            }))
            .send()
            .await
            .map_err(|e| {
                // Connection-level failures flip availability until a
                // request succeeds again
                self.available.store(false, Ordering::SeqCst);
                Error::provider("embeddings", e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::provider(
                "embeddings",
                format!("{}: {}", status, body),
            ));
        }

        let parsed: EmbeddingApiResponse = response
            .json()
            .await
            .map_err(|e| Error::provider("embeddings", e.to_string()))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::provider("embeddings", "empty response"))?;

        self.available.store(true, Ordering::SeqCst);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
