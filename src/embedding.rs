//! Client for the embedding sidecar (spec.md §6): a sibling process
//! reached over a unix-domain socket, one line-delimited JSON request
//! per call over a `UnixStream`, newline-delimited rather than
//! length-prefixed, with a `{"type":"embed","text":...}` request shape.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Talks to the embedding sidecar, degrading to a deterministic local
/// vector on timeout or connection failure rather than failing the
/// caller (spec.md §5).
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    socket_path: PathBuf,
    timeout: Duration,
    dimension: usize,
}

impl EmbeddingClient {
    pub fn new(socket_path: PathBuf, timeout: Duration, dimension: usize) -> Self {
        Self {
            socket_path,
            timeout,
            dimension,
        }
    }

    /// Embed `text`. Never fails: a sidecar timeout or connection error
    /// degrades to [`fallback_vector`], logged at `warn`.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        match self.try_embed(text).await {
            Ok(vector) => self.project(vector),
            Err(e) => {
                tracing::warn!(error = %e, "embedding sidecar unavailable, using fallback vector");
                fallback_vector(text, self.dimension)
            }
        }
    }

    async fn try_embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let attempt = async {
            let stream = UnixStream::connect(&self.socket_path).await?;
            let (read_half, mut write_half) = stream.into_split();
            let request = EmbedRequest {
                kind: "embed",
                text,
            };
            let mut line = serde_json::to_string(&request)?;
            line.push('\n');
            write_half.write_all(line.as_bytes()).await?;
            write_half.flush().await?;

            let mut reader = BufReader::new(read_half);
            let mut response_line = String::new();
            reader.read_line(&mut response_line).await?;
            let response: EmbedResponse = serde_json::from_str(response_line.trim())?;
            Ok::<Vec<f32>, anyhow::Error>(response.embedding)
        };

        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| anyhow::anyhow!("embedding sidecar timed out"))?
    }

    /// Project a raw sidecar vector to the database's declared
    /// dimension by truncation or zero-padding.
    fn project(&self, mut vector: Vec<f32>) -> Vec<f32> {
        vector.resize(self.dimension, 0.0);
        vector
    }
}

/// Deterministic stand-in embedding used when the sidecar is
/// unreachable. Identical `text` always yields an identical vector, so
/// the idempotent-ingestion property (spec.md §8) holds even across
/// sidecar outages.
pub fn fallback_vector(text: &str, dimension: usize) -> Vec<f32> {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let seed_bytes = hasher.finalize();

    let mut state = u64::from_le_bytes(seed_bytes[0..8].try_into().unwrap());
    let mut next = move || {
        // xorshift64*
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    let mut vector: Vec<f32> = (0..dimension)
        .map(|_| {
            let raw = next();
            ((raw % 2_000_001) as f32 / 1_000_000.0) - 1.0
        })
        .collect();

    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_vector_is_deterministic() {
        let a = fallback_vector("hello world", 16);
        let b = fallback_vector("hello world", 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn fallback_vector_differs_by_content() {
        let a = fallback_vector("hello", 16);
        let b = fallback_vector("world", 16);
        assert_ne!(a, b);
    }

    #[test]
    fn fallback_vector_is_normalized() {
        let v = fallback_vector("normalize me", 32);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }
}
