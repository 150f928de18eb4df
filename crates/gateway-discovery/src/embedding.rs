//! Embedding provider seam (SPEC_FULL.md §4.5). A real deployment
//! wires in a sentence-embedding model; tests and offline operation use
//! a deterministic hash-based fallback so the hybrid scorer has
//! something stable to rank against without a model dependency.

use sha2::{Digest, Sha256};

pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic, model-free embedding: repeatedly hashes the input
/// and spreads the digest bytes across the configured dimension, then
/// L2-normalizes. Captures nothing about semantics beyond exact/near
/// text overlap, but is stable across runs and processes, which is
/// enough to exercise the hybrid-scoring machinery end to end.
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0f32; self.dimension];
        let mut counter: u32 = 0;
        let mut filled = 0;
        while filled < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for byte in digest.iter() {
                if filled >= self.dimension {
                    break;
                }
                // Map byte 0..=255 to roughly -1.0..=1.0
                out[filled] = (*byte as f32 - 127.5) / 127.5;
                filled += 1;
            }
            counter += 1;
        }
        normalize(&mut out);
        out
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_are_deterministic_and_correctly_sized() {
        let provider = HashEmbeddingProvider::new(384);
        let a = provider.embed("current time by timezone");
        let b = provider.embed("current time by timezone");
        assert_eq!(a.len(), 384);
        assert_eq!(a, b);
    }

    #[test]
    fn identical_text_has_cosine_similarity_one() {
        let provider = HashEmbeddingProvider::new(32);
        let v = provider.embed("weather forecast");
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-4);
    }

    #[test]
    fn different_text_has_lower_similarity() {
        let provider = HashEmbeddingProvider::new(64);
        let a = provider.embed("weather forecast");
        let b = provider.embed("quantum chromodynamics");
        assert!(cosine_similarity(&a, &b) < 0.9);
    }
}
