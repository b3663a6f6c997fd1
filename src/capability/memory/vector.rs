use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use super::MemoryError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub key: String,
    pub score: f64,
}

/// In-memory vector store ranked by cosine similarity.
///
/// Every vector has the same dimension: the configured one, or the
/// dimension of the first vector stored.
pub struct VectorStore {
    inner: RwLock<Inner>,
}

struct Inner {
    dimensions: Option<usize>,
    vectors: HashMap<String, Vec<f32>>,
}

impl VectorStore {
    pub fn new(dimensions: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                dimensions: dimensions.filter(|d| *d > 0),
                vectors: HashMap::new(),
            }),
        }
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.inner.read().dimensions
    }

    pub fn put(&self, key: &str, vector: Vec<f32>) -> Result<(), MemoryError> {
        if key.is_empty() {
            return Err(MemoryError::EmptyKey);
        }
        if vector.is_empty() {
            return Err(MemoryError::EmptyVector);
        }
        let mut inner = self.inner.write();
        match inner.dimensions {
            Some(expected) if expected != vector.len() => {
                return Err(MemoryError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                })
            }
            Some(_) => {}
            None => inner.dimensions = Some(vector.len()),
        }
        inner.vectors.insert(key.to_string(), vector);
        Ok(())
    }

    /// Top `limit` keys by cosine similarity; ties are broken by key.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<Match>, MemoryError> {
        if query.is_empty() {
            return Err(MemoryError::EmptyVector);
        }
        let inner = self.inner.read();
        if let Some(expected) = inner.dimensions {
            if expected != query.len() {
                return Err(MemoryError::DimensionMismatch {
                    expected,
                    got: query.len(),
                });
            }
        }

        let mut matches: Vec<Match> = inner
            .vectors
            .iter()
            .map(|(key, vector)| Match {
                key: key.clone(),
                score: cosine(query, vector),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        matches.truncate(limit);
        Ok(matches)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut mag_a, mut mag_b) = (0f64, 0f64, 0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a.sqrt() * mag_b.sqrt())
}
