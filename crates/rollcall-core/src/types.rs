use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("roll number is required")]
pub struct InvalidRollNumber;

/// User-visible external code of an identity. Always trimmed and uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RollNumber(String);

impl RollNumber {
    pub fn new(raw: &str) -> Result<Self, InvalidRollNumber> {
        let code = raw.trim().to_uppercase();
        if code.is_empty() {
            return Err(InvalidRollNumber);
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RollNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RollNumber {
    type Err = InvalidRollNumber;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RollNumber {
    type Error = InvalidRollNumber;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<RollNumber> for String {
    fn from(roll: RollNumber) -> Self {
        roll.0
    }
}

/// One independent extraction pipeline. Vectors from different families
/// live in different spaces and are never compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingFamily {
    /// General-purpose face-net style embedder on RGB crops.
    General,
    /// Small learned CNN embedder on grayscale crops.
    Compact,
}

impl EmbeddingFamily {
    pub const ALL: [EmbeddingFamily; 2] = [EmbeddingFamily::General, EmbeddingFamily::Compact];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingFamily::General => "general",
            EmbeddingFamily::Compact => "compact",
        }
    }

    /// Empirically tuned acceptance threshold for this family.
    pub fn default_threshold(&self) -> f32 {
        match self {
            EmbeddingFamily::General => 0.70,
            EmbeddingFamily::Compact => 0.94,
        }
    }
}

impl fmt::Display for EmbeddingFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cosine similarity is undefined for these inputs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DegenerateVector {
    #[error("degenerate vector: zero norm")]
    ZeroNorm,
    #[error("degenerate vector: dimension mismatch ({left} vs {right})")]
    DimensionMismatch { left: usize, right: usize },
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet-keras").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Accumulates in f64. Fails instead of returning 0 when either vector
    /// has zero norm or the dimensions differ.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, DegenerateVector> {
        if self.values.len() != other.values.len() {
            return Err(DegenerateVector::DimensionMismatch {
                left: self.values.len(),
                right: other.values.len(),
            });
        }

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (*a as f64, *b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            return Err(DegenerateVector::ZeroNorm);
        }

        let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
        Ok(similarity.clamp(-1.0, 1.0) as f32)
    }

    /// Element-wise arithmetic mean. `Ok(None)` for an empty slice.
    pub fn mean(items: &[Embedding]) -> Result<Option<Embedding>, DegenerateVector> {
        let Some(first) = items.first() else {
            return Ok(None);
        };

        let dim = first.dim();
        let mut sums = vec![0.0f64; dim];
        for item in items {
            if item.dim() != dim {
                return Err(DegenerateVector::DimensionMismatch {
                    left: dim,
                    right: item.dim(),
                });
            }
            for (sum, v) in sums.iter_mut().zip(item.values.iter()) {
                *sum += *v as f64;
            }
        }

        let n = items.len() as f64;
        Ok(Some(Embedding {
            values: sums.into_iter().map(|s| (s / n) as f32).collect(),
            model_version: first.model_version.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_scale_invariant() {
        let a = Embedding::new(vec![3.0, 4.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b).unwrap(), 0.6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector_is_degenerate() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), Err(DegenerateVector::ZeroNorm));
        assert_eq!(b.similarity(&a), Err(DegenerateVector::ZeroNorm));
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(
            a.similarity(&b),
            Err(DegenerateVector::DimensionMismatch { left: 2, right: 3 })
        );
    }

    #[test]
    fn test_mean_is_elementwise() {
        let items = vec![
            Embedding::new(vec![1.0, 0.0, 2.0]),
            Embedding::new(vec![3.0, 2.0, 4.0]),
        ];
        let mean = Embedding::mean(&items).unwrap().unwrap();
        assert_eq!(mean.values, vec![2.0, 1.0, 3.0]);
    }

    #[test]
    fn test_mean_empty() {
        assert_eq!(Embedding::mean(&[]).unwrap(), None);
    }

    #[test]
    fn test_mean_rejects_mixed_dimensions() {
        let items = vec![Embedding::new(vec![1.0]), Embedding::new(vec![1.0, 2.0])];
        assert!(Embedding::mean(&items).is_err());
    }

    #[test]
    fn test_roll_number_is_normalized() {
        let roll = RollNumber::new("  23bd1a056d ").unwrap();
        assert_eq!(roll.as_str(), "23BD1A056D");
        assert_eq!(RollNumber::new("   "), Err(InvalidRollNumber));
    }

    #[test]
    fn test_roll_number_serde_uppercases() {
        let roll: RollNumber = serde_json::from_str("\"x1\"").unwrap();
        assert_eq!(roll.as_str(), "X1");
        assert_eq!(serde_json::to_string(&roll).unwrap(), "\"X1\"");
    }
}
