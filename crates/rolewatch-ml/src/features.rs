//! Feature vector for ML models

use crate::FEATURE_DIM;

/// Fixed-size feature vector for ML inference
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    data: Vec<f32>,
    dim: usize,
}

impl FeatureVector {
    /// Create new feature vector with dimension
    pub fn new(dim: usize) -> Self {
        Self {
            data: vec![0.0; dim],
            dim,
        }
    }

    /// Create from slice
    pub fn from_slice(data: &[f32]) -> Self {
        Self {
            dim: data.len(),
            data: data.to_vec(),
        }
    }

    /// Set feature at index (non-finite values are stored as zero)
    #[inline]
    pub fn set(&mut self, index: usize, value: f32) {
        if index < self.dim {
            self.data[index] = if value.is_finite() { value } else { 0.0 };
        }
    }

    /// Get feature at index
    #[inline]
    pub fn get(&self, index: usize) -> f32 {
        self.data.get(index).copied().unwrap_or(0.0)
    }

    /// Get dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Get as slice
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Dot product with a weight row
    pub fn dot(&self, weights: &[f32]) -> f32 {
        self.data.iter()
            .zip(weights.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Cosine similarity with another vector
    pub fn cosine_similarity(&self, other: &[f32]) -> f32 {
        let dot = self.dot(other);
        let norm_a: f32 = self.data.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = other.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a > 0.001 && norm_b > 0.001 {
            dot / (norm_a * norm_b)
        } else {
            0.0
        }
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::new(FEATURE_DIM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_vector() {
        let mut fv = FeatureVector::new(4);
        fv.set(0, 1.0);
        fv.set(3, 4.0);
        fv.set(9, 7.0);
        fv.set(1, f32::NAN);

        assert_eq!(fv.get(0), 1.0);
        assert_eq!(fv.get(1), 0.0);
        assert_eq!(fv.get(3), 4.0);
        assert_eq!(fv.get(9), 0.0);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = FeatureVector::from_slice(&[1.0, 0.0, 0.0]);

        assert!((a.cosine_similarity(&[1.0, 0.0, 0.0]) - 1.0).abs() < 0.01);
        assert!((a.cosine_similarity(&[0.0, 1.0, 0.0]) - 0.0).abs() < 0.01);
        assert_eq!(a.cosine_similarity(&[0.0, 0.0, 0.0]), 0.0);
    }
}
