use serde::{Deserialize, Serialize};

/// Distance function used both for "best so far" bookkeeping and for the
/// distance reported to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Euclidean norm of the difference.
    #[default]
    Euclidean,
    /// `1 - cos(θ)`, in `[0, 2]`.
    Cosine,
    /// Mean of the absolute component differences.
    MeanAbsolute,
}

impl Metric {
    /// Distance between `a` and `b`. The norms are the cached Euclidean
    /// norms of both vectors and are only read by [`Metric::Cosine`].
    pub fn distance(self, a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
        match self {
            Metric::Euclidean => euclidean_distance(a, b),
            Metric::Cosine => cosine_distance_with_norms(a, a_norm, b, b_norm),
            Metric::MeanAbsolute => mean_absolute_distance(a, b),
        }
    }

    /// Converts the key gap between a probe and a splitting plane into a
    /// lower bound on the distance to anything on the far side.
    ///
    /// A key is either one coordinate or the mean of one column, so
    /// `|gap| <= ‖a - b‖` for Euclidean and `|gap| <= axes * mean|a - b|`
    /// for mean-absolute distance. Cosine distance has no such bound; the
    /// raw gap is used and the search is approximate.
    pub fn plane_bound(self, gap: f32, axes: usize) -> f32 {
        let gap = gap.abs();
        match self {
            Metric::Euclidean | Metric::Cosine => gap,
            Metric::MeanAbsolute => gap / axes.max(1) as f32,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Metric::Euclidean => 0,
            Metric::Cosine => 1,
            Metric::MeanAbsolute => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Metric::Euclidean),
            1 => Some(Metric::Cosine),
            2 => Some(Metric::MeanAbsolute),
            _ => None,
        }
    }
}

/// Euclidean norm of a vector, accumulated in f64.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter()
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt() as f32
}

/// Euclidean distance between two vectors of equal length.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Mean absolute difference between two vectors of equal length.
/// Returns 0.0 for empty vectors.
pub fn mean_absolute_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| (x as f64 - y as f64).abs())
        .sum();
    (sum / a.len() as f64) as f32
}

/// Compute the cosine distance between two vectors.
///
/// Returns a value in `[0, 2]` where 0 means identical direction and
/// 2 means opposite direction. Returns 2.0 for zero vectors or dimension
/// mismatches.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 2.0;
    }
    cosine_distance_with_norms(a, l2_norm(a), b, l2_norm(b))
}

/// Cosine distance with precomputed norms.
pub fn cosine_distance_with_norms(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    if a_norm == 0.0 || b_norm == 0.0 {
        return 2.0;
    }

    let dot: f64 = a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum();
    let similarity = dot / (a_norm as f64 * b_norm as f64);
    // Clamp to [-1, 1] to handle floating point errors.
    let similarity = similarity.clamp(-1.0, 1.0);
    (1.0 - similarity) as f32
}
