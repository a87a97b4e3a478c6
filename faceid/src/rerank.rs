use postamat_kdtree::{Match, l2_norm};
use serde::{Deserialize, Serialize};

/// Age difference, in years, at which the age penalty reaches `1 - e^-3`.
const AGE_SCALE: f32 = 50.0;

/// Base weights of the combined re-ranking score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankWeights {
    pub distance: f32,
    pub gender: f32,
    pub age: f32,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            distance: 0.7,
            gender: 0.2,
            age: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

/// Auxiliary attributes of a face, estimated outside this crate.
/// Unknown values never add a penalty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attributes {
    pub gender: Option<Gender>,
    pub age: Option<u32>,
}

/// Reranker reorders index candidates by a weighted mix of embedding
/// distance and attribute disagreement.
///
/// It only sees the candidates the index returned; it never changes which
/// entries are candidates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reranker {
    weights: RerankWeights,
}

impl Reranker {
    pub fn new(weights: RerankWeights) -> Self {
        Self { weights }
    }

    /// Scales the base weights by the quality of the probe embedding and
    /// normalizes them to sum to 1.
    ///
    /// Quality is `0.5 + ‖v‖ / max|v_i|`, clamped to `[0.5, 1.5]`: a
    /// confident embedding shifts weight onto distance, a weak one onto the
    /// attributes. A zero probe keeps the base proportions.
    pub fn adaptive_weights(&self, probe: &[f32]) -> RerankWeights {
        let peak = probe.iter().fold(0.0f32, |m, x| m.max(x.abs()));
        let quality = if peak > 0.0 {
            (0.5 + l2_norm(probe) / peak).clamp(0.5, 1.5)
        } else {
            1.0
        };

        let w = RerankWeights {
            distance: self.weights.distance * quality,
            gender: self.weights.gender * (2.0 - quality),
            age: self.weights.age * (2.0 - quality),
        };
        let total = w.distance + w.gender + w.age;
        if !(total > 0.0) {
            return w;
        }
        RerankWeights {
            distance: w.distance / total,
            gender: w.gender / total,
            age: w.age / total,
        }
    }

    /// Combined score of one candidate. Lower is better.
    pub fn score(
        &self,
        weights: &RerankWeights,
        distance: f32,
        query: &Attributes,
        candidate: &Attributes,
    ) -> f32 {
        weights.distance * distance
            + weights.gender * gender_penalty(query.gender, candidate.gender)
            + weights.age * age_penalty(query.age, candidate.age)
    }

    /// Re-scores `candidates` and keeps the best `top_k`.
    ///
    /// The returned distances are combined scores. Equal scores keep the
    /// index order.
    pub fn rerank<F>(
        &self,
        probe: &[f32],
        query: &Attributes,
        candidates: Vec<Match>,
        top_k: usize,
        lookup: F,
    ) -> Vec<Match>
    where
        F: Fn(&str) -> Attributes,
    {
        let weights = self.adaptive_weights(probe);
        let mut scored: Vec<Match> = candidates
            .into_iter()
            .map(|m| {
                let attrs = lookup(&m.id);
                let distance = self.score(&weights, m.distance, query, &attrs);
                Match { id: m.id, distance }
            })
            .collect();
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(top_k);
        scored
    }
}

/// 0 for matching or unknown genders, 1 otherwise.
pub fn gender_penalty(a: Option<Gender>, b: Option<Gender>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) if a != b => 1.0,
        _ => 0.0,
    }
}

/// `1 - exp(-3 |Δage| / 50)`, or 0 when either age is unknown.
pub fn age_penalty(a: Option<u32>, b: Option<u32>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) => {
            let diff = a.abs_diff(b) as f32;
            1.0 - (-3.0 * diff / AGE_SCALE).exp()
        }
        _ => 0.0,
    }
}
