use crate::error::KdError;
use crate::index::{Entry, FaceIndex, Match, Neighbor, validate_entries};
use crate::metric::{Metric, l2_norm};

/// LinearIndex answers queries by scanning every entry.
///
/// It scores with the same [`Metric`] and cached norms as [`KdTree`](crate::KdTree),
/// so it serves as ground truth in tests and as the baseline in benchmarks.
/// Ties are broken by insertion order.
#[derive(Debug, Clone, Default)]
pub struct LinearIndex {
    metric: Metric,
    entries: Vec<Entry>,
    norms: Vec<f32>,
    dim: usize,
}

impl LinearIndex {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            ..Self::default()
        }
    }

    /// Build a linear index with the same validation as [`KdTree::build`](crate::KdTree::build).
    pub fn from_entries(metric: Metric, entries: Vec<Entry>) -> Result<Self, KdError> {
        let dim = validate_entries(&entries)?;
        let norms = entries.iter().map(|e| l2_norm(&e.vector)).collect();
        Ok(Self {
            metric,
            entries,
            norms,
            dim,
        })
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn nearest(&self, probe: &[f32]) -> Result<Neighbor, KdError> {
        Ok(self
            .search(probe, 1)?
            .into_iter()
            .next()
            .map_or_else(Neighbor::not_found, Neighbor::from))
    }

    pub fn search(&self, probe: &[f32], top_k: usize) -> Result<Vec<Match>, KdError> {
        if self.entries.is_empty() || top_k == 0 {
            return Ok(vec![]);
        }
        if probe.len() != self.dim {
            return Err(KdError::DimensionMismatch {
                got: probe.len(),
                want: self.dim,
            });
        }

        let probe_norm = l2_norm(probe);
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .zip(&self.norms)
            .enumerate()
            .map(|(i, (e, &norm))| (i, self.metric.distance(probe, probe_norm, &e.vector, norm)))
            .collect();

        // Stable, so equal distances keep insertion order.
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(i, distance)| Match {
                id: self.entries[i].id.clone(),
                distance,
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FaceIndex for LinearIndex {
    fn nearest(&self, probe: &[f32]) -> Result<Neighbor, KdError> {
        LinearIndex::nearest(self, probe)
    }

    fn search(&self, probe: &[f32], top_k: usize) -> Result<Vec<Match>, KdError> {
        LinearIndex::search(self, probe, top_k)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}
