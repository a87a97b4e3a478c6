use serde::{Deserialize, Serialize};

use crate::error::KdError;

/// Entry pairs one feature vector with the identifier of the enrolled
/// subject it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub vector: Vec<f32>,
}

impl Entry {
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
        }
    }
}

/// Longest entry id, in bytes, an index accepts.
pub const MAX_ID_LEN: usize = 1 << 16;

/// Largest vector dimension an index accepts.
pub const MAX_DIM: usize = 1 << 20;

/// Checks a build input and returns its common dimension (0 when empty).
///
/// Every vector must be non-empty, no longer than [`MAX_DIM`], finite, and
/// as long as the first one; every id must fit in [`MAX_ID_LEN`] bytes.
/// These are the limits the persisted format is read back with.
pub(crate) fn validate_entries(entries: &[Entry]) -> Result<usize, KdError> {
    let Some(first) = entries.first() else {
        return Ok(0);
    };
    let dim = first.vector.len();
    if dim == 0 {
        return Err(KdError::EmptyVector);
    }
    if dim > MAX_DIM {
        return Err(KdError::DimensionTooLarge { got: dim, max: MAX_DIM });
    }
    for (index, e) in entries.iter().enumerate() {
        if e.vector.len() != dim {
            return Err(KdError::InconsistentDimension {
                index,
                got: e.vector.len(),
                want: dim,
            });
        }
        if e.id.len() > MAX_ID_LEN {
            return Err(KdError::IdTooLong {
                index,
                len: e.id.len(),
                max: MAX_ID_LEN,
            });
        }
        if !e.vector.iter().all(|x| x.is_finite()) {
            return Err(KdError::NonFiniteValue { index });
        }
    }
    Ok(dim)
}

/// Match is a single result from a vector similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Identifier of the matched entry.
    pub id: String,

    /// Distance between the query and matched vector.
    /// Lower values indicate higher similarity.
    pub distance: f32,
}

/// Neighbor is the answer to a nearest-neighbor query.
///
/// `id` is `None` and `distance` is `+inf` when the index is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: Option<String>,
    pub distance: f32,
}

impl Neighbor {
    pub fn not_found() -> Self {
        Self {
            id: None,
            distance: f32::INFINITY,
        }
    }

    pub fn is_found(&self) -> bool {
        self.id.is_some()
    }
}

impl From<Match> for Neighbor {
    fn from(m: Match) -> Self {
        Self {
            id: Some(m.id),
            distance: m.distance,
        }
    }
}

/// FaceIndex is the read side shared by the k-d tree and the linear
/// baseline.
///
/// Implementations are immutable while queried and safe to share across
/// threads.
pub trait FaceIndex: Send + Sync {
    /// Return the closest entry to `probe`.
    fn nearest(&self, probe: &[f32]) -> Result<Neighbor, KdError>;

    /// Return the top-k nearest entries to `probe`, ordered by ascending
    /// distance (closest first).
    fn search(&self, probe: &[f32], top_k: usize) -> Result<Vec<Match>, KdError>;

    /// Return the number of entries in the index.
    fn len(&self) -> usize;

    /// Return true if the index contains no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the vector dimension, or 0 when the index is empty.
    fn dimension(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_limits() {
        let at_limit = Entry::new("x".repeat(MAX_ID_LEN), vec![1.0]);
        assert_eq!(validate_entries(&[at_limit]).unwrap(), 1);

        let long_id = Entry::new("x".repeat(MAX_ID_LEN + 1), vec![1.0]);
        assert!(matches!(
            validate_entries(&[Entry::new("a", vec![0.0]), long_id]),
            Err(KdError::IdTooLong { index: 1, .. })
        ));

        let wide = Entry::new("w", vec![0.0; MAX_DIM + 1]);
        assert!(matches!(
            validate_entries(&[wide]),
            Err(KdError::DimensionTooLarge { .. })
        ));

        let nan = Entry::new("n", vec![1.0, f32::NAN]);
        assert!(matches!(
            validate_entries(&[Entry::new("a", vec![0.0, 0.0]), nan]),
            Err(KdError::NonFiniteValue { index: 1 })
        ));
        assert_eq!(validate_entries(&[]).unwrap(), 0);
    }

    #[test]
    fn neighbor_not_found() {
        let n = Neighbor::not_found();
        assert!(!n.is_found());
        assert!(n.distance.is_infinite());
    }

    #[test]
    fn neighbor_from_match() {
        let n: Neighbor = Match {
            id: "a".into(),
            distance: 0.5,
        }
        .into();
        assert_eq!(n.id.as_deref(), Some("a"));
        assert_eq!(n.distance, 0.5);
    }
}
