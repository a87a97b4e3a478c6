use serde::{Deserialize, Serialize};

use crate::error::KdError;
use crate::metric::Metric;

/// Config controls how a [`KdTree`](crate::KdTree) splits and scores.
///
/// Deserializes with per-field defaults, so `{}` is a valid config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Distance function. Default: Euclidean.
    pub metric: Metric,
    /// How the split axis is chosen at each node. Default: MaxVariance.
    pub axis_policy: AxisPolicy,
    /// Scalar reduction of a vector on an axis. Default: Coordinate.
    pub split_key: SplitKey,
    /// Widens the far-side visit test: the far child is explored while
    /// `plane_bound < best * slack`. Values below 1.0 are reset to 1.0.
    pub slack: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            axis_policy: AxisPolicy::default(),
            split_key: SplitKey::default(),
            slack: 1.0,
        }
    }
}

/// Split axis selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisPolicy {
    /// Root splits on axis 0, each child on `(parent + 1) mod axes`.
    RoundRobin,
    /// Axis with the largest key variance over the entries being split.
    /// Lowest axis wins ties.
    #[default]
    MaxVariance,
}

/// Reduction of a feature vector to one scalar per axis.
///
/// `Coordinate` is the textbook k-d tree. `ColumnMean` reads the vector as a
/// row-major matrix (for example a grayscale face crop) and reduces column
/// `axis` to its mean. A column mean is not a coordinate, so for multi-row
/// vectors the tree orders entries by a summary of the data rather than the
/// data itself. See [`Metric::plane_bound`] for when search stays exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKey {
    #[default]
    Coordinate,
    ColumnMean { columns: usize },
}

impl SplitKey {
    /// Number of split axes for vectors of dimension `dim`.
    pub fn axes(self, dim: usize) -> usize {
        match self {
            SplitKey::Coordinate => dim,
            SplitKey::ColumnMean { columns } => columns,
        }
    }

    /// Key of `v` on `axis`. `v` must be valid for this split key.
    pub fn key(self, v: &[f32], axis: usize) -> f32 {
        match self {
            SplitKey::Coordinate => v[axis],
            SplitKey::ColumnMean { columns } => {
                let rows = v.len() / columns;
                let sum: f64 = (0..rows).map(|r| v[r * columns + axis] as f64).sum();
                (sum / rows as f64) as f32
            }
        }
    }

    /// Keys of `v` on every axis.
    pub fn keys(self, v: &[f32]) -> Vec<f32> {
        (0..self.axes(v.len())).map(|a| self.key(v, a)).collect()
    }

    /// Checks that vectors of dimension `dim` can be reduced by this key.
    pub fn validate(self, dim: usize) -> Result<(), KdError> {
        match self {
            SplitKey::Coordinate => Ok(()),
            SplitKey::ColumnMean { columns: 0 } => Err(KdError::InvalidConfig(
                "column_mean requires at least one column".into(),
            )),
            SplitKey::ColumnMean { columns } if dim % columns != 0 => {
                Err(KdError::InvalidConfig(format!(
                    "dimension {dim} is not a multiple of {columns} columns"
                )))
            }
            SplitKey::ColumnMean { .. } => Ok(()),
        }
    }
}

impl Config {
    pub(crate) fn set_defaults(&mut self) {
        if !self.slack.is_finite() || self.slack < 1.0 {
            self.slack = 1.0;
        }
    }
}

impl AxisPolicy {
    pub(crate) fn tag(self) -> u8 {
        match self {
            AxisPolicy::RoundRobin => 0,
            AxisPolicy::MaxVariance => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(AxisPolicy::RoundRobin),
            1 => Some(AxisPolicy::MaxVariance),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.metric, Metric::Euclidean);
        assert_eq!(cfg.axis_policy, AxisPolicy::MaxVariance);
        assert_eq!(cfg.split_key, SplitKey::Coordinate);
        assert_eq!(cfg.slack, 1.0);
    }

    #[test]
    fn slack_reset() {
        let mut cfg = Config {
            slack: 0.2,
            ..Config::default()
        };
        cfg.set_defaults();
        assert_eq!(cfg.slack, 1.0);

        cfg.slack = f32::NAN;
        cfg.set_defaults();
        assert_eq!(cfg.slack, 1.0);

        cfg.slack = 3.0;
        cfg.set_defaults();
        assert_eq!(cfg.slack, 3.0);
    }

    #[test]
    fn deserialize_partial() {
        let cfg: Config = serde_json::from_str(r#"{"metric":"cosine"}"#).unwrap();
        assert_eq!(cfg.metric, Metric::Cosine);
        assert_eq!(cfg.axis_policy, AxisPolicy::MaxVariance);

        let cfg: Config = serde_json::from_str(
            r#"{"axis_policy":"round_robin","split_key":{"column_mean":{"columns":4}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.axis_policy, AxisPolicy::RoundRobin);
        assert_eq!(cfg.split_key, SplitKey::ColumnMean { columns: 4 });
    }

    #[test]
    fn coordinate_key() {
        let k = SplitKey::Coordinate;
        assert_eq!(k.axes(3), 3);
        assert_eq!(k.keys(&[1.0, 2.0, 3.0]), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn column_mean_key() {
        // 2 rows x 3 columns.
        let v = [1.0, 2.0, 3.0, 3.0, 4.0, 5.0];
        let k = SplitKey::ColumnMean { columns: 3 };
        assert_eq!(k.axes(v.len()), 3);
        assert_eq!(k.keys(&v), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn column_mean_validation() {
        assert!(SplitKey::ColumnMean { columns: 3 }.validate(6).is_ok());
        assert!(SplitKey::ColumnMean { columns: 4 }.validate(6).is_err());
        assert!(SplitKey::ColumnMean { columns: 0 }.validate(6).is_err());
        assert!(SplitKey::Coordinate.validate(7).is_ok());
    }
}
