use std::path::Path;

use postamat_kdtree::Config as IndexConfig;
use serde::{Deserialize, Serialize};

use crate::FaceIdError;
use crate::rerank::RerankWeights;

/// Controls verifier behavior.
///
/// ```yaml
/// index:
///   metric: euclidean
///   axis_policy: max_variance
/// threshold: 0.6
/// candidate_expansion: 5
/// rerank:
///   distance: 0.7
///   gender: 0.2
///   age: 0.1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// k-d tree settings.
    pub index: IndexConfig,

    /// A probe is accepted iff its nearest distance is strictly below this.
    /// Must be finite and positive. Default: 0.6.
    pub threshold: f32,

    /// `candidates(k)` pulls `k * candidate_expansion` entries from the
    /// index before re-ranking. Default: 5.
    pub candidate_expansion: usize,

    /// Attribute re-ranking; disabled when absent.
    pub rerank: Option<RerankWeights>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            threshold: 0.6,
            candidate_expansion: 5,
            rerank: None,
        }
    }
}

impl VerifierConfig {
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.candidate_expansion == 0 {
            self.candidate_expansion = 5;
        }
        self
    }

    /// Checks values that have no sensible fallback.
    pub fn validate(&self) -> Result<(), FaceIdError> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(FaceIdError::Config(format!(
                "threshold must be finite and positive, got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    /// Parse a config from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, FaceIdError> {
        let cfg: Self =
            serde_json::from_slice(data).map_err(|e| FaceIdError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg.with_defaults())
    }

    /// Parse a config from YAML bytes.
    pub fn from_yaml(data: &[u8]) -> Result<Self, FaceIdError> {
        let cfg: Self =
            serde_yaml::from_slice(data).map_err(|e| FaceIdError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg.with_defaults())
    }

    /// Parse a config file, choosing the format by extension.
    pub fn from_file(path: &Path) -> Result<Self, FaceIdError> {
        let data = std::fs::read(path)
            .map_err(|e| FaceIdError::Config(format!("read {}: {}", path.display(), e)))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "json" => Self::from_json(&data),
            "yaml" | "yml" => Self::from_yaml(&data),
            _ => Err(FaceIdError::Config(format!(
                "unsupported config extension: {ext}"
            ))),
        }
    }
}
