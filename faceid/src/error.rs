use postamat_kdtree::KdError;
use thiserror::Error;

/// Errors returned by faceid operations.
#[derive(Debug, Error)]
pub enum FaceIdError {
    #[error(transparent)]
    Index(#[from] KdError),

    #[error("faceid: store error: {0}")]
    Store(String),

    #[error("faceid: embedding error: {0}")]
    Embedding(String),

    #[error("faceid: config error: {0}")]
    Config(String),

    #[error("faceid: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}
