use thiserror::Error;

#[derive(Error, Debug)]
pub enum KdError {
    #[error("kdtree: dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },

    #[error("kdtree: entry {index} has dimension {got}, want {want}")]
    InconsistentDimension { index: usize, got: usize, want: usize },

    #[error("kdtree: feature vectors must not be empty")]
    EmptyVector,

    #[error("kdtree: dimension {got} exceeds the maximum {max}")]
    DimensionTooLarge { got: usize, max: usize },

    #[error("kdtree: entry {index} id is {len} bytes, max {max}")]
    IdTooLong { index: usize, len: usize, max: usize },

    #[error("kdtree: entry {index} has a non-finite component")]
    NonFiniteValue { index: usize },

    #[error("kdtree: invalid config: {0}")]
    InvalidConfig(String),

    #[error("kdtree: {0}")]
    Io(String),

    #[error("kdtree: corrupt data: {0}")]
    CorruptData(String),
}
