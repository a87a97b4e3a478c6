use crate::FaceIdError;

/// Extracts face embedding vectors from an encoded image.
///
/// The output is a dense f32 vector whose dimensionality is returned by
/// [`FaceEmbedder::dimension`]. Detection, alignment and the model itself
/// are up to the implementation.
///
/// Implementations must be safe for concurrent use.
pub trait FaceEmbedder: Send + Sync {
    /// Computes a face embedding from raw image bytes.
    fn extract(&self, image: &[u8]) -> Result<Vec<f32>, FaceIdError>;

    /// Returns the dimensionality of the embedding vectors (e.g., 128).
    fn dimension(&self) -> usize;
}

/// Runs `embedder` and checks the output length against its declared
/// dimension.
pub(crate) fn extract_checked(
    embedder: &dyn FaceEmbedder,
    image: &[u8],
) -> Result<Vec<f32>, FaceIdError> {
    let emb = embedder.extract(image)?;
    if emb.len() != embedder.dimension() {
        return Err(FaceIdError::DimensionMismatch {
            expected: embedder.dimension(),
            got: emb.len(),
        });
    }
    Ok(emb)
}
