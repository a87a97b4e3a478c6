use std::sync::Arc;

use parking_lot::Mutex;
use postamat_kdtree::Entry;

use crate::FaceIdError;

/// Persists enrolled embeddings so the index can be rebuilt from scratch.
///
/// Implementations must be safe for concurrent use.
/// Use [`MemoryStore`] for in-memory storage (testing/ephemeral).
pub trait EnrollmentStore: Send + Sync {
    /// Stores an embedding for subject `id`. Returns a unique sequence number.
    fn add(&self, id: &str, emb: &[f32]) -> Result<u64, FaceIdError>;

    /// Returns all stored entries in insertion order.
    fn all(&self) -> Result<Vec<Entry>, FaceIdError>;

    /// Returns the count of stored entries.
    fn len(&self) -> Result<usize, FaceIdError>;

    /// Removes all stored entries.
    fn clear(&self) -> Result<(), FaceIdError>;
}

/// In-memory [`EnrollmentStore`] implementation.
/// Data is lost on restart.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

struct MemoryStoreInner {
    data: Vec<Entry>,
    seq: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner {
                data: Vec::new(),
                seq: 0,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnrollmentStore for MemoryStore {
    fn add(&self, id: &str, emb: &[f32]) -> Result<u64, FaceIdError> {
        let mut inner = self.inner.lock();
        inner.data.push(Entry::new(id, emb.to_vec()));
        inner.seq += 1;
        Ok(inner.seq)
    }

    fn all(&self) -> Result<Vec<Entry>, FaceIdError> {
        Ok(self.inner.lock().data.clone())
    }

    fn len(&self) -> Result<usize, FaceIdError> {
        Ok(self.inner.lock().data.len())
    }

    fn clear(&self) -> Result<(), FaceIdError> {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.seq = 0;
        Ok(())
    }
}

// Lets a caller keep a handle on the store it hands to a verifier.
impl<S: EnrollmentStore + ?Sized> EnrollmentStore for Arc<S> {
    fn add(&self, id: &str, emb: &[f32]) -> Result<u64, FaceIdError> {
        (**self).add(id, emb)
    }

    fn all(&self) -> Result<Vec<Entry>, FaceIdError> {
        (**self).all()
    }

    fn len(&self) -> Result<usize, FaceIdError> {
        (**self).len()
    }

    fn clear(&self) -> Result<(), FaceIdError> {
        (**self).clear()
    }
}
