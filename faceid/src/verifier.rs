use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use postamat_kdtree::{Entry, KdError, KdTree, Match, persist};
use tracing::{debug, info};

use crate::FaceIdError;
use crate::config::VerifierConfig;
use crate::embedder::{FaceEmbedder, extract_checked};
use crate::rerank::{Attributes, Reranker};
use crate::store::{EnrollmentStore, MemoryStore};

/// Result of matching one probe against the enrolled population.
#[derive(Debug, Clone, PartialEq)]
pub struct Identification {
    /// Matched subject, or `None` when rejected or nobody is enrolled.
    pub id: Option<String>,

    /// Distance to the nearest enrolled entry, kept even when rejected.
    /// `+inf` when nobody is enrolled.
    pub distance: f32,

    /// True iff `distance < threshold`.
    pub accepted: bool,
}

/// Verifies faces against enrolled subjects.
///
/// Enrolled embeddings live in an [`EnrollmentStore`]; the searchable index
/// is a [`KdTree`] snapshot rebuilt from the store. Queries clone the live
/// `Arc` and run without holding any lock, and a rebuild builds the new
/// tree off to the side before swapping it in, so readers see either the
/// old or the new index in full.
///
/// Thread-safe: all methods can be called concurrently.
pub struct Verifier {
    cfg: VerifierConfig,
    reranker: Option<Reranker>,
    index: RwLock<Arc<KdTree>>,
    store: Box<dyn EnrollmentStore>,
    attributes: RwLock<HashMap<String, Attributes>>,
    // Serializes read-store/build/swap so an older population never
    // replaces a newer one.
    rebuild_lock: Mutex<()>,
}

impl Verifier {
    /// Creates a verifier with an empty index. Call [`Verifier::rebuild`]
    /// when `store` already holds enrollments.
    ///
    /// The threshold is used as given; run [`VerifierConfig::validate`] on
    /// configs not built by its parsers.
    pub fn new(cfg: VerifierConfig, store: Box<dyn EnrollmentStore>) -> Self {
        let cfg = cfg.with_defaults();
        Self {
            reranker: cfg.rerank.map(Reranker::new),
            index: RwLock::new(Arc::new(KdTree::new(cfg.index))),
            store,
            attributes: RwLock::new(HashMap::new()),
            rebuild_lock: Mutex::new(()),
            cfg,
        }
    }

    /// Creates a verifier with an in-memory store.
    pub fn with_memory_store(cfg: VerifierConfig) -> Self {
        Self::new(cfg, Box::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.cfg
    }

    /// Rebuilds the index from every stored enrollment and swaps it in.
    /// Returns the number of indexed entries. On error the live index is
    /// unchanged.
    pub fn rebuild(&self) -> Result<usize, FaceIdError> {
        let _guard = self.rebuild_lock.lock();
        let entries = self.store.all()?;
        let tree = KdTree::from_entries(self.cfg.index, entries)?;
        Ok(self.swap_in(tree))
    }

    /// Enrolls one embedding for subject `id` and rebuilds the index.
    /// Returns the new index size.
    ///
    /// The new index is built before the store is written, so an embedding
    /// the index rejects is never stored.
    pub fn enroll(&self, id: &str, emb: &[f32]) -> Result<usize, FaceIdError> {
        if emb.is_empty() {
            return Err(KdError::EmptyVector.into());
        }
        let _guard = self.rebuild_lock.lock();
        let mut entries = self.store.all()?;
        if let Some(first) = entries.first() {
            let dim = first.vector.len();
            if emb.len() != dim {
                return Err(FaceIdError::DimensionMismatch {
                    expected: dim,
                    got: emb.len(),
                });
            }
        }
        entries.push(Entry::new(id, emb.to_vec()));
        let tree = KdTree::from_entries(self.cfg.index, entries)?;

        let seq = self.store.add(id, emb)?;
        debug!("faceid: enrolled {} (seq {})", id, seq);
        Ok(self.swap_in(tree))
    }

    // Caller holds `rebuild_lock`.
    fn swap_in(&self, tree: KdTree) -> usize {
        let n = tree.len();
        *self.index.write() = Arc::new(tree);
        info!("faceid: rebuilt index with {} entries", n);
        n
    }

    /// Extracts an embedding from `image` and enrolls it.
    pub fn enroll_image(
        &self,
        id: &str,
        embedder: &dyn FaceEmbedder,
        image: &[u8],
    ) -> Result<usize, FaceIdError> {
        let emb = extract_checked(embedder, image)?;
        self.enroll(id, &emb)
    }

    /// Matches `probe` against the enrolled population.
    pub fn identify(&self, probe: &[f32]) -> Result<Identification, FaceIdError> {
        let n = self.snapshot().nearest(probe)?;
        let accepted = n.is_found() && n.distance < self.cfg.threshold;
        debug!(
            "faceid: nearest {:?} at {:.4}, accepted={}",
            n.id, n.distance, accepted
        );
        Ok(Identification {
            id: if accepted { n.id } else { None },
            distance: n.distance,
            accepted,
        })
    }

    /// Extracts an embedding from `image` and identifies it.
    pub fn identify_image(
        &self,
        embedder: &dyn FaceEmbedder,
        image: &[u8],
    ) -> Result<Identification, FaceIdError> {
        let emb = extract_checked(embedder, image)?;
        self.identify(&emb)
    }

    /// Returns up to `top_k` candidates for `probe`, closest first.
    ///
    /// With re-ranking configured and `query` attributes given, the index
    /// is asked for `top_k * candidate_expansion` entries which are then
    /// re-scored; the returned distances are combined scores. Otherwise the
    /// raw index distances are returned.
    pub fn candidates(
        &self,
        probe: &[f32],
        top_k: usize,
        query: Option<&Attributes>,
    ) -> Result<Vec<Match>, FaceIdError> {
        let tree = self.snapshot();
        match (self.reranker, query) {
            (Some(reranker), Some(query)) => {
                let expanded = top_k.saturating_mul(self.cfg.candidate_expansion);
                let found = tree.search(probe, expanded)?;
                let attrs = self.attributes.read();
                Ok(reranker.rerank(probe, query, found, top_k, |id| {
                    attrs.get(id).copied().unwrap_or_default()
                }))
            }
            _ => Ok(tree.search(probe, top_k)?),
        }
    }

    /// Records auxiliary attributes for subject `id`, used by re-ranking.
    pub fn set_attributes(&self, id: &str, attrs: Attributes) {
        self.attributes.write().insert(id.to_string(), attrs);
    }

    /// Returns the live index.
    pub fn snapshot(&self) -> Arc<KdTree> {
        Arc::clone(&self.index.read())
    }

    /// Number of entries in the live index.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Saves the live index to `path`. Returns `Ok(false)` when there is
    /// nothing to save.
    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<bool, FaceIdError> {
        Ok(persist::save_file(&self.snapshot(), path)?)
    }

    /// Loads an index saved by [`Verifier::save_state`] and swaps it in.
    ///
    /// Returns the number of loaded entries. A missing file loads nothing
    /// and keeps the live index; corrupt data is an error and also keeps it.
    ///
    /// The loaded entries are copied into the enrollment store so later
    /// enrollments rebuild on top of them. The store must be empty: loading
    /// over existing enrollments is refused with [`FaceIdError::Store`].
    pub fn load_state(&self, path: impl AsRef<Path>) -> Result<usize, FaceIdError> {
        let tree = persist::load_file(path)?;
        if tree.is_empty() {
            return Ok(0);
        }

        let _guard = self.rebuild_lock.lock();
        let held = self.store.len()?;
        if held != 0 {
            return Err(FaceIdError::Store(format!(
                "store already holds {held} enrollments, refusing to load saved state"
            )));
        }
        for e in tree.entries() {
            if let Err(err) = self.store.add(&e.id, &e.vector) {
                let _ = self.store.clear();
                return Err(err);
            }
        }
        Ok(self.swap_in(tree))
    }
}

#[cfg(test)]
mod tests {
    use postamat_kdtree::{Metric, SplitKey};

    use super::*;
    use crate::rerank::{Gender, RerankWeights};

    fn verifier() -> Verifier {
        Verifier::with_memory_store(VerifierConfig::default())
    }

    #[test]
    fn identify_empty() {
        let v = verifier();
        let id = v.identify(&[1.0, 2.0]).unwrap();
        assert_eq!(id.id, None);
        assert!(!id.accepted);
        assert!(id.distance.is_infinite());
        assert!(v.is_empty());
    }

    #[test]
    fn threshold_accept_reject() {
        let v = verifier();
        v.enroll("alice", &[0.0, 0.0]).unwrap();
        v.enroll("bob", &[10.0, 10.0]).unwrap();
        assert_eq!(v.len(), 2);

        let hit = v.identify(&[0.3, 0.4]).unwrap();
        assert_eq!(hit.id.as_deref(), Some("alice"));
        assert!(hit.accepted);
        assert!((hit.distance - 0.5).abs() < 1e-6);

        let miss = v.identify(&[3.0, 4.0]).unwrap();
        assert_eq!(miss.id, None);
        assert!(!miss.accepted);
        assert!((miss.distance - 5.0).abs() < 1e-6);

        // Strictly below the threshold.
        let edge = v.identify(&[0.6, 0.0]).unwrap();
        assert!(!edge.accepted);
    }

    #[test]
    fn enroll_dimension_mismatch() {
        let v = verifier();
        v.enroll("alice", &[0.0, 0.0]).unwrap();
        assert!(matches!(
            v.enroll("bob", &[1.0, 2.0, 3.0]),
            Err(FaceIdError::DimensionMismatch { expected: 2, got: 3 })
        ));
        assert!(matches!(
            v.enroll("bob", &[]),
            Err(FaceIdError::Index(KdError::EmptyVector))
        ));
        assert_eq!(v.len(), 1);
        assert!(matches!(
            v.identify(&[1.0]),
            Err(FaceIdError::Index(KdError::DimensionMismatch { got: 1, want: 2 }))
        ));
    }

    #[test]
    fn snapshot_survives_rebuild() {
        let v = verifier();
        v.enroll("alice", &[0.0, 0.0]).unwrap();
        let before = v.snapshot();
        v.enroll("bob", &[5.0, 5.0]).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(v.snapshot().len(), 2);
    }

    #[test]
    fn rebuild_from_prefilled_store() {
        let store = MemoryStore::new();
        store.add("a", &[1.0, 1.0, 1.0]).unwrap();
        store.add("b", &[2.0, 2.0, 2.0]).unwrap();
        let v = Verifier::new(VerifierConfig::default(), Box::new(store));
        assert!(v.is_empty());
        assert_eq!(v.rebuild().unwrap(), 2);
        assert_eq!(v.identify(&[2.0, 2.0, 2.1]).unwrap().id.as_deref(), Some("b"));
    }

    #[test]
    fn candidates_with_rerank() {
        let cfg = VerifierConfig {
            index: postamat_kdtree::Config {
                metric: Metric::Euclidean,
                ..Default::default()
            },
            rerank: Some(RerankWeights {
                distance: 0.5,
                gender: 0.5,
                age: 0.0,
            }),
            ..VerifierConfig::default()
        };
        let v = Verifier::with_memory_store(cfg);
        v.enroll("f", &[0.0, 1.0]).unwrap();
        v.enroll("m", &[0.0, 1.2]).unwrap();
        v.set_attributes("f", Attributes { gender: Some(Gender::Female), age: None });
        v.set_attributes("m", Attributes { gender: Some(Gender::Male), age: None });

        let plain = v.candidates(&[0.0, 1.0], 1, None).unwrap();
        assert_eq!(plain[0].id, "f");

        let query = Attributes { gender: Some(Gender::Male), age: None };
        let ranked = v.candidates(&[0.0, 1.0], 1, Some(&query)).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "m");
    }

    #[test]
    fn state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.kdt");

        let v = verifier();
        assert!(!v.save_state(&path).unwrap());
        v.enroll("alice", &[0.0, 0.0]).unwrap();
        v.enroll("bob", &[10.0, 10.0]).unwrap();
        assert!(v.save_state(&path).unwrap());

        let restored = verifier();
        assert_eq!(restored.load_state(&path).unwrap(), 2);
        assert_eq!(
            restored.identify(&[0.0, 0.5]).unwrap().id.as_deref(),
            Some("alice")
        );

        // Missing file keeps the live index.
        assert_eq!(restored.load_state(dir.path().join("none.kdt")).unwrap(), 0);
        assert_eq!(restored.len(), 2);

        // Corrupt file keeps it too.
        std::fs::write(&path, b"KDTR\x01\x00\x00\x00").unwrap();
        assert!(restored.load_state(&path).is_err());
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn enroll_after_load_state_keeps_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.kdt");
        let v = verifier();
        v.enroll("alice", &[0.0, 0.0]).unwrap();
        v.enroll("bob", &[10.0, 10.0]).unwrap();
        v.save_state(&path).unwrap();

        let store = Arc::new(MemoryStore::new());
        let restored = Verifier::new(VerifierConfig::default(), Box::new(Arc::clone(&store)));
        assert_eq!(restored.load_state(&path).unwrap(), 2);
        assert_eq!(store.len().unwrap(), 2);

        assert_eq!(restored.enroll("carol", &[5.0, 0.0]).unwrap(), 3);
        for (probe, want) in [
            ([0.0f32, 0.1], "alice"),
            ([9.9, 10.0], "bob"),
            ([5.0, 0.1], "carol"),
        ] {
            assert_eq!(restored.identify(&probe).unwrap().id.as_deref(), Some(want));
        }

        // Loading over live enrollments is refused and changes nothing.
        assert!(matches!(
            restored.load_state(&path),
            Err(FaceIdError::Store(_))
        ));
        assert_eq!(restored.len(), 3);
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn rejected_enroll_leaves_store_clean() {
        let cfg = VerifierConfig {
            index: postamat_kdtree::Config {
                split_key: SplitKey::ColumnMean { columns: 4 },
                ..Default::default()
            },
            ..VerifierConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let v = Verifier::new(cfg, Box::new(Arc::clone(&store)));

        assert!(matches!(
            v.enroll("bad", &[1.0, 2.0, 3.0]),
            Err(FaceIdError::Index(KdError::InvalidConfig(_)))
        ));
        assert_eq!(store.len().unwrap(), 0);
        assert!(v.is_empty());

        assert_eq!(v.enroll("good", &[1.0, 2.0, 3.0, 4.0]).unwrap(), 1);
        assert_eq!(store.len().unwrap(), 1);
        assert!(matches!(
            v.enroll("nan", &[1.0, f32::NAN, 3.0, 4.0]),
            Err(FaceIdError::Index(KdError::NonFiniteValue { .. }))
        ));
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(v.len(), 1);
    }
}
