//! Face verification on top of the k-d tree index.
//!
//! Enrolled embeddings are kept in an [`EnrollmentStore`] and indexed by a
//! [`postamat_kdtree::KdTree`] snapshot that is rebuilt on every enrollment.
//! Probes are accepted when their nearest enrolled embedding is closer than
//! the configured threshold.
//!
//! # Usage
//!
//! ```
//! use postamat_faceid::{Verifier, VerifierConfig};
//!
//! let v = Verifier::with_memory_store(VerifierConfig::default());
//! v.enroll("alice", &[0.1, 0.2, 0.3]).unwrap();
//!
//! let id = v.identify(&[0.1, 0.2, 0.35]).unwrap();
//! assert!(id.accepted);
//! assert_eq!(id.id.as_deref(), Some("alice"));
//! ```
//!
//! # Re-ranking
//!
//! With [`VerifierConfig::rerank`] set, [`Verifier::candidates`] widens the
//! index query and reorders the results by a weighted mix of distance and
//! [`Attributes`] disagreement (gender, age). The index itself never looks
//! at attributes.

mod config;
mod embedder;
mod error;
mod rerank;
mod store;
mod verifier;

pub use config::VerifierConfig;
pub use embedder::FaceEmbedder;
pub use error::FaceIdError;
pub use rerank::{Attributes, Gender, RerankWeights, Reranker, age_penalty, gender_penalty};
pub use store::{EnrollmentStore, MemoryStore};
pub use verifier::{Identification, Verifier};
