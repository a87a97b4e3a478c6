//! k-d tree index over fixed-dimension biometric feature vectors.
//!
//! The tree is bulk-loaded from `(id, vector)` entries and answers
//! nearest-neighbor queries by branch-and-bound descent. It is a read-only
//! snapshot: adding a subject means building a new tree.
//!
//! # Usage
//!
//! ```
//! use postamat_kdtree::{Config, Entry, KdTree};
//!
//! let tree = KdTree::from_entries(
//!     Config::default(),
//!     vec![
//!         Entry::new("a", vec![0.0, 0.0]),
//!         Entry::new("b", vec![10.0, 10.0]),
//!         Entry::new("c", vec![5.0, 5.0]),
//!     ],
//! )
//! .unwrap();
//!
//! let n = tree.nearest(&[0.0, 1.0]).unwrap();
//! assert_eq!(n.id.as_deref(), Some("a"));
//! assert_eq!(n.distance, 1.0);
//! ```
//!
//! # Split keys
//!
//! With [`SplitKey::Coordinate`] each axis is one vector component and the
//! search is exact for Euclidean and mean-absolute distance.
//! [`SplitKey::ColumnMean`] treats each vector as a row-major matrix and
//! splits on column means; the plane bounds in [`Metric::plane_bound`] keep
//! that exact too. Cosine distance prunes heuristically; raise
//! [`Config::slack`] to trade speed for recall.
//!
//! # Persistence
//!
//! [`persist`] stores a tree in a versioned little-endian binary format and
//! validates its structure on load.

mod config;
mod error;
mod index;
mod linear;
mod metric;
pub mod persist;
mod tree;

pub use config::{AxisPolicy, Config, SplitKey};
pub use error::KdError;
pub use index::{Entry, FaceIndex, MAX_DIM, MAX_ID_LEN, Match, Neighbor};
pub use linear::LinearIndex;
pub use metric::{
    Metric, cosine_distance, euclidean_distance, l2_norm, mean_absolute_distance,
};
pub use persist::{load, load_file, save, save_file};
pub use tree::KdTree;
