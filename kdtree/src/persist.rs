use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{AxisPolicy, Config, SplitKey};
use crate::error::KdError;
use crate::index::{Entry, MAX_DIM, MAX_ID_LEN};
use crate::metric::{Metric, l2_norm};
use crate::tree::{KdTree, NIL, Node};

const KDTR_MAGIC: [u8; 4] = *b"KDTR";
const KDTR_VERSION: u32 = 1;

const SPLIT_COORDINATE: u8 = 0;
const SPLIT_COLUMN_MEAN: u8 = 1;

/// Save serializes a non-empty tree to a writer in a compact binary format.
///
/// ```text
/// [4B magic "KDTR"] [4B version=1]
/// [1B metric] [1B axis policy] [1B split key] [4B columns] [4B slack f32]
/// [4B dim] [4B nodeCount] [4B root]
/// For each node, in arena order:
///   [4B idLen] [idLen bytes ID string]
///   [4B axis] [4B split f32] [4B norm f32]
///   [4B left] [4B right]            (0xFFFFFFFF = no child)
///   [dim x 4B float32 vector]
/// ```
///
/// All multi-byte values are little-endian. Returns `Ok(false)` without
/// writing anything when the tree is empty.
///
/// Every length is checked before the first byte is written, so a tree
/// that [`load`] would refuse fails here with nothing written.
pub fn save(tree: &KdTree, w: &mut dyn Write) -> Result<bool, KdError> {
    if tree.is_empty() {
        return Ok(false);
    }

    let cfg = tree.config();
    let (split_kind, columns) = match cfg.split_key {
        SplitKey::Coordinate => (SPLIT_COORDINATE, 0),
        SplitKey::ColumnMean { columns } => (SPLIT_COLUMN_MEAN, to_u32("columns", columns)?),
    };
    let dim = to_u32("dimension", tree.dimension())?;
    if tree.dimension() > MAX_DIM {
        return Err(KdError::DimensionTooLarge {
            got: tree.dimension(),
            max: MAX_DIM,
        });
    }
    let count = to_u32("node count", tree.len())?;
    let mut id_lens = Vec::with_capacity(tree.len());
    for (index, nd) in tree.nodes().iter().enumerate() {
        let len = nd.entry.id.len();
        if len > MAX_ID_LEN {
            return Err(KdError::IdTooLong {
                index,
                len,
                max: MAX_ID_LEN,
            });
        }
        id_lens.push(to_u32("id length", len)?);
    }

    let mut bw = BufWriter::new(w);
    let write_err = |e: io::Error| KdError::Io(e.to_string());

    bw.write_all(&KDTR_MAGIC).map_err(write_err)?;
    bw.write_all(&KDTR_VERSION.to_le_bytes()).map_err(write_err)?;

    // Config.
    bw.write_all(&[cfg.metric.tag(), cfg.axis_policy.tag(), split_kind])
        .map_err(write_err)?;
    bw.write_all(&columns.to_le_bytes()).map_err(write_err)?;
    bw.write_all(&cfg.slack.to_le_bytes()).map_err(write_err)?;

    // Shape.
    bw.write_all(&dim.to_le_bytes()).map_err(write_err)?;
    bw.write_all(&count.to_le_bytes()).map_err(write_err)?;
    bw.write_all(&tree.root().to_le_bytes()).map_err(write_err)?;

    for (nd, id_len) in tree.nodes().iter().zip(id_lens) {
        bw.write_all(&id_len.to_le_bytes()).map_err(write_err)?;
        bw.write_all(nd.entry.id.as_bytes()).map_err(write_err)?;

        bw.write_all(&nd.axis.to_le_bytes()).map_err(write_err)?;
        bw.write_all(&nd.split.to_le_bytes()).map_err(write_err)?;
        bw.write_all(&nd.norm.to_le_bytes()).map_err(write_err)?;
        bw.write_all(&nd.left.to_le_bytes()).map_err(write_err)?;
        bw.write_all(&nd.right.to_le_bytes()).map_err(write_err)?;

        for &v in &nd.entry.vector {
            bw.write_all(&v.to_le_bytes()).map_err(write_err)?;
        }
    }

    bw.flush().map_err(write_err)?;
    debug!("kdtree: saved {} nodes, dim={}", tree.len(), tree.dimension());
    Ok(true)
}

fn to_u32(what: &str, n: usize) -> Result<u32, KdError> {
    u32::try_from(n)
        .map_err(|_| KdError::InvalidConfig(format!("{what} {n} does not fit the index format")))
}

fn read_err(e: io::Error) -> KdError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        KdError::CorruptData("unexpected end of stream".into())
    } else {
        KdError::Io(e.to_string())
    }
}

fn read_u8(r: &mut impl Read) -> Result<u8, KdError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).map_err(read_err)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32, KdError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(read_err)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32(r: &mut impl Read) -> Result<f32, KdError> {
    read_u32(r).map(f32::from_bits)
}

/// Load deserializes a tree from a reader.
///
/// The stream must match what [`save`] produces. Structure is validated
/// rather than trusted: every child index must be in range, every node
/// but the root must have exactly one parent, and every node must be
/// reachable from the root. Vectors must be finite, and the cached split
/// value and norm of each node must match what its vector yields.
pub fn load(r: &mut dyn Read) -> Result<KdTree, KdError> {
    let mut br = BufReader::new(r);

    let mut magic = [0u8; 4];
    br.read_exact(&mut magic).map_err(read_err)?;
    if magic != KDTR_MAGIC {
        return Err(KdError::CorruptData(format!("invalid magic {magic:?}")));
    }
    let version = read_u32(&mut br)?;
    if version != KDTR_VERSION {
        return Err(KdError::CorruptData(format!(
            "unsupported version {version} (want {KDTR_VERSION})"
        )));
    }

    // Config.
    let metric_tag = read_u8(&mut br)?;
    let metric = Metric::from_tag(metric_tag)
        .ok_or_else(|| KdError::CorruptData(format!("unknown metric tag {metric_tag}")))?;
    let policy_tag = read_u8(&mut br)?;
    let axis_policy = AxisPolicy::from_tag(policy_tag)
        .ok_or_else(|| KdError::CorruptData(format!("unknown axis policy tag {policy_tag}")))?;
    let split_kind = read_u8(&mut br)?;
    let columns = read_u32(&mut br)? as usize;
    let split_key = match split_kind {
        SPLIT_COORDINATE => SplitKey::Coordinate,
        SPLIT_COLUMN_MEAN => SplitKey::ColumnMean { columns },
        other => {
            return Err(KdError::CorruptData(format!(
                "unknown split key tag {other}"
            )));
        }
    };
    let slack = read_f32(&mut br)?;

    // Shape.
    let dim = read_u32(&mut br)? as usize;
    let count = read_u32(&mut br)? as usize;
    let root = read_u32(&mut br)?;

    let mut cfg = Config {
        metric,
        axis_policy,
        split_key,
        slack,
    };
    cfg.set_defaults();

    if count == 0 {
        if root != NIL {
            return Err(KdError::CorruptData(format!(
                "root {root} in a tree without nodes"
            )));
        }
        return Ok(KdTree::new(cfg));
    }
    if dim == 0 || dim > MAX_DIM {
        return Err(KdError::CorruptData(format!("invalid dimension {dim}")));
    }
    if count >= NIL as usize {
        return Err(KdError::CorruptData(format!("invalid node count {count}")));
    }
    split_key
        .validate(dim)
        .map_err(|e| KdError::CorruptData(e.to_string()))?;
    let axes = split_key.axes(dim);

    let in_range = |idx: u32| idx == NIL || (idx as usize) < count;
    if root == NIL || !in_range(root) {
        return Err(KdError::CorruptData(format!(
            "root {root} out of bounds (nodeCount={count})"
        )));
    }

    // Nodes.
    let mut nodes: Vec<Node> = Vec::with_capacity(count.min(1 << 16));
    for i in 0..count {
        let id_len = read_u32(&mut br)? as usize;
        if id_len > MAX_ID_LEN {
            return Err(KdError::CorruptData(format!(
                "node {i}: id length {id_len} exceeds {MAX_ID_LEN}"
            )));
        }
        let mut id_bytes = vec![0u8; id_len];
        br.read_exact(&mut id_bytes).map_err(read_err)?;
        let id = String::from_utf8(id_bytes)
            .map_err(|e| KdError::CorruptData(format!("node {i}: {e}")))?;

        let axis = read_u32(&mut br)?;
        if axis as usize >= axes {
            return Err(KdError::CorruptData(format!(
                "node {i}: axis {axis} out of bounds (axes={axes})"
            )));
        }
        let split = read_f32(&mut br)?;
        let norm = read_f32(&mut br)?;
        let left = read_u32(&mut br)?;
        let right = read_u32(&mut br)?;
        for child in [left, right] {
            if !in_range(child) {
                return Err(KdError::CorruptData(format!(
                    "node {i}: child {child} out of bounds (nodeCount={count})"
                )));
            }
        }

        let mut vector = vec![0.0f32; dim];
        for v in &mut vector {
            *v = read_f32(&mut br)?;
        }
        if !vector.iter().all(|x| x.is_finite()) {
            return Err(KdError::CorruptData(format!(
                "node {i}: non-finite vector component"
            )));
        }
        let want_split = split_key.key(&vector, axis as usize);
        let want_norm = l2_norm(&vector);
        if !cached_matches(split, want_split) || !cached_matches(norm, want_norm) {
            return Err(KdError::CorruptData(format!(
                "node {i}: stored split {split} / norm {norm} do not match the vector \
                 (want {want_split} / {want_norm})"
            )));
        }

        nodes.push(Node {
            entry: Entry { id, vector },
            axis,
            split,
            norm,
            left,
            right,
        });
    }

    check_structure(&nodes, root)?;
    Ok(KdTree::from_parts(cfg, nodes, root, dim))
}

/// A cached value read from disk agrees with the one recomputed from the
/// vector, allowing for rounding across platforms.
fn cached_matches(stored: f32, want: f32) -> bool {
    stored.is_finite() && (stored == want || (stored - want).abs() <= 1e-5 * want.abs().max(1.0))
}

/// Every node but the root has exactly one parent, and all nodes are
/// reachable from the root.
fn check_structure(nodes: &[Node], root: u32) -> Result<(), KdError> {
    let mut parents = vec![0u32; nodes.len()];
    for nd in nodes {
        for child in [nd.left, nd.right] {
            if child != NIL {
                parents[child as usize] += 1;
            }
        }
    }
    for (i, &p) in parents.iter().enumerate() {
        let want = if i == root as usize { 0 } else { 1 };
        if p != want {
            return Err(KdError::CorruptData(format!(
                "node {i} has {p} parents, want {want}"
            )));
        }
    }

    let mut reached = 0usize;
    let mut stack = vec![root];
    while let Some(idx) = stack.pop() {
        reached += 1;
        let nd = &nodes[idx as usize];
        for child in [nd.left, nd.right] {
            if child != NIL {
                stack.push(child);
            }
        }
    }
    if reached != nodes.len() {
        return Err(KdError::CorruptData(format!(
            "{} of {} nodes unreachable from root",
            nodes.len() - reached,
            nodes.len()
        )));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Save a tree to `path`, replacing any previous file.
///
/// The data is written to a sibling temp file first and renamed into place,
/// so readers never observe a partially written index. An empty tree writes
/// nothing and returns `Ok(false)`.
pub fn save_file(tree: &KdTree, path: impl AsRef<Path>) -> Result<bool, KdError> {
    let path = path.as_ref();
    if tree.is_empty() {
        debug!("kdtree: nothing to save to {}", path.display());
        return Ok(false);
    }

    let tmp = temp_path(path);
    let result = (|| {
        let mut f = File::create(&tmp).map_err(|e| KdError::Io(e.to_string()))?;
        save(tree, &mut f)?;
        f.sync_all().map_err(|e| KdError::Io(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| KdError::Io(e.to_string()))
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    info!("kdtree: saved {} entries to {}", tree.len(), path.display());
    Ok(true)
}

/// Load a tree from `path`.
///
/// A file that is missing or cannot be opened is a cold start: an empty
/// tree with the default config is returned and a warning logged. A file
/// that opens but does not decode is an error.
pub fn load_file(path: impl AsRef<Path>) -> Result<KdTree, KdError> {
    let path = path.as_ref();
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(
                "kdtree: cannot open {}: {}, starting empty",
                path.display(),
                e
            );
            return Ok(KdTree::default());
        }
    };
    let tree = load(&mut f)?;
    info!("kdtree: loaded {} entries from {}", tree.len(), path.display());
    Ok(tree)
}

impl KdTree {
    /// Replace this tree with the one stored at `path`.
    ///
    /// Unlike [`load_file`], a missing file is an error here. On any error
    /// the current tree is kept.
    pub fn reload(&mut self, path: impl AsRef<Path>) -> Result<(), KdError> {
        let mut f = File::open(path.as_ref()).map_err(|e| KdError::Io(e.to_string()))?;
        *self = load(&mut f)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc_tree(cfg: Config) -> KdTree {
        KdTree::from_entries(
            cfg,
            vec![
                Entry::new("a", vec![0.0, 0.0]),
                Entry::new("b", vec![10.0, 10.0]),
                Entry::new("c", vec![5.0, 5.0]),
            ],
        )
        .unwrap()
    }

    fn grid_tree(cfg: Config) -> KdTree {
        let entries = (0..64)
            .map(|i| {
                let v: Vec<f32> = (0..8).map(|d| ((i * 7 + d * 3) % 11) as f32).collect();
                Entry::new(format!("g{i}"), v)
            })
            .collect();
        KdTree::from_entries(cfg, entries).unwrap()
    }

    fn saved(tree: &KdTree) -> Vec<u8> {
        let mut buf = Vec::new();
        assert!(save(tree, &mut buf).unwrap());
        buf
    }

    #[test]
    fn test_save_load() {
        let cfg = Config {
            metric: Metric::MeanAbsolute,
            axis_policy: AxisPolicy::RoundRobin,
            split_key: SplitKey::ColumnMean { columns: 4 },
            slack: 1.5,
        };
        let tree = grid_tree(cfg);
        let buf = saved(&tree);
        let loaded = load(&mut buf.as_slice()).unwrap();

        assert_eq!(loaded.len(), tree.len());
        assert_eq!(loaded.dimension(), 8);
        assert_eq!(loaded.config(), tree.config());
        assert_eq!(loaded.depth(), tree.depth());

        for i in 0..20 {
            let probe: Vec<f32> = (0..8).map(|d| ((i * 5 + d) % 9) as f32 + 0.25).collect();
            assert_eq!(loaded.nearest(&probe).unwrap(), tree.nearest(&probe).unwrap());
            assert_eq!(loaded.search(&probe, 5).unwrap(), tree.search(&probe, 5).unwrap());
        }
    }

    #[test]
    fn test_save_empty() {
        let tree = KdTree::default();
        let mut buf = Vec::new();
        assert!(!save(&tree, &mut buf).unwrap());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_load_invalid_magic() {
        let bad = b"NOPE";
        assert!(matches!(
            load(&mut bad.as_slice()),
            Err(KdError::CorruptData(_))
        ));
    }

    #[test]
    fn test_load_bad_version() {
        let mut buf = saved(&abc_tree(Config::default()));
        buf[4] = 9;
        assert!(matches!(
            load(&mut buf.as_slice()),
            Err(KdError::CorruptData(_))
        ));
    }

    #[test]
    fn test_load_truncated() {
        let buf = saved(&abc_tree(Config::default()));
        for cut in [0, 3, 8, 20, buf.len() / 2, buf.len() - 1] {
            let res = load(&mut &buf[..cut]);
            assert!(
                matches!(res, Err(KdError::CorruptData(_))),
                "cut at {cut}: {res:?}"
            );
        }
    }

    #[test]
    fn test_load_unknown_metric() {
        let mut buf = saved(&abc_tree(Config::default()));
        buf[8] = 42;
        assert!(load(&mut buf.as_slice()).is_err());
    }

    // Header layout: 4 magic + 4 version + 3 tags + 4 columns + 4 slack
    // + 4 dim + 4 count + 4 root = 31 bytes. The first node's id is "c"
    // (the median), so its left link sits at 31 + 4 + 1 + 12.
    const FIRST_LEFT: usize = 31 + 4 + 1 + 12;

    #[test]
    fn test_load_child_out_of_bounds() {
        let mut buf = saved(&abc_tree(Config::default()));
        buf[FIRST_LEFT..FIRST_LEFT + 4].copy_from_slice(&7u32.to_le_bytes());
        let err = load(&mut buf.as_slice()).unwrap_err();
        assert!(err.to_string().contains("out of bounds"), "{err}");
    }

    #[test]
    fn test_load_shared_child() {
        let tree = abc_tree(Config::default());
        let mut buf = saved(&tree);
        // Point the root's left link at its right child.
        let right = tree.nodes()[0].right;
        buf[FIRST_LEFT..FIRST_LEFT + 4].copy_from_slice(&right.to_le_bytes());
        let err = load(&mut buf.as_slice()).unwrap_err();
        assert!(err.to_string().contains("parents"), "{err}");
    }

    #[test]
    fn test_load_cycle_to_root() {
        let tree = abc_tree(Config::default());
        let mut buf = saved(&tree);
        buf[FIRST_LEFT..FIRST_LEFT + 4].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            load(&mut buf.as_slice()),
            Err(KdError::CorruptData(_))
        ));
    }

    #[test]
    fn test_load_rejects_tampered_norm() {
        let cfg = Config {
            metric: Metric::Cosine,
            ..Config::default()
        };
        let tree = abc_tree(cfg);
        let mut buf = saved(&tree);
        assert_eq!(
            load(&mut buf.as_slice()).unwrap().nearest(&[5.0, 5.0]).unwrap(),
            tree.nearest(&[5.0, 5.0]).unwrap()
        );

        // The norm field sits right before the left link.
        let norm_at = FIRST_LEFT - 4;
        buf[norm_at..norm_at + 4].copy_from_slice(&100.0f32.to_le_bytes());
        let err = load(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, KdError::CorruptData(_)), "{err}");
        assert!(err.to_string().contains("norm"), "{err}");

        buf[norm_at..norm_at + 4].copy_from_slice(&f32::NAN.to_le_bytes());
        assert!(matches!(
            load(&mut buf.as_slice()),
            Err(KdError::CorruptData(_))
        ));
    }

    #[test]
    fn test_load_rejects_tampered_split() {
        let mut buf = saved(&abc_tree(Config::default()));
        let split_at = FIRST_LEFT - 8;
        buf[split_at..split_at + 4].copy_from_slice(&(-3.0f32).to_le_bytes());
        assert!(matches!(
            load(&mut buf.as_slice()),
            Err(KdError::CorruptData(_))
        ));
    }

    #[test]
    fn test_load_rejects_non_finite_vector() {
        let mut buf = saved(&abc_tree(Config::default()));
        // The first node's vector follows its right link.
        let vec_at = FIRST_LEFT + 8;
        buf[vec_at..vec_at + 4].copy_from_slice(&f32::INFINITY.to_le_bytes());
        let err = load(&mut buf.as_slice()).unwrap_err();
        assert!(err.to_string().contains("non-finite"), "{err}");
    }

    #[test]
    fn test_id_at_length_limit_round_trips() {
        let long_id = "x".repeat(MAX_ID_LEN);
        let tree = KdTree::from_entries(
            Config::default(),
            vec![
                Entry::new(long_id.clone(), vec![1.0, 2.0]),
                Entry::new("short", vec![3.0, 4.0]),
            ],
        )
        .unwrap();
        let loaded = load(&mut saved(&tree).as_slice()).unwrap();
        assert_eq!(loaded.nearest(&[1.0, 2.0]).unwrap().id, Some(long_id));

        // One byte more is refused at build time, never written.
        let res = KdTree::from_entries(
            Config::default(),
            vec![Entry::new("x".repeat(MAX_ID_LEN + 1), vec![1.0, 2.0])],
        );
        assert!(matches!(res, Err(KdError::IdTooLong { index: 0, .. })));
    }

    #[test]
    fn test_to_u32_rejects_overflow() {
        assert_eq!(to_u32("dimension", 128).unwrap(), 128);
        let err = to_u32("columns", u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, KdError::InvalidConfig(_)));
        assert!(err.to_string().contains("columns"), "{err}");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kdt");
        let tree = abc_tree(Config::default());

        assert!(save_file(&tree, &path).unwrap());
        assert!(!temp_path(&path).exists());

        let loaded = load_file(&path).unwrap();
        let n = loaded.nearest(&[0.0, 1.0]).unwrap();
        assert_eq!(n.id.as_deref(), Some("a"));
        assert!((n.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_save_file_empty_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kdt");
        assert!(!save_file(&KdTree::default(), &path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_load_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tree = load_file(dir.path().join("missing.kdt")).unwrap();
        assert!(tree.is_empty());
        assert!(!tree.nearest(&[1.0, 2.0]).unwrap().is_found());
    }

    #[test]
    fn test_load_file_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kdt");
        fs::write(&path, b"KDTRgarbage").unwrap();
        assert!(load_file(&path).is_err());
    }

    #[test]
    fn test_reload_failure_keeps_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.kdt");
        let mut tree = abc_tree(Config::default());

        assert!(tree.reload(dir.path().join("missing.kdt")).is_err());
        fs::write(&path, b"not an index").unwrap();
        assert!(tree.reload(&path).is_err());
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.nearest(&[9.0, 9.0]).unwrap().id.as_deref(), Some("b"));

        let other = KdTree::from_entries(
            Config::default(),
            vec![Entry::new("z", vec![1.0, 1.0, 1.0])],
        )
        .unwrap();
        save_file(&other, &path).unwrap();
        tree.reload(&path).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.dimension(), 3);
    }
}
