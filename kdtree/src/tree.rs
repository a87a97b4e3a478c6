use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::debug;

use crate::config::{AxisPolicy, Config};
use crate::error::KdError;
use crate::index::{Entry, FaceIndex, Match, Neighbor, validate_entries};
use crate::metric::l2_norm;

/// Arena index meaning "no child".
pub(crate) const NIL: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) entry: Entry,
    pub(crate) axis: u32,
    /// Key of `entry` on `axis`.
    pub(crate) split: f32,
    /// Euclidean norm of `entry.vector`.
    pub(crate) norm: f32,
    pub(crate) left: u32,
    pub(crate) right: u32,
}

// ---------------------------------------------------------------------------
// Search heap
// ---------------------------------------------------------------------------

/// Max-heap item: the worst kept candidate is on top. Among equal
/// distances the later-visited one is "worse", so the first visited wins.
struct Candidate {
    dist: f32,
    seq: u32,
    node: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.seq.cmp(&other.seq))
    }
}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Candidate {}

// ---------------------------------------------------------------------------
// KdTree
// ---------------------------------------------------------------------------

/// KdTree is a binary space-partitioning index over fixed-dimension feature
/// vectors, each tagged with the identifier of an enrolled subject.
///
/// The tree is bulk-loaded by [`KdTree::build`] and read-only afterwards.
/// Nodes live in one arena and link to their children by index; every node
/// has exactly one parent.
///
/// For each node, entries in the left subtree have a key no greater than the
/// node's split value on its axis, and entries in the right subtree a key no
/// smaller. Keys are produced by the configured [`SplitKey`](crate::SplitKey).
#[derive(Debug, Clone)]
pub struct KdTree {
    cfg: Config,
    nodes: Vec<Node>,
    root: u32,
    dim: usize,
}

impl Default for KdTree {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl KdTree {
    /// Create an empty tree.
    pub fn new(mut cfg: Config) -> Self {
        cfg.set_defaults();
        Self {
            cfg,
            nodes: Vec::new(),
            root: NIL,
            dim: 0,
        }
    }

    /// Build a tree off to the side, ready to be swapped in for a live one.
    pub fn from_entries(cfg: Config, entries: Vec<Entry>) -> Result<Self, KdError> {
        let mut tree = Self::new(cfg);
        tree.build(entries)?;
        Ok(tree)
    }

    /// Replace the tree content with `entries`.
    ///
    /// An empty entry set yields an empty tree. All vectors must be finite
    /// and share one non-zero dimension of at most [`MAX_DIM`](crate::MAX_DIM),
    /// and ids are limited to [`MAX_ID_LEN`](crate::MAX_ID_LEN) bytes, so that
    /// every built tree can be saved and loaded back. On error the previous
    /// content is left untouched.
    pub fn build(&mut self, entries: Vec<Entry>) -> Result<(), KdError> {
        if entries.is_empty() {
            self.nodes = Vec::new();
            self.root = NIL;
            self.dim = 0;
            debug!("kdtree: built empty tree");
            return Ok(());
        }

        let dim = validate_entries(&entries)?;
        self.cfg.split_key.validate(dim)?;
        if entries.len() >= NIL as usize {
            return Err(KdError::InvalidConfig(format!(
                "{} entries exceed the index capacity",
                entries.len()
            )));
        }

        let mut b = Builder::new(&self.cfg, dim, entries);
        let n = b.items.len();
        let root = b.build_range(0, n, None, 1);

        debug!(
            "kdtree: built {} entries, dim={}, depth={}",
            n, dim, b.max_depth
        );

        self.nodes = b.nodes;
        self.root = root;
        self.dim = dim;
        Ok(())
    }

    /// Return the closest entry to `probe`.
    ///
    /// An empty tree answers `(None, +inf)`. When several entries share the
    /// best distance, the first one reached by the descent wins; that order
    /// depends on the tree shape and should not be relied upon.
    pub fn nearest(&self, probe: &[f32]) -> Result<Neighbor, KdError> {
        Ok(self
            .search(probe, 1)?
            .into_iter()
            .next()
            .map_or_else(Neighbor::not_found, Neighbor::from))
    }

    /// Return the top-k nearest entries to `probe`, closest first.
    ///
    /// Branch-and-bound: the child on the probe's side of each split is
    /// explored first, and the other child only while the probe's distance
    /// to the splitting plane, as a metric lower bound and widened by the
    /// configured slack, is below the k-th best distance so far.
    pub fn search(&self, probe: &[f32], top_k: usize) -> Result<Vec<Match>, KdError> {
        if self.root == NIL || top_k == 0 {
            return Ok(vec![]);
        }
        if probe.len() != self.dim {
            return Err(KdError::DimensionMismatch {
                got: probe.len(),
                want: self.dim,
            });
        }

        let metric = self.cfg.metric;
        let split_key = self.cfg.split_key;
        let axes = split_key.axes(self.dim);
        let slack = self.cfg.slack;
        let keys = split_key.keys(probe);
        let probe_norm = l2_norm(probe);

        let mut best: BinaryHeap<Candidate> = BinaryHeap::with_capacity(top_k + 1);
        // (node, lower bound on the distance of anything in its subtree)
        let mut stack: Vec<(u32, f32)> = vec![(self.root, 0.0)];
        let mut seq: u32 = 0;

        while let Some((idx, bound)) = stack.pop() {
            if best.len() >= top_k {
                let worst = best.peek().map_or(f32::INFINITY, |c| c.dist);
                if !(bound < worst * slack) {
                    continue;
                }
            }

            let node = &self.nodes[idx as usize];
            let d = metric.distance(probe, probe_norm, &node.entry.vector, node.norm);
            seq += 1;
            if best.len() < top_k {
                best.push(Candidate { dist: d, seq, node: idx });
            } else if best.peek().is_some_and(|worst| d < worst.dist) {
                best.pop();
                best.push(Candidate { dist: d, seq, node: idx });
            }

            let probe_key = keys[node.axis as usize];
            let (near, far) = if probe_key < node.split {
                (node.left, node.right)
            } else {
                (node.right, node.left)
            };
            // The far child is pushed first so it is popped after the whole
            // near subtree, against the best distance found there.
            if far != NIL {
                stack.push((far, metric.plane_bound(probe_key - node.split, axes)));
            }
            if near != NIL {
                stack.push((near, 0.0));
            }
        }

        Ok(best
            .into_sorted_vec()
            .into_iter()
            .map(|c| Match {
                id: self.nodes[c.node as usize].entry.id.clone(),
                distance: c.dist,
            })
            .collect())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Vector dimension, or 0 for an empty tree.
    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Number of levels on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        if self.root == NIL {
            return 0;
        }
        let mut max = 0;
        let mut stack = vec![(self.root, 1usize)];
        while let Some((idx, level)) = stack.pop() {
            max = max.max(level);
            let node = &self.nodes[idx as usize];
            for child in [node.left, node.right] {
                if child != NIL {
                    stack.push((child, level + 1));
                }
            }
        }
        max
    }

    /// Iterate over the stored entries in arena order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.nodes.iter().map(|n| &n.entry)
    }

    /// Assemble a tree from validated parts (used by persistence).
    pub(crate) fn from_parts(cfg: Config, nodes: Vec<Node>, root: u32, dim: usize) -> Self {
        Self {
            cfg,
            nodes,
            root,
            dim,
        }
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn root(&self) -> u32 {
        self.root
    }
}

impl FaceIndex for KdTree {
    fn nearest(&self, probe: &[f32]) -> Result<Neighbor, KdError> {
        KdTree::nearest(self, probe)
    }

    fn search(&self, probe: &[f32], top_k: usize) -> Result<Vec<Match>, KdError> {
        KdTree::search(self, probe, top_k)
    }

    fn len(&self) -> usize {
        KdTree::len(self)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

struct BuildItem {
    keys: Vec<f32>,
    entry: Entry,
}

struct Builder<'a> {
    cfg: &'a Config,
    axes: usize,
    items: Vec<BuildItem>,
    nodes: Vec<Node>,
    max_depth: usize,
}

impl<'a> Builder<'a> {
    fn new(cfg: &'a Config, dim: usize, entries: Vec<Entry>) -> Self {
        let items: Vec<BuildItem> = entries
            .into_iter()
            .map(|entry| BuildItem {
                keys: cfg.split_key.keys(&entry.vector),
                entry,
            })
            .collect();
        let nodes = Vec::with_capacity(items.len());
        Self {
            cfg,
            axes: cfg.split_key.axes(dim),
            items,
            nodes,
            max_depth: 0,
        }
    }

    /// Build the subtree over `items[start..end)` and return its root.
    /// Nodes are appended in pre-order, so the tree root is node 0.
    fn build_range(
        &mut self,
        start: usize,
        end: usize,
        parent_axis: Option<usize>,
        depth: usize,
    ) -> u32 {
        if start >= end {
            return NIL;
        }
        self.max_depth = self.max_depth.max(depth);

        let axis = self.choose_axis(start, end, parent_axis);
        // Stable, so equal inputs always yield the same tree.
        self.items[start..end].sort_by(|a, b| a.keys[axis].total_cmp(&b.keys[axis]));

        // Lower median for even-length ranges.
        let mid = start + (end - start) / 2;
        let item = &mut self.items[mid];
        let split = item.keys[axis];
        let entry = std::mem::take(&mut item.entry);
        let norm = l2_norm(&entry.vector);

        let idx = self.nodes.len() as u32;
        self.nodes.push(Node {
            entry,
            axis: axis as u32,
            split,
            norm,
            left: NIL,
            right: NIL,
        });

        let left = self.build_range(start, mid, Some(axis), depth + 1);
        let right = self.build_range(mid + 1, end, Some(axis), depth + 1);
        let node = &mut self.nodes[idx as usize];
        node.left = left;
        node.right = right;
        idx
    }

    fn choose_axis(&self, start: usize, end: usize, parent_axis: Option<usize>) -> usize {
        match self.cfg.axis_policy {
            AxisPolicy::RoundRobin => parent_axis.map_or(0, |p| (p + 1) % self.axes),
            AxisPolicy::MaxVariance => {
                let items = &self.items[start..end];
                let n = items.len() as f64;
                let mut best_axis = 0;
                let mut best_var = f64::NEG_INFINITY;
                for axis in 0..self.axes {
                    let mean = items.iter().map(|it| it.keys[axis] as f64).sum::<f64>() / n;
                    let var = items
                        .iter()
                        .map(|it| {
                            let d = it.keys[axis] as f64 - mean;
                            d * d
                        })
                        .sum::<f64>()
                        / n;
                    if var > best_var {
                        best_var = var;
                        best_axis = axis;
                    }
                }
                best_axis
            }
        }
    }
}
