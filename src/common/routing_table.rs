//! Kademlia routing table: a binary trie of K-buckets with replacement
//! caches.

use std::collections::BTreeMap;
use std::mem;

use crate::common::{Distance, Node, NodeInfo, PeerId};

/// K = the default maximum size of a k-bucket, and of its replacement cache.
pub const DEFAULT_BUCKET_SIZE_K: usize = 10;

/// B = the default maximum depth of buckets outside the home branch.
pub const DEFAULT_BRANCH_DEPTH_B: usize = 5;

#[derive(Debug, Clone)]
/// Kademlia routing table.
///
/// The table is a binary trie branched on successive bits of node ids,
/// starting at bit 0 (the most significant). Leaves are buckets of up to K
/// nodes in insertion order. The leaf whose id range contains the owner's
/// own id (the home branch) splits whenever it fills; all other leaves split
/// only while they are fewer than B levels deep, and past that reject new
/// entries, remembering them in a bounded FIFO replacement cache instead.
pub struct RoutingTable {
    id: PeerId,
    k: usize,
    b: usize,
    root: Tree,
}

#[derive(Debug, Clone)]
enum Tree {
    Bucket(KBucket),
    /// Children for the next id bit being 0 and 1 respectively.
    Split(Box<Tree>, Box<Tree>),
}

impl RoutingTable {
    /// Create a new [RoutingTable] owned by `id`, with a single empty root
    /// bucket.
    pub fn new(id: PeerId) -> Self {
        RoutingTable {
            id,
            k: DEFAULT_BUCKET_SIZE_K,
            b: DEFAULT_BRANCH_DEPTH_B,
            root: Tree::Bucket(KBucket::new()),
        }
    }

    /// Override the bucket size K.
    pub fn with_bucket_size(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Override the maximum non-home branch depth B.
    pub fn with_branch_depth(mut self, b: usize) -> Self {
        self.b = b;
        self
    }

    // === Getters ===

    /// Returns the id of this node, where distances are measured from.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    // === Public Methods ===

    /// Attempts to add a node to this routing table.
    ///
    /// Walks the trie by the bits of `node.id()`. If the target bucket has
    /// room the node is appended with a clean timeout record. A full bucket
    /// on the home branch, or above the depth cap, is split and the insert
    /// retried. Otherwise the candidate is remembered in the bucket's
    /// replacement cache and the bucket's front entry, its least recently
    /// refreshed node, is returned as `Err` so the caller can decide whether
    /// to verify it is still alive.
    ///
    /// Re-inserting an id that is already present refreshes its address and
    /// returns `Ok`.
    pub fn insert(&mut self, node: Node) -> Result<(), Node> {
        if node.id == self.id {
            // Never track self.
            return Ok(());
        }

        insert_at(&mut self.root, node, 0, true, &self.id, self.k, self.b)
    }

    /// Same as [Self::insert], but a rejected insert is discarded.
    ///
    /// Used when the decision has already been made, e.g. after the node
    /// answered a ping, and there is nothing useful to do with the evicted
    /// candidate.
    pub fn insert_unchecked(&mut self, node: Node) {
        let _ = self.insert(node);
    }

    /// Increment the timeout counter of the node with `id`, if present.
    pub fn record_timeout(&mut self, id: &PeerId) {
        if let Some(info) = self.info_mut(id) {
            info.timeout_count = info.timeout_count.saturating_add(1);
        }
    }

    /// Reset the timeout counter of the node with `id` to 0, if present.
    pub fn clear_timeout(&mut self, id: &PeerId) {
        if let Some(info) = self.info_mut(id) {
            info.timeout_count = 0;
        }
    }

    /// Returns up to `n` nodes with the smallest XOR distance to `target`,
    /// in non-decreasing distance order.
    pub fn closest(&self, n: usize, target: &PeerId) -> Vec<Node> {
        let mut by_distance: BTreeMap<Distance, Node> = BTreeMap::new();
        collect(&self.root, &mut |info| {
            by_distance.insert(info.node.id.distance(target), info.node.clone());
        });

        by_distance.into_values().take(n).collect()
    }

    /// Returns `true` if a node with `id` is tracked by the table.
    pub fn contains(&self, id: &PeerId) -> bool {
        bucket_for(&self.root, id, 0)
            .nodes
            .iter()
            .any(|info| info.node.id == *id)
    }

    /// The number of nodes in this routing table.
    pub fn size(&self) -> usize {
        let mut count = 0;
        collect(&self.root, &mut |_| count += 1);
        count
    }

    /// Returns `true` if this routing table has no nodes.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Owned list of all tracked nodes.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        collect(&self.root, &mut |info| nodes.push(info.node.clone()));
        nodes
    }

    // === Crate-internal Methods ===

    /// Per-bucket view of the entries that have unanswered requests,
    /// together with that bucket's replacement cache. Buckets with a clean
    /// record are skipped.
    pub(crate) fn suspicious_buckets(&self) -> Vec<BucketSnapshot> {
        let mut snapshots = Vec::new();
        snapshot_buckets(&self.root, &mut snapshots);
        snapshots
    }

    /// Replace the slot holding `dead` with a fresh entry for `replacement`,
    /// removing the replacement from the bucket's cache. Returns `false`
    /// when `dead` is no longer tracked, in which case nothing changes.
    pub(crate) fn promote_cached(&mut self, dead: &PeerId, replacement: Node) -> bool {
        let bucket = bucket_for_mut(&mut self.root, dead, 0);

        match bucket.nodes.iter().position(|info| info.node.id == *dead) {
            Some(index) => {
                bucket.cache.retain(|cached| cached.id != replacement.id);
                bucket.nodes[index] = NodeInfo::new(replacement);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn timeout_count(&self, id: &PeerId) -> Option<u32> {
        bucket_for(&self.root, id, 0)
            .nodes
            .iter()
            .find(|info| info.node.id == *id)
            .map(|info| info.timeout_count)
    }

    #[cfg(test)]
    pub(crate) fn cache_of(&self, id: &PeerId) -> Vec<Node> {
        bucket_for(&self.root, id, 0).cache.clone()
    }

    fn info_mut(&mut self, id: &PeerId) -> Option<&mut NodeInfo> {
        bucket_for_mut(&mut self.root, id, 0)
            .nodes
            .iter_mut()
            .find(|info| info.node.id == *id)
    }
}

/// One bucket's maintenance view: its suspicious entries and cache.
#[derive(Debug, Clone)]
pub(crate) struct BucketSnapshot {
    pub suspicious: Vec<NodeInfo>,
    pub cache: Vec<Node>,
}

#[derive(Debug, Clone)]
struct KBucket {
    /// Tracked nodes in insertion order; the front is the least recently
    /// refreshed entry.
    nodes: Vec<NodeInfo>,
    /// FIFO of nodes that attempted to enter this bucket while it was full.
    cache: Vec<Node>,
}

impl KBucket {
    fn new() -> Self {
        KBucket {
            nodes: Vec::new(),
            cache: Vec::new(),
        }
    }

    fn push_cache(&mut self, node: Node, k: usize) {
        if self.cache.iter().any(|cached| cached.id == node.id) {
            return;
        }

        if self.cache.len() == k {
            self.cache.remove(0);
        }
        self.cache.push(node);
    }
}

fn insert_at(
    tree: &mut Tree,
    node: Node,
    depth: usize,
    home: bool,
    owner: &PeerId,
    k: usize,
    b: usize,
) -> Result<(), Node> {
    match tree {
        Tree::Split(zero, one) => {
            let bit = node.id.bit(depth);
            let branch = if bit { one } else { zero };

            insert_at(branch, node, depth + 1, home && owner.bit(depth) == bit, owner, k, b)
        }
        Tree::Bucket(bucket) => {
            if let Some(existing) = bucket
                .nodes
                .iter_mut()
                .find(|info| info.node.id == node.id)
            {
                existing.node.address = node.address;
                return Ok(());
            }

            if bucket.nodes.len() < k {
                bucket.nodes.push(NodeInfo::new(node));
                return Ok(());
            }

            if home || depth < b {
                split(tree, depth);
                return insert_at(tree, node, depth, home, owner, k, b);
            }

            let evictable = bucket.nodes[0].node.clone();
            bucket.push_cache(node, k);

            Err(evictable)
        }
    }
}

/// Split a leaf on the bit at `depth`, redistributing its nodes and cache.
fn split(tree: &mut Tree, depth: usize) {
    let bucket = match mem::replace(tree, Tree::Bucket(KBucket::new())) {
        Tree::Bucket(bucket) => bucket,
        Tree::Split(..) => unreachable!("only leaves are split"),
    };

    let mut zero = KBucket::new();
    let mut one = KBucket::new();

    for info in bucket.nodes {
        if info.node.id.bit(depth) {
            one.nodes.push(info);
        } else {
            zero.nodes.push(info);
        }
    }

    for cached in bucket.cache {
        if cached.id.bit(depth) {
            one.cache.push(cached);
        } else {
            zero.cache.push(cached);
        }
    }

    *tree = Tree::Split(
        Box::new(Tree::Bucket(zero)),
        Box::new(Tree::Bucket(one)),
    );
}

fn bucket_for<'a>(tree: &'a Tree, id: &PeerId, depth: usize) -> &'a KBucket {
    match tree {
        Tree::Bucket(bucket) => bucket,
        Tree::Split(zero, one) => {
            let branch = if id.bit(depth) { one } else { zero };
            bucket_for(branch, id, depth + 1)
        }
    }
}

fn bucket_for_mut<'a>(tree: &'a mut Tree, id: &PeerId, depth: usize) -> &'a mut KBucket {
    match tree {
        Tree::Bucket(bucket) => bucket,
        Tree::Split(zero, one) => {
            let branch = if id.bit(depth) { one } else { zero };
            bucket_for_mut(branch, id, depth + 1)
        }
    }
}

fn collect(tree: &Tree, visit: &mut impl FnMut(&NodeInfo)) {
    match tree {
        Tree::Bucket(bucket) => {
            for info in &bucket.nodes {
                visit(info);
            }
        }
        Tree::Split(zero, one) => {
            collect(zero, visit);
            collect(one, visit);
        }
    }
}

fn snapshot_buckets(tree: &Tree, snapshots: &mut Vec<BucketSnapshot>) {
    match tree {
        Tree::Bucket(bucket) => {
            let suspicious: Vec<NodeInfo> = bucket
                .nodes
                .iter()
                .filter(|info| info.timeout_count > 0)
                .cloned()
                .collect();

            if !suspicious.is_empty() {
                snapshots.push(BucketSnapshot {
                    suspicious,
                    cache: bucket.cache.clone(),
                });
            }
        }
        Tree::Split(zero, one) => {
            snapshot_buckets(zero, snapshots);
            snapshot_buckets(one, snapshots);
        }
    }
}
