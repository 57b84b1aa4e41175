//! Dynamic bounding volume tree holding one proxy per concealed cluster
//!
//! Leaves store fattened boxes; internal nodes store the union of their
//! children. Insertion picks the sibling with the lowest surface-area cost and
//! rebalances with tree rotations on the way back up, so queries stay
//! logarithmic regardless of insertion order.

use parking_lot::RwLock;

use crate::host::ClusterId;
use crate::util::bounds::{Aabb, Sphere};

/// Margin added around every leaf box
pub const DEFAULT_AABB_MARGIN: f64 = 3.0;

const NULL_NODE: usize = usize::MAX;

/// Handle to one entry of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId(usize);

impl ProxyId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("Proxy {0:?} is not a live leaf")]
    UnknownProxy(ProxyId),
}

#[derive(Debug, Clone)]
struct TreeNode<T> {
    aabb: Aabb,
    /// Parent index, or next free node while on the free list
    parent: usize,
    child1: usize,
    child2: usize,
    /// Leaf = 0, free node = -1
    height: i32,
    data: Option<T>,
}

impl<T> TreeNode<T> {
    #[inline]
    fn is_leaf(&self) -> bool {
        self.child1 == NULL_NODE
    }
}

/// Dynamic AABB tree
#[derive(Debug, Clone)]
pub struct AabbTree<T> {
    nodes: Vec<TreeNode<T>>,
    root: usize,
    free_list: usize,
    leaf_count: usize,
    margin: f64,
}

impl<T: Copy> AabbTree<T> {
    pub fn new(margin: f64) -> Self {
        Self {
            nodes: Vec::with_capacity(16),
            root: NULL_NODE,
            free_list: NULL_NODE,
            leaf_count: 0,
            margin,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.leaf_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }

    /// Height of the root, 0 for a single leaf or an empty tree
    pub fn height(&self) -> i32 {
        if self.root == NULL_NODE {
            0
        } else {
            self.nodes[self.root].height
        }
    }

    fn allocate_node(&mut self) -> usize {
        if self.free_list == NULL_NODE {
            self.nodes.push(TreeNode {
                aabb: Aabb::from_point(Default::default()),
                parent: NULL_NODE,
                child1: NULL_NODE,
                child2: NULL_NODE,
                height: 0,
                data: None,
            });
            return self.nodes.len() - 1;
        }
        let id = self.free_list;
        self.free_list = self.nodes[id].parent;
        let node = &mut self.nodes[id];
        node.parent = NULL_NODE;
        node.child1 = NULL_NODE;
        node.child2 = NULL_NODE;
        node.height = 0;
        node.data = None;
        id
    }

    fn free_node(&mut self, id: usize) {
        let node = &mut self.nodes[id];
        node.parent = self.free_list;
        node.height = -1;
        node.data = None;
        node.child1 = NULL_NODE;
        node.child2 = NULL_NODE;
        self.free_list = id;
    }

    /// Insert `data` with bounds `aabb`
    pub fn insert(&mut self, aabb: Aabb, data: T) -> ProxyId {
        let leaf = self.allocate_node();
        {
            let node = &mut self.nodes[leaf];
            node.aabb = aabb.inflate(self.margin);
            node.data = Some(data);
            node.height = 0;
        }
        self.insert_leaf(leaf);
        self.leaf_count += 1;
        ProxyId(leaf)
    }

    /// Remove a proxy, returning its payload
    pub fn remove(&mut self, proxy: ProxyId) -> Result<T, IndexError> {
        let id = proxy.0;
        let data = match self.nodes.get(id) {
            Some(node) if node.height == 0 && node.is_leaf() => node.data,
            _ => None,
        }
        .ok_or(IndexError::UnknownProxy(proxy))?;

        self.remove_leaf(id);
        self.free_node(id);
        self.leaf_count -= 1;
        Ok(data)
    }

    /// Payload of a live proxy
    pub fn get(&self, proxy: ProxyId) -> Option<T> {
        self.nodes
            .get(proxy.0)
            .filter(|n| n.height == 0 && n.is_leaf())
            .and_then(|n| n.data)
    }

    /// Fattened box stored for a live proxy
    pub fn fat_aabb(&self, proxy: ProxyId) -> Option<Aabb> {
        self.nodes
            .get(proxy.0)
            .filter(|n| n.height == 0 && n.is_leaf() && n.data.is_some())
            .map(|n| n.aabb)
    }

    fn insert_leaf(&mut self, leaf: usize) {
        if self.root == NULL_NODE {
            self.root = leaf;
            self.nodes[leaf].parent = NULL_NODE;
            return;
        }

        // Find the best sibling by surface-area cost
        let leaf_aabb = self.nodes[leaf].aabb;
        let mut index = self.root;
        while !self.nodes[index].is_leaf() {
            let child1 = self.nodes[index].child1;
            let child2 = self.nodes[index].child2;

            let area = self.nodes[index].aabb.perimeter();
            let combined_area = self.nodes[index].aabb.union(&leaf_aabb).perimeter();

            // Cost of creating a new parent for this node and the leaf
            let cost = 2.0 * combined_area;
            // Minimum cost of pushing the leaf further down
            let inheritance = 2.0 * (combined_area - area);

            let cost1 = self.descent_cost(child1, &leaf_aabb) + inheritance;
            let cost2 = self.descent_cost(child2, &leaf_aabb) + inheritance;

            if cost < cost1 && cost < cost2 {
                break;
            }
            index = if cost1 < cost2 { child1 } else { child2 };
        }
        let sibling = index;

        let old_parent = self.nodes[sibling].parent;
        let new_parent = self.allocate_node();
        {
            let sibling_aabb = self.nodes[sibling].aabb;
            let sibling_height = self.nodes[sibling].height;
            let node = &mut self.nodes[new_parent];
            node.parent = old_parent;
            node.aabb = leaf_aabb.union(&sibling_aabb);
            node.height = sibling_height + 1;
            node.child1 = sibling;
            node.child2 = leaf;
        }
        if old_parent != NULL_NODE {
            if self.nodes[old_parent].child1 == sibling {
                self.nodes[old_parent].child1 = new_parent;
            } else {
                self.nodes[old_parent].child2 = new_parent;
            }
        } else {
            self.root = new_parent;
        }
        self.nodes[sibling].parent = new_parent;
        self.nodes[leaf].parent = new_parent;

        self.refit_from(self.nodes[leaf].parent);
    }

    fn descent_cost(&self, child: usize, leaf_aabb: &Aabb) -> f64 {
        let node = &self.nodes[child];
        let merged = leaf_aabb.union(&node.aabb).perimeter();
        if node.is_leaf() {
            merged
        } else {
            merged - node.aabb.perimeter()
        }
    }

    fn remove_leaf(&mut self, leaf: usize) {
        if leaf == self.root {
            self.root = NULL_NODE;
            return;
        }

        let parent = self.nodes[leaf].parent;
        let grand_parent = self.nodes[parent].parent;
        let sibling = if self.nodes[parent].child1 == leaf {
            self.nodes[parent].child2
        } else {
            self.nodes[parent].child1
        };

        if grand_parent != NULL_NODE {
            // Splice the sibling into the parent's slot
            if self.nodes[grand_parent].child1 == parent {
                self.nodes[grand_parent].child1 = sibling;
            } else {
                self.nodes[grand_parent].child2 = sibling;
            }
            self.nodes[sibling].parent = grand_parent;
            self.free_node(parent);
            self.refit_from(grand_parent);
        } else {
            self.root = sibling;
            self.nodes[sibling].parent = NULL_NODE;
            self.free_node(parent);
        }
    }

    /// Walk to the root rebalancing and refitting every ancestor
    fn refit_from(&mut self, start: usize) {
        let mut index = start;
        while index != NULL_NODE {
            index = self.balance(index);

            let child1 = self.nodes[index].child1;
            let child2 = self.nodes[index].child2;
            let height = 1 + self.nodes[child1].height.max(self.nodes[child2].height);
            let aabb = self.nodes[child1].aabb.union(&self.nodes[child2].aabb);
            self.nodes[index].height = height;
            self.nodes[index].aabb = aabb;

            index = self.nodes[index].parent;
        }
    }

    /// Rotate `a` if its subtree is imbalanced. Returns the new subtree root.
    fn balance(&mut self, a: usize) -> usize {
        if self.nodes[a].is_leaf() || self.nodes[a].height < 2 {
            return a;
        }

        let b = self.nodes[a].child1;
        let c = self.nodes[a].child2;
        let balance = self.nodes[c].height - self.nodes[b].height;

        if balance > 1 {
            self.rotate_up(a, c, b, true)
        } else if balance < -1 {
            self.rotate_up(a, b, c, false)
        } else {
            a
        }
    }

    /// Promote child `up` of `a` above it; `other` is `a`'s remaining child.
    /// `up_was_child2` tells which slot of `a` the promoted node occupied.
    fn rotate_up(&mut self, a: usize, up: usize, other: usize, up_was_child2: bool) -> usize {
        let f = self.nodes[up].child1;
        let g = self.nodes[up].child2;

        // `up` takes `a`'s place under a's parent
        self.nodes[up].child1 = a;
        self.nodes[up].parent = self.nodes[a].parent;
        self.nodes[a].parent = up;

        let up_parent = self.nodes[up].parent;
        if up_parent != NULL_NODE {
            if self.nodes[up_parent].child1 == a {
                self.nodes[up_parent].child1 = up;
            } else {
                self.nodes[up_parent].child2 = up;
            }
        } else {
            self.root = up;
        }

        // The taller grandchild stays with `up`, the shorter moves under `a`
        let (keep, moved) = if self.nodes[f].height > self.nodes[g].height {
            (f, g)
        } else {
            (g, f)
        };
        self.nodes[up].child2 = keep;
        if up_was_child2 {
            self.nodes[a].child2 = moved;
        } else {
            self.nodes[a].child1 = moved;
        }
        self.nodes[moved].parent = a;

        let a_aabb = self.nodes[other].aabb.union(&self.nodes[moved].aabb);
        let a_height = 1 + self.nodes[other].height.max(self.nodes[moved].height);
        self.nodes[a].aabb = a_aabb;
        self.nodes[a].height = a_height;

        let up_aabb = a_aabb.union(&self.nodes[keep].aabb);
        self.nodes[up].aabb = up_aabb;
        self.nodes[up].height = 1 + a_height.max(self.nodes[keep].height);

        up
    }

    /// Visit every payload whose leaf box satisfies `hit`; internal nodes
    /// failing `hit` prune their subtree.
    fn visit(&self, hit: impl Fn(&Aabb) -> bool, mut f: impl FnMut(T)) {
        if self.root == NULL_NODE {
            return;
        }
        let mut stack = Vec::with_capacity(64);
        stack.push(self.root);
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if !hit(&node.aabb) {
                continue;
            }
            if node.is_leaf() {
                if let Some(data) = node.data {
                    f(data);
                }
            } else {
                stack.push(node.child1);
                stack.push(node.child2);
            }
        }
    }

    /// Append every payload whose box overlaps the sphere
    pub fn query_sphere(&self, sphere: &Sphere, out: &mut Vec<T>) {
        self.visit(|aabb| sphere.intersects(aabb), |data| out.push(data));
    }

    /// Append every payload whose box overlaps `bounds`
    pub fn query_aabb(&self, bounds: &Aabb, out: &mut Vec<T>) {
        self.visit(|aabb| aabb.overlaps(bounds), |data| out.push(data));
    }

    /// Check parent links, heights and containment. Test helper.
    pub fn validate(&self) -> bool {
        if self.root == NULL_NODE {
            return self.leaf_count == 0;
        }
        if self.nodes[self.root].parent != NULL_NODE {
            return false;
        }
        let mut leaves = 0;
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if node.is_leaf() {
                if node.height != 0 || node.data.is_none() {
                    return false;
                }
                leaves += 1;
                continue;
            }
            let (c1, c2) = (node.child1, node.child2);
            if self.nodes[c1].parent != index || self.nodes[c2].parent != index {
                return false;
            }
            if node.height != 1 + self.nodes[c1].height.max(self.nodes[c2].height) {
                return false;
            }
            if !node.aabb.contains(&self.nodes[c1].aabb) || !node.aabb.contains(&self.nodes[c2].aabb) {
                return false;
            }
            stack.push(c1);
            stack.push(c2);
        }
        leaves == self.leaf_count
    }
}

/// Spatial index of concealed clusters
///
/// Queries take a shared lock and may run concurrently; insert and remove take
/// the exclusive lock, so no query observes a half-linked entry.
pub struct ConcealmentIndex {
    tree: RwLock<AabbTree<ClusterId>>,
}

impl ConcealmentIndex {
    pub fn new() -> Self {
        Self::with_margin(DEFAULT_AABB_MARGIN)
    }

    pub fn with_margin(margin: f64) -> Self {
        Self {
            tree: RwLock::new(AabbTree::new(margin)),
        }
    }

    pub fn insert(&self, cluster: ClusterId, bounds: Aabb) -> ProxyId {
        self.tree.write().insert(bounds, cluster)
    }

    pub fn remove(&self, proxy: ProxyId) -> Result<ClusterId, IndexError> {
        self.tree.write().remove(proxy)
    }

    /// Clusters whose stored bounds overlap the sphere; no duplicates
    pub fn query_sphere(&self, center: crate::util::vec3::Vec3, radius: f64) -> Vec<ClusterId> {
        let mut out = Vec::new();
        self.tree.read().query_sphere(&Sphere::new(center, radius), &mut out);
        out
    }

    pub fn contains(&self, proxy: ProxyId) -> bool {
        self.tree.read().get(proxy).is_some()
    }

    pub fn cluster_at(&self, proxy: ProxyId) -> Option<ClusterId> {
        self.tree.read().get(proxy)
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    pub fn height(&self) -> i32 {
        self.tree.read().height()
    }

    pub fn validate(&self) -> bool {
        self.tree.read().validate()
    }
}

impl Default for ConcealmentIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::vec3::Vec3;
    use rayon::prelude::*;

    fn cube(x: f64, y: f64, z: f64, half: f64) -> Aabb {
        Aabb::from_center(Vec3::new(x, y, z), half)
    }

    #[test]
    fn test_insert_and_query() {
        let mut tree = AabbTree::new(0.0);
        tree.insert(cube(0.0, 0.0, 0.0, 1.0), 1u64);
        tree.insert(cube(100.0, 0.0, 0.0, 1.0), 2u64);

        let mut out = Vec::new();
        tree.query_sphere(&Sphere::new(Vec3::ZERO, 10.0), &mut out);
        assert_eq!(out, vec![1]);
        assert!(tree.validate());
    }

    #[test]
    fn test_remove_frees_proxy() {
        let mut tree = AabbTree::new(0.0);
        let a = tree.insert(cube(0.0, 0.0, 0.0, 1.0), 1u64);
        let b = tree.insert(cube(10.0, 0.0, 0.0, 1.0), 2u64);

        assert_eq!(tree.remove(a), Ok(1));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.remove(a), Err(IndexError::UnknownProxy(a)));
        assert_eq!(tree.get(b), Some(2));
        assert!(tree.validate());

        assert_eq!(tree.remove(b), Ok(2));
        assert!(tree.is_empty());
        assert!(tree.validate());
    }

    #[test]
    fn test_node_reuse_after_remove() {
        let mut tree = AabbTree::new(0.0);
        let a = tree.insert(cube(0.0, 0.0, 0.0, 1.0), 1u64);
        tree.insert(cube(5.0, 0.0, 0.0, 1.0), 2u64);
        let capacity = tree.nodes.len();
        tree.remove(a).unwrap();
        tree.insert(cube(7.0, 0.0, 0.0, 1.0), 3u64);
        assert_eq!(tree.nodes.len(), capacity);
        assert!(tree.validate());
    }

    #[test]
    fn test_margin_fattens_leaves() {
        let mut tree = AabbTree::new(3.0);
        let p = tree.insert(cube(0.0, 0.0, 0.0, 1.0), 1u64);
        assert_eq!(tree.fat_aabb(p), Some(cube(0.0, 0.0, 0.0, 4.0)));
    }

    #[test]
    fn test_stays_balanced_with_sorted_inserts() {
        let mut tree = AabbTree::new(0.0);
        for i in 0..1024 {
            tree.insert(cube(i as f64 * 10.0, 0.0, 0.0, 1.0), i as u64);
        }
        assert!(tree.validate());
        // A degenerate chain would have height 1023
        assert!(tree.height() < 64, "height {}", tree.height());
    }

    #[test]
    fn test_full_cover_query_returns_each_once() {
        let mut tree = AabbTree::new(DEFAULT_AABB_MARGIN);
        let mut proxies = Vec::new();
        for i in 0..200u64 {
            let x = (i % 20) as f64 * 100.0;
            let z = (i / 20) as f64 * 100.0;
            proxies.push(tree.insert(cube(x, 0.0, z, 5.0), i));
        }
        // Remove every third to exercise rebalancing
        for (i, p) in proxies.iter().enumerate() {
            if i % 3 == 0 {
                tree.remove(*p).unwrap();
            }
        }

        let mut out = Vec::new();
        tree.query_sphere(&Sphere::new(Vec3::new(1000.0, 0.0, 500.0), 1e6), &mut out);
        out.sort_unstable();
        let expected: Vec<u64> = (0..200u64).filter(|i| i % 3 != 0).collect();
        assert_eq!(out, expected);
        assert!(tree.validate());
    }

    #[test]
    fn test_query_aabb() {
        let mut tree = AabbTree::new(0.0);
        tree.insert(cube(0.0, 0.0, 0.0, 1.0), 1u64);
        tree.insert(cube(0.0, 50.0, 0.0, 1.0), 2u64);
        let mut out = Vec::new();
        tree.query_aabb(&cube(0.0, 48.0, 0.0, 2.0), &mut out);
        assert_eq!(out, vec![2]);
    }

    #[test]
    fn test_index_concurrent_queries() {
        let index = ConcealmentIndex::with_margin(0.0);
        for i in 0..100u64 {
            index.insert(i, cube(i as f64 * 50.0, 0.0, 0.0, 1.0));
        }

        let centers: Vec<f64> = (0..16).map(|i| i as f64 * 300.0).collect();
        let counts: Vec<usize> = centers
            .par_iter()
            .map(|x| index.query_sphere(Vec3::new(*x, 0.0, 0.0), 60.0).len())
            .collect();

        // Every sphere centred on a box reaches it and its two neighbours
        assert!(counts.iter().all(|c| *c == 3 || *c == 2));
        assert_eq!(index.len(), 100);
    }

    #[test]
    fn test_index_remove_unknown() {
        let index = ConcealmentIndex::new();
        let p = index.insert(9, cube(0.0, 0.0, 0.0, 1.0));
        assert_eq!(index.cluster_at(p), Some(9));
        assert_eq!(index.remove(p), Ok(9));
        assert!(!index.contains(p));
        assert!(index.remove(p).is_err());
    }
}
