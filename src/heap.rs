//! Heap allocator
//!
//! The heap region is covered by a binary tree of nodes. A free leaf is split
//! in half while the request still fits in one half, and the first node that
//! cannot be usefully split is handed out whole. Freed leaves are merged back
//! into their parent as soon as both siblings are free leaves again, all the
//! way up to the root.
//!
//! Nodes live in an arena and refer to each other by index. The tree only
//! tracks address ranges; the words themselves live in the machine memory.

use std::ops::Range;

use tracing::trace;

use crate::error::Fault;

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone)]
struct Node {
    start: usize,
    size: usize,
    allocated: bool,
    children: Option<(NodeId, NodeId)>,
    parent: Option<NodeId>,
}

impl Node {
    fn leaf(start: usize, size: usize, parent: Option<NodeId>) -> Self {
        Node {
            start,
            size,
            allocated: false,
            children: None,
            parent,
        }
    }
}

/// Allocation tree over one heap region
#[derive(Debug, Clone)]
pub struct HeapTree {
    nodes: Vec<Node>,
    vacant: Vec<NodeId>,
    min_alloc: usize,
    live: usize,
    total_allocs: usize,
    total_frees: usize,
}

impl HeapTree {
    /// Create a tree covering `range`. Nodes smaller than `2 * min_alloc`
    /// are never split.
    pub fn new(range: Range<usize>, min_alloc: usize) -> Self {
        HeapTree {
            nodes: vec![Node::leaf(range.start, range.len(), None)],
            vacant: Vec::new(),
            min_alloc: min_alloc.max(1),
            live: 0,
            total_allocs: 0,
            total_frees: 0,
        }
    }

    /// Address range managed by this tree
    pub fn range(&self) -> Range<usize> {
        let root = &self.nodes[ROOT];
        root.start..root.start + root.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }

    /// Allocate a block of at least `size` words and return its address.
    pub fn alloc(&mut self, size: usize) -> Result<usize, Fault> {
        let size = size.max(1);
        match self.alloc_in(ROOT, size) {
            Some(addr) => {
                self.live += 1;
                self.total_allocs += 1;
                trace!(addr, size, "heap alloc");
                Ok(addr)
            }
            None => Err(Fault::HeapExhausted(size)),
        }
    }

    fn alloc_in(&mut self, id: NodeId, size: usize) -> Option<usize> {
        let Node {
            size: capacity,
            allocated,
            children,
            ..
        } = self.nodes[id];
        if allocated || size > capacity {
            return None;
        }

        let (left, right) = match children {
            Some(children) => children,
            None => {
                let half = capacity / 2;
                if size > half || half < self.min_alloc {
                    let node = &mut self.nodes[id];
                    node.allocated = true;
                    return Some(node.start);
                }
                self.split(id)
            }
        };

        self.alloc_in(left, size)
            .or_else(|| self.alloc_in(right, size))
    }

    fn split(&mut self, id: NodeId) -> (NodeId, NodeId) {
        let Node { start, size, .. } = self.nodes[id];
        let half = size / 2;
        let left = self.new_node(Node::leaf(start, half, Some(id)));
        let right = self.new_node(Node::leaf(start + half, size - half, Some(id)));
        self.nodes[id].children = Some((left, right));
        trace!(start, size, "heap split");
        (left, right)
    }

    fn new_node(&mut self, node: Node) -> NodeId {
        match self.vacant.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Release the block starting at `addr` and merge free siblings.
    /// Returns the size of the released block.
    pub fn free(&mut self, addr: usize) -> Result<usize, Fault> {
        let id = self.find(addr).ok_or(Fault::InvalidFree(addr))?;
        let node = &mut self.nodes[id];
        node.allocated = false;
        let size = node.size;

        self.live -= 1;
        self.total_frees += 1;
        trace!(addr, size, "heap free");

        self.coalesce(self.nodes[id].parent);
        Ok(size)
    }

    /// Descend by address to the allocated leaf that starts at `addr`.
    fn find(&self, addr: usize) -> Option<NodeId> {
        if !self.contains(addr) {
            return None;
        }

        let mut id = ROOT;
        loop {
            let node = &self.nodes[id];
            if node.allocated {
                return (node.start == addr).then_some(id);
            }
            let (left, right) = node.children?;
            id = if addr < self.nodes[right].start {
                left
            } else {
                right
            };
        }
    }

    fn coalesce(&mut self, mut current: Option<NodeId>) {
        while let Some(id) = current {
            let Some((left, right)) = self.nodes[id].children else {
                break;
            };
            if !self.is_free_leaf(left) || !self.is_free_leaf(right) {
                break;
            }

            self.nodes[id].children = None;
            self.vacant.push(left);
            self.vacant.push(right);
            current = self.nodes[id].parent;
        }
    }

    fn is_free_leaf(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        !node.allocated && node.children.is_none()
    }

    /// Size of the live block starting at `addr`
    pub fn block_size(&self, addr: usize) -> Option<usize> {
        self.find(addr).map(|id| self.nodes[id].size)
    }

    /// Ranges of every live block, in address order
    pub fn live_blocks(&self) -> Vec<Range<usize>> {
        let mut blocks = Vec::new();
        let mut pending = vec![ROOT];
        while let Some(id) = pending.pop() {
            let node = &self.nodes[id];
            if node.allocated {
                blocks.push(node.start..node.start + node.size);
            } else if let Some((left, right)) = node.children {
                pending.push(right);
                pending.push(left);
            }
        }
        blocks
    }

    /// Number of live blocks
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn total_allocs(&self) -> usize {
        self.total_allocs
    }

    pub fn total_frees(&self) -> usize {
        self.total_frees
    }

    /// True when the tree is back to a single unsplit free root.
    pub fn is_pristine(&self) -> bool {
        self.is_free_leaf(ROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(tree: &HeapTree) {
        let blocks = tree.live_blocks();
        for pair in blocks.windows(2) {
            assert!(
                pair[0].end <= pair[1].start,
                "{:?} overlaps {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn halves_until_request_fits() {
        let mut tree = HeapTree::new(100..164, 4);

        let a = tree.alloc(20).unwrap();
        assert_eq!(a, 100);
        assert_eq!(tree.block_size(a), Some(32));

        let b = tree.alloc(20).unwrap();
        assert_eq!(b, 132);

        assert_eq!(tree.alloc(1), Err(Fault::HeapExhausted(1)));
    }

    #[test]
    fn small_requests_get_min_granularity() {
        let mut tree = HeapTree::new(0..64, 4);
        let a = tree.alloc(1).unwrap();
        let b = tree.alloc(1).unwrap();
        assert_eq!(tree.block_size(a), Some(4));
        assert_eq!(b, 4);
        assert_disjoint(&tree);
    }

    #[test]
    fn oversized_request_fails() {
        let mut tree = HeapTree::new(0..64, 4);
        assert_eq!(tree.alloc(65), Err(Fault::HeapExhausted(65)));
        let whole = tree.alloc(64).unwrap();
        assert_eq!(tree.block_size(whole), Some(64));
    }

    #[test]
    fn free_coalesces_to_root() {
        let mut tree = HeapTree::new(0..64, 4);
        let a = tree.alloc(3).unwrap();
        let b = tree.alloc(9).unwrap();
        let c = tree.alloc(4).unwrap();
        assert!(!tree.is_pristine());

        tree.free(b).unwrap();
        tree.free(a).unwrap();
        assert!(!tree.is_pristine());
        tree.free(c).unwrap();
        assert!(tree.is_pristine());
        assert_eq!(tree.live(), 0);

        // The whole range is usable again
        assert_eq!(tree.alloc(64), Ok(0));
    }

    #[test]
    fn invalid_and_double_free() {
        let mut tree = HeapTree::new(0..64, 4);
        let a = tree.alloc(8).unwrap();
        assert_eq!(tree.free(a + 1), Err(Fault::InvalidFree(a + 1)));
        assert_eq!(tree.free(1000), Err(Fault::InvalidFree(1000)));
        tree.free(a).unwrap();
        assert_eq!(tree.free(a), Err(Fault::InvalidFree(a)));
    }

    #[test]
    fn mixed_sequence_never_overlaps() {
        let mut tree = HeapTree::new(0..1024, 2);
        let mut live = Vec::new();
        let mut seed: u32 = 7;
        let mut next = || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            (seed >> 16) as usize
        };

        for _ in 0..500 {
            if next() % 3 == 0 && !live.is_empty() {
                let addr = live.swap_remove(next() % live.len());
                tree.free(addr).unwrap();
            } else if let Ok(addr) = tree.alloc(1 + next() % 40) {
                live.push(addr);
            }
            assert_disjoint(&tree);
            assert_eq!(tree.live(), live.len());
        }

        for addr in live {
            tree.free(addr).unwrap();
        }
        assert!(tree.is_pristine());
        assert_eq!(tree.total_allocs(), tree.total_frees());
    }
}
