//! The callstack deduplicator: a trie folding all recorded stacks into a
//! shared tree keyed from the outermost frame inward.
//!
//! Nodes live in a single arena ([`TiVec`]) indexed by [`StackId`], rather
//! than as individually-owned, recursively-destructed tree nodes. The arena
//! is dropped as one block when the [`CallstackTrie`] is dropped, so no
//! node ever needs an individual destructor and there is no risk of a deep
//! recursive teardown blowing the stack.

use typed_index_collections::TiVec;

/// An index into the trie's node arena.
///
/// Two stacks that were interned with equal frame sequences always produce
/// equal ids; the empty stack always interns to the root sentinel,
/// [`CallstackTrie::ROOT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackId(usize);

impl From<usize> for StackId {
    fn from(idx: usize) -> Self {
        StackId(idx)
    }
}

impl From<StackId> for usize {
    fn from(id: StackId) -> usize {
        id.0
    }
}

#[derive(Debug, Clone)]
struct Node {
    /// Unused (`0`) for the root sentinel.
    frame_addr: u64,
    /// `0` for the root sentinel; otherwise the 1-based distance from the root.
    depth: u32,
    parent: Option<StackId>,
    first_child: Option<StackId>,
    next_sibling: Option<StackId>,
}

impl Node {
    fn root() -> Self {
        Node {
            frame_addr: 0,
            depth: 0,
            parent: None,
            first_child: None,
            next_sibling: None,
        }
    }
}

/// Deduplicates callstacks across an entire trace.
///
/// `intern` walks the trie from the root, matching children by
/// `frame_addr`; on a miss, a new chain of nodes is appended for the
/// remaining outer-to-inner frames. A most-recently-matched sibling is
/// moved to the head of its sibling list (a move-to-front heuristic),
/// which speeds up subsequent interns that share a prefix. This is
/// observable only in performance, never in the ids returned.
#[derive(Debug, Clone)]
pub struct CallstackTrie {
    nodes: TiVec<StackId, Node>,
    total_frames: u64,
    unique_frames: u64,
}

impl Default for CallstackTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl CallstackTrie {
    /// The id of the empty stack, shared by every trace.
    pub const ROOT: StackId = StackId(0);

    /// Create a trie containing only the root sentinel.
    pub fn new() -> Self {
        let mut nodes = TiVec::new();
        nodes.push(Node::root());
        CallstackTrie {
            nodes,
            total_frames: 0,
            unique_frames: 0,
        }
    }

    /// Intern a stack, given as frame addresses ordered innermost-first
    /// (index 0 is the call site of the allocator entry point).
    ///
    /// Returns a stable id: interning the same frame sequence again returns
    /// the same id. An empty slice returns [`CallstackTrie::ROOT`].
    pub fn intern(&mut self, frames: &[u64]) -> StackId {
        self.total_frames += frames.len() as u64;

        let mut parent = Self::ROOT;
        for &addr in frames.iter().rev() {
            parent = self.find_or_insert_child(parent, addr);
        }
        parent
    }

    fn find_or_insert_child(&mut self, parent: StackId, addr: u64) -> StackId {
        let mut prev: Option<StackId> = None;
        let mut cur = self.nodes[parent].first_child;

        while let Some(node_id) = cur {
            if self.nodes[node_id].frame_addr == addr {
                if let Some(prev_id) = prev {
                    // Splice `node_id` out from wherever it sits in the
                    // sibling chain and move it to the front.
                    let next = self.nodes[node_id].next_sibling;
                    self.nodes[prev_id].next_sibling = next;
                    self.nodes[node_id].next_sibling = self.nodes[parent].first_child;
                    self.nodes[parent].first_child = Some(node_id);
                }
                return node_id;
            }
            prev = Some(node_id);
            cur = self.nodes[node_id].next_sibling;
        }

        self.unique_frames += 1;
        let depth = self.nodes[parent].depth + 1;
        let new_id: StackId = self.nodes.push_and_get_key(Node {
            frame_addr: addr,
            depth,
            parent: Some(parent),
            first_child: None,
            next_sibling: self.nodes[parent].first_child,
        });
        self.nodes[parent].first_child = Some(new_id);
        new_id
    }

    /// The number of frames in the given stack. `0` for the empty stack.
    pub fn depth(&self, id: StackId) -> usize {
        self.nodes[id].depth as usize
    }

    /// Write `id`'s frames back into `out`, innermost-first, matching the
    /// order they were interned in. `out` must have room for `depth(id)`
    /// entries.
    ///
    /// Calling this with an id not owned by this trie is a programming
    /// defect, not a recoverable error.
    pub fn reify(&self, id: StackId, out: &mut [u64]) {
        let depth = self.depth(id);
        assert!(
            out.len() >= depth,
            "reify: output buffer too small for stack of depth {depth}"
        );
        let mut node = id;
        for slot in out.iter_mut().take(depth) {
            *slot = self.nodes[node].frame_addr;
            node = self.nodes[node].parent.expect("non-root node must have a parent");
        }
    }

    /// The sum of every frame of every interned stack, counting shared
    /// prefixes once per call to `intern`, not once per trie node.
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// The number of distinct trie nodes allocated, i.e. frames that did
    /// not already exist on a shared prefix.
    pub fn unique_frames(&self) -> u64 {
        self.unique_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reify_vec(trie: &CallstackTrie, id: StackId) -> Vec<u64> {
        let mut out = vec![0u64; trie.depth(id)];
        trie.reify(id, &mut out);
        out
    }

    #[test]
    fn empty_stack_is_root() {
        let mut trie = CallstackTrie::new();
        let id = trie.intern(&[]);
        assert_eq!(id, CallstackTrie::ROOT);
        assert_eq!(trie.depth(id), 0);
    }

    #[test]
    fn round_trips_a_single_stack() {
        let mut trie = CallstackTrie::new();
        let frames = [0x1000u64, 0x2000, 0x3000];
        let id = trie.intern(&frames);
        assert_eq!(trie.depth(id), 3);
        assert_eq!(reify_vec(&trie, id), frames);
    }

    #[test]
    fn equal_stacks_share_an_id() {
        let mut trie = CallstackTrie::new();
        let a = trie.intern(&[0xAA, 0xBB, 0xCC]);
        let b = trie.intern(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(a, b);
    }

    #[test]
    fn unequal_stacks_get_distinct_ids() {
        let mut trie = CallstackTrie::new();
        let a = trie.intern(&[0xAA, 0xBB, 0xCC]);
        let b = trie.intern(&[0xAA, 0xDD, 0xCC]);
        assert_ne!(a, b);
    }

    /// S4: shared outermost frame, divergent innermost frame.
    #[test]
    fn shared_outermost_frame_is_deduplicated() {
        let mut trie = CallstackTrie::new();
        trie.intern(&[0xAA, 0xBB, 0xCC]);
        trie.intern(&[0xAA, 0xDD, 0xCC]);
        assert_eq!(trie.total_frames(), 6);
        assert_eq!(trie.unique_frames(), 5);
    }

    #[test]
    fn unique_frames_never_exceeds_total() {
        let mut trie = CallstackTrie::new();
        for i in 0..50u64 {
            trie.intern(&[0xAA, i, 0xCC]);
        }
        assert!(trie.total_frames() >= trie.unique_frames());
    }
}
