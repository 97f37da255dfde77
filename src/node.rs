use crate::lock::HolderMutex;
use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr};

/// A key in the set, with dedicated variants that sort below and above
/// every real key. The variants stand in for the endpoint sentinels, so no
/// value of `K` has to be reserved for them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum NodeKey<K> {
    NegInf,
    Key(K),
    PosInf,
}

impl<K: Ord> NodeKey<K> {
    /// Compares this key against a real key.
    pub(crate) fn cmp_key(&self, key: &K) -> Ordering {
        match self {
            NodeKey::NegInf => Ordering::Less,
            NodeKey::Key(k) => k.cmp(key),
            NodeKey::PosInf => Ordering::Greater,
        }
    }
}

/// A node of the set, one per live key plus the two permanent sentinels.
pub(crate) struct Node<K> {
    pub(crate) key: NodeKey<K>,
    /// True from creation until the node is logically removed. Flipped
    /// exactly once, under the removal's `succ_lock`s.
    pub(crate) valid: AtomicBool,
    pub(crate) left: AtomicPtr<Node<K>>,
    pub(crate) right: AtomicPtr<Node<K>>,
    pub(crate) parent: AtomicPtr<Node<K>>,
    /// Ordered-chain neighbors. A retired node keeps its outgoing chain
    /// pointers, so a reader that landed on it can still walk back to the
    /// live chain.
    pub(crate) pred: AtomicPtr<Node<K>>,
    pub(crate) succ: AtomicPtr<Node<K>>,
    /// Cached subtree heights, 0 for an empty slot. Only read and written
    /// under `tree_lock`.
    pub(crate) left_height: AtomicI32,
    pub(crate) right_height: AtomicI32,
    /// Protects `left`, `right`, `parent`, the cached heights, and this
    /// node's participation in rotations.
    pub(crate) tree_lock: HolderMutex,
    /// Protects `succ` and this node's role as predecessor of the gap
    /// right after it.
    pub(crate) succ_lock: HolderMutex,
    /// Intrusive link in the set's quarantine list of retired nodes.
    pub(crate) next_free: AtomicPtr<Node<K>>,
}

impl<K> Node<K> {
    /// Allocates a node and leaks it to the set; the set frees it through
    /// its quarantine list or its own teardown.
    pub(crate) fn alloc(
        key: NodeKey<K>,
        pred: *mut Node<K>,
        succ: *mut Node<K>,
        parent: *mut Node<K>,
    ) -> *mut Node<K> {
        Box::into_raw(Box::new(Node {
            key,
            valid: AtomicBool::new(true),
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
            parent: AtomicPtr::new(parent),
            pred: AtomicPtr::new(pred),
            succ: AtomicPtr::new(succ),
            left_height: AtomicI32::new(0),
            right_height: AtomicI32::new(0),
            tree_lock: HolderMutex::new(),
            succ_lock: HolderMutex::new(),
            next_free: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::NodeKey;

    #[test]
    fn sentinel_keys_bracket_every_real_key() {
        assert!(NodeKey::NegInf < NodeKey::Key(i32::MIN));
        assert!(NodeKey::Key(i32::MAX) < NodeKey::<i32>::PosInf);
        assert!(NodeKey::Key(1) < NodeKey::Key(2));
        assert_eq!(NodeKey::Key(7).cmp_key(&7), std::cmp::Ordering::Equal);
        assert_eq!(
            NodeKey::<i32>::NegInf.cmp_key(&i32::MIN),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            NodeKey::<i32>::PosInf.cmp_key(&i32::MAX),
            std::cmp::Ordering::Greater
        );
    }
}
