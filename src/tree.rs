use crate::logger::{Log, NoopLogger};
use crate::node::Node;
use std::marker::PhantomData as marker;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

/// A concurrent ordered set of keys.
///
/// The set is an AVL tree whose nodes are threaded into a doubly-linked
/// list in key order, bracketed by two permanent sentinels. `contains`
/// never takes a lock; `insert` and `remove` lock individual nodes and
/// release them promptly. Removed nodes aren't freed immediately, they are
/// parked on a quarantine list owned by the set itself, which is only
/// emptied by `AvlSet::gc` or when the set is dropped.
pub struct AvlSet<K, Logger = NoopLogger>
where
    K: Ord,
    Logger: Log,
{
    /// The `PosInf` sentinel, the root of descent.
    pub(crate) root: NonNull<Node<K>>,
    /// The `NegInf` sentinel, the head of the ordered chain and the root
    /// sentinel's parent.
    pub(crate) head: NonNull<Node<K>>,
    /// Head of the quarantine list of retired nodes.
    pub(crate) free: AtomicPtr<Node<K>>,
    pub(crate) free_count: AtomicUsize,
    pub(crate) marker: marker<(K, Logger)>,
}

impl<K, Logger> AvlSet<K, Logger>
where
    K: Ord,
    Logger: Log,
{
    /// Returns a reference to the root sentinel.
    ///
    /// Sentinels live exactly as long as the set, so tying the borrow to
    /// `&self` is sound.
    pub(crate) fn root(&self) -> &Node<K> {
        unsafe { self.root.as_ref() }
    }

    /// Returns a reference to the chain-head sentinel.
    pub(crate) fn head(&self) -> &Node<K> {
        unsafe { self.head.as_ref() }
    }
}
