use crate::logger::Log;
use crate::node::{Node, NodeKey};
use crate::tree::AvlSet;
use std::cmp;
use std::ffi::c_void;
use std::marker::PhantomData as marker;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::thread;

fn raw<K>(node: &Node<K>) -> *mut Node<K> {
    node as *const Node<K> as *mut Node<K>
}

fn is_node<K>(ptr: *mut Node<K>, node: &Node<K>) -> bool {
    ptr == raw(node)
}

/// Left height minus right height, from the caches. Only meaningful under
/// the node's `tree_lock`.
fn balance_factor<K>(node: &Node<K>) -> i32 {
    node.left_height.load(Ordering::Relaxed) - node.right_height.load(Ordering::Relaxed)
}

/// True iff `child` occupies `node`'s left slot; `None` matches an empty
/// slot.
fn on_left<K>(node: &Node<K>, child: Option<&Node<K>>) -> bool {
    node.left.load(Ordering::Acquire) == child.map_or(ptr::null_mut(), raw)
}

/// Refreshes `node`'s cached height on one side from `child`'s caches.
/// Returns false when the cache was already accurate.
fn update_height<K>(child: Option<&Node<K>>, node: &Node<K>, is_left: bool) -> bool {
    let new_height = match child {
        None => 0,
        Some(child) => {
            let left = child.left_height.load(Ordering::Relaxed);
            let right = child.right_height.load(Ordering::Relaxed);
            left.max(right) + 1
        }
    };
    let slot = if is_left {
        &node.left_height
    } else {
        &node.right_height
    };
    if slot.load(Ordering::Relaxed) == new_height {
        return false;
    }
    slot.store(new_height, Ordering::Relaxed);
    true
}

/// Replaces `old` by `new` in `parent`'s child slot and reparents `new`.
/// Returns true when the slot was the left one.
fn update_child<K>(parent: &Node<K>, old: &Node<K>, new: Option<&Node<K>>) -> bool {
    if let Some(new) = new {
        new.parent.store(raw(parent), Ordering::Release);
    }
    let new_ptr = new.map_or(ptr::null_mut(), raw);
    let left = is_node(parent.left.load(Ordering::Acquire), old);
    if left {
        parent.left.store(new_ptr, Ordering::Release);
    } else {
        parent.right.store(new_ptr, Ordering::Release);
    }
    left
}

/// Releases whichever of the three rebalance locks the calling thread
/// still owns. The bulk `unlock` discards reentrant acquisitions along
/// with the outermost one.
fn unlock_all<K>(node: Option<&Node<K>>, child: Option<&Node<K>>, parent: Option<&Node<K>>) {
    if let Some(child) = child {
        if child.tree_lock.owns_lock() {
            child.tree_lock.unlock();
        }
    }
    if let Some(node) = node {
        if node.tree_lock.owns_lock() {
            node.tree_lock.unlock();
        }
    }
    if let Some(parent) = parent {
        if parent.tree_lock.owns_lock() {
            parent.tree_lock.unlock();
        }
    }
}

impl<K> AvlSet<K>
where
    K: Ord,
{
    /// Creates an empty set with the no-op logger.
    pub fn new() -> Self {
        Self::with_logger()
    }
}

impl<K> Default for AvlSet<K>
where
    K: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, Logger> AvlSet<K, Logger>
where
    K: Ord,
    Logger: Log,
{
    /// Creates an empty set.
    ///
    /// The chain-head sentinel is wired as the root sentinel's parent, so
    /// climbing operations always find a parent without a null check, and
    /// as its chain predecessor, so chain walks terminate on both ends.
    pub fn with_logger() -> Self {
        let head = Node::alloc(
            NodeKey::NegInf,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
        );
        let root = Node::alloc(NodeKey::PosInf, head, ptr::null_mut(), head);
        unsafe {
            (*head).right.store(root, Ordering::Relaxed);
            (*head).succ.store(root, Ordering::Relaxed);
        }
        AvlSet {
            root: unsafe { NonNull::new_unchecked(root) },
            head: unsafe { NonNull::new_unchecked(head) },
            free: AtomicPtr::new(ptr::null_mut()),
            free_count: AtomicUsize::new(0),
            marker,
        }
    }

    /// Dereferences a pointer read from a node field.
    ///
    /// Nodes are only freed with exclusive access to the set (`gc` and
    /// drop), so every pointer stored in a node stays dereferenceable for
    /// the duration of a shared borrow.
    fn node<'a>(&'a self, ptr: *mut Node<K>) -> Option<&'a Node<K>> {
        unsafe { ptr.as_ref() }
    }

    /// Lock-free descent from the root sentinel. Returns the last node
    /// visited; a racing rotation or removal may have moved it away from
    /// the key's true position, so callers correct the landing through
    /// the ordered chain.
    fn search<'a>(&'a self, key: &K) -> &'a Node<K> {
        let mut node = self.root();
        loop {
            let child_ptr = match node.key.cmp_key(key) {
                cmp::Ordering::Equal => return node,
                cmp::Ordering::Less => node.right.load(Ordering::Acquire),
                cmp::Ordering::Greater => node.left.load(Ordering::Acquire),
            };
            match self.node(child_ptr) {
                Some(child) => node = child,
                None => return node,
            }
        }
    }

    /// Returns whether `key` is in the set, without taking any lock.
    ///
    /// The chain pointers of a retired node keep pointing into the list,
    /// so the walk always converges on the live position of the key.
    pub fn contains(&self, key: &K) -> bool {
        let mut node = self.search(key);
        while node.key.cmp_key(key) == cmp::Ordering::Greater {
            node = self
                .node(node.pred.load(Ordering::Acquire))
                .expect("the chain is bracketed by sentinels");
        }
        while node.key.cmp_key(key) == cmp::Ordering::Less {
            node = self
                .node(node.succ.load(Ordering::Acquire))
                .expect("the chain is bracketed by sentinels");
        }
        node.key.cmp_key(key) == cmp::Ordering::Equal && node.valid.load(Ordering::Acquire)
    }

    /// Inserts `key`, returning false when it is already present.
    pub fn insert(&self, key: K) -> bool {
        loop {
            let node = self.search(&key);
            let pred = match node.key.cmp_key(&key) {
                cmp::Ordering::Less => node,
                _ => self
                    .node(node.pred.load(Ordering::Acquire))
                    .expect("the chain is bracketed by sentinels"),
            };
            pred.succ_lock.lock();
            if !pred.valid.load(Ordering::Acquire) || pred.key.cmp_key(&key) != cmp::Ordering::Less
            {
                // The gap moved underneath us.
                pred.succ_lock.unlock();
                continue;
            }
            let succ = self
                .node(pred.succ.load(Ordering::Acquire))
                .expect("a valid node has a chain successor");
            match succ.key.cmp_key(&key) {
                cmp::Ordering::Equal => {
                    pred.succ_lock.unlock();
                    return false;
                }
                cmp::Ordering::Less => {
                    // Stale landing, the key now belongs further right.
                    pred.succ_lock.unlock();
                    continue;
                }
                cmp::Ordering::Greater => {}
            }

            let (parent, parent_is_pred) = self.choose_parent(pred, succ, node);
            let new = Node::alloc(NodeKey::Key(key), raw(pred), raw(succ), raw(parent));
            let new_node = self.node(new).expect("a fresh allocation is nonnull");
            // Publication on the chain is the linearization point.
            succ.pred.store(new, Ordering::Release);
            pred.succ.store(new, Ordering::Release);
            pred.succ_lock.unlock();
            Logger::log_insert(new as *const c_void);
            self.insert_to_tree(parent, new_node, parent_is_pred);
            return true;
        }
    }

    /// Removes `key`, returning false when it is absent.
    pub fn remove(&self, key: &K) -> bool {
        loop {
            let node = self.search(key);
            let pred = match node.key.cmp_key(key) {
                cmp::Ordering::Less => node,
                _ => self
                    .node(node.pred.load(Ordering::Acquire))
                    .expect("the chain is bracketed by sentinels"),
            };
            pred.succ_lock.lock();
            if !pred.valid.load(Ordering::Acquire) || pred.key.cmp_key(key) != cmp::Ordering::Less
            {
                pred.succ_lock.unlock();
                continue;
            }
            let victim = self
                .node(pred.succ.load(Ordering::Acquire))
                .expect("a valid node has a chain successor");
            match victim.key.cmp_key(key) {
                cmp::Ordering::Less => {
                    pred.succ_lock.unlock();
                    continue;
                }
                cmp::Ordering::Greater => {
                    pred.succ_lock.unlock();
                    return false;
                }
                cmp::Ordering::Equal => {}
            }

            victim.succ_lock.lock();
            let successor = self.acquire_tree_locks(victim);
            let parent = self.lock_parent(victim);

            victim.valid.store(false, Ordering::Release);

            let after = self
                .node(victim.succ.load(Ordering::Acquire))
                .expect("the chain is bracketed by sentinels");
            after.pred.store(raw(pred), Ordering::Release);
            pred.succ.store(raw(after), Ordering::Release);
            victim.succ_lock.unlock();
            pred.succ_lock.unlock();

            self.remove_from_tree(victim, successor, parent);
            self.retire(victim);
            return true;
        }
    }

    /// Picks the tree parent for a key falling between `pred` and `succ`:
    /// whichever of the two currently has the adjacent child slot empty.
    /// Chain adjacency guarantees exactly one of the slots can stay empty
    /// for good, so alternating between them terminates. Returns with the
    /// winner's `tree_lock` held; the flag is true when the parent is
    /// `pred` (the new node goes in the right slot).
    fn choose_parent<'a>(
        &'a self,
        pred: &'a Node<K>,
        succ: &'a Node<K>,
        hint: &'a Node<K>,
    ) -> (&'a Node<K>, bool) {
        let mut candidate = if ptr::eq(hint, pred) || ptr::eq(hint, succ) {
            hint
        } else {
            pred
        };
        loop {
            candidate.tree_lock.lock();
            if ptr::eq(candidate, pred) {
                if candidate.right.load(Ordering::Acquire).is_null() {
                    return (candidate, true);
                }
                candidate.tree_lock.unlock();
                candidate = succ;
            } else {
                if candidate.left.load(Ordering::Acquire).is_null() {
                    return (candidate, false);
                }
                candidate.tree_lock.unlock();
                candidate = pred;
            }
            thread::yield_now();
        }
    }

    /// Attaches `new` under `parent` (whose `tree_lock` is held) and
    /// starts rebalancing from the grandparent.
    fn insert_to_tree(&self, parent: &Node<K>, new: &Node<K>, is_right: bool) {
        if is_right {
            parent.right.store(raw(new), Ordering::Release);
            parent.right_height.store(1, Ordering::Relaxed);
        } else {
            parent.left.store(raw(new), Ordering::Release);
            parent.left_height.store(1, Ordering::Relaxed);
        }
        if ptr::eq(parent, self.root()) {
            parent.tree_lock.unlock();
        } else {
            let grand = self.lock_parent(parent);
            let is_left = on_left(grand, Some(parent));
            self.rebalance(grand, Some(parent), is_left);
        }
    }

    /// Takes the tree locks needed to splice `node` out. Returns the
    /// in-tree successor when `node` has two children (locked, along with
    /// its parent when distinct from `node` and its right child), or
    /// `None` when a single-child unlink suffices (the child, if any, is
    /// locked). Everything past the first lock is a `try_lock`; a miss
    /// releases the lot and retries after a yield.
    fn acquire_tree_locks<'a>(&'a self, node: &'a Node<K>) -> Option<&'a Node<K>> {
        loop {
            node.tree_lock.lock();
            let right = self.node(node.right.load(Ordering::Acquire));
            let left = self.node(node.left.load(Ordering::Acquire));

            if right.is_none() || left.is_none() {
                let single = if right.is_some() { right } else { left };
                if let Some(child) = single {
                    if !child.tree_lock.try_lock() {
                        node.tree_lock.unlock();
                        thread::yield_now();
                        continue;
                    }
                }
                return None;
            }

            // Two children: the chain successor is the leftmost node of
            // the right subtree, the transplant target.
            let succ = self
                .node(node.succ.load(Ordering::Acquire))
                .expect("a valid node has a chain successor");
            let parent = self
                .node(succ.parent.load(Ordering::Acquire))
                .expect("the successor hangs below the root sentinel");
            if !ptr::eq(parent, node) {
                if !parent.tree_lock.try_lock() {
                    node.tree_lock.unlock();
                    thread::yield_now();
                    continue;
                }
                if !is_node(succ.parent.load(Ordering::Acquire), parent)
                    || !parent.valid.load(Ordering::Acquire)
                {
                    parent.tree_lock.unlock();
                    node.tree_lock.unlock();
                    thread::yield_now();
                    continue;
                }
            }
            if !succ.tree_lock.try_lock() {
                node.tree_lock.unlock();
                if !ptr::eq(parent, node) {
                    parent.tree_lock.unlock();
                }
                thread::yield_now();
                continue;
            }
            if let Some(succ_right) = self.node(succ.right.load(Ordering::Acquire)) {
                if !succ_right.tree_lock.try_lock() {
                    node.tree_lock.unlock();
                    succ.tree_lock.unlock();
                    if !ptr::eq(parent, node) {
                        parent.tree_lock.unlock();
                    }
                    thread::yield_now();
                    continue;
                }
            }
            return Some(succ);
        }
    }

    /// Physically splices `node` out of the tree. `succ` and `parent` are
    /// the locks handed over by `acquire_tree_locks` and `lock_parent`.
    fn remove_from_tree(&self, node: &Node<K>, succ: Option<&Node<K>>, parent: &Node<K>) {
        let succ = match succ {
            None => {
                let right = self.node(node.right.load(Ordering::Acquire));
                let child = if right.is_some() {
                    right
                } else {
                    self.node(node.left.load(Ordering::Acquire))
                };
                let left_side = update_child(parent, node, child);
                node.tree_lock.unlock();
                self.rebalance(parent, child, left_side);
                return;
            }
            Some(succ) => succ,
        };

        // Transplant: the successor takes over the victim's place,
        // inheriting its children, parent, and cached heights; its old
        // right child takes its old slot.
        let old_parent = self
            .node(succ.parent.load(Ordering::Acquire))
            .expect("the successor hangs below the root sentinel");
        let old_right = self.node(succ.right.load(Ordering::Acquire));
        update_child(old_parent, succ, old_right);

        succ.left_height
            .store(node.left_height.load(Ordering::Relaxed), Ordering::Relaxed);
        succ.right_height
            .store(node.right_height.load(Ordering::Relaxed), Ordering::Relaxed);

        let left = self
            .node(node.left.load(Ordering::Acquire))
            .expect("a transplanted victim has a left child");
        let right = self.node(node.right.load(Ordering::Acquire));
        succ.parent.store(raw(parent), Ordering::Release);
        succ.left.store(raw(left), Ordering::Release);
        succ.right
            .store(right.map_or(ptr::null_mut(), raw), Ordering::Release);
        left.parent.store(raw(succ), Ordering::Release);
        if let Some(right) = right {
            right.parent.store(raw(succ), Ordering::Release);
        }

        if is_node(parent.left.load(Ordering::Acquire), node) {
            parent.left.store(raw(succ), Ordering::Release);
        } else {
            parent.right.store(raw(succ), Ordering::Release);
        }

        let is_left = !ptr::eq(old_parent, node);
        let violated = balance_factor(succ).abs() >= 2;

        let anchor = if is_left {
            succ.tree_lock.unlock();
            old_parent
        } else {
            // The successor was the victim's right child; its own right
            // slot is the one that shrank.
            succ
        };
        node.tree_lock.unlock();
        parent.tree_lock.unlock();

        self.rebalance(anchor, old_right, is_left);

        if violated {
            // The transplanted successor inherited an imbalance; run a
            // second pass rooted at it, anchored on its heavy child so
            // the pass starts from an accurate height recomputation.
            succ.tree_lock.lock();
            if succ.valid.load(Ordering::Acquire) && balance_factor(succ).abs() >= 2 {
                let child = self.restart(succ, None);
                if succ.tree_lock.owns_lock() {
                    let side = on_left(succ, child);
                    self.rebalance(succ, child, side);
                }
            } else {
                succ.tree_lock.unlock();
            }
        }
    }

    /// Locks `node`'s parent, revalidating that the edge still holds and
    /// the parent is still valid. An invalid parent is waited out; the
    /// removal that invalidated it re-points the edge before it finishes.
    fn lock_parent<'a>(&'a self, node: &'a Node<K>) -> &'a Node<K> {
        let mut parent = self
            .node(node.parent.load(Ordering::Acquire))
            .expect("a node below the root sentinel has a parent");
        parent.tree_lock.lock();
        while !is_node(node.parent.load(Ordering::Acquire), parent)
            || !parent.valid.load(Ordering::Acquire)
        {
            parent.tree_lock.unlock();
            parent = self
                .node(node.parent.load(Ordering::Acquire))
                .expect("a node below the root sentinel has a parent");
            while !parent.valid.load(Ordering::Acquire) {
                thread::yield_now();
                parent = self
                    .node(node.parent.load(Ordering::Acquire))
                    .expect("a node below the root sentinel has a parent");
            }
            parent.tree_lock.lock();
        }
        parent
    }

    /// Recovers from a contended `try_lock` during rebalancing: drops the
    /// held locks, reacquires `node`, and picks its current heavy child.
    /// Returns the freshly locked child, or `None` with `node`'s lock
    /// either released (`node` went invalid) or still held (no heavy
    /// child); callers tell the two apart with `owns_lock`.
    fn restart<'a>(&'a self, node: &'a Node<K>, parent: Option<&'a Node<K>>) -> Option<&'a Node<K>> {
        if let Some(parent) = parent {
            parent.tree_lock.unlock();
        }
        node.tree_lock.unlock();
        thread::yield_now();
        loop {
            node.tree_lock.lock();
            if !node.valid.load(Ordering::Acquire) {
                node.tree_lock.unlock();
                return None;
            }
            let child_ptr = if balance_factor(node) >= 2 {
                node.left.load(Ordering::Acquire)
            } else {
                node.right.load(Ordering::Acquire)
            };
            let child = match self.node(child_ptr) {
                Some(child) => child,
                None => return None,
            };
            if child.tree_lock.try_lock() {
                return Some(child);
            }
            node.tree_lock.unlock();
            thread::yield_now();
        }
    }

    /// Rotates `child` up around `node` through `parent`'s child slot,
    /// refreshing the two cached heights the rotation moves.
    fn rotate(&self, child: &Node<K>, node: &Node<K>, parent: &Node<K>, left: bool) {
        if is_node(parent.left.load(Ordering::Acquire), node) {
            parent.left.store(raw(child), Ordering::Release);
        } else {
            parent.right.store(raw(child), Ordering::Release);
        }
        child.parent.store(raw(parent), Ordering::Release);
        node.parent.store(raw(child), Ordering::Release);
        if left {
            let grand = self.node(child.left.load(Ordering::Acquire));
            node.right
                .store(grand.map_or(ptr::null_mut(), raw), Ordering::Release);
            if let Some(grand) = grand {
                grand.parent.store(raw(node), Ordering::Release);
            }
            child.left.store(raw(node), Ordering::Release);
            node.right_height
                .store(child.left_height.load(Ordering::Relaxed), Ordering::Relaxed);
            let lifted = node
                .left_height
                .load(Ordering::Relaxed)
                .max(node.right_height.load(Ordering::Relaxed))
                + 1;
            child.left_height.store(lifted, Ordering::Relaxed);
        } else {
            let grand = self.node(child.right.load(Ordering::Acquire));
            node.left
                .store(grand.map_or(ptr::null_mut(), raw), Ordering::Release);
            if let Some(grand) = grand {
                grand.parent.store(raw(node), Ordering::Release);
            }
            child.right.store(raw(node), Ordering::Release);
            node.left_height
                .store(child.right_height.load(Ordering::Relaxed), Ordering::Relaxed);
            let lifted = node
                .left_height
                .load(Ordering::Relaxed)
                .max(node.right_height.load(Ordering::Relaxed))
                + 1;
            child.right_height.store(lifted, Ordering::Relaxed);
        }
    }

    /// Bottom-up rebalancing from a `(node, child, is_left)` window, with
    /// `node.tree_lock` held on entry and `child` (when present) locked:
    /// `child` is the subtree that just changed, `is_left` the side it
    /// hangs on. Climbs with hand-over-hand parent locks, rotating while
    /// the balance factor is out of range, and stops as soon as a height
    /// update no longer propagates. Every exit path funnels through
    /// `unlock_all`.
    fn rebalance<'a>(&'a self, mut node: &'a Node<K>, mut child: Option<&'a Node<K>>, mut is_left: bool) {
        let mut parent: Option<&'a Node<K>> = None;

        if ptr::eq(node, self.root()) {
            unlock_all(Some(node), child, None);
            return;
        }

        while !ptr::eq(node, self.root()) {
            let height_changed = update_height(child, node, is_left);
            let mut bf = balance_factor(node);

            if !height_changed && bf.abs() < 2 {
                unlock_all(Some(node), child, parent);
                return;
            }

            while bf.abs() >= 2 {
                if (is_left && bf <= -2) || (!is_left && bf >= 2) {
                    // The heavy side is opposite the one we came from.
                    if let Some(child) = child {
                        child.tree_lock.unlock();
                    }
                    let heavy_ptr = if is_left {
                        node.right.load(Ordering::Acquire)
                    } else {
                        node.left.load(Ordering::Acquire)
                    };
                    let heavy = self.node(heavy_ptr).expect("the heavy side has a child");
                    if !heavy.tree_lock.try_lock() {
                        child = self.restart(node, parent);
                        if !node.tree_lock.owns_lock() {
                            unlock_all(Some(node), child, parent);
                            return;
                        }
                        parent = None;
                        is_left = on_left(node, child);
                        bf = balance_factor(node);
                        continue;
                    }
                    child = Some(heavy);
                    is_left = !is_left;
                }

                let pivot = child.expect("the heavy child is locked");
                let pivot_bf = balance_factor(pivot);
                if (is_left && pivot_bf < 0) || (!is_left && pivot_bf > 0) {
                    // The child leans the other way; rotate its inner
                    // grandchild through it before the outer rotation.
                    let grand_ptr = if is_left {
                        pivot.right.load(Ordering::Acquire)
                    } else {
                        pivot.left.load(Ordering::Acquire)
                    };
                    let grand = self
                        .node(grand_ptr)
                        .expect("a leaning child has an inner grandchild");
                    if !grand.tree_lock.try_lock() {
                        pivot.tree_lock.unlock();
                        child = self.restart(node, parent);
                        if !node.tree_lock.owns_lock() {
                            unlock_all(Some(node), child, parent);
                            return;
                        }
                        parent = None;
                        is_left = on_left(node, child);
                        bf = balance_factor(node);
                        continue;
                    }
                    self.rotate(grand, pivot, node, is_left);
                    pivot.tree_lock.unlock();
                    child = Some(grand);
                }

                let above = match parent {
                    Some(above) => above,
                    None => {
                        let above = self.lock_parent(node);
                        parent = Some(above);
                        above
                    }
                };
                let pivot = child.expect("the rotation child is locked");
                self.rotate(pivot, node, above, !is_left);
                bf = balance_factor(node);

                if bf.abs() >= 2 {
                    // The rotation surfaced an imbalance below; shift the
                    // window down instead of climbing.
                    above.tree_lock.unlock();
                    parent = Some(pivot);
                    child = None;
                    is_left = bf <= -2;
                    continue;
                }

                child = Some(node);
                node = pivot;
                is_left = on_left(node, child);
                bf = balance_factor(node);
            }

            if let Some(child) = child {
                child.tree_lock.unlock();
            }
            child = Some(node);
            node = match parent {
                Some(above) if above.tree_lock.owns_lock() => above,
                _ => self.lock_parent(node),
            };
            is_left = on_left(node, child);
            parent = None;
        }

        unlock_all(Some(node), child, parent);
    }

    /// Parks a removed node on the quarantine list. The node stays
    /// allocated until `gc` runs with exclusive access: readers that
    /// found it before the removal may still walk its chain pointers.
    fn retire(&self, node: &Node<K>) {
        Logger::log_retire(raw(node) as *const c_void);
        let node_ptr = raw(node);
        let mut head = self.free.load(Ordering::Relaxed);
        loop {
            node.next_free.store(head, Ordering::Relaxed);
            match self.free.compare_exchange_weak(
                head,
                node_ptr,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Frees every quarantined node. Exclusive access guarantees no
    /// operation still holds a reference into the list.
    pub fn gc(&mut self) {
        let mut head = self.free.swap(ptr::null_mut(), Ordering::Acquire);
        while let Some(ptr) = NonNull::new(head) {
            let node = unsafe { Box::from_raw(ptr.as_ptr()) };
            head = node.next_free.load(Ordering::Relaxed);
            Logger::log_drop(ptr.as_ptr() as *const c_void);
        }
        self.free_count.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn retired(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }
}

unsafe impl<K, Logger> Send for AvlSet<K, Logger>
where
    K: Ord + Send,
    Logger: Log,
{
}

unsafe impl<K, Logger> Sync for AvlSet<K, Logger>
where
    K: Ord + Send + Sync,
    Logger: Log,
{
}

impl<K, Logger> Drop for AvlSet<K, Logger>
where
    K: Ord,
    Logger: Log,
{
    fn drop(&mut self) {
        self.gc();
        // Iterative teardown; the tree can be deeper than the call stack
        // for large sets.
        let mut pending = vec![raw(self.head())];
        while let Some(ptr) = pending.pop() {
            let node = unsafe { Box::from_raw(ptr) };
            let left = node.left.load(Ordering::Relaxed);
            if !left.is_null() {
                pending.push(left);
            }
            let right = node.right.load(Ordering::Relaxed);
            if !right.is_null() {
                pending.push(right);
            }
            Logger::log_drop(ptr as *const c_void);
        }
    }
}

#[cfg(test)]
impl<K, Logger> AvlSet<K, Logger>
where
    K: Ord + Clone + std::fmt::Debug,
    Logger: Log,
{
    /// In-order keys of the tree hanging below the root sentinel.
    fn tree_keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut cursor = self.node(self.root().left.load(Ordering::Acquire));
        while cursor.is_some() || !stack.is_empty() {
            while let Some(node) = cursor {
                stack.push(node);
                cursor = self.node(node.left.load(Ordering::Acquire));
            }
            let node = stack.pop().unwrap();
            if let NodeKey::Key(key) = &node.key {
                out.push(key.clone());
            }
            cursor = self.node(node.right.load(Ordering::Acquire));
        }
        out
    }

    /// Keys on the ordered chain from head sentinel to root sentinel,
    /// checking that every `pred` edge mirrors the `succ` edge and that
    /// keys strictly ascend.
    fn chain_keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        let mut node = self.head();
        loop {
            let next = match self.node(node.succ.load(Ordering::Acquire)) {
                Some(next) => next,
                None => break,
            };
            assert!(
                is_node(next.pred.load(Ordering::Acquire), node),
                "pred edge does not mirror succ edge"
            );
            assert!(node.key < next.key, "chain keys out of order");
            if let NodeKey::Key(key) = &next.key {
                out.push(key.clone());
            }
            node = next;
        }
        assert_eq!(node.key, NodeKey::PosInf, "chain does not end at the root sentinel");
        out
    }

    /// Recomputed height of `node`'s subtree, auditing cached heights,
    /// parent pointers, key order, and the AVL bound on the way down.
    fn check_subtree(&self, node: &Node<K>) -> i32 {
        assert!(node.valid.load(Ordering::Acquire), "invalid node left in the tree");
        let left_height = match self.node(node.left.load(Ordering::Acquire)) {
            None => 0,
            Some(child) => {
                assert!(is_node(child.parent.load(Ordering::Acquire), node));
                assert!(child.key < node.key, "left child out of order");
                self.check_subtree(child)
            }
        };
        let right_height = match self.node(node.right.load(Ordering::Acquire)) {
            None => 0,
            Some(child) => {
                assert!(is_node(child.parent.load(Ordering::Acquire), node));
                assert!(node.key < child.key, "right child out of order");
                self.check_subtree(child)
            }
        };
        assert_eq!(
            node.left_height.load(Ordering::Relaxed),
            left_height,
            "stale left height cache at {:?}",
            node.key
        );
        assert_eq!(
            node.right_height.load(Ordering::Relaxed),
            right_height,
            "stale right height cache at {:?}",
            node.key
        );
        assert!(
            (left_height - right_height).abs() <= 1,
            "node {:?} out of balance",
            node.key
        );
        left_height.max(right_height) + 1
    }

    /// Full structural audit for a quiescent set.
    fn check_invariants(&self) {
        let tree = self.tree_keys();
        for window in tree.windows(2) {
            assert!(window[0] < window[1], "in-order keys not strictly ascending");
        }
        assert_eq!(tree, self.chain_keys(), "chain and tree disagree");
        if let Some(top) = self.node(self.root().left.load(Ordering::Acquire)) {
            assert!(is_node(top.parent.load(Ordering::Acquire), self.root()));
            self.check_subtree(top);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn empty_set() {
        let set = AvlSet::new();
        assert!(!set.contains(&5));
        assert!(!set.remove(&5));
        assert!(set.insert(5));
        assert!(set.contains(&5));
        assert!(!set.insert(5));
        set.check_invariants();
    }

    #[test]
    fn insert_remove_idempotence() {
        let set = AvlSet::new();
        assert!(set.insert(1));
        assert!(!set.insert(1));
        assert!(set.remove(&1));
        assert!(!set.remove(&1));
        assert!(!set.contains(&1));
        set.check_invariants();
    }

    #[test]
    fn small_tree_shape() {
        let set = AvlSet::new();
        for key in [10, 20, 5, 15].iter() {
            assert!(set.insert(*key));
        }
        assert_eq!(set.tree_keys(), vec![5, 10, 15, 20]);
        let top = set.node(set.root().left.load(Ordering::Acquire)).unwrap();
        assert_eq!(top.key, NodeKey::Key(10));
        set.check_invariants();
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let set = AvlSet::new();
        for key in 1..=7 {
            assert!(set.insert(key));
        }
        let top = set.node(set.root().left.load(Ordering::Acquire)).unwrap();
        assert_eq!(top.key, NodeKey::Key(4));
        assert_eq!(set.check_subtree(top), 3);
        assert_eq!(set.tree_keys(), (1..=7).collect::<Vec<_>>());
        set.check_invariants();
    }

    #[test]
    fn remove_node_with_two_children() {
        let set = AvlSet::new();
        for key in 1..=7 {
            set.insert(key);
        }
        assert!(set.remove(&4));
        assert!(!set.contains(&4));
        assert_eq!(set.tree_keys(), vec![1, 2, 3, 5, 6, 7]);
        set.check_invariants();
    }

    #[test]
    fn random_ops_match_oracle() {
        let set = AvlSet::new();
        let mut oracle = BTreeSet::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..4096 {
            let key: i32 = rng.gen_range(0..64);
            match rng.gen_range(0..3) {
                0 => assert_eq!(set.insert(key), oracle.insert(key)),
                1 => assert_eq!(set.remove(&key), oracle.remove(&key)),
                _ => assert_eq!(set.contains(&key), oracle.contains(&key)),
            }
        }
        assert_eq!(set.tree_keys(), oracle.iter().cloned().collect::<Vec<_>>());
        set.check_invariants();
    }

    #[test]
    fn string_keys() {
        let set = AvlSet::new();
        assert!(set.insert(String::from("pear")));
        assert!(set.insert(String::from("apple")));
        assert!(set.insert(String::from("quince")));
        assert!(!set.insert(String::from("pear")));
        assert!(set.contains(&String::from("apple")));
        assert!(set.remove(&String::from("apple")));
        assert!(!set.contains(&String::from("apple")));
        assert_eq!(
            set.tree_keys(),
            vec![String::from("pear"), String::from("quince")]
        );
        set.check_invariants();
    }

    #[test]
    fn disjoint_concurrent_inserts() {
        let set = Arc::new(AvlSet::new());
        let evens = Arc::clone(&set);
        let odds = Arc::clone(&set);
        let even_thread = thread::spawn(move || {
            for key in (0..1000).step_by(2) {
                assert!(evens.insert(key));
            }
        });
        let odd_thread = thread::spawn(move || {
            for key in (1..1000).step_by(2) {
                assert!(odds.insert(key));
            }
        });
        even_thread.join().unwrap();
        odd_thread.join().unwrap();
        for key in 0..1000 {
            assert!(set.contains(&key));
        }
        assert_eq!(set.tree_keys(), (0..1000).collect::<Vec<_>>());
        set.check_invariants();
    }

    #[test]
    fn mixed_concurrent_workload() {
        let set = Arc::new(AvlSet::new());
        let mut workers = Vec::new();
        for seed in 0..8u64 {
            let set = Arc::clone(&set);
            workers.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..8192 {
                    let key: i32 = rng.gen_range(0..100);
                    match rng.gen_range(0..3) {
                        0 => {
                            set.insert(key);
                        }
                        1 => {
                            set.remove(&key);
                        }
                        _ => {
                            set.contains(&key);
                        }
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        set.check_invariants();
        let present: BTreeSet<i32> = set.tree_keys().into_iter().collect();
        for key in 0..100 {
            assert_eq!(set.contains(&key), present.contains(&key));
        }
    }

    #[test]
    fn readers_run_against_writers() {
        let set = Arc::new(AvlSet::new());
        for key in 0..64 {
            set.insert(key);
        }
        let mut workers = Vec::new();
        for seed in 0..2u64 {
            let set = Arc::clone(&set);
            workers.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..2048 {
                    let key: i32 = rng.gen_range(0..64);
                    if rng.gen_bool(0.5) {
                        set.insert(key);
                    } else {
                        set.remove(&key);
                    }
                }
            }));
        }
        for _ in 0..2 {
            let set = Arc::clone(&set);
            workers.push(thread::spawn(move || {
                for round in 0..2048 {
                    set.contains(&(round % 64));
                    assert!(!set.contains(&1_000_000));
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        set.check_invariants();
    }

    #[test]
    fn gc_frees_quarantined_nodes() {
        let mut set = AvlSet::new();
        for key in 0..100 {
            set.insert(key);
        }
        for key in (0..100).step_by(2) {
            assert!(set.remove(&key));
        }
        assert_eq!(set.retired(), 50);
        set.gc();
        assert_eq!(set.retired(), 0);
        for key in (0..100).step_by(2) {
            assert!(set.insert(key));
        }
        assert_eq!(set.tree_keys(), (0..100).collect::<Vec<_>>());
        set.check_invariants();
    }
}
