// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lock-free concurrent skip-list in the Herlihy/Shavit style, with the
//! physical-unlink refinements popularised by folly's `ConcurrentSkipList`.
//!
//! Every forward link carries a mark bit ([`MarkedPtr`]). Erasure proceeds in
//! two phases: the links of the victim are marked from the top level down
//! (logical deletion), and the thread that wins the bottom-level mark CAS
//! owns the removal. Physical unlinking is cooperative: any search that
//! observes a marked link CAS-swings the predecessor past the deleted node
//! (*helping*), so no traversal ever returns a node that was marked when it
//! was reached.
//!
//! The linearization point of `insert` is the successful bottom-level link
//! CAS; of `remove`, the successful bottom-level mark CAS.

use crate::level::LevelSelector;
use crate::marked::MarkedPtr;
use crate::reclaim::{OpGuard, Retire, ScopeManager};
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use strata_util::{Backoff, non_null};

const HEAD: u8 = 1;
const MARKED: u8 = 1 << 1;

/// Node header plus a tail-allocated array of `top_level + 1` markable
/// forward links.
#[repr(C)]
struct Node<K, V> {
    flags: AtomicU8,
    top_level: u8,
    value: MaybeUninit<(K, V)>,
    links: [MarkedPtr<Node<K, V>>; 0],
}

// === impl Node ===

impl<K, V> Node<K, V> {
    fn layout(top_level: u8) -> Layout {
        let links = Layout::array::<MarkedPtr<Self>>(usize::from(top_level) + 1)
            .expect("link array layout overflowed");
        Layout::new::<Self>()
            .extend(links)
            .expect("node layout overflowed")
            .0
            .pad_to_align()
    }

    fn alloc(value: Option<(K, V)>, top_level: u8) -> NonNull<Self> {
        let layout = Self::layout(top_level);
        // Safety: `layout` has non-zero size.
        let raw = unsafe { alloc(layout) }.cast::<Self>();
        let Some(node) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };

        let flags = if value.is_some() { 0 } else { HEAD };
        // Safety: fresh allocation of `layout`, which has room for the header
        // plus `top_level + 1` link slots.
        unsafe {
            let n = node.as_ptr();
            (&raw mut (*n).flags).write(AtomicU8::new(flags));
            (&raw mut (*n).top_level).write(top_level);
            if let Some(value) = value {
                (&raw mut (*n).value).write(MaybeUninit::new(value));
            }
            let links = (&raw mut (*n).links).cast::<MarkedPtr<Self>>();
            for i in 0..=usize::from(top_level) {
                links.add(i).write(MarkedPtr::new(ptr::null_mut(), false));
            }
        }
        node
    }

    /// Reclaims a node that was never published, handing the payload back.
    ///
    /// # Safety
    ///
    /// The node must be exclusively owned (no link CAS ever succeeded on it)
    /// and must not be the head sentinel.
    unsafe fn take_value(node: NonNull<Self>) -> (K, V) {
        // Safety: exclusive ownership per the contract; the payload was
        // written in `alloc` and is moved out exactly once before dealloc.
        unsafe {
            let top_level = node.as_ref().top_level;
            let value = (&raw const (*node.as_ptr()).value).read().assume_init();
            dealloc(node.as_ptr().cast::<u8>(), Self::layout(top_level));
            value
        }
    }

    fn links(&self) -> &[MarkedPtr<Self>] {
        // Safety: the allocation holds `top_level + 1` link slots directly
        // after the header.
        unsafe {
            core::slice::from_raw_parts(
                (&raw const self.links).cast::<MarkedPtr<Self>>(),
                usize::from(self.top_level) + 1,
            )
        }
    }

    #[inline]
    fn link(&self, level: usize) -> &MarkedPtr<Self> {
        &self.links()[level]
    }

    #[inline]
    fn is_head(&self) -> bool {
        self.flags.load(Ordering::Acquire) & HEAD != 0
    }

    #[inline]
    fn set_marked(&self) {
        self.flags.fetch_or(MARKED, Ordering::Release);
    }

    /// Whether the node is logically deleted: its bottom-level link is
    /// marked (the erase linearization point) or the removal owner has
    /// already set the flag.
    #[inline]
    fn is_removed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & MARKED != 0 || self.link(0).load(Ordering::Acquire).1
    }

    /// # Safety
    ///
    /// Must not be called on the head sentinel.
    #[inline]
    unsafe fn key(&self) -> &K {
        debug_assert!(!self.is_head());
        // Safety: every non-head node is allocated with its payload written.
        unsafe { &self.value.assume_init_ref().0 }
    }

    /// # Safety
    ///
    /// Must not be called on the head sentinel.
    #[inline]
    unsafe fn pair(&self) -> &(K, V) {
        debug_assert!(!self.is_head());
        // Safety: as in `key`.
        unsafe { self.value.assume_init_ref() }
    }
}

// Safety: drops the payload (head sentinels have none) and releases the
// allocation created in `Node::alloc`.
unsafe impl<K, V> Retire for Node<K, V> {
    unsafe fn destroy(ptr: NonNull<Self>) {
        // Safety: produced by `Node::alloc`, destroyed exactly once.
        unsafe {
            let node = ptr.as_ptr();
            let top_level = (*node).top_level;
            if (*node).flags.load(Ordering::Relaxed) & HEAD == 0 {
                (*node).value.assume_init_drop();
            }
            dealloc(node.cast::<u8>(), Self::layout(top_level));
        }
    }
}

/// Argument to the [`SkipMap::insert_or_update`] callback.
pub enum Upsert<'a, V> {
    /// The key was absent; the node is not yet published, so the value may
    /// be mutated freely.
    Inserted(&'a mut V),
    /// The key was present; the node is visible to other threads, so only
    /// shared access is handed out (use interior mutability for in-place
    /// updates).
    Updated(&'a V),
}

/// A concurrent ordered map backed by a lock-free skip-list of height
/// `HEIGHT` (at most 64 levels).
pub struct SkipMap<K, V, const HEIGHT: usize = 32> {
    head: AtomicPtr<Node<K, V>>,
    selector: LevelSelector,
    size: AtomicUsize,
    scope: ScopeManager<Node<K, V>>,
}

// Safety: the map owns its nodes; moving the map moves ownership of the
// payloads.
unsafe impl<K: Send, V: Send, const HEIGHT: usize> Send for SkipMap<K, V, HEIGHT> {}
// Safety: shared access hands out `&K`/`&V` only; all structural state is
// atomic.
unsafe impl<K: Send + Sync, V: Send + Sync, const HEIGHT: usize> Sync for SkipMap<K, V, HEIGHT> {}

// === impl SkipMap ===

impl<K, V, const HEIGHT: usize> SkipMap<K, V, HEIGHT> {
    const MAX_LEVEL: u8 = (HEIGHT - 1) as u8;

    pub fn new() -> Self {
        const {
            assert!(
                HEIGHT >= 2 && HEIGHT <= 64,
                "skip-list height must be in [2, 64]"
            );
        }

        let head = Node::alloc(None, Self::MAX_LEVEL);
        Self {
            head: AtomicPtr::new(head.as_ptr()),
            selector: LevelSelector::new(42, Self::MAX_LEVEL),
            size: AtomicUsize::new(0),
            scope: ScopeManager::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord, V, const HEIGHT: usize> SkipMap<K, V, HEIGHT> {
    /// Search with helping: marked successors are physically unlinked along
    /// the way. Restarts from the head whenever an unlink CAS loses. Fills
    /// `preds`/`succs` at every level and reports whether an equal key sits
    /// at the bottom-level successor position.
    fn search(
        &self,
        key: &K,
        preds: &mut [*mut Node<K, V>; HEIGHT],
        succs: &mut [*mut Node<K, V>; HEIGHT],
    ) -> bool {
        'retry: loop {
            let mut pred = self.head.load(Ordering::Acquire);
            let mut curr: *mut Node<K, V> = ptr::null_mut();

            for level in (0..HEIGHT).rev() {
                // Safety: `pred` is the head or a node reached through a live
                // link; the operation checkout keeps reached nodes allocated.
                curr = unsafe { &*pred }.link(level).ptr(Ordering::Acquire);

                loop {
                    // Safety: as above.
                    let Some(curr_ref) = (unsafe { curr.as_ref() }) else {
                        break;
                    };
                    let (mut succ, mut mark) = curr_ref.link(level).load(Ordering::Acquire);

                    while mark {
                        // finish the marked node's removal on behalf of its
                        // eraser
                        // Safety: checkout held.
                        let snipped = unsafe { &*pred }
                            .link(level)
                            .compare_exchange(curr, false, succ, false)
                            .is_ok();
                        if !snipped {
                            continue 'retry;
                        }
                        // Safety: checkout held.
                        curr = unsafe { &*pred }.link(level).ptr(Ordering::Acquire);
                        // Safety: checkout held.
                        let Some(curr_ref) = (unsafe { curr.as_ref() }) else {
                            break;
                        };
                        (succ, mark) = curr_ref.link(level).load(Ordering::Acquire);
                    }

                    // Safety: checkout held.
                    let Some(curr_ref) = (unsafe { curr.as_ref() }) else {
                        break;
                    };
                    // Safety: `curr` is never the head sentinel.
                    if unsafe { curr_ref.key() } < key {
                        pred = curr;
                        curr = succ;
                    } else {
                        break;
                    }
                }

                preds[level] = pred;
                succs[level] = curr;
            }

            // Safety: checkout held.
            return match unsafe { curr.as_ref() } {
                // Safety: non-head node.
                Some(curr_ref) => (unsafe { curr_ref.key() } == key),
                None => false,
            };
        }
    }

    pub fn insert(&self, key: K, value: V) -> (Entry<'_, K, V>, bool) {
        self.insert_inner(key, value, |_: Upsert<'_, V>| {})
    }

    fn insert_inner(
        &self,
        key: K,
        value: V,
        mut visit: impl FnMut(Upsert<'_, V>),
    ) -> (Entry<'_, K, V>, bool) {
        let _op = OpGuard::enter(&self.scope);
        let top_level = self.selector.next_level();
        let mut preds = [ptr::null_mut(); HEIGHT];
        let mut succs = [ptr::null_mut(); HEIGHT];
        let mut pair = (key, value);

        loop {
            if self.search(&pair.0, &mut preds, &mut succs) {
                let found = succs[0];
                // Safety: checkout held; non-head node.
                visit(Upsert::Updated(unsafe { &(*found).pair().1 }));
                return (Entry::acquire(&self.scope, found), false);
            }

            let node = Node::alloc(Some(pair), top_level);
            for level in 0..=usize::from(top_level) {
                // Safety: exclusively owned until the bottom-level CAS
                // succeeds; the borrow ends before the callback below runs.
                unsafe { &*node.as_ptr() }
                    .link(level)
                    .store(succs[level], false, Ordering::Relaxed);
            }
            // the node is still invisible here, so the callback may mutate
            // Safety: exclusive ownership, payload initialised.
            visit(Upsert::Inserted(unsafe {
                &mut (*node.as_ptr()).value.assume_init_mut().1
            }));

            // Safety: checkout held.
            let published = unsafe { &*preds[0] }
                .link(0)
                .compare_exchange(succs[0], false, node.as_ptr(), false)
                .is_ok();
            if !published {
                // Safety: the bottom-level CAS failed, so the node was never
                // published and we still own it.
                pair = unsafe { Node::take_value(node) };
                continue;
            }

            // swing the upper levels over; a lost CAS re-runs the search to
            // refresh that level's predecessor
            for level in 1..=usize::from(top_level) {
                loop {
                    // Safety: checkout held.
                    let linked = unsafe { &*preds[level] }
                        .link(level)
                        .compare_exchange(succs[level], false, node.as_ptr(), false)
                        .is_ok();
                    if linked {
                        break;
                    }
                    // Safety: non-head node; the borrow only lives for the
                    // search call.
                    let key = unsafe { (*node.as_ptr()).key() };
                    self.search(key, &mut preds, &mut succs);
                }
            }

            self.size.fetch_add(1, Ordering::Relaxed);
            return (Entry::acquire(&self.scope, node.as_ptr()), true);
        }
    }

    /// Removes `key`. Returns whether this call removed it.
    pub fn remove(&self, key: &K) -> bool {
        let _op = OpGuard::enter(&self.scope);
        let mut preds = [ptr::null_mut(); HEIGHT];
        let mut succs = [ptr::null_mut(); HEIGHT];

        if !self.search(key, &mut preds, &mut succs) {
            return false;
        }
        let victim = succs[0];
        // Safety: checkout held.
        let victim_ref = unsafe { &*victim };

        // logical deletion: mark every upper link top-down
        for level in (1..=usize::from(victim_ref.top_level)).rev() {
            let mut backoff = Backoff::new();
            loop {
                let (succ, mark) = victim_ref.link(level).load(Ordering::Acquire);
                if mark
                    || victim_ref
                        .link(level)
                        .compare_exchange(succ, false, succ, true)
                        .is_ok()
                {
                    break;
                }
                backoff.spin();
            }
        }

        // the bottom-level mark decides which eraser owns the removal
        let (mut succ, _) = victim_ref.link(0).load(Ordering::Acquire);
        loop {
            match victim_ref.link(0).compare_exchange(succ, false, succ, true) {
                Ok(()) => {
                    victim_ref.set_marked();
                    // our own search physically unlinks the victim at every
                    // level before we retire it
                    self.search(key, &mut preds, &mut succs);
                    self.size.fetch_sub(1, Ordering::Relaxed);
                    // Safety: `victim` is non-null.
                    self.scope.defer_destroy(unsafe { non_null(victim) });
                    return true;
                }
                Err((observed, mark)) => {
                    if mark {
                        // another eraser won
                        return false;
                    }
                    succ = observed;
                }
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Entry<'_, K, V>> {
        let _op = OpGuard::enter(&self.scope);
        let mut preds = [ptr::null_mut(); HEIGHT];
        let mut succs = [ptr::null_mut(); HEIGHT];

        if !self.search(key, &mut preds, &mut succs) {
            return None;
        }
        let found = succs[0];
        // Safety: checkout held.
        (!unsafe { &*found }.is_removed()).then(|| Entry::acquire(&self.scope, found))
    }

    /// Marked-node-skipping traversal that never helps (and therefore never
    /// writes), unlike [`search`][Self::search].
    pub fn contains(&self, key: &K) -> bool {
        let _op = OpGuard::enter(&self.scope);
        let mut pred = self.head.load(Ordering::Acquire);
        let mut curr: *mut Node<K, V> = ptr::null_mut();

        for level in (0..HEIGHT).rev() {
            // Safety: checkout held; pred reached through live links.
            curr = unsafe { &*pred }.link(level).ptr(Ordering::Acquire);
            loop {
                // Safety: checkout held.
                let Some(curr_ref) = (unsafe { curr.as_ref() }) else {
                    break;
                };
                let (mut succ, mut mark) = curr_ref.link(level).load(Ordering::Acquire);
                while mark {
                    // step over logically deleted nodes without unlinking
                    curr = succ;
                    // Safety: checkout held.
                    let Some(curr_ref) = (unsafe { curr.as_ref() }) else {
                        break;
                    };
                    (succ, mark) = curr_ref.link(level).load(Ordering::Acquire);
                }
                // Safety: checkout held.
                let Some(curr_ref) = (unsafe { curr.as_ref() }) else {
                    break;
                };
                // Safety: non-head node.
                if unsafe { curr_ref.key() } < key {
                    pred = curr;
                    curr = succ;
                } else {
                    break;
                }
            }
        }

        // Safety: checkout held.
        match unsafe { curr.as_ref() } {
            // Safety: non-head node.
            Some(curr_ref) => (unsafe { curr_ref.key() } == key) && !curr_ref.is_removed(),
            None => false,
        }
    }

    /// Returns the entry for the first key greater than or equal to `key`.
    pub fn lower_bound(&self, key: &K) -> Option<Entry<'_, K, V>> {
        let _op = OpGuard::enter(&self.scope);
        let mut preds = [ptr::null_mut(); HEIGHT];
        let mut succs = [ptr::null_mut(); HEIGHT];

        self.search(key, &mut preds, &mut succs);
        let mut curr = succs[0];
        // Safety: checkout held along the walk.
        while let Some(node) = unsafe { curr.as_ref() } {
            if !node.is_removed() {
                return Some(Entry::acquire(&self.scope, curr));
            }
            curr = node.link(0).ptr(Ordering::Acquire);
        }
        None
    }

    /// Returns the entry for `key`, inserting `default()` if it is absent.
    pub fn get_or_insert_with(&self, key: K, default: impl FnOnce() -> V) -> Entry<'_, K, V> {
        if let Some(entry) = self.get(&key) {
            return entry;
        }
        self.insert(key, default()).0
    }

    /// Iterates the live keys in ascending order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let op = OpGuard::enter(&self.scope);
        // Safety: checkout held.
        let mut curr = unsafe { &*self.head.load(Ordering::Acquire) }
            .link(0)
            .ptr(Ordering::Acquire);
        // Safety: checkout held.
        while let Some(node) = unsafe { curr.as_ref() } {
            if !node.is_removed() {
                break;
            }
            curr = node.link(0).ptr(Ordering::Acquire);
        }
        Iter::position(op, curr)
    }

    /// Erases every key observed by a level-0 sweep. Best effort under
    /// concurrent writers; does not invalidate outstanding entries.
    pub fn clear(&self) {
        let _op = OpGuard::enter(&self.scope);
        // Safety: checkout held for the duration of the sweep.
        let mut curr = unsafe { &*self.head.load(Ordering::Acquire) }
            .link(0)
            .ptr(Ordering::Acquire);
        while let Some(node) = unsafe { curr.as_ref() } {
            let next = node.link(0).ptr(Ordering::Acquire);
            if !node.is_removed() {
                // Safety: non-head node.
                self.remove(unsafe { node.key() });
            }
            curr = next;
        }
    }
}

impl<K: Ord, V: Default, const HEIGHT: usize> SkipMap<K, V, HEIGHT> {
    /// Inserts a default-constructed value for `key` if it is absent, or
    /// visits the existing one. The callback receives
    /// [`Upsert::Inserted`] with a mutable borrow while the new node is
    /// still unpublished, or [`Upsert::Updated`] with a shared borrow of the
    /// visible value.
    ///
    /// Under contention the callback may run more than once: a lost publish
    /// CAS discards the speculative node (and any mutation done to it) and
    /// retries. Only the final invocation's target becomes observable.
    pub fn insert_or_update(
        &self,
        key: K,
        visit: impl FnMut(Upsert<'_, V>),
    ) -> (Entry<'_, K, V>, bool) {
        self.insert_inner(key, V::default(), visit)
    }
}

impl<K, V, const HEIGHT: usize> Default for SkipMap<K, V, HEIGHT> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const HEIGHT: usize> Drop for SkipMap<K, V, HEIGHT> {
    fn drop(&mut self) {
        let mut curr = *self.head.get_mut();
        while let Some(node) = NonNull::new(curr) {
            // Safety: exclusive access; every node on the level-0 chain was
            // allocated by this map and retired nodes are not on it.
            unsafe {
                curr = node.as_ref().link(0).ptr(Ordering::Relaxed);
                Node::destroy(node);
            }
        }
    }
}

impl<K, V, const HEIGHT: usize> fmt::Debug for SkipMap<K, V, HEIGHT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipMap").field("len", &self.len()).finish()
    }
}

/// A handle to a live map entry; holds a checkout so the node outlives a
/// concurrent removal.
pub struct Entry<'a, K, V> {
    node: NonNull<Node<K, V>>,
    scope: &'a ScopeManager<Node<K, V>>,
}

// Safety: an entry only exposes shared references to the payload.
unsafe impl<K: Sync, V: Sync> Send for Entry<'_, K, V> {}
// Safety: as above.
unsafe impl<K: Sync, V: Sync> Sync for Entry<'_, K, V> {}

// === impl Entry ===

impl<'a, K, V> Entry<'a, K, V> {
    fn acquire(scope: &'a ScopeManager<Node<K, V>>, node: *mut Node<K, V>) -> Self {
        scope.add_checkout();
        Self {
            // Safety: callers only construct entries for non-null nodes.
            node: unsafe { non_null(node) },
            scope,
        }
    }

    pub fn key(&self) -> &K {
        // Safety: never the head sentinel; checkout keeps the node alive.
        unsafe { self.node.as_ref().key() }
    }

    pub fn value(&self) -> &V {
        // Safety: as in `key`.
        unsafe { &self.node.as_ref().pair().1 }
    }

    /// Whether the entry's key has since been logically deleted.
    pub fn is_removed(&self) -> bool {
        // Safety: checkout keeps the node alive.
        unsafe { self.node.as_ref() }.is_removed()
    }
}

impl<K, V> Clone for Entry<'_, K, V> {
    fn clone(&self) -> Self {
        self.scope.add_checkout();
        Self {
            node: self.node,
            scope: self.scope,
        }
    }
}

impl<K, V> Drop for Entry<'_, K, V> {
    fn drop(&mut self) {
        self.scope.remove_checkout();
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Entry<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", self.key())
            .field("value", self.value())
            .finish()
    }
}

/// Forward iterator over the live entries, in ascending key order.
pub struct Iter<'a, K, V> {
    current: *mut Node<K, V>,
    op: Option<OpGuard<'a, Node<K, V>>>,
}

// === impl Iter ===

impl<'a, K, V> Iter<'a, K, V> {
    fn position(op: OpGuard<'a, Node<K, V>>, current: *mut Node<K, V>) -> Self {
        Self {
            current,
            op: (!current.is_null()).then_some(op),
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = Entry<'a, K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = NonNull::new(self.current)?;
        let op = self.op.as_ref().expect("iterator position without checkout");
        let entry = Entry::acquire(op.scope, node.as_ptr());

        // Safety: the iterator's own checkout keeps the chain walkable.
        let mut next = unsafe { node.as_ref() }.link(0).ptr(Ordering::Acquire);
        while let Some(node) = unsafe { next.as_ref() } {
            if !node.is_removed() {
                break;
            }
            next = node.link(0).ptr(Ordering::Acquire);
        }
        self.current = next;
        if next.is_null() {
            self.op = None;
        }

        Some(entry)
    }
}

/// A concurrent ordered set; a [`SkipMap`] with unit values.
pub struct SkipSet<K, const HEIGHT: usize = 32> {
    map: SkipMap<K, (), HEIGHT>,
}

// === impl SkipSet ===

impl<K, const HEIGHT: usize> SkipSet<K, HEIGHT> {
    pub fn new() -> Self {
        Self { map: SkipMap::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: Ord, const HEIGHT: usize> SkipSet<K, HEIGHT> {
    /// Inserts `key`; returns whether it was newly inserted.
    pub fn insert(&self, key: K) -> bool {
        self.map.insert(key, ()).1
    }

    pub fn remove(&self, key: &K) -> bool {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains(key)
    }

    pub fn get(&self, key: &K) -> Option<Entry<'_, K, ()>> {
        self.map.get(key)
    }

    pub fn lower_bound(&self, key: &K) -> Option<Entry<'_, K, ()>> {
        self.map.lower_bound(key)
    }

    pub fn iter(&self) -> Iter<'_, K, ()> {
        self.map.iter()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

impl<K, const HEIGHT: usize> Default for SkipSet<K, HEIGHT> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, const HEIGHT: usize> fmt::Debug for SkipSet<K, HEIGHT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipSet")
            .field("len", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    fn collect_keys<const H: usize>(set: &SkipSet<i32, H>) -> Vec<i32> {
        set.iter().map(|e| *e.key()).collect()
    }

    #[test]
    fn insert_erase_contains_single_thread() {
        let set = SkipSet::<i32>::new();
        for key in [3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5] {
            set.insert(key);
        }
        assert_eq!(collect_keys(&set), [1, 2, 3, 4, 5, 6, 9]);
        assert_eq!(set.len(), 7);

        assert!(set.remove(&5));
        assert!(!set.remove(&5));
        assert_eq!(collect_keys(&set), [1, 2, 3, 4, 6, 9]);
        assert!(!set.contains(&5));
        assert!(set.contains(&9));
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn duplicate_insert_returns_existing() {
        let map = SkipMap::<i32, i32>::new();
        assert!(map.insert(1, 10).1);
        let (entry, inserted) = map.insert(1, 20);
        assert!(!inserted);
        assert_eq!(*entry.value(), 10);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn insert_or_update_mutates_invisible_and_visits_visible() {
        let map = SkipMap::<i32, AtomicU64>::new();

        let (entry, inserted) = map.insert_or_update(5, |slot| match slot {
            Upsert::Inserted(value) => *value.get_mut() = 7,
            Upsert::Updated(_) => panic!("key was absent"),
        });
        assert!(inserted);
        assert_eq!(entry.value().load(Ordering::Relaxed), 7);

        let (entry, inserted) = map.insert_or_update(5, |slot| match slot {
            Upsert::Inserted(_) => panic!("key was present"),
            Upsert::Updated(value) => {
                value.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(!inserted);
        assert_eq!(entry.value().load(Ordering::Relaxed), 8);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn lower_bound_and_iteration_skip_removed() {
        let map = SkipMap::<i32, i32>::new();
        for key in [10, 20, 30] {
            map.insert(key, key);
        }
        map.remove(&20);
        assert_eq!(*map.lower_bound(&15).unwrap().key(), 30);
        let keys: Vec<i32> = map.iter().map(|e| *e.key()).collect();
        assert_eq!(keys, [10, 30]);
    }

    #[test]
    fn entry_survives_concurrent_erase() {
        let map = Arc::new(SkipMap::<i32, String>::new());
        map.insert(7, "seven".to_string());

        let entry = map.get(&7).unwrap();
        {
            let map = Arc::clone(&map);
            thread::spawn(move || assert!(map.remove(&7)))
                .join()
                .unwrap();
        }
        assert!(!map.contains(&7));
        assert!(entry.is_removed());
        assert_eq!(entry.value(), "seven");
    }

    #[test]
    fn concurrent_disjoint_inserts_cover_the_union() {
        const THREADS: i32 = 8;
        const PER_THREAD: i32 = 2_500;

        let set = SkipSet::<i32>::new();
        thread::scope(|s| {
            for t in 0..THREADS {
                let set = &set;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        assert!(set.insert(t * PER_THREAD + i));
                    }
                });
            }
        });

        assert_eq!(set.len(), (THREADS * PER_THREAD) as usize);
        let keys = collect_keys(&set);
        assert_eq!(keys.len(), (THREADS * PER_THREAD) as usize);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn interleaved_insert_erase_leaves_consistent_set() {
        const KEYS: i32 = 5_000;

        let set = Arc::new(SkipSet::<i32>::new());
        thread::scope(|s| {
            for _ in 0..4 {
                let set = Arc::clone(&set);
                s.spawn(move || {
                    for key in 0..KEYS {
                        set.insert(key);
                    }
                });
            }
            for _ in 0..4 {
                let set = Arc::clone(&set);
                s.spawn(move || {
                    for key in 0..KEYS {
                        set.remove(&key);
                    }
                });
            }
        });

        let keys = collect_keys(&set);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        let unique: BTreeSet<_> = keys.iter().copied().collect();
        assert_eq!(unique.len(), keys.len());
        assert_eq!(keys.len(), set.len());
        for key in &keys {
            assert!(set.contains(key));
        }
    }

    #[test]
    fn clear_empties_the_map() {
        let map = SkipMap::<i32, ()>::new();
        for key in 0..200 {
            map.insert(key, ());
        }
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(map.iter().next().is_none());
    }

    #[test]
    fn tall_lists_work() {
        let set = SkipSet::<i32, 64>::new();
        for key in 0..1_000 {
            set.insert(key);
        }
        assert_eq!(set.len(), 1_000);
        assert!(set.contains(&999));
    }
}
