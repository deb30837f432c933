// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lock-coupled concurrent skip-list.
//!
//! Writers take the per-node locks of the distinct predecessors of the
//! affected position (always in ascending level order, so inserters and
//! erasers cannot deadlock against each other), validate that the recorded
//! predecessor/successor pairs still hold, and retry the search when
//! validation fails. Readers never lock; they skip nodes that are not yet
//! fully linked or are marked for removal.
//!
//! A node becomes visible to readers only once its `FULLY_LINKED` flag is
//! set, which happens after every predecessor link has been swung over to
//! it. Removal marks the victim under its own lock first and unlinks it from
//! the top level down, so a reader that still sees the victim at some level
//! always finds level 0 intact.

use crate::level::LevelSelector;
use crate::reclaim::{OpGuard, Retire, ScopeManager};
use arrayvec::ArrayVec;
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use lock_api::RawMutex as RawLock;
use parking_lot::RawMutex;
use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use strata_util::{Backoff, non_null};

const HEAD: u8 = 1;
const MARKED: u8 = 1 << 1;
const FULLY_LINKED: u8 = 1 << 2;

/// A node header followed by a tail-allocated array of `top_level + 1`
/// forward links, all carved out of a single allocation.
#[repr(C)]
struct Node<K, V> {
    lock: RawMutex,
    flags: AtomicU8,
    top_level: u8,
    value: MaybeUninit<(K, V)>,
    links: [AtomicPtr<Node<K, V>>; 0],
}

// === impl Node ===

impl<K, V> Node<K, V> {
    fn layout(top_level: u8) -> Layout {
        let links = Layout::array::<AtomicPtr<Self>>(usize::from(top_level) + 1)
            .expect("link array layout overflowed");
        Layout::new::<Self>()
            .extend(links)
            .expect("node layout overflowed")
            .0
            .pad_to_align()
    }

    /// Allocates a node with all links null. `value` is `None` only for the
    /// head sentinel, whose payload slot stays uninitialised forever.
    fn alloc(value: Option<(K, V)>, top_level: u8) -> NonNull<Self> {
        let layout = Self::layout(top_level);
        // Safety: `layout` has non-zero size (the header alone is non-empty).
        let raw = unsafe { alloc(layout) }.cast::<Self>();
        let Some(node) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };

        let flags = if value.is_some() { 0 } else { HEAD };
        // Safety: `node` points at a fresh allocation of `layout`, which has
        // room for the header plus `top_level + 1` link slots.
        unsafe {
            let n = node.as_ptr();
            (&raw mut (*n).lock).write(<RawMutex as RawLock>::INIT);
            (&raw mut (*n).flags).write(AtomicU8::new(flags));
            (&raw mut (*n).top_level).write(top_level);
            if let Some(value) = value {
                (&raw mut (*n).value).write(MaybeUninit::new(value));
            }
            let links = (&raw mut (*n).links).cast::<AtomicPtr<Self>>();
            for i in 0..=usize::from(top_level) {
                links.add(i).write(AtomicPtr::new(ptr::null_mut()));
            }
        }
        node
    }

    fn links(&self) -> &[AtomicPtr<Self>] {
        // Safety: the allocation holds `top_level + 1` link slots directly
        // after the header; `links` is the zero-sized marker field at that
        // offset.
        unsafe {
            core::slice::from_raw_parts(
                (&raw const self.links).cast::<AtomicPtr<Self>>(),
                usize::from(self.top_level) + 1,
            )
        }
    }

    #[inline]
    fn next(&self, level: usize) -> *mut Self {
        self.links()[level].load(Ordering::Acquire)
    }

    #[inline]
    fn set_next(&self, level: usize, node: *mut Self) {
        self.links()[level].store(node, Ordering::Release);
    }

    #[inline]
    fn cas_next(&self, level: usize, current: *mut Self, new: *mut Self) -> bool {
        self.links()[level]
            .compare_exchange(current, new, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    fn is_head(&self) -> bool {
        self.flags() & HEAD != 0
    }

    #[inline]
    fn is_marked(&self) -> bool {
        self.flags() & MARKED != 0
    }

    #[inline]
    fn is_fully_linked(&self) -> bool {
        self.flags() & FULLY_LINKED != 0
    }

    #[inline]
    fn set_marked(&self) {
        self.flags.fetch_or(MARKED, Ordering::Release);
    }

    #[inline]
    fn set_fully_linked(&self) {
        self.flags.fetch_or(FULLY_LINKED, Ordering::Release);
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
        // Safety: every non-head node is allocated with its payload written.
        unsafe { self.value.assume_init_ref() }
    }
}

// Safety: drops the payload (head sentinels have none) and releases the
// allocation created in `Node::alloc`.
unsafe impl<K, V> Retire for Node<K, V> {
    unsafe fn destroy(ptr: NonNull<Self>) {
        // Safety: the pointer was produced by `Node::alloc` and is destroyed
        // exactly once per the `Retire` contract.
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

/// Unlocks a set of predecessor locks on drop.
///
/// Predecessors repeat across adjacent levels; only distinct ones are
/// locked, mirroring the level-ascending acquisition order of both insert
/// and remove.
struct LockSet<'a, const HEIGHT: usize> {
    locked: ArrayVec<&'a RawMutex, HEIGHT>,
}

// === impl LockSet ===

impl<'a, const HEIGHT: usize> LockSet<'a, HEIGHT> {
    fn new() -> Self {
        Self {
            locked: ArrayVec::new(),
        }
    }

    fn lock(&mut self, mutex: &'a RawMutex) {
        if let Some(last) = self.locked.last()
            && ptr::eq(*last, mutex)
        {
            return;
        }
        mutex.lock();
        self.locked.push(mutex);
    }
}

impl<const HEIGHT: usize> Drop for LockSet<'_, HEIGHT> {
    fn drop(&mut self) {
        for mutex in &self.locked {
            // Safety: every mutex in `locked` was locked by this set.
            unsafe { mutex.unlock() };
        }
    }
}

/// Holds a single node lock, released on drop.
struct NodeLock<'a> {
    mutex: &'a RawMutex,
}

impl<'a> NodeLock<'a> {
    fn lock(mutex: &'a RawMutex) -> Self {
        mutex.lock();
        Self { mutex }
    }
}

impl Drop for NodeLock<'_> {
    fn drop(&mut self) {
        // Safety: locked in `NodeLock::lock`.
        unsafe { self.mutex.unlock() };
    }
}

/// A concurrent ordered map backed by a lock-coupled skip-list of height
/// `HEIGHT` (at most 32 levels).
///
/// All operations take `&self` and may be called from any number of threads.
/// Lookups return [`Entry`] handles that keep the underlying node alive even
/// if the key is concurrently removed.
pub struct SkipMap<K, V, const HEIGHT: usize = 32> {
    head: AtomicPtr<Node<K, V>>,
    selector: LevelSelector,
    size: AtomicUsize,
    scope: ScopeManager<Node<K, V>>,
}

// Safety: the map owns its nodes; moving the map moves ownership of the
// payloads.
unsafe impl<K: Send, V: Send, const HEIGHT: usize> Send for SkipMap<K, V, HEIGHT> {}
// Safety: shared access hands out `&K`/`&V` only and all structural state is
// atomic or lock protected.
unsafe impl<K: Send + Sync, V: Send + Sync, const HEIGHT: usize> Sync for SkipMap<K, V, HEIGHT> {}

// === impl SkipMap ===

impl<K, V, const HEIGHT: usize> SkipMap<K, V, HEIGHT> {
    const MAX_LEVEL: u8 = (HEIGHT - 1) as u8;

    pub fn new() -> Self {
        const {
            assert!(
                HEIGHT >= 2 && HEIGHT <= 32,
                "skip-list height must be in [2, 32]"
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
    /// Records the predecessor and successor of the searched position at
    /// every level and returns the highest level at which an equal key was
    /// seen.
    fn search(
        &self,
        key: &K,
        preds: &mut [*mut Node<K, V>; HEIGHT],
        succs: &mut [*mut Node<K, V>; HEIGHT],
    ) -> Option<usize> {
        let mut found = None;
        let mut pred = self.head.load(Ordering::Acquire);

        for level in (0..HEIGHT).rev() {
            // Safety: `pred` is the head or a node observed through a live
            // link while this operation holds a checkout.
            let mut curr = unsafe { &*pred }.next(level);
            loop {
                let Some(curr_ref) =
                    // Safety: non-null links point at live or retired (but
                    // not yet destroyed) nodes while a checkout is held.
                    (unsafe { curr.as_ref() })
                else {
                    break;
                };
                // Safety: `curr` is never the head sentinel.
                if unsafe { curr_ref.key() } >= key {
                    break;
                }
                pred = curr;
                curr = curr_ref.next(level);
            }

            if found.is_none()
                && let Some(curr_ref) = unsafe { curr.as_ref() }
                // Safety: non-head node, payload initialised.
                && unsafe { curr_ref.key() } == key
            {
                found = Some(level);
            }

            preds[level] = pred;
            succs[level] = curr;
        }

        found
    }

    /// Inserts `key` if it is absent. Returns the entry for the key and
    /// whether this call inserted it; an existing key leaves the map
    /// unchanged and drops the provided value.
    pub fn insert(&self, key: K, value: V) -> (Entry<'_, K, V>, bool) {
        let _op = OpGuard::enter(&self.scope);
        let top_level = self.selector.next_level();
        let mut preds = [ptr::null_mut(); HEIGHT];
        let mut succs = [ptr::null_mut(); HEIGHT];
        let mut backoff = Backoff::new();

        loop {
            if let Some(level) = self.search(&key, &mut preds, &mut succs) {
                let found = succs[level];
                // Safety: checkout held, node not destroyed.
                let node = unsafe { &*found };
                if !node.is_marked() {
                    // an in-flight insert for the same key; wait for it to
                    // finish publishing before handing out the entry
                    let mut spin = Backoff::new();
                    while !node.is_fully_linked() {
                        spin.spin();
                    }
                    return (Entry::acquire(&self.scope, found), false);
                }
                // marked duplicate is on its way out; retry until the eraser
                // unlinks it
                backoff.spin();
                continue;
            }

            let mut locks = LockSet::<HEIGHT>::new();
            let mut valid = true;
            for level in 0..=usize::from(top_level) {
                let pred = preds[level];
                let succ = succs[level];
                // Safety: checkout held; `pred` outlives this iteration.
                let pred_ref = unsafe { &*pred };
                locks.lock(&pred_ref.lock);
                valid = !pred_ref.is_marked()
                    // Safety: checkout held.
                    && unsafe { succ.as_ref() }.is_none_or(|s| !s.is_marked())
                    && pred_ref.next(level) == succ;
                if !valid {
                    break;
                }
            }
            if !valid {
                drop(locks);
                backoff.spin();
                continue;
            }

            let node = Node::alloc(Some((key, value)), top_level);
            // Safety: freshly allocated, exclusively owned until published.
            let node_ref = unsafe { node.as_ref() };
            for level in 0..=usize::from(top_level) {
                node_ref.set_next(level, succs[level]);
            }
            for level in 0..=usize::from(top_level) {
                // the predecessors are locked and validated, so the links
                // cannot have moved
                // Safety: checkout held.
                let linked = unsafe { &*preds[level] }.cas_next(level, succs[level], node.as_ptr());
                debug_assert!(linked);
            }
            node_ref.set_fully_linked();
            self.size.fetch_add(1, Ordering::Relaxed);
            return (Entry::acquire(&self.scope, node.as_ptr()), true);
        }
    }

    /// Removes `key`. Returns whether a key was removed; a missing key is
    /// not an error.
    pub fn remove(&self, key: &K) -> bool {
        let _op = OpGuard::enter(&self.scope);
        let mut preds = [ptr::null_mut(); HEIGHT];
        let mut succs = [ptr::null_mut(); HEIGHT];
        let mut victim: *mut Node<K, V> = ptr::null_mut();
        let mut victim_lock: Option<NodeLock<'_>> = None;
        let mut top_level = 0_usize;
        let mut backoff = Backoff::new();

        loop {
            let found = self.search(key, &mut preds, &mut succs);

            if victim_lock.is_none() {
                let candidate = match found {
                    Some(level) => {
                        let node = succs[level];
                        // Safety: checkout held.
                        let node_ref = unsafe { &*node };
                        (node_ref.is_fully_linked()
                            && usize::from(node_ref.top_level) == level
                            && !node_ref.is_marked())
                        .then_some(node)
                    }
                    None => None,
                };
                let Some(node) = candidate else {
                    return false;
                };

                victim = node;
                // Safety: checkout held.
                let victim_ref = unsafe { &*victim };
                top_level = usize::from(victim_ref.top_level);
                let lock = NodeLock::lock(&victim_ref.lock);
                if victim_ref.is_marked() {
                    // another eraser won the race while we were locking
                    return false;
                }
                victim_ref.set_marked();
                victim_lock = Some(lock);
            }

            let mut locks = LockSet::<HEIGHT>::new();
            let mut valid = true;
            for level in 0..=top_level {
                // Safety: checkout held.
                let pred = unsafe { &*preds[level] };
                locks.lock(&pred.lock);
                valid = !pred.is_marked() && pred.next(level) == victim;
                if !valid {
                    break;
                }
            }
            if !valid {
                drop(locks);
                backoff.spin();
                continue;
            }

            // Safety: checkout held; victim is locked and marked by us.
            let victim_ref = unsafe { &*victim };
            for level in (0..=top_level).rev() {
                // Safety: checkout held.
                unsafe { &*preds[level] }.set_next(level, victim_ref.next(level));
            }
            self.size.fetch_sub(1, Ordering::Relaxed);

            drop(locks);
            drop(victim_lock);
            // Safety: `victim` is non-null here.
            self.scope.defer_destroy(unsafe { non_null(victim) });
            return true;
        }
    }

    pub fn get(&self, key: &K) -> Option<Entry<'_, K, V>> {
        let _op = OpGuard::enter(&self.scope);
        let mut preds = [ptr::null_mut(); HEIGHT];
        let mut succs = [ptr::null_mut(); HEIGHT];

        let level = self.search(key, &mut preds, &mut succs)?;
        let node = succs[level];
        // Safety: checkout held.
        let node_ref = unsafe { &*node };
        (node_ref.is_fully_linked() && !node_ref.is_marked())
            .then(|| Entry::acquire(&self.scope, node))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns the entry for the first key greater than or equal to `key`.
    pub fn lower_bound(&self, key: &K) -> Option<Entry<'_, K, V>> {
        let _op = OpGuard::enter(&self.scope);
        let mut preds = [ptr::null_mut(); HEIGHT];
        let mut succs = [ptr::null_mut(); HEIGHT];

        self.search(key, &mut preds, &mut succs);
        let mut curr = succs[0];
        // Safety: checkout held along the whole walk.
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.is_fully_linked() && !node.is_marked() {
                return Some(Entry::acquire(&self.scope, curr));
            }
            curr = node.next(0);
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

    /// Iterates the live keys in ascending order. The iterator is stable
    /// against concurrent mutation; each yielded [`Entry`] pins its node
    /// independently.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let op = OpGuard::enter(&self.scope);
        // Safety: checkout held.
        let mut curr = unsafe { &*self.head.load(Ordering::Acquire) }.next(0);
        // Safety: checkout held.
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.is_fully_linked() && !node.is_marked() {
                break;
            }
            curr = node.next(0);
        }
        Iter::position(op, curr)
    }

    /// Erases every key observed by a level-0 sweep. Best effort: keys
    /// inserted concurrently behind the sweep position survive.
    pub fn clear(&self) {
        let _op = OpGuard::enter(&self.scope);
        // Safety: checkout held for the duration of the sweep, so nodes we
        // pass through stay dereferenceable even once removed.
        let mut curr = unsafe { &*self.head.load(Ordering::Acquire) }.next(0);
        while let Some(node) = unsafe { curr.as_ref() } {
            let next = node.next(0);
            // Safety: non-head node.
            self.remove(unsafe { node.key() });
            curr = next;
        }
    }
}

impl<K, V, const HEIGHT: usize> Default for SkipMap<K, V, HEIGHT> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const HEIGHT: usize> Drop for SkipMap<K, V, HEIGHT> {
    fn drop(&mut self) {
        // Tear down the live chain directly; retired nodes are drained by the
        // scope manager's own drop.
        let mut curr = *self.head.get_mut();
        while let Some(node) = NonNull::new(curr) {
            // Safety: exclusive access; every node on the level-0 chain was
            // allocated by this map and is destroyed exactly once.
            unsafe {
                curr = node.as_ref().next(0);
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

/// A handle to a live map entry.
///
/// Holding an `Entry` counts as a checkout against the map's reclamation
/// scope: the underlying node stays dereferenceable even if the key is
/// removed while the handle is held.
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
        // Safety: entries are never created for the head sentinel and the
        // checkout keeps the node alive.
        unsafe { self.node.as_ref().key() }
    }

    pub fn value(&self) -> &V {
        // Safety: as in `key`.
        unsafe { &self.node.as_ref().pair().1 }
    }

    /// Whether the entry's key has since been marked for removal.
    pub fn is_removed(&self) -> bool {
        // Safety: checkout keeps the node alive.
        unsafe { self.node.as_ref() }.is_marked()
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

        // advance to the next fully-linked, unmarked node
        // Safety: the iterator's own checkout keeps the chain walkable.
        let mut next = unsafe { node.as_ref() }.next(0);
        while let Some(node) = unsafe { next.as_ref() } {
            if node.is_fully_linked() && !node.is_marked() {
                break;
            }
            next = node.next(0);
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
    fn map_basics() {
        let map = SkipMap::<&str, u32>::new();
        let (entry, inserted) = map.insert("a", 1);
        assert!(inserted);
        assert_eq!(*entry.value(), 1);

        let (entry, inserted) = map.insert("a", 2);
        assert!(!inserted);
        assert_eq!(*entry.value(), 1, "duplicate insert must not overwrite");

        assert_eq!(*map.get_or_insert_with("b", || 7).value(), 7);
        assert_eq!(*map.get_or_insert_with("b", || 9).value(), 7);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn lower_bound_skips_to_next_key() {
        let map = SkipMap::<i32, i32>::new();
        for key in [10, 20, 30] {
            map.insert(key, key * 2);
        }
        assert_eq!(*map.lower_bound(&15).unwrap().key(), 20);
        assert_eq!(*map.lower_bound(&20).unwrap().key(), 20);
        assert_eq!(*map.lower_bound(&5).unwrap().key(), 10);
        assert!(map.lower_bound(&31).is_none());
    }

    #[test]
    fn clear_empties_the_map() {
        let map = SkipMap::<i32, ()>::new();
        for key in 0..100 {
            map.insert(key, ());
        }
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(map.iter().next().is_none());
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
        // the node was logically erased, but our checkout keeps it readable
        assert!(!map.contains(&7));
        assert!(entry.is_removed());
        assert_eq!(entry.value(), "seven");
        drop(entry);
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        const THREADS: i32 = 8;
        const PER_THREAD: i32 = 2_000;

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
    fn concurrent_insert_erase_converges() {
        const KEYS: i32 = 4_000;

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

        // whatever survived must be a subset of the inserted keys, sorted and
        // unique, and len() must agree with iteration
        let keys = collect_keys(&set);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        let unique: BTreeSet<_> = keys.iter().copied().collect();
        assert_eq!(unique.len(), keys.len());
        assert_eq!(keys.len(), set.len());
        for key in &keys {
            assert!(set.contains(key));
        }
    }
}
