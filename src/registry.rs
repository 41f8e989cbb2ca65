//! Validity tracking for memory regions shared between views.
//!
//! Every [`TypedView`](crate::TypedView) registers the region it points at with a [`Registry`].
//! Views derived from another view record a parent/child relationship, so that invalidating a
//! region (for example because the owning buffer was freed or reallocated) invalidates every
//! view derived from it as well.
//!
//! A region's reference count covers the views of the region itself and every view derived
//! from it. Each entry carries a generation assigned when the entry is created, so a view that
//! outlived its region cannot release or revive a later region registered at the same address.

use std::{fmt, sync::Arc};

use ahash::RandomState;
use indexmap::{IndexMap, IndexSet};
use log::trace;
use parking_lot::Mutex;

/// Key identifying a tracked memory region by its start address and length in bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct RegionKey {
    pub address: usize,
    pub length:  usize,
}
impl RegionKey {
    pub const fn new(address: usize, length: usize) -> Self { Self { address, length } }
}
impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{:#x}", self.address, self.length)
    }
}

/// Generation of a registry entry. Zero is never assigned.
pub type Generation = u64;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count:      usize,
    generation: Generation,
}

#[derive(Default)]
struct RegistryState {
    entries:    IndexMap<RegionKey, Entry, RandomState>,
    parents:    IndexMap<RegionKey, RegionKey, RandomState>,
    children:   IndexMap<RegionKey, IndexSet<RegionKey, RandomState>, RandomState>,
    generation: Generation,
}

impl RegistryState {
    fn is_current(&self, key: RegionKey, generation: Generation) -> bool {
        self.entries.get(&key).is_some_and(|entry| entry.generation == generation && entry.count > 0)
    }

    /// Increment `key` and all of its recorded ancestors, creating the entry if it is unknown.
    fn acquire(&mut self, key: RegionKey) -> Entry {
        if !self.entries.contains_key(&key) {
            self.generation += 1;
            let generation = self.generation;
            self.entries.insert(key, Entry { count: 0, generation });
        }
        let mut current = Some(key);
        while let Some(key) = current {
            match self.entries.get_mut(&key) {
                Some(entry) => entry.count += 1,
                None => break,
            }
            current = self.parents.get(&key).copied();
        }
        self.entries.get(&key).copied().unwrap_or(Entry {
            count:      0,
            generation: 0,
        })
    }

    /// Subtract `amount` from every recorded ancestor of `key`.
    /// Returns the ancestors that dropped to zero.
    fn release_ancestors(&mut self, key: RegionKey, amount: usize) -> Vec<RegionKey> {
        let mut zeroed = Vec::new();
        let mut current = self.parents.get(&key).copied();
        while let Some(parent) = current {
            let Some(entry) = self.entries.get_mut(&parent) else {
                break;
            };
            entry.count = entry.count.saturating_sub(amount);
            if entry.count == 0 {
                zeroed.push(parent);
            }
            current = self.parents.get(&parent).copied();
        }
        zeroed
    }

    /// Decrement `key` and all of its recorded ancestors, invalidating every entry that drops to
    /// zero. Returns the new count of `key`.
    fn release(&mut self, key: RegionKey) -> usize {
        let Some(entry) = self.entries.get_mut(&key) else {
            return 0;
        };
        entry.count = entry.count.saturating_sub(1);
        let count = entry.count;
        let mut zeroed = self.release_ancestors(key, 1);
        if count == 0 {
            zeroed.push(key);
        }
        for key in zeroed {
            self.remove_subtree(key);
        }
        count
    }

    /// Forcibly remove `key` and everything derived from it.
    /// The surviving ancestors lose the references the removed subtree held on them.
    fn invalidate(&mut self, key: RegionKey) {
        let Some(entry) = self.entries.get(&key).copied() else {
            return;
        };
        let zeroed = self.release_ancestors(key, entry.count);
        self.remove_subtree(key);
        for key in zeroed {
            self.remove_subtree(key);
        }
    }

    fn remove_subtree(&mut self, key: RegionKey) {
        let mut work = vec![key];
        while let Some(key) = work.pop() {
            if self.entries.swap_remove(&key).is_none() {
                continue;
            }
            trace!("invalidated region {}", key);

            if let Some(parent) = self.parents.swap_remove(&key) {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.swap_remove(&key);
                }
            }
            if let Some(children) = self.children.swap_remove(&key) {
                work.extend(children);
            }
        }
    }
}

/// Shared table of live memory regions.
///
/// The registry is a cheap handle; clones refer to the same table. Every operation takes the
/// internal lock exactly once and runs its full cascade under it.
#[derive(Clone, Default)]
pub struct Registry {
    state: Arc<Mutex<RegistryState>>,
}

impl Registry {
    /// Create a new, empty registry.
    pub fn new() -> Self { Self::default() }

    /// Add a reference to the region, creating it if it is unknown.
    /// Ancestors recorded through [`Registry::relationship`] are referenced as well.
    ///
    /// # Returns
    /// Returns the new reference count of the region.
    pub fn ref_region(&self, key: RegionKey) -> usize {
        let count = self.state.lock().acquire(key).count;
        trace!("ref region {} ({})", key, count);
        count
    }

    /// Like [`Registry::ref_region`], but returns the generation of the referenced entry.
    pub fn acquire(&self, key: RegionKey) -> Generation {
        let entry = self.state.lock().acquire(key);
        trace!("acquire region {} ({}, generation {})", key, entry.count, entry.generation);
        entry.generation
    }

    /// Add a reference to the region only if it is still live in `generation`.
    ///
    /// # Returns
    /// Returns whether a reference was added.
    pub fn retain(&self, key: RegionKey, generation: Generation) -> bool {
        let mut state = self.state.lock();
        if !state.is_current(key, generation) {
            return false;
        }
        state.acquire(key);
        true
    }

    /// Remove a reference from the region and its ancestors.
    /// Regions reaching a count of zero are invalidated.
    ///
    /// # Returns
    /// Returns the remaining reference count, or 0 if the region is unknown.
    pub fn deref_region(&self, key: RegionKey) -> usize {
        let count = self.state.lock().release(key);
        trace!("deref region {} ({})", key, count);
        count
    }

    /// Like [`Registry::deref_region`], but does nothing unless the region is still live in
    /// `generation`.
    pub fn release(&self, key: RegionKey, generation: Generation) -> usize {
        let mut state = self.state.lock();
        if !state.is_current(key, generation) {
            trace!("skipped release of stale region {} (generation {})", key, generation);
            return 0;
        }
        let count = state.release(key);
        trace!("release region {} ({})", key, count);
        count
    }

    /// Record that `child` was derived from `parent`.
    /// Identical keys share a reference count and do not form a relationship.
    pub fn relationship(&self, parent: RegionKey, child: RegionKey) {
        if parent == child {
            return;
        }
        let mut state = self.state.lock();
        state.parents.insert(child, parent);
        state
            .children
            .entry(parent)
            .or_insert_with(|| IndexSet::with_hasher(RandomState::new()))
            .insert(child);
        trace!("relationship {} -> {}", parent, child);
    }

    /// Forcibly remove the region, releasing its ancestors and invalidating all regions derived
    /// from it.
    pub fn invalidate(&self, key: RegionKey) { self.state.lock().invalidate(key); }

    /// Like [`Registry::invalidate`], but does nothing unless the region is still live in
    /// `generation`.
    pub fn invalidate_generation(&self, key: RegionKey, generation: Generation) {
        let mut state = self.state.lock();
        if state.is_current(key, generation) {
            state.invalidate(key);
        }
    }

    /// Returns whether the region is known and referenced.
    pub fn is_valid(&self, key: RegionKey) -> bool {
        self.state.lock().entries.get(&key).is_some_and(|entry| entry.count > 0)
    }

    /// Returns whether the region is known, referenced and still in `generation`.
    pub fn is_current(&self, key: RegionKey, generation: Generation) -> bool {
        self.state.lock().is_current(key, generation)
    }

    /// Returns the generation of the region, if it is known.
    pub fn generation(&self, key: RegionKey) -> Option<Generation> {
        self.state.lock().entries.get(&key).map(|entry| entry.generation)
    }

    /// Returns the current reference count of the region.
    pub fn refcount(&self, key: RegionKey) -> usize {
        self.state.lock().entries.get(&key).map(|entry| entry.count).unwrap_or_default()
    }

    /// Returns the number of live regions.
    pub fn len(&self) -> usize { self.state.lock().entries.len() }

    /// Returns whether no region is live.
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("regions", &self.len()).finish()
    }
}
