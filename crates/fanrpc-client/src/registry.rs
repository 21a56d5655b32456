//! Connection registry.
//!
//! A read-mostly concurrent map from address to connection handle. Dispatch
//! reads vastly outnumber connect/disconnect writes, so the map keeps two
//! layers:
//!
//! - a **read snapshot** behind an [`ArcSwap`], consulted without locking
//! - a **dirty overlay** behind a mutex, holding every key written since the
//!   snapshot was taken
//!
//! Each key maps to a shared [`Entry`] whose slot can be swapped atomically,
//! so updating or deleting an address already in the snapshot never takes
//! the lock. Deleted entries that are left out of the dirty overlay are
//! tombstoned as *expunged* so they are not resurrected when the overlay is
//! promoted. Reads that miss the snapshot count towards promotion: once the
//! misses reach the promotion threshold (by default the size of the
//! overlay), the overlay becomes the new snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use fanrpc_common::{FanrpcError, Result};

enum Slot<V> {
    Live(Arc<V>),
    Deleted,
    Expunged,
}

struct Entry<V> {
    p: ArcSwap<Slot<V>>,
}

impl<V> Entry<V> {
    fn new(value: Arc<V>) -> Self {
        Self {
            p: ArcSwap::from_pointee(Slot::Live(value)),
        }
    }

    fn load(&self) -> Option<Arc<V>> {
        match &**self.p.load() {
            Slot::Live(v) => Some(Arc::clone(v)),
            _ => None,
        }
    }

    /// Replaces the slot unless it is expunged. The outer `None` means the
    /// entry is expunged and must be re-added under the lock.
    fn try_swap(&self, value: &Arc<V>) -> Option<Option<Arc<V>>> {
        let new = Arc::new(Slot::Live(Arc::clone(value)));
        loop {
            let cur = self.p.load_full();
            if let Slot::Expunged = *cur {
                return None;
            }
            let prev = self.p.compare_and_swap(&cur, Arc::clone(&new));
            if Arc::ptr_eq(&*prev, &cur) {
                return Some(match &*cur {
                    Slot::Live(old) => Some(Arc::clone(old)),
                    _ => None,
                });
            }
        }
    }

    fn unexpunge_locked(&self) -> bool {
        let cur = self.p.load_full();
        if !matches!(*cur, Slot::Expunged) {
            return false;
        }
        let prev = self.p.compare_and_swap(&cur, Arc::new(Slot::Deleted));
        Arc::ptr_eq(&*prev, &cur)
    }

    fn swap_locked(&self, value: Arc<V>) -> Option<Arc<V>> {
        match &*self.p.swap(Arc::new(Slot::Live(value))) {
            Slot::Live(old) => Some(Arc::clone(old)),
            _ => None,
        }
    }

    fn delete(&self) -> Option<Arc<V>> {
        loop {
            let cur = self.p.load_full();
            let Slot::Live(v) = &*cur else {
                return None;
            };
            let v = Arc::clone(v);
            let prev = self.p.compare_and_swap(&cur, Arc::new(Slot::Deleted));
            if Arc::ptr_eq(&*prev, &cur) {
                return Some(v);
            }
        }
    }

    fn try_expunge_locked(&self) -> bool {
        loop {
            let cur = self.p.load_full();
            match *cur {
                Slot::Live(_) => return false,
                Slot::Expunged => return true,
                Slot::Deleted => {
                    let prev = self.p.compare_and_swap(&cur, Arc::new(Slot::Expunged));
                    if Arc::ptr_eq(&*prev, &cur) {
                        return true;
                    }
                }
            }
        }
    }
}

type EntryMap<V> = HashMap<String, Arc<Entry<V>>>;

struct ReadOnly<V> {
    m: EntryMap<V>,
    /// The dirty overlay holds keys missing from `m`
    amended: bool,
}

struct Dirty<V> {
    m: Option<EntryMap<V>>,
    misses: usize,
}

/// Concurrent address to handle map.
///
/// # Example
///
/// ```rust
/// use fanrpc_client::Registry;
/// use std::sync::Arc;
///
/// let registry: Registry<&str> = Registry::new();
/// registry.store("10.0.0.1:8081", Arc::new("handle"));
///
/// assert_eq!(registry.load("10.0.0.1:8081").as_deref(), Some(&"handle"));
/// assert_eq!(registry.len(), 1);
///
/// registry.delete("10.0.0.1:8081");
/// assert!(registry.load("10.0.0.1:8081").is_none());
/// assert!(registry.range(|_, _| true).is_err());
/// ```
pub struct Registry<V> {
    read: ArcSwap<ReadOnly<V>>,
    dirty: Mutex<Dirty<V>>,
    len: AtomicUsize,
    promote_after: Option<usize>,
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Registry<V> {
    /// Creates an empty registry. The overlay is promoted once it has seen
    /// as many misses as it holds entries.
    pub fn new() -> Self {
        Self {
            read: ArcSwap::from_pointee(ReadOnly {
                m: HashMap::new(),
                amended: false,
            }),
            dirty: Mutex::new(Dirty { m: None, misses: 0 }),
            len: AtomicUsize::new(0),
            promote_after: None,
        }
    }

    /// Promotes the dirty overlay after a fixed number of snapshot misses
    /// instead of after as many misses as the overlay has entries.
    pub fn with_promotion_threshold(threshold: usize) -> Self {
        Self {
            promote_after: Some(threshold.max(1)),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Dirty<V>> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up `key` in the snapshot, falling back to the overlay. With
    /// `remove` set the key is taken out of the overlay.
    fn entry(&self, key: &str, remove: bool) -> Option<Arc<Entry<V>>> {
        let read = self.read.load();
        if let Some(e) = read.m.get(key) {
            return Some(Arc::clone(e));
        }
        if !read.amended {
            return None;
        }
        drop(read);

        let mut dirty = self.lock();
        let read = self.read.load();
        if let Some(e) = read.m.get(key) {
            return Some(Arc::clone(e));
        }
        if !read.amended {
            return None;
        }
        let e = if remove {
            dirty.m.as_mut().and_then(|m| m.remove(key))
        } else {
            dirty.m.as_ref().and_then(|m| m.get(key)).cloned()
        };
        self.miss_locked(&mut dirty);
        e
    }

    /// Returns the handle stored for `key`.
    ///
    /// Hits the immutable snapshot without locking. A key missing from the
    /// snapshot takes the overlay lock while the overlay holds entries, and
    /// counts as a miss towards promoting it.
    pub fn load(&self, key: &str) -> Option<Arc<V>> {
        self.entry(key, false).and_then(|e| e.load())
    }

    /// Stores `value` for `key`, replacing any previous handle.
    pub fn store(&self, key: &str, value: Arc<V>) {
        self.swap(key, value);
    }

    /// Stores `value` and returns the handle it replaced, if any.
    pub fn swap(&self, key: &str, value: Arc<V>) -> Option<Arc<V>> {
        {
            let read = self.read.load();
            if let Some(e) = read.m.get(key) {
                if let Some(prev) = e.try_swap(&value) {
                    self.track_store(&prev);
                    return prev;
                }
            }
        }

        let mut dirty = self.lock();
        let read = self.read.load_full();
        let prev = if let Some(e) = read.m.get(key) {
            if e.unexpunge_locked() {
                dirty
                    .m
                    .get_or_insert_with(HashMap::new)
                    .insert(key.to_string(), Arc::clone(e));
            }
            e.swap_locked(value)
        } else if let Some(e) = dirty.m.as_ref().and_then(|m| m.get(key)) {
            e.swap_locked(value)
        } else {
            if !read.amended {
                self.dirty_locked(&mut dirty, &read);
                self.read.store(Arc::new(ReadOnly {
                    m: read.m.clone(),
                    amended: true,
                }));
            }
            dirty
                .m
                .get_or_insert_with(HashMap::new)
                .insert(key.to_string(), Arc::new(Entry::new(value)));
            None
        };
        self.track_store(&prev);
        prev
    }

    /// Removes `key` and returns the handle it held. Deleting a missing key
    /// is a no-op.
    pub fn delete(&self, key: &str) -> Option<Arc<V>> {
        let prev = self.entry(key, true).and_then(|e| e.delete());
        if prev.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        prev
    }

    /// Calls `f` for every live entry until it returns `false`.
    ///
    /// Returns the number of entries visited, or
    /// [`FanrpcError::NoConnectionFound`] when there were none.
    pub fn range<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(&str, &Arc<V>) -> bool,
    {
        let mut read = self.read.load_full();
        if read.amended {
            let mut dirty = self.lock();
            read = self.read.load_full();
            if read.amended {
                if let Some(m) = dirty.m.take() {
                    let promoted = Arc::new(ReadOnly { m, amended: false });
                    self.read.store(Arc::clone(&promoted));
                    read = promoted;
                }
                dirty.misses = 0;
            }
        }

        let mut visited = 0;
        for (key, e) in read.m.iter() {
            if let Some(v) = e.load() {
                visited += 1;
                if !f(key, &v) {
                    break;
                }
            }
        }
        if visited == 0 {
            return Err(FanrpcError::NoConnectionFound);
        }
        Ok(visited)
    }

    /// Live entries sorted by address.
    pub fn entries(&self) -> Vec<(String, Arc<V>)> {
        let mut out = Vec::with_capacity(self.len());
        let _ = self.range(|addr, v| {
            out.push((addr.to_string(), Arc::clone(v)));
            true
        });
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Live addresses, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.entries().into_iter().map(|(addr, _)| addr).collect()
    }

    /// Number of live entries. Tombstones are not counted.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn track_store(&self, prev: &Option<Arc<V>>) {
        if prev.is_none() {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn miss_locked(&self, dirty: &mut Dirty<V>) {
        dirty.misses += 1;
        let Some(m) = dirty.m.as_ref() else {
            return;
        };
        let threshold = self.promote_after.unwrap_or(m.len());
        if dirty.misses < threshold {
            return;
        }
        if let Some(m) = dirty.m.take() {
            self.read.store(Arc::new(ReadOnly { m, amended: false }));
        }
        dirty.misses = 0;
    }

    fn dirty_locked(&self, dirty: &mut Dirty<V>, read: &ReadOnly<V>) {
        if dirty.m.is_some() {
            return;
        }
        let mut m = HashMap::with_capacity(read.m.len());
        for (key, e) in read.m.iter() {
            if !e.try_expunge_locked() {
                m.insert(key.clone(), Arc::clone(e));
            }
        }
        dirty.m = Some(m);
    }
}
