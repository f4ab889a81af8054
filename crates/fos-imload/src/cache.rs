//! Generic Tile Cache
//!
//! Bounded LRU of cacheable tiles with a second list for pinned tiles.
//! Both lists are doubly linked through slot indices of the backing
//! [`TilePool`], so touch, evict, pin and unpin are all O(1).
//!
//! `size` counts unpinned tiles only. Pinned tiles never count against the
//! budget and are never selected for eviction.

use crate::pool::{TileId, TilePool};

/// A tile payload that can live in a [`TileCache`]
pub trait Cacheable: Sized {
    /// State needed to dispose of an evicted tile
    type Context;

    /// Called exactly once when the tile leaves the cache
    fn discard(self, ctx: &mut Self::Context);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Lru,
    Pinned,
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

#[derive(Debug)]
struct Entry<T> {
    tile: T,
    prev: Option<u32>,
    next: Option<u32>,
    list: ListKind,
    pins: u32,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub insertions: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 { 0.0 } else { self.hits as f64 / lookups as f64 }
    }
}

/// LRU tile cache with pinning
#[derive(Debug)]
pub struct TileCache<T> {
    entries: TilePool<Entry<T>>,
    lru: Links,
    pinned: Links,
    limit: usize,
    size: usize,
    stats: CacheStats,
}

impl<T: Cacheable> TileCache<T> {
    /// Create a cache holding at most `limit` unpinned tiles
    pub fn new(limit: usize) -> Self {
        Self::with_high_water(limit, usize::MAX)
    }

    /// Like [`new`](Self::new), trimming vacant tail slots above `high_water`
    pub fn with_high_water(limit: usize, high_water: usize) -> Self {
        Self {
            entries: TilePool::with_high_water(high_water),
            lru: Links::default(),
            pinned: Links::default(),
            limit: limit.max(1),
            size: 0,
            stats: CacheStats::default(),
        }
    }

    /// Make room for one more tile, evicting the least recently used
    pub fn acquire_spot(&mut self, ctx: &mut T::Context) {
        if self.size >= self.limit {
            self.shrink_to(self.limit - 1, ctx);
        }
    }

    /// Register a new tile at the most-recently-used end
    ///
    /// [`acquire_spot`](Self::acquire_spot) must have been called first.
    pub fn add_entry(&mut self, tile: T) -> TileId {
        assert!(self.size < self.limit, "add_entry called without acquire_spot");

        let id = self.entries.acquire(Entry {
            tile,
            prev: None,
            next: None,
            list: ListKind::Lru,
            pins: 0,
        });
        self.push_back(id.index, ListKind::Lru);
        self.size += 1;
        self.stats.insertions += 1;
        id
    }

    /// Pin a tile; pinned tiles are never evicted
    pub fn lock_entry(&mut self, id: TileId) {
        let entry = self.entry_mut(id, "lock_entry");
        entry.pins += 1;
        if entry.pins == 1 {
            self.unlink(id.index);
            self.push_back(id.index, ListKind::Pinned);
            self.size -= 1;
        }
    }

    /// Drop one pin; the last unpin returns the tile to the LRU tail
    pub fn unlock_entry(&mut self, id: TileId, ctx: &mut T::Context) {
        let entry = self.entry_mut(id, "unlock_entry");
        assert!(entry.pins > 0, "unlock_entry on unpinned tile {id:?}");
        entry.pins -= 1;
        if entry.pins == 0 {
            self.unlink(id.index);
            self.acquire_spot(ctx);
            self.push_back(id.index, ListKind::Lru);
            self.size += 1;
        }
    }

    /// Mark a tile most recently used
    pub fn touch_entry(&mut self, id: TileId) {
        let entry = self.entry_mut(id, "touch_entry");
        if entry.pins > 0 {
            return;
        }
        self.unlink(id.index);
        self.push_back(id.index, ListKind::Lru);
        self.stats.hits += 1;
    }

    /// Remove a tile and discard it
    pub fn remove_entry(&mut self, id: TileId, ctx: &mut T::Context) {
        if !self.contains(id) {
            panic!("remove_entry on stale tile {id:?}");
        }
        self.unlink(id.index);
        if let Some(entry) = self.entries.release(id) {
            if entry.list == ListKind::Lru {
                self.size -= 1;
            }
            entry.tile.discard(ctx);
        }
    }

    /// Evict every unpinned tile
    pub fn discard_all(&mut self, ctx: &mut T::Context) {
        self.shrink_to(0, ctx);
    }

    /// Change the budget, evicting down to it
    pub fn set_limit(&mut self, limit: usize, ctx: &mut T::Context) {
        self.limit = limit.max(1);
        self.shrink_to(self.limit, ctx);
    }

    fn shrink_to(&mut self, target: usize, ctx: &mut T::Context) {
        while self.size > target {
            let Some(id) = self.lru.head.and_then(|head| self.entries.id_at(head)) else {
                break;
            };
            tracing::trace!("Evicting tile {:?}", id);
            self.stats.evictions += 1;
            self.remove_entry(id, ctx);
        }
    }

    /// Look up a tile without changing its recency
    pub fn get(&self, id: TileId) -> Option<&T> {
        self.entries.get(id).map(|entry| &entry.tile)
    }

    pub fn get_mut(&mut self, id: TileId) -> Option<&mut T> {
        self.entries.get_mut(id).map(|entry| &mut entry.tile)
    }

    /// Mutable access to a tile the caller knows is resident
    pub(crate) fn tile_mut(&mut self, id: TileId) -> &mut T {
        &mut self.entry_mut(id, "tile_mut").tile
    }

    pub(crate) fn tile(&self, id: TileId) -> &T {
        match self.entries.get(id) {
            Some(entry) => &entry.tile,
            None => panic!("tile on stale tile {id:?}"),
        }
    }

    /// Record a lookup that found nothing
    pub(crate) fn note_miss(&mut self) {
        self.stats.misses += 1;
    }

    pub fn contains(&self, id: TileId) -> bool {
        self.entries.get(id).is_some()
    }

    pub fn pin_count(&self, id: TileId) -> Option<u32> {
        self.entries.get(id).map(|entry| entry.pins)
    }

    /// Unpinned tiles
    pub fn size(&self) -> usize {
        self.size
    }

    /// Pinned tiles
    pub fn pinned_len(&self) -> usize {
        self.pinned.len
    }

    /// All registered tiles
    pub fn live(&self) -> usize {
        self.entries.len()
    }

    /// Slots in the entry arena, vacant ones included
    pub fn slot_count(&self) -> usize {
        self.entries.slot_count()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Unpinned tiles from least to most recently used
    pub fn lru_order(&self) -> Vec<TileId> {
        let mut order = Vec::with_capacity(self.lru.len);
        let mut cursor = self.lru.head;
        while let Some(index) = cursor {
            if let Some(id) = self.entries.id_at(index) {
                order.push(id);
            }
            cursor = self.entries.at(index).and_then(|entry| entry.next);
        }
        order
    }

    fn entry_mut(&mut self, id: TileId, op: &str) -> &mut Entry<T> {
        match self.entries.get_mut(id) {
            Some(entry) => entry,
            None => panic!("{op} on stale tile {id:?}"),
        }
    }

    fn links_mut(&mut self, list: ListKind) -> &mut Links {
        match list {
            ListKind::Lru => &mut self.lru,
            ListKind::Pinned => &mut self.pinned,
        }
    }

    fn unlink(&mut self, index: u32) {
        let Some(entry) = self.entries.at_mut(index) else {
            return;
        };
        let (prev, next, list) = (entry.prev.take(), entry.next.take(), entry.list);

        match prev {
            Some(p) => {
                if let Some(prev_entry) = self.entries.at_mut(p) {
                    prev_entry.next = next;
                }
            }
            None => self.links_mut(list).head = next,
        }
        match next {
            Some(n) => {
                if let Some(next_entry) = self.entries.at_mut(n) {
                    next_entry.prev = prev;
                }
            }
            None => self.links_mut(list).tail = prev,
        }
        self.links_mut(list).len -= 1;
    }

    fn push_back(&mut self, index: u32, list: ListKind) {
        let tail = self.links_mut(list).tail;
        if let Some(entry) = self.entries.at_mut(index) {
            entry.prev = tail;
            entry.next = None;
            entry.list = list;
        }
        match tail {
            Some(t) => {
                if let Some(tail_entry) = self.entries.at_mut(t) {
                    tail_entry.next = Some(index);
                }
            }
            None => self.links_mut(list).head = Some(index),
        }
        let links = self.links_mut(list);
        links.tail = Some(index);
        links.len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records its tag in the context when discarded
    #[derive(Debug)]
    struct Tagged(u32);

    impl Cacheable for Tagged {
        type Context = Vec<u32>;

        fn discard(self, ctx: &mut Vec<u32>) {
            ctx.push(self.0);
        }
    }

    fn insert(cache: &mut TileCache<Tagged>, discarded: &mut Vec<u32>, tag: u32) -> TileId {
        cache.acquire_spot(discarded);
        cache.add_entry(Tagged(tag))
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut cache = TileCache::new(3);
        let mut discarded = Vec::new();
        let ids: Vec<_> = (0..5).map(|i| insert(&mut cache, &mut discarded, i)).collect();

        assert_eq!(discarded, vec![0, 1]);
        assert_eq!(cache.size(), 3);
        assert!(!cache.contains(ids[0]));
        assert!(!cache.contains(ids[1]));
        assert_eq!(cache.lru_order(), ids[2..].to_vec());
    }

    #[test]
    fn test_touch_moves_to_tail() {
        let mut cache = TileCache::new(3);
        let mut discarded = Vec::new();
        let a = insert(&mut cache, &mut discarded, 0);
        let b = insert(&mut cache, &mut discarded, 1);
        let c = insert(&mut cache, &mut discarded, 2);

        cache.touch_entry(a);
        assert_eq!(cache.lru_order(), vec![b, c, a]);

        insert(&mut cache, &mut discarded, 3);
        assert_eq!(discarded, vec![1]);
        assert!(cache.contains(a));
    }

    #[test]
    fn test_pinned_never_evicted() {
        let mut cache = TileCache::new(2);
        let mut discarded = Vec::new();
        let pinned = insert(&mut cache, &mut discarded, 99);
        cache.lock_entry(pinned);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.pinned_len(), 1);

        for i in 0..20 {
            insert(&mut cache, &mut discarded, i);
        }
        assert!(cache.contains(pinned));
        assert!(!discarded.contains(&99));
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.live(), 3);
    }

    #[test]
    fn test_nested_pins() {
        let mut cache = TileCache::new(4);
        let mut discarded = Vec::new();
        let a = insert(&mut cache, &mut discarded, 0);

        cache.lock_entry(a);
        cache.lock_entry(a);
        assert_eq!(cache.pin_count(a), Some(2));

        cache.unlock_entry(a, &mut discarded);
        assert_eq!(cache.pinned_len(), 1);
        cache.unlock_entry(a, &mut discarded);
        assert_eq!(cache.pinned_len(), 0);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.lru_order(), vec![a]);
    }

    #[test]
    fn test_unlock_evicts_when_full() {
        let mut cache = TileCache::new(2);
        let mut discarded = Vec::new();
        let a = insert(&mut cache, &mut discarded, 0);
        cache.lock_entry(a);
        insert(&mut cache, &mut discarded, 1);
        insert(&mut cache, &mut discarded, 2);
        assert!(discarded.is_empty());

        cache.unlock_entry(a, &mut discarded);
        assert_eq!(discarded, vec![1]);
        assert_eq!(cache.size(), 2);
        assert_eq!(*cache.lru_order().last().unwrap(), a);
    }

    #[test]
    #[should_panic(expected = "unlock_entry on unpinned tile")]
    fn test_double_unlock_panics() {
        let mut cache = TileCache::new(2);
        let mut discarded = Vec::new();
        let a = insert(&mut cache, &mut discarded, 0);
        cache.unlock_entry(a, &mut discarded);
    }

    #[test]
    fn test_remove_discards_once() {
        let mut cache = TileCache::new(2);
        let mut discarded = Vec::new();
        let a = insert(&mut cache, &mut discarded, 7);
        cache.lock_entry(a);
        cache.remove_entry(a, &mut discarded);

        assert_eq!(discarded, vec![7]);
        assert_eq!(cache.live(), 0);
        assert_eq!(cache.pinned_len(), 0);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_set_limit_shrinks() {
        let mut cache = TileCache::new(8);
        let mut discarded = Vec::new();
        for i in 0..8 {
            insert(&mut cache, &mut discarded, i);
        }
        cache.set_limit(3, &mut discarded);
        assert_eq!(discarded, vec![0, 1, 2, 3, 4]);
        assert_eq!(cache.size(), 3);

        cache.discard_all(&mut discarded);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().evictions, 8);
    }

    #[test]
    fn test_pin_accounting_invariant() {
        let mut cache = TileCache::new(5);
        let mut discarded = Vec::new();
        let mut ids = Vec::new();
        for step in 0..60u32 {
            let id = insert(&mut cache, &mut discarded, step);
            ids.push(id);
            if step % 3 == 0 {
                cache.lock_entry(id);
            }
            if step % 7 == 0 {
                if let Some(&old) = ids.iter().find(|id| cache.pin_count(**id).unwrap_or(0) > 0) {
                    cache.unlock_entry(old, &mut discarded);
                }
            }
            assert!(cache.size() <= cache.limit());
            assert_eq!(cache.size() + cache.pinned_len(), cache.live());
        }
    }

    #[test]
    fn test_vacant_slots_trimmed_above_high_water() {
        let mut cache = TileCache::with_high_water(2, 2);
        let mut discarded = Vec::new();
        let ids: Vec<_> = (0..6)
            .map(|tag| {
                let id = insert(&mut cache, &mut discarded, tag);
                cache.lock_entry(id);
                id
            })
            .collect();
        assert_eq!(cache.slot_count(), 6);
        assert_eq!(cache.pinned_len(), 6);

        for id in &ids {
            cache.remove_entry(*id, &mut discarded);
        }
        assert_eq!(cache.live(), 0);
        assert_eq!(cache.slot_count(), 2);
        assert_eq!(discarded, vec![0, 1, 2, 3, 4, 5]);

        let id = insert(&mut cache, &mut discarded, 6);
        assert!(ids.iter().all(|old| !cache.contains(*old)));
        assert!(cache.contains(id));
    }
}
