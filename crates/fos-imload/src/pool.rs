//! Tile Object Pool
//!
//! Slot arena that owns every cacheable tile, plus a pool that recycles the
//! pixel buffers those tiles carry.
//!
//! Slots are addressed by a generational [`TileId`]: releasing a slot bumps
//! its generation, so a handle kept by a plane after its tile was evicted
//! simply stops resolving instead of aliasing the next tenant.

/// Generational handle to a pooled tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena with a free-index stack
#[derive(Debug)]
pub struct TilePool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    /// Vacant slots at the tail beyond this many are dropped
    high_water: usize,
    /// Generation handed to freshly pushed slots
    fresh_generation: u32,
    live: usize,
}

impl<T> TilePool<T> {
    /// Create a pool that never shrinks
    pub fn new() -> Self {
        Self::with_high_water(usize::MAX)
    }

    /// Create a pool that trims vacant tail slots above `high_water` slots
    pub fn with_high_water(high_water: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            high_water,
            fresh_generation: 0,
            live: 0,
        }
    }

    /// Store a value, reusing a vacant slot when one exists
    pub fn acquire(&mut self, value: T) -> TileId {
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return TileId { index, generation: slot.generation };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: self.fresh_generation, value: Some(value) });
        TileId { index, generation: self.fresh_generation }
    }

    /// Take the value out of its slot; stale ids return `None`
    pub fn release(&mut self, id: TileId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        self.trim();
        Some(value)
    }

    fn trim(&mut self) {
        if self.slots.len() <= self.high_water {
            return;
        }

        let before = self.slots.len();
        while self.slots.len() > self.high_water {
            match self.slots.last() {
                Some(slot) if slot.value.is_none() => {
                    // Ids minted later must not collide with ids of dropped slots.
                    self.fresh_generation = self.fresh_generation.max(slot.generation);
                    self.slots.pop();
                }
                _ => break,
            }
        }

        if self.slots.len() != before {
            let len = self.slots.len() as u32;
            self.free.retain(|&index| index < len);
        }
    }

    /// Get a value
    pub fn get(&self, id: TileId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Get a mutable value
    pub fn get_mut(&mut self, id: TileId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Current id of an occupied slot
    pub(crate) fn id_at(&self, index: u32) -> Option<TileId> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.value.is_some())
            .map(|slot| TileId { index, generation: slot.generation })
    }

    pub(crate) fn at_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots.get_mut(index as usize).and_then(|slot| slot.value.as_mut())
    }

    pub(crate) fn at(&self, index: u32) -> Option<&T> {
        self.slots.get(index as usize).and_then(|slot| slot.value.as_ref())
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots allocated, live or vacant
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Vacant slots ready for reuse
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl<T> Default for TilePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Recycles pixel buffers between tiles
#[derive(Debug)]
pub struct BufferPool {
    spare: Vec<Vec<u8>>,
    /// Maximum spare buffers kept
    high_water: usize,
    hits: u64,
    misses: u64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BufferPool {
    pub fn new(high_water: usize) -> Self {
        Self {
            spare: Vec::new(),
            high_water,
            hits: 0,
            misses: 0,
        }
    }

    /// Checkout a zeroed buffer of `len` bytes
    pub fn checkout(&mut self, len: usize) -> Vec<u8> {
        if let Some(pos) = self.spare.iter().position(|buf| buf.capacity() >= len) {
            let mut buf = self.spare.swap_remove(pos);
            buf.clear();
            buf.resize(len, 0);
            self.hits += 1;
            return buf;
        }

        self.misses += 1;
        vec![0; len]
    }

    /// Return a buffer; dropped once the pool is at its high-water mark
    pub fn checkin(&mut self, mut buf: Vec<u8>) {
        if self.spare.len() >= self.high_water {
            return;
        }
        buf.clear();
        self.spare.push(buf);
    }

    /// Drop every spare buffer
    pub fn clear(&mut self) {
        self.spare.clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits,
            misses: self.misses,
            hit_rate: if self.hits + self.misses > 0 {
                self.hits as f64 / (self.hits + self.misses) as f64
            } else {
                0.0
            },
            spare_buffers: self.spare.len(),
            spare_bytes: self.spare.iter().map(|buf| buf.capacity()).sum(),
        }
    }
}

/// Buffer pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub spare_buffers: usize,
    pub spare_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuses_slot() {
        let mut pool = TilePool::new();
        let a = pool.acquire("a");
        let b = pool.acquire("b");
        assert_eq!(pool.len(), 2);

        assert_eq!(pool.release(a), Some("a"));
        let c = pool.acquire("c");

        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.get(c), Some(&"c"));
        assert_eq!(pool.get(b), Some(&"b"));
        assert_eq!(pool.slot_count(), 2);
    }

    #[test]
    fn test_double_release_is_none() {
        let mut pool = TilePool::new();
        let a = pool.acquire(1u32);
        assert_eq!(pool.release(a), Some(1));
        assert_eq!(pool.release(a), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_high_water_trims_tail() {
        let mut pool = TilePool::with_high_water(2);
        let ids: Vec<_> = (0..6u32).map(|i| pool.acquire(i)).collect();
        assert_eq!(pool.slot_count(), 6);

        for id in ids.iter().rev() {
            pool.release(*id);
        }
        assert!(pool.slot_count() <= 2);
        assert!(pool.free_count() <= pool.slot_count());

        // Old handles never resolve against new tenants.
        let fresh: Vec<_> = (0..6u32).map(|i| pool.acquire(i + 100)).collect();
        for id in &ids {
            assert_eq!(pool.get(*id), None);
        }
        assert_eq!(pool.get(fresh[5]), Some(&105));
    }

    #[test]
    fn test_buffer_pool_checkout_checkin() {
        let mut pool = BufferPool::new(4);
        let buf = pool.checkout(64 * 64 * 4);
        assert_eq!(pool.stats().misses, 1);

        pool.checkin(buf);
        assert_eq!(pool.stats().spare_buffers, 1);

        let buf = pool.checkout(64);
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_buffer_pool_high_water() {
        let mut pool = BufferPool::new(2);
        for _ in 0..5 {
            pool.checkin(vec![1; 16]);
        }
        assert_eq!(pool.stats().spare_buffers, 2);
    }
}
