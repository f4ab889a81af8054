//! Tile slots and cacheable tile payloads
//!
//! A [`TileStack`] sits at every tile address of a plane. It owns at most one
//! live [`DecodedTile`] in the decoded cache and one [`RenderTile`] in the
//! render cache, a progress vector for each, and the swap state of the
//! decoded pixels once they have been evicted.

use std::cell::{Cell, RefCell};
use std::mem;
use std::rc::Rc;

use crate::cache::{Cacheable, TileCache};
use crate::config::ImageConfig;
use crate::pool::{BufferPool, TileId};
use crate::swap::{SwapBlock, SwapManager};
use crate::TS;

/// One version stamp per tile row; 0 means never written
pub type ProgressVector = [u8; TS];

/// Where a decoded tile's pixels live when it is not cached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SwapSlot {
    /// Never swapped out
    #[default]
    Empty,
    /// Parked in a swap arena
    Swapped(SwapBlock),
    /// Swap-out failed; the pixels are gone
    Lost,
    /// The owning plane was released
    Released,
}

/// Storage used when decoded tiles come and go
#[derive(Debug)]
pub struct TileBacking {
    pub swap: SwapManager,
    pub buffers: BufferPool,
}

/// Decoded pixel tile
#[derive(Debug)]
pub struct DecodedTile {
    pixels: Vec<u8>,
    /// Written since it was last swapped in
    dirty: bool,
    slot: Rc<Cell<SwapSlot>>,
}

impl DecodedTile {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Mutable pixels; marks the tile for write-back on eviction
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.pixels
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Cacheable for DecodedTile {
    type Context = TileBacking;

    fn discard(self, backing: &mut TileBacking) {
        let DecodedTile { pixels, dirty, slot } = self;

        // Nobody can restore a tile whose stack is gone.
        let orphaned = Rc::strong_count(&slot) == 1;

        match slot.get() {
            SwapSlot::Released => {}
            _ if orphaned => {}
            SwapSlot::Swapped(_) | SwapSlot::Empty | SwapSlot::Lost if !dirty => {}
            current => write_back(&slot, current, &pixels, &mut backing.swap),
        }

        backing.buffers.checkin(pixels);
    }
}

fn write_back(slot: &Cell<SwapSlot>, current: SwapSlot, pixels: &[u8], swap: &mut SwapManager) {
    let block = match current {
        SwapSlot::Swapped(block) => block,
        _ => match swap.alloc(pixels.len()) {
            Ok(block) => block,
            Err(err) => {
                tracing::warn!("Tile swap-out failed, tile lost: {}", err);
                slot.set(SwapSlot::Lost);
                return;
            }
        },
    };

    match swap.swap_out(block, pixels) {
        Ok(()) => slot.set(SwapSlot::Swapped(block)),
        Err(err) => {
            tracing::warn!("Tile swap-out failed, tile lost: {}", err);
            swap.free(block);
            slot.set(SwapSlot::Lost);
        }
    }
}

/// Render-ready tile (premultiplied RGBA)
#[derive(Debug)]
pub struct RenderTile {
    pub pixmap: tiny_skia::Pixmap,
}

impl Cacheable for RenderTile {
    type Context = BufferPool;

    fn discard(self, buffers: &mut BufferPool) {
        buffers.checkin(self.pixmap.take());
    }
}

/// Swap blocks and cache entries left behind by planes dropped without release
#[derive(Debug, Default)]
pub struct Leftovers {
    blocks: Vec<SwapBlock>,
    decoded: Vec<TileId>,
    render: Vec<TileId>,
}

impl Leftovers {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.decoded.is_empty() && self.render.is_empty()
    }
}

/// Queue shared between the resources and every plane that touched them
pub type ReleaseQueue = Rc<RefCell<Leftovers>>;

/// The caches and swap arenas every plane draws from
#[derive(Debug)]
pub struct TileResources {
    pub decoded: TileCache<DecodedTile>,
    pub render: TileCache<RenderTile>,
    pub backing: TileBacking,
    leftovers: ReleaseQueue,
}

impl TileResources {
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            decoded: TileCache::with_high_water(
                config.decoded_cache_tiles,
                config.decoded_cache_tiles + config.pool_high_water,
            ),
            render: TileCache::with_high_water(
                config.render_cache_tiles,
                config.render_cache_tiles + config.pool_high_water,
            ),
            backing: TileBacking {
                swap: SwapManager::new(config.swap_arena_capacity, config.swap_backing, config.swap_max_arenas),
                buffers: BufferPool::new(config.pool_high_water),
            },
            leftovers: ReleaseQueue::default(),
        }
    }

    /// Handle a plane keeps so its drop can hand back what it still holds
    pub fn release_queue(&self) -> ReleaseQueue {
        Rc::clone(&self.leftovers)
    }

    /// Free the swap blocks and cache entries of planes dropped without release
    pub fn reclaim(&mut self) {
        let Ok(mut queue) = self.leftovers.try_borrow_mut() else {
            return;
        };
        if queue.is_empty() {
            return;
        }
        let leftovers = mem::take(&mut *queue);
        drop(queue);

        tracing::debug!(
            "Reclaiming {} swap blocks and {} tiles of dropped planes",
            leftovers.blocks.len(),
            leftovers.decoded.len() + leftovers.render.len()
        );
        for block in leftovers.blocks {
            self.backing.swap.free(block);
        }
        for id in leftovers.decoded {
            if self.decoded.contains(id) {
                self.decoded.remove_entry(id, &mut self.backing);
            }
        }
        for id in leftovers.render {
            if self.render.contains(id) {
                self.render.remove_entry(id, &mut self.backing.buffers);
            }
        }
    }

    /// Evict every unpinned tile from both caches
    pub fn discard_all(&mut self) {
        self.reclaim();
        self.decoded.discard_all(&mut self.backing);
        self.render.discard_all(&mut self.backing.buffers);
    }
}

/// Per-address tile record
#[derive(Debug)]
pub struct TileStack {
    decoded: Option<TileId>,
    render: Option<TileId>,
    progress: ProgressVector,
    render_progress: ProgressVector,
    slot: Rc<Cell<SwapSlot>>,
}

impl Default for TileStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TileStack {
    pub fn new() -> Self {
        Self {
            decoded: None,
            render: None,
            progress: [0; TS],
            render_progress: [0; TS],
            slot: Rc::new(Cell::new(SwapSlot::Empty)),
        }
    }

    /// Swapped out with no live decoded tile
    pub fn is_discarded(&self, cache: &TileCache<DecodedTile>) -> bool {
        matches!(self.slot.get(), SwapSlot::Swapped(_)) && self.live_decoded(cache).is_none()
    }

    pub fn swap_slot(&self) -> SwapSlot {
        self.slot.get()
    }

    /// Version stamps of the decoded rows
    pub fn progress(&self) -> &ProgressVector {
        &self.progress
    }

    pub fn progress_mut(&mut self) -> &mut ProgressVector {
        &mut self.progress
    }

    /// Version stamps of the rows converted into the render tile
    pub fn render_progress(&self) -> &ProgressVector {
        &self.render_progress
    }

    pub fn render_progress_mut(&mut self) -> &mut ProgressVector {
        &mut self.render_progress
    }

    /// The decoded tile, if it is still cached
    pub fn live_decoded(&self, cache: &TileCache<DecodedTile>) -> Option<TileId> {
        self.decoded.filter(|id| cache.contains(*id))
    }

    /// The render tile, if it is still cached
    pub fn live_render(&self, cache: &TileCache<RenderTile>) -> Option<TileId> {
        self.render.filter(|id| cache.contains(*id))
    }

    /// Bring the decoded tile into the cache and return its id
    ///
    /// A cached tile is touched. An absent tile is rebuilt from swap when it
    /// was swapped out, or starts zeroed otherwise. A tile whose swap-out
    /// failed comes back zeroed with its progress reset.
    pub fn materialize_decoded(&mut self, res: &mut TileResources, len: usize) -> TileId {
        if let Some(id) = self.live_decoded(&res.decoded) {
            res.decoded.touch_entry(id);
            return id;
        }

        res.reclaim();
        res.decoded.note_miss();
        res.decoded.acquire_spot(&mut res.backing);
        let mut pixels = res.backing.buffers.checkout(len);

        match self.slot.get() {
            SwapSlot::Empty => {}
            SwapSlot::Swapped(block) => {
                if let Err(err) = res.backing.swap.swap_in(block, &mut pixels) {
                    tracing::warn!("Tile swap-in failed, tile lost: {}", err);
                    res.backing.swap.free(block);
                    pixels.fill(0);
                    self.progress = [0; TS];
                    self.slot.set(SwapSlot::Empty);
                }
            }
            SwapSlot::Lost => {
                tracing::warn!("Rebuilding lost tile as blank");
                self.progress = [0; TS];
                self.slot.set(SwapSlot::Empty);
            }
            SwapSlot::Released => panic!("materialize on a released tile"),
        }

        let id = res.decoded.add_entry(DecodedTile {
            pixels,
            dirty: false,
            slot: Rc::clone(&self.slot),
        });
        self.decoded = Some(id);
        id
    }

    /// Bring the render tile into the cache; a fresh one starts unconverted
    pub fn materialize_render(&mut self, res: &mut TileResources, width: u32, height: u32) -> Option<TileId> {
        if let Some(id) = self.live_render(&res.render) {
            res.render.touch_entry(id);
            return Some(id);
        }

        res.reclaim();
        res.render.note_miss();
        let size = tiny_skia::IntSize::from_wh(width, height)?;
        res.render.acquire_spot(&mut res.backing.buffers);
        let data = res.backing.buffers.checkout(width as usize * height as usize * 4);
        let pixmap = tiny_skia::Pixmap::from_vec(data, size)?;

        self.render_progress = [0; TS];
        let id = res.render.add_entry(RenderTile { pixmap });
        self.render = Some(id);
        Some(id)
    }

    /// Free swap space and drop cache membership
    pub fn release(&mut self, res: &mut TileResources) {
        if let SwapSlot::Swapped(block) = self.slot.get() {
            res.backing.swap.free(block);
        }
        self.slot.set(SwapSlot::Released);

        if let Some(id) = self.decoded.take().filter(|id| res.decoded.contains(*id)) {
            res.decoded.remove_entry(id, &mut res.backing);
        }
        if let Some(id) = self.render.take().filter(|id| res.render.contains(*id)) {
            res.render.remove_entry(id, &mut res.backing.buffers);
        }
    }

    /// Hand swap space and cache membership to the queue for a later
    /// [`TileResources::reclaim`]
    pub fn abandon(&mut self, leftovers: &mut Leftovers) {
        if let SwapSlot::Swapped(block) = self.slot.get() {
            leftovers.blocks.push(block);
        }
        self.slot.set(SwapSlot::Released);
        leftovers.decoded.extend(self.decoded.take());
        leftovers.render.extend(self.render.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEN: usize = TS * TS * 4;

    fn resources(decoded_tiles: usize) -> TileResources {
        TileResources::new(&ImageConfig {
            decoded_cache_tiles: decoded_tiles,
            ..ImageConfig::minimal()
        })
    }

    #[test]
    fn test_materialize_is_lazy_and_cached() {
        let mut res = resources(4);
        let mut stack = TileStack::new();
        assert!(stack.live_decoded(&res.decoded).is_none());

        let a = stack.materialize_decoded(&mut res, LEN);
        let b = stack.materialize_decoded(&mut res, LEN);
        assert_eq!(a, b);
        assert_eq!(res.decoded.live(), 1);
        assert_eq!(res.decoded.stats().misses, 1);
        assert_eq!(res.decoded.stats().hits, 1);
    }

    #[test]
    fn test_evicted_tile_restored_from_swap() {
        let mut res = resources(1);
        let mut first = TileStack::new();
        let mut second = TileStack::new();

        let id = first.materialize_decoded(&mut res, LEN);
        res.decoded.tile_mut(id).pixels_mut().fill(0xAB);
        first.progress_mut()[0] = 1;

        second.materialize_decoded(&mut res, LEN);
        assert!(first.is_discarded(&res.decoded));
        assert!(matches!(first.swap_slot(), SwapSlot::Swapped(_)));

        let id = first.materialize_decoded(&mut res, LEN);
        assert!(res.decoded.tile(id).pixels().iter().all(|&b| b == 0xAB));
        assert!(!res.decoded.tile(id).is_dirty());
        assert_eq!(first.progress()[0], 1);
    }

    #[test]
    fn test_clean_tile_not_rewritten() {
        let mut res = resources(1);
        let mut first = TileStack::new();
        let mut second = TileStack::new();

        let id = first.materialize_decoded(&mut res, LEN);
        res.decoded.tile_mut(id).pixels_mut().fill(1);
        second.materialize_decoded(&mut res, LEN);
        first.materialize_decoded(&mut res, LEN);
        second.materialize_decoded(&mut res, LEN);

        assert_eq!(res.backing.swap.stats().swap_outs, 1);
    }

    #[test]
    fn test_swap_failure_marks_lost() {
        let mut res = TileResources::new(&ImageConfig {
            decoded_cache_tiles: 1,
            swap_max_arenas: Some(0),
            ..ImageConfig::minimal()
        });
        let mut first = TileStack::new();
        let mut second = TileStack::new();

        let id = first.materialize_decoded(&mut res, LEN);
        res.decoded.tile_mut(id).pixels_mut().fill(9);
        first.progress_mut().fill(3);
        second.materialize_decoded(&mut res, LEN);
        assert_eq!(first.swap_slot(), SwapSlot::Lost);

        let id = first.materialize_decoded(&mut res, LEN);
        assert!(res.decoded.tile(id).pixels().iter().all(|&b| b == 0));
        assert!(first.progress().iter().all(|&v| v == 0));
        assert_eq!(first.swap_slot(), SwapSlot::Empty);
    }

    #[test]
    fn test_release_frees_swap_and_entries() {
        let mut res = resources(1);
        let mut first = TileStack::new();
        let mut second = TileStack::new();

        let id = first.materialize_decoded(&mut res, LEN);
        res.decoded.tile_mut(id).pixels_mut().fill(5);
        second.materialize_decoded(&mut res, LEN);
        assert_eq!(res.backing.swap.total_used(), LEN as u64);

        first.release(&mut res);
        second.release(&mut res);
        assert_eq!(res.backing.swap.total_used(), 0);
        assert_eq!(res.decoded.live(), 0);
        assert_eq!(first.swap_slot(), SwapSlot::Released);
    }

    #[test]
    fn test_abandoned_tiles_reclaimed() {
        let mut res = resources(1);
        let mut first = TileStack::new();
        let mut second = TileStack::new();

        let id = first.materialize_decoded(&mut res, LEN);
        res.decoded.tile_mut(id).pixels_mut().fill(5);
        let id = second.materialize_decoded(&mut res, LEN);
        res.decoded.tile_mut(id).pixels_mut().fill(6);
        assert_eq!(res.backing.swap.total_used(), LEN as u64);

        let queue = res.release_queue();
        first.abandon(&mut queue.borrow_mut());
        second.abandon(&mut queue.borrow_mut());
        assert!(!queue.borrow().is_empty());
        assert_eq!(res.backing.swap.total_used(), LEN as u64);

        res.reclaim();
        assert!(queue.borrow().is_empty());
        assert_eq!(res.backing.swap.total_used(), 0);
        assert_eq!(res.decoded.live(), 0);
        // The dirty tile of a released stack is not written back.
        assert_eq!(res.backing.swap.stats().swap_outs, 1);
    }

    #[test]
    fn test_render_tile_recycles_buffers() {
        let mut res = resources(4);
        let mut stack = TileStack::new();
        let id = stack.materialize_render(&mut res, 64, 64).unwrap();
        assert_eq!(res.render.tile(id).pixmap.width(), 64);

        stack.release(&mut res);
        assert_eq!(res.backing.buffers.stats().spare_buffers, 1);
    }
}
