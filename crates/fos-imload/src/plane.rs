//! Tiling & Scaling Geometry
//!
//! A [`Plane`] partitions a `width x height` pixel grid into 64x64 tiles
//! and owns one [`TileStack`] per tile address. Edge tiles carry the
//! remainder. [`ScaleTable`] maps each destination coordinate of a rescaled
//! plane to its nearest source pixel, addressed by tile and offset.

use crate::pool::TileId;
use crate::tile::{ReleaseQueue, TileResources, TileStack};
use crate::{TILE_SIZE, TS};

/// Pixel rectangle covered by one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Tiled pixel grid
#[derive(Debug)]
pub struct Plane {
    width: u32,
    height: u32,
    depth: usize,
    tiles_width: u32,
    tiles_height: u32,
    tiles: Vec<TileStack>,
    released: bool,
    /// Picked up on first materialize; a drop without release queues its tiles here
    leftovers: Option<ReleaseQueue>,
}

impl Plane {
    /// Create a plane of `depth` bytes per pixel
    pub fn new(width: u32, height: u32, depth: usize) -> Self {
        let tiles_width = width.div_ceil(TILE_SIZE);
        let tiles_height = height.div_ceil(TILE_SIZE);
        let tiles = (0..tiles_width * tiles_height).map(|_| TileStack::new()).collect();

        Self {
            width,
            height,
            depth,
            tiles_width,
            tiles_height,
            tiles,
            released: false,
            leftovers: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per pixel
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn tiles_width(&self) -> u32 {
        self.tiles_width
    }

    pub fn tiles_height(&self) -> u32 {
        self.tiles_height
    }

    /// Bytes in one tile buffer; tiles are always allocated full size
    pub fn tile_bytes(&self) -> usize {
        TS * TS * self.depth
    }

    /// Bytes between two rows of a tile buffer
    pub fn tile_stride(&self) -> usize {
        TS * self.depth
    }

    pub fn tile_width(&self, tile_x: u32) -> u32 {
        edge_extent(self.width, self.tiles_width, tile_x)
    }

    pub fn tile_height(&self, tile_y: u32) -> u32 {
        edge_extent(self.height, self.tiles_height, tile_y)
    }

    pub fn tile_rect(&self, tile_x: u32, tile_y: u32) -> TileRect {
        TileRect {
            x: tile_x * TILE_SIZE,
            y: tile_y * TILE_SIZE,
            width: self.tile_width(tile_x),
            height: self.tile_height(tile_y),
        }
    }

    pub fn stack(&self, tile_x: u32, tile_y: u32) -> &TileStack {
        &self.tiles[self.index(tile_x, tile_y)]
    }

    pub fn stack_mut(&mut self, tile_x: u32, tile_y: u32) -> &mut TileStack {
        let index = self.index(tile_x, tile_y);
        &mut self.tiles[index]
    }

    fn index(&self, tile_x: u32, tile_y: u32) -> usize {
        assert!(
            tile_x < self.tiles_width && tile_y < self.tiles_height,
            "tile ({tile_x}, {tile_y}) outside {}x{} tiles",
            self.tiles_width,
            self.tiles_height
        );
        (tile_y * self.tiles_width + tile_x) as usize
    }

    /// Materialize the decoded tile at an address
    pub fn decoded_tile(&mut self, res: &mut TileResources, tile_x: u32, tile_y: u32) -> TileId {
        if self.leftovers.is_none() {
            self.leftovers = Some(res.release_queue());
        }
        let len = self.tile_bytes();
        self.stack_mut(tile_x, tile_y).materialize_decoded(res, len)
    }

    /// Materialize and pin every tile of a tile row
    pub fn lock_row(&mut self, res: &mut TileResources, tile_y: u32) {
        for tile_x in 0..self.tiles_width {
            let id = self.decoded_tile(res, tile_x, tile_y);
            res.decoded.lock_entry(id);
        }
    }

    /// Drop the pins taken by [`lock_row`](Self::lock_row)
    pub fn unlock_row(&mut self, res: &mut TileResources, tile_y: u32) {
        for tile_x in 0..self.tiles_width {
            let Some(id) = self.stack(tile_x, tile_y).live_decoded(&res.decoded) else {
                panic!("unlock_row: tile ({tile_x}, {tile_y}) is not resident");
            };
            res.decoded.unlock_entry(id, &mut res.backing);
        }
    }

    /// Free swap space and cache membership of every tile
    pub fn release(&mut self, res: &mut TileResources) {
        for stack in &mut self.tiles {
            stack.release(res);
        }
        self.released = true;
    }
}

impl Drop for Plane {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(queue) = self.leftovers.take() else {
            return;
        };
        let Ok(mut leftovers) = queue.try_borrow_mut() else {
            tracing::warn!("Plane {}x{} dropped during reclaim, tiles leaked", self.width, self.height);
            return;
        };
        for stack in &mut self.tiles {
            stack.abandon(&mut leftovers);
        }
        tracing::debug!(
            "Plane {}x{} dropped without release, tiles queued for reclaim",
            self.width,
            self.height
        );
    }
}

fn edge_extent(total: u32, tiles: u32, index: u32) -> u32 {
    if index + 1 < tiles {
        return TILE_SIZE;
    }
    match total % TILE_SIZE {
        0 => TILE_SIZE,
        rem => rem,
    }
}

/// Source pixel for one destination coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleEntry {
    pub tile: u32,
    pub offset: u32,
}

impl ScaleEntry {
    pub fn source(&self) -> u32 {
        self.tile * TILE_SIZE + self.offset
    }
}

/// Nearest-neighbour resampling table for one axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTable {
    entries: Vec<ScaleEntry>,
    identity: bool,
}

impl ScaleTable {
    /// Map every coordinate of `scaled` to the source pixel whose centre is nearest
    pub fn calc(original: u32, scaled: u32) -> Self {
        let entries = (0..scaled)
            .map(|dst| {
                let origin = ((2 * dst as u64 + 1) * original as u64 / (2 * scaled as u64)) as u32;
                let origin = origin.min(original.saturating_sub(1));
                ScaleEntry { tile: origin / TILE_SIZE, offset: origin % TILE_SIZE }
            })
            .collect();

        Self { entries, identity: original == scaled }
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, dst: u32) -> ScaleEntry {
        self.entries[dst as usize]
    }

    pub fn entries(&self) -> &[ScaleEntry] {
        &self.entries
    }

    pub fn source_pixel(&self, dst: u32) -> u32 {
        self.entry(dst).source()
    }

    /// Destination range whose sources fall in `start..=end`
    pub fn map_source_range(&self, start: u32, end: u32) -> Option<(u32, u32)> {
        let first = self.entries.partition_point(|e| e.source() < start);
        let last = self.entries.partition_point(|e| e.source() <= end);
        (first < last).then(|| (first as u32, last as u32 - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;

    #[test]
    fn test_tiling_coverage() {
        for (w, h) in [(1, 1), (63, 64), (64, 65), (130, 7), (200, 129), (1000, 999)] {
            let plane = Plane::new(w, h, 4);
            let widths: u32 = (0..plane.tiles_width()).map(|x| plane.tile_width(x)).sum();
            let heights: u32 = (0..plane.tiles_height()).map(|y| plane.tile_height(y)).sum();
            assert_eq!(widths, w);
            assert_eq!(heights, h);

            let mut area = 0u64;
            let mut covered = vec![false; (w * h) as usize];
            for ty in 0..plane.tiles_height() {
                for tx in 0..plane.tiles_width() {
                    let rect = plane.tile_rect(tx, ty);
                    for y in rect.y..rect.y + rect.height {
                        for x in rect.x..rect.x + rect.width {
                            let i = (y * w + x) as usize;
                            assert!(!covered[i], "overlap at {x},{y}");
                            covered[i] = true;
                        }
                    }
                    area += rect.width as u64 * rect.height as u64;
                }
            }
            assert_eq!(area, w as u64 * h as u64);
            assert!(covered.iter().all(|&c| c));
        }
    }

    #[test]
    fn test_even_edge_is_full_tile() {
        let plane = Plane::new(128, 64, 1);
        assert_eq!(plane.tiles_width(), 2);
        assert_eq!(plane.tile_width(1), 64);
        assert_eq!(plane.tile_height(0), 64);
    }

    #[test]
    fn test_lock_unlock_row() {
        let mut res = TileResources::new(&ImageConfig::minimal());
        let mut plane = Plane::new(200, 100, 4);

        plane.lock_row(&mut res, 1);
        assert_eq!(res.decoded.pinned_len(), 4);
        plane.unlock_row(&mut res, 1);
        assert_eq!(res.decoded.pinned_len(), 0);
        assert_eq!(res.decoded.size(), 4);

        plane.release(&mut res);
        assert_eq!(res.decoded.live(), 0);
    }

    #[test]
    fn test_drop_without_release_queues_tiles() {
        let mut res = TileResources::new(&ImageConfig::minimal());
        let mut plane = Plane::new(200, 100, 4);
        plane.lock_row(&mut res, 0);
        plane.decoded_tile(&mut res, 0, 1);
        assert_eq!(res.decoded.live(), 5);

        drop(plane);
        assert!(!res.release_queue().borrow().is_empty());
        res.reclaim();
        assert_eq!(res.decoded.live(), 0);
        assert_eq!(res.decoded.pinned_len(), 0);

        // Never materialized, nothing to hand back.
        drop(Plane::new(64, 64, 1));
        assert!(res.release_queue().borrow().is_empty());
    }

    #[test]
    fn test_scale_table_identity() {
        let table = ScaleTable::calc(150, 150);
        assert!(table.is_identity());
        for dst in 0..150 {
            assert_eq!(table.source_pixel(dst), dst);
        }
    }

    #[test]
    fn test_scale_table_bounds() {
        for (orig, scaled) in [(100, 37), (37, 100), (1, 64), (640, 1), (129, 257)] {
            let table = ScaleTable::calc(orig, scaled);
            assert_eq!(table.len(), scaled as usize);
            assert!(table.entries().iter().all(|e| e.source() < orig));
            assert!(table.entries().iter().all(|e| e.offset < TILE_SIZE));
        }
    }

    #[test]
    fn test_scale_table_halving() {
        let table = ScaleTable::calc(128, 64);
        assert_eq!(table.source_pixel(0), 1);
        assert_eq!(table.source_pixel(63), 127);
        assert_eq!(table.entry(40), ScaleEntry { tile: 1, offset: 17 });
    }

    #[test]
    fn test_map_source_range() {
        let table = ScaleTable::calc(100, 50);
        assert_eq!(table.map_source_range(0, 1), Some((0, 0)));
        assert_eq!(table.map_source_range(10, 13), Some((5, 6)));
        assert_eq!(table.map_source_range(99, 99), Some((49, 49)));

        let upscale = ScaleTable::calc(10, 100);
        assert_eq!(upscale.map_source_range(0, 0), Some((0, 9)));
        assert_eq!(ScaleTable::calc(100, 10).map_source_range(0, 3), None);
    }
}
