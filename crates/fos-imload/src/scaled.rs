//! Scaled Image Plane
//!
//! A rescaled copy of a source plane, built tile by tile on demand. Each
//! destination row carries the version of the source row it was sampled
//! from, so only rows whose source changed are resampled again.

use crate::plane::{Plane, ScaleTable};
use crate::pool::TileId;
use crate::tile::TileResources;
use crate::TILE_SIZE;

/// Nearest-neighbour rescaled plane
#[derive(Debug)]
pub struct ScaledImagePlane {
    plane: Plane,
    x_table: ScaleTable,
    y_table: ScaleTable,
    resampled_rows: u64,
}

impl ScaledImagePlane {
    pub fn new(src_width: u32, src_height: u32, dst_width: u32, dst_height: u32, depth: usize) -> Self {
        Self {
            plane: Plane::new(dst_width, dst_height, depth),
            x_table: ScaleTable::calc(src_width, dst_width),
            y_table: ScaleTable::calc(src_height, dst_height),
            resampled_rows: 0,
        }
    }

    pub fn plane(&self) -> &Plane {
        &self.plane
    }

    pub fn plane_mut(&mut self) -> &mut Plane {
        &mut self.plane
    }

    pub fn x_table(&self) -> &ScaleTable {
        &self.x_table
    }

    pub fn y_table(&self) -> &ScaleTable {
        &self.y_table
    }

    /// Rows resampled since creation
    pub fn resampled_rows(&self) -> u64 {
        self.resampled_rows
    }

    /// Resample the stale rows of one destination tile and return it
    ///
    /// The destination tile is pinned while it is written, and every source
    /// tile it reads from is pinned while its rows are copied.
    pub fn ensure_up_to_date(&mut self, src: &mut Plane, res: &mut TileResources, tile_x: u32, tile_y: u32) -> TileId {
        let dst_id = self.plane.decoded_tile(res, tile_x, tile_y);
        res.decoded.lock_entry(dst_id);

        let rect = self.plane.tile_rect(tile_x, tile_y);
        let first_col = self.x_table.entry(rect.x).tile;
        let last_col = self.x_table.entry(rect.x + rect.width - 1).tile;

        // (destination row, source tile row, source row offset, version)
        let mut stale = Vec::new();
        for row in 0..rect.height {
            let entry = self.y_table.entry(rect.y + row);
            let version = (first_col..=last_col)
                .map(|col| src.stack(col, entry.tile).progress()[entry.offset as usize])
                .max()
                .unwrap_or(0);
            if version != self.plane.stack(tile_x, tile_y).progress()[row as usize] {
                stale.push((row, entry.tile, entry.offset, version));
            }
        }

        let depth = self.plane.depth();
        let stride = self.plane.tile_stride();
        let mut line = vec![0u8; rect.width as usize * depth];

        for group in stale.chunk_by(|a, b| a.1 == b.1) {
            let src_row = group[0].1;
            let sources: Vec<TileId> = (first_col..=last_col)
                .map(|col| {
                    let id = src.decoded_tile(res, col, src_row);
                    res.decoded.lock_entry(id);
                    id
                })
                .collect();

            for &(row, _, offset, version) in group {
                for dx in 0..rect.width {
                    let entry = self.x_table.entry(rect.x + dx);
                    let pixels = res.decoded.tile(sources[(entry.tile - first_col) as usize]).pixels();
                    let at = offset as usize * stride + entry.offset as usize * depth;
                    let out = dx as usize * depth;
                    line[out..out + depth].copy_from_slice(&pixels[at..at + depth]);
                }

                let start = row as usize * stride;
                res.decoded.tile_mut(dst_id).pixels_mut()[start..start + line.len()].copy_from_slice(&line);
                self.plane.stack_mut(tile_x, tile_y).progress_mut()[row as usize] = version;
                self.resampled_rows += 1;
            }

            for id in sources {
                res.decoded.unlock_entry(id, &mut res.backing);
            }
        }

        res.decoded.unlock_entry(dst_id, &mut res.backing);
        dst_id
    }

    /// Source tile rows feeding one destination tile row
    pub fn source_tile_rows(&self, tile_y: u32) -> (u32, u32) {
        let rect_y = tile_y * TILE_SIZE;
        let height = self.plane.tile_height(tile_y);
        (self.y_table.entry(rect_y).tile, self.y_table.entry(rect_y + height - 1).tile)
    }

    pub fn release(&mut self, res: &mut TileResources) {
        self.plane.release(res);
    }
}
