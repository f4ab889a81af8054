//! Image loader configuration

use serde::{Deserialize, Serialize};

use crate::Color;

/// Where evicted tile pixels are parked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapBacking {
    /// Heap-backed arenas
    #[default]
    Memory,
    /// Files under the system temp directory, removed when the arena is dropped
    File,
}

/// Image loader configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Decoded-pixel cache budget (tiles)
    pub decoded_cache_tiles: usize,

    /// Render-surface cache budget (tiles)
    pub render_cache_tiles: usize,

    /// Soft capacity of one swap arena (bytes)
    pub swap_arena_capacity: u64,

    /// Swap arena backend
    pub swap_backing: SwapBacking,

    /// Maximum number of swap arenas (None = unbounded)
    pub swap_max_arenas: Option<usize>,

    /// Spare pixel buffers kept for reuse, and vacant cache slots kept above each budget
    pub pool_high_water: usize,

    /// Animation timer granularity (ms)
    pub anim_tick_ms: u32,

    /// Frame delays below this are clamped up (ms)
    pub min_frame_delay_ms: u32,

    /// Width of one update coalescing slot (ms)
    pub update_slot_ms: u32,

    /// Number of update coalescing slots
    pub update_slots: usize,

    /// Bytes scanned for a format signature before giving up
    pub sniff_limit: usize,

    /// Fill used where no tile data is cached
    pub fallback_color: Color,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            decoded_cache_tiles: 2048,
            render_cache_tiles: 4096,
            swap_arena_capacity: 1 << 30, // 1GB per arena
            swap_backing: SwapBacking::Memory,
            swap_max_arenas: None,
            pool_high_water: 256,
            anim_tick_ms: 10,
            min_frame_delay_ms: 100,
            update_slot_ms: 100,
            update_slots: 10,
            sniff_limit: 4096,
            fallback_color: Color::LIGHT_GRAY,
        }
    }
}

impl ImageConfig {
    /// Small budgets, useful for constrained devices and tests
    pub fn minimal() -> Self {
        Self {
            decoded_cache_tiles: 64,
            render_cache_tiles: 128,
            swap_arena_capacity: 16 * 1024 * 1024,
            pool_high_water: 16,
            ..Default::default()
        }
    }

    /// Clamp values that would make the pipeline unusable
    pub fn validate(mut self) -> Self {
        self.decoded_cache_tiles = self.decoded_cache_tiles.max(1);
        self.render_cache_tiles = self.render_cache_tiles.max(1);
        self.swap_arena_capacity = self.swap_arena_capacity.max(1);
        self.anim_tick_ms = self.anim_tick_ms.max(1);
        self.update_slot_ms = self.update_slot_ms.max(1);
        self.update_slots = self.update_slots.max(1);
        self
    }
}
