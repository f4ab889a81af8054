//! Image context
//!
//! Owns everything images share: both tile caches, the swap arenas, the
//! animation timer and the update coalescer. Built once by the host and
//! passed to every image operation; it must outlive every image.

use crate::animation::AnimTimer;
use crate::config::ImageConfig;
use crate::tile::TileResources;
use crate::updater::Updater;
use crate::ImageId;

/// Work the host must dispatch to an image after advancing the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Call [`Image::switch_frame`](crate::Image::switch_frame)
    SwitchFrame(ImageId),
    /// Call [`Image::flush_updates`](crate::Image::flush_updates)
    FlushUpdates(ImageId),
}

/// Shared image pipeline state
#[derive(Debug)]
pub struct ImageContext {
    config: ImageConfig,
    pub tiles: TileResources,
    pub anim: AnimTimer,
    pub updater: Updater,
    next_id: u32,
    /// Milliseconds not yet consumed by a whole tick
    anim_clock: u32,
    update_clock: u32,
}

impl Default for ImageContext {
    fn default() -> Self {
        Self::new(ImageConfig::default())
    }
}

impl ImageContext {
    pub fn new(config: ImageConfig) -> Self {
        let config = config.validate();
        Self {
            tiles: TileResources::new(&config),
            anim: AnimTimer::new(config.anim_tick_ms, config.min_frame_delay_ms),
            updater: Updater::new(config.update_slots, config.update_slot_ms),
            config,
            next_id: 0,
            anim_clock: 0,
            update_clock: 0,
        }
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn next_image_id(&mut self) -> ImageId {
        self.next_id += 1;
        ImageId(self.next_id)
    }

    /// Run both timers for `elapsed_ms` of wall time
    pub fn advance(&mut self, elapsed_ms: u32) -> Vec<TimerEvent> {
        self.tiles.reclaim();
        let mut events = Vec::new();

        let tick_ms = self.anim.tick_ms();
        self.anim_clock += elapsed_ms;
        while self.anim_clock >= tick_ms {
            self.anim_clock -= tick_ms;
            events.extend(self.anim.tick().into_iter().map(TimerEvent::SwitchFrame));
        }

        let slot_ms = self.updater.slot_ms();
        self.update_clock += elapsed_ms;
        while self.update_clock >= slot_ms {
            self.update_clock -= slot_ms;
            events.extend(self.updater.tick().into_iter().map(TimerEvent::FlushUpdates));
        }

        events
    }

    /// Evict every unpinned tile, e.g. under memory pressure
    pub fn discard_cache(&mut self) {
        let before = self.tiles.decoded.size() + self.tiles.render.size();
        self.tiles.discard_all();
        self.tiles.backing.buffers.clear();
        tracing::debug!("Discarded {} cached tiles", before);
    }
}
