//! Animation module
//!
//! Per-image frame-advance state and the shared timer that drives it.
//!
//! The timer fires [`AnimProvider::switch_frame`] through the context; the
//! switch itself (disposal, advance, compositing) happens on the next paint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Color, ImageId};

/// What happens to a frame's area before the next frame is drawn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposal {
    /// Leave the frame in place
    #[default]
    Leave,
    /// Refill the backing store with the background colour
    RestoreBackground,
    /// Keep the backing store; frames never draw outside their own rectangle
    RestorePrevious,
}

impl Disposal {
    /// Apply to a composited backing store
    pub fn apply(&self, backing: &mut tiny_skia::Pixmap, background: Color) {
        match self {
            Disposal::Leave | Disposal::RestorePrevious => {}
            Disposal::RestoreBackground => fill(backing, background),
        }
    }
}

/// Fill a whole pixmap with one colour
pub(crate) fn fill(pixmap: &mut tiny_skia::Pixmap, color: Color) {
    let px = color.premultiplied();
    for dst in pixmap.data_mut().chunks_exact_mut(4) {
        dst.copy_from_slice(&px);
    }
}

/// Animation state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnimState {
    /// Showing a frame, waiting for its delay to run out
    #[default]
    WaitingForTick,
    /// Delay ran out; the next paint advances the frame
    Switching,
}

/// Frame-advance state of one animated image
#[derive(Debug, Default)]
pub struct AnimProvider {
    state: AnimState,
    frame: usize,
    /// Frames composited up to and including `frame`
    backing: Option<tiny_skia::Pixmap>,
    /// A tick is scheduled for the current frame
    armed: bool,
    stopped: bool,
}

impl AnimProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AnimState {
        self.state
    }

    /// Index of the frame on screen
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Timer callback: request a switch on the next paint
    pub fn switch_frame(&mut self) {
        self.armed = false;
        if !self.stopped {
            self.state = AnimState::Switching;
        }
    }

    pub fn is_switch_pending(&self) -> bool {
        self.state == AnimState::Switching
    }

    /// Move to `next`, finishing a pending switch
    pub fn advance_to(&mut self, next: usize) {
        tracing::trace!("Animation frame {} -> {}", self.frame, next);
        self.frame = next;
        self.state = AnimState::WaitingForTick;
    }

    /// Keep the current frame; the next tick retries the switch
    pub fn postpone(&mut self) {
        self.state = AnimState::WaitingForTick;
    }

    pub fn backing(&self) -> Option<&tiny_skia::Pixmap> {
        self.backing.as_ref()
    }

    pub fn backing_mut(&mut self) -> Option<&mut tiny_skia::Pixmap> {
        self.backing.as_mut()
    }

    pub fn set_backing(&mut self, backing: tiny_skia::Pixmap) {
        self.backing = Some(backing);
    }

    /// Force the backing store to be rebuilt from the frames
    pub fn invalidate_backing(&mut self) {
        self.backing = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn set_armed(&mut self, armed: bool) {
        self.armed = armed;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.armed = false;
        self.state = AnimState::WaitingForTick;
    }

    pub fn resume(&mut self) {
        self.stopped = false;
    }
}

/// Shared animation scheduler
///
/// Holds the remaining delay of every armed image and counts it down in
/// fixed ticks.
#[derive(Debug)]
pub struct AnimTimer {
    tick_ms: u32,
    min_delay_ms: u32,
    pending: BTreeMap<ImageId, u32>,
}

impl AnimTimer {
    pub fn new(tick_ms: u32, min_delay_ms: u32) -> Self {
        Self {
            tick_ms: tick_ms.max(1),
            min_delay_ms,
            pending: BTreeMap::new(),
        }
    }

    pub fn tick_ms(&self) -> u32 {
        self.tick_ms
    }

    /// Arm `id` to fire after `delay_ms`, clamped up to the minimum delay
    pub fn schedule(&mut self, id: ImageId, delay_ms: u32) {
        self.pending.insert(id, delay_ms.max(self.min_delay_ms));
    }

    pub fn cancel(&mut self, id: ImageId) {
        self.pending.remove(&id);
    }

    /// Remaining delay of an armed image
    pub fn pending(&self, id: ImageId) -> Option<u32> {
        self.pending.get(&id).copied()
    }

    /// Count every entry down by one tick; returns the ones that ran out
    pub fn tick(&mut self) -> Vec<ImageId> {
        let mut fired = Vec::new();
        for (id, remaining) in self.pending.iter_mut() {
            *remaining = remaining.saturating_sub(self.tick_ms);
            if *remaining == 0 {
                fired.push(*id);
            }
        }
        for id in &fired {
            self.pending.remove(id);
        }
        fired
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}
