//! Update coalescer
//!
//! Batches damage notifications: an image that reports updates any number
//! of times within one slot is flushed once, when the ring reaches that slot.

use crate::ImageId;

/// Ring of update slots
#[derive(Debug)]
pub struct Updater {
    slots: Vec<Vec<ImageId>>,
    current: usize,
    slot_ms: u32,
}

impl Updater {
    pub fn new(slots: usize, slot_ms: u32) -> Self {
        Self {
            slots: vec![Vec::new(); slots.max(1)],
            current: 0,
            slot_ms: slot_ms.max(1),
        }
    }

    pub fn slot_ms(&self) -> u32 {
        self.slot_ms
    }

    /// Queue `id` for the next slot
    pub fn have_updates(&mut self, id: ImageId) {
        let next = (self.current + 1) % self.slots.len();
        let slot = &mut self.slots[next];
        if !slot.contains(&id) {
            slot.push(id);
        }
    }

    /// Forget every queued flush for `id`
    pub fn cancel(&mut self, id: ImageId) {
        for slot in &mut self.slots {
            slot.retain(|queued| *queued != id);
        }
    }

    /// Advance one slot and take the images queued there
    pub fn tick(&mut self) -> Vec<ImageId> {
        self.current = (self.current + 1) % self.slots.len();
        std::mem::take(&mut self.slots[self.current])
    }

    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }
}
