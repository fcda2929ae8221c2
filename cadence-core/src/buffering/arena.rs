//! Index-addressed scratch arena.
//!
//! Every scratch buffer a session needs is allocated once, at session init,
//! with a hard capacity. Callers address slots by index; a write that would
//! exceed a slot's capacity is truncated rather than growing the buffer, so
//! an oversized input can never turn into an unbounded allocation.

/// Handle to one arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(usize);

/// Fixed set of pre-sized `f32` scratch buffers.
#[derive(Debug)]
pub struct ScratchArena {
    slots: Vec<Vec<f32>>,
    limits: Vec<usize>,
}

impl ScratchArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            limits: Vec::new(),
        }
    }

    /// Reserve a slot with a fixed capacity.
    pub fn reserve(&mut self, capacity: usize) -> SlotId {
        self.slots.push(Vec::with_capacity(capacity));
        self.limits.push(capacity);
        SlotId(self.slots.len() - 1)
    }

    pub fn capacity(&self, slot: SlotId) -> usize {
        self.limits[slot.0]
    }

    pub fn get(&self, slot: SlotId) -> &[f32] {
        &self.slots[slot.0]
    }

    pub fn len(&self, slot: SlotId) -> usize {
        self.slots[slot.0].len()
    }

    pub fn remaining(&self, slot: SlotId) -> usize {
        self.limits[slot.0] - self.slots[slot.0].len()
    }

    /// Append up to the slot's remaining capacity; returns the count taken.
    pub fn extend(&mut self, slot: SlotId, samples: &[f32]) -> usize {
        let n = samples.len().min(self.remaining(slot));
        self.slots[slot.0].extend_from_slice(&samples[..n]);
        n
    }

    /// Append decoded samples from an iterator, truncating at capacity.
    pub fn extend_iter(&mut self, slot: SlotId, samples: impl IntoIterator<Item = f32>) -> usize {
        let room = self.remaining(slot);
        let buf = &mut self.slots[slot.0];
        let before = buf.len();
        buf.extend(samples.into_iter().take(room));
        buf.len() - before
    }

    /// Drop the first `n` samples of a slot, keeping the rest in order.
    pub fn consume(&mut self, slot: SlotId, n: usize) {
        let buf = &mut self.slots[slot.0];
        let n = n.min(buf.len());
        buf.drain(..n);
    }

    pub fn clear(&mut self, slot: SlotId) {
        self.slots[slot.0].clear();
    }
}

impl Default for ScratchArena {
    fn default() -> Self {
        Self::new()
    }
}
