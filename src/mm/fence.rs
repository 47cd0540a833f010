//! Fence-register pool
//!
//! Tiled objects accessed through the aperture need one of a small number of
//! hardware fence registers. Slots are handed out lazily and recycled in
//! least-recently-used order.

use super::object::{ObjectId, Tiling};

/// Default number of fence registers
pub const DEFAULT_FENCE_COUNT: usize = 16;

/// Sink for fence-register programming
///
/// The device implements this on top of the wake gate; tests can record or
/// ignore the writes.
pub trait FenceWriter: Send + Sync {
    /// Program `slot` with an encoded value; zero clears it
    fn write_fence(&self, slot: usize, value: u32);
}

/// Fence writer that discards every write
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFenceWriter;

impl FenceWriter for NullFenceWriter {
    fn write_fence(&self, _slot: usize, _value: u32) {}
}

/// Encode a fence covering `[offset, offset + size)` with the given tiling
pub fn encode_fence(offset: u64, size: u64, tiling: Tiling) -> u32 {
    let pages = ((size + 0xfff) >> 12) as u32;
    let tiling_bits = match tiling {
        Tiling::None => 0,
        Tiling::X => 1,
        Tiling::Y => 2,
    };
    (offset as u32 & !0xfff) | (pages.min(0xff) << 3) | (tiling_bits << 1) | 1
}

#[derive(Debug, Clone, Default)]
struct FenceSlot {
    owner: Option<ObjectId>,
    value: u32,
    pin_count: u32,
    last_used: u64,
}

/// LRU-managed pool of fence registers
#[derive(Debug, Clone)]
pub struct FenceRegisters {
    slots: Vec<FenceSlot>,
    clock: u64,
}

impl FenceRegisters {
    /// Pool with `count` free slots
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![FenceSlot::default(); count],
            clock: 0,
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently owned
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_some()).count()
    }

    /// Slot held by `object`
    pub fn lookup(&self, object: ObjectId) -> Option<usize> {
        self.slots.iter().position(|s| s.owner == Some(object))
    }

    /// Owner of a slot
    pub fn owner(&self, slot: usize) -> Option<ObjectId> {
        self.slots.get(slot).and_then(|s| s.owner)
    }

    /// Pick a slot for a new owner: a free one, else the least recently used
    /// unpinned slot whose owner is not busy
    pub fn find_victim(&self, busy: impl Fn(ObjectId) -> bool) -> Option<usize> {
        if let Some(free) = self.slots.iter().position(|s| s.owner.is_none()) {
            return Some(free);
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.pin_count == 0 && s.owner.map_or(true, |o| !busy(o)))
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i)
    }

    /// Value last programmed into a slot
    pub fn value(&self, slot: usize) -> u32 {
        self.slots.get(slot).map_or(0, |s| s.value)
    }

    /// Give `slot` to `object` programmed with `value`, returning the previous owner
    pub fn assign(&mut self, slot: usize, object: ObjectId, value: u32) -> Option<ObjectId> {
        self.clock += 1;
        let entry = &mut self.slots[slot];
        let prev = entry.owner.replace(object);
        entry.value = value;
        entry.last_used = self.clock;
        prev
    }

    /// Mark a slot most recently used
    pub fn touch(&mut self, slot: usize) {
        self.clock += 1;
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.last_used = self.clock;
        }
    }

    /// Hold a slot across a submission
    pub fn pin(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.pin_count += 1;
        }
    }

    /// Drop a submission hold
    pub fn unpin(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.pin_count = entry.pin_count.saturating_sub(1);
        }
    }

    /// Free whatever slot `object` holds
    pub fn release(&mut self, object: ObjectId) -> Option<usize> {
        let slot = self.lookup(object)?;
        self.slots[slot] = FenceSlot::default();
        Some(slot)
    }

    /// Free every slot
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = FenceSlot::default());
    }
}
