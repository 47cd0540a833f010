//! GPU virtual address space: bindings, LRU eviction and fences

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::allocator::RangeAllocator;
use super::fence::{encode_fence, FenceRegisters, FenceWriter};
use super::object::{BufferObject, ObjectId, PAGE_SIZE};
use crate::config::GttConfig;
use crate::error::{GemError, GemResult};

/// Placement of one object in this address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Bound object
    pub object: ObjectId,
    /// GPU virtual offset
    pub offset: u64,
    /// Bound size
    pub size: u64,
    /// Lies entirely within the CPU-mappable aperture
    pub mappable: bool,
    /// Fence register held, if any
    pub fence: Option<usize>,
    /// Pins that block eviction (reservation, scanout)
    pub pin_count: u32,
    /// Unretired requests referencing the binding
    pub active_refs: u32,
    lru_stamp: u64,
}

impl Binding {
    /// On the active list
    pub fn is_active(&self) -> bool {
        self.active_refs > 0
    }

    /// Pinned in place
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// End of the bound range
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Placement meets the alignment and aperture constraints
    pub fn satisfies(&self, req: &BindRequest) -> bool {
        self.offset % req.alignment.max(1) == 0 && (!req.mappable || self.mappable)
    }
}

/// Placement constraints for [`AddressSpace::bind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRequest {
    /// Required offset alignment
    pub alignment: u64,
    /// Must lie inside the mappable aperture
    pub mappable: bool,
    /// Eviction is allowed
    pub may_block: bool,
}

impl Default for BindRequest {
    fn default() -> Self {
        Self {
            alignment: PAGE_SIZE,
            mappable: false,
            may_block: true,
        }
    }
}

/// A fence slot handed to a new owner while a journal was open
#[derive(Debug, Clone, Copy)]
struct FenceChange {
    slot: usize,
    owner: ObjectId,
    previous: Option<(ObjectId, u32)>,
}

/// Changes recorded while a journal is open, for rollback
#[derive(Debug, Default, Clone)]
pub struct BindJournal {
    created: Vec<ObjectId>,
    removed: Vec<Binding>,
    fences: Vec<FenceChange>,
}

impl BindJournal {
    /// Nothing was changed
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.fences.is_empty()
    }
}

/// Comparable view of which ranges are occupied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    /// `(object, offset, size)` sorted by offset
    pub bindings: Vec<(ObjectId, u64, u64)>,
    /// Bytes not allocated
    pub free_bytes: u64,
}

/// Counters for reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpaceStats {
    /// Successful binds
    pub binds: u64,
    /// Unbinds of any cause
    pub unbinds: u64,
    /// Bindings removed by eviction
    pub evictions: u64,
    /// Fence registers taken from another owner
    pub fence_steals: u64,
    /// Bytes currently bound
    pub bound_bytes: u64,
    /// Bindings on the active list
    pub active: usize,
    /// Bindings on the inactive list
    pub inactive: usize,
}

/// The global GTT
///
/// Every binding is tracked in exactly one of `active` (referenced by
/// unretired work) or `inactive` (LRU order, evictable unless pinned).
pub struct AddressSpace {
    alloc: RangeAllocator,
    mappable_end: u64,
    bindings: HashMap<ObjectId, Binding>,
    inactive: BTreeMap<u64, ObjectId>,
    active: BTreeSet<ObjectId>,
    clock: u64,
    fences: FenceRegisters,
    fence_writer: Arc<dyn FenceWriter>,
    journal: Option<BindJournal>,
    stats: AddressSpaceStats,
}

impl AddressSpace {
    /// Empty address space sized from the configuration
    pub fn new(config: &GttConfig, fence_writer: Arc<dyn FenceWriter>) -> Self {
        Self {
            alloc: RangeAllocator::new(0..config.size),
            mappable_end: config.mappable_size.min(config.size),
            bindings: HashMap::new(),
            inactive: BTreeMap::new(),
            active: BTreeSet::new(),
            clock: 0,
            fences: FenceRegisters::new(config.fence_registers),
            fence_writer,
            journal: None,
            stats: AddressSpaceStats::default(),
        }
    }

    /// End of the CPU-mappable aperture
    pub fn mappable_end(&self) -> u64 {
        self.mappable_end
    }

    /// Binding of `object`, if bound
    pub fn binding(&self, object: ObjectId) -> Option<&Binding> {
        self.bindings.get(&object)
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Nothing bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Inactive bindings, least recently used first
    pub fn inactive_lru(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.inactive.values().copied()
    }

    /// Active bindings
    pub fn active(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.active.iter().copied()
    }

    /// Counters and list sizes
    pub fn stats(&self) -> AddressSpaceStats {
        let mut stats = self.stats.clone();
        stats.bound_bytes = self.bindings.values().map(|b| b.size).sum();
        stats.active = self.active.len();
        stats.inactive = self.inactive.len();
        stats
    }

    /// Fence slots in use
    pub fn fences_in_use(&self) -> usize {
        self.fences.in_use()
    }

    /// Snapshot of occupied ranges
    pub fn occupancy(&self) -> Occupancy {
        let mut bindings: Vec<_> = self
            .bindings
            .values()
            .map(|b| (b.object, b.offset, b.size))
            .collect();
        bindings.sort_by_key(|&(_, offset, _)| offset);
        Occupancy {
            bindings,
            free_bytes: self.alloc.free_bytes(),
        }
    }

    fn limit(&self, mappable: bool) -> Range<u64> {
        if mappable {
            0..self.mappable_end
        } else {
            self.alloc.span()
        }
    }

    fn stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Start recording binds and unbinds for [`rollback`](Self::rollback)
    pub fn begin_journal(&mut self) {
        self.journal = Some(BindJournal::default());
    }

    /// Stop recording and hand back what changed
    pub fn take_journal(&mut self) -> BindJournal {
        self.journal.take().unwrap_or_default()
    }

    /// Undo a journal: drop created bindings, restore removed ones in place
    /// and hand stolen fence slots back
    ///
    /// Callers release their pins on created bindings first. A restored
    /// binding regains a fence only if the slot was stolen from it.
    pub fn rollback(&mut self, journal: BindJournal) {
        self.journal = None;
        for object in journal.created.into_iter().rev() {
            if let Err(e) = self.unbind(object) {
                log::warn!("gtt: rollback could not drop {}: {}", object, e);
            }
        }
        for mut binding in journal.removed.into_iter().rev() {
            if self.bindings.contains_key(&binding.object) {
                continue;
            }
            if !self.alloc.reserve(binding.offset, binding.size) {
                log::warn!(
                    "gtt: rollback could not restore {} at {:#x}",
                    binding.object,
                    binding.offset
                );
                continue;
            }
            binding.fence = None;
            binding.pin_count = 0;
            binding.active_refs = 0;
            self.inactive.insert(binding.lru_stamp, binding.object);
            self.bindings.insert(binding.object, binding);
        }
        for change in journal.fences.into_iter().rev() {
            self.undo_fence(change);
        }
    }

    fn undo_fence(&mut self, change: FenceChange) {
        if self.fences.owner(change.slot) == Some(change.owner) {
            self.fences.release(change.owner);
            self.fence_writer.write_fence(change.slot, 0);
            if let Some(b) = self.bindings.get_mut(&change.owner) {
                b.fence = None;
            }
        }
        let Some((prev, value)) = change.previous else {
            return;
        };
        if self.fences.owner(change.slot).is_some() {
            return;
        }
        match self.bindings.get_mut(&prev) {
            Some(b) if b.fence.is_none() => {
                b.fence = Some(change.slot);
                self.fences.assign(change.slot, prev, value);
                self.fence_writer.write_fence(change.slot, value);
                log::trace!("gtt: fence {} returned to {}", change.slot, prev);
            }
            _ => {}
        }
    }

    /// Find or create a binding for `obj`
    ///
    /// An existing binding that violates the constraints is unbound first,
    /// which fails with `StillActive` while GPU work references it. When no
    /// free range fits, LRU eviction runs if `may_block` is set.
    pub fn bind(&mut self, obj: &BufferObject, req: BindRequest) -> GemResult<Binding> {
        if let Some(existing) = self.bindings.get(&obj.id).copied() {
            if existing.satisfies(&req) {
                return Ok(existing);
            }
            log::debug!(
                "gtt: rebinding {} (offset {:#x}, mappable {})",
                obj.id,
                existing.offset,
                existing.mappable
            );
            self.unbind(obj.id)?;
        }

        let size = obj.size;
        let limit = self.limit(req.mappable);
        let offset = match self.alloc.allocate(size, req.alignment, limit.clone()) {
            Some(offset) => offset,
            None if !req.may_block => return Err(GemError::WouldBlock),
            None => {
                self.evict_for(size, req.alignment, req.mappable)?;
                self.alloc
                    .allocate(size, req.alignment, limit)
                    .ok_or(GemError::NoSpace)?
            }
        };

        let stamp = self.stamp();
        let binding = Binding {
            object: obj.id,
            offset,
            size,
            mappable: offset + size <= self.mappable_end,
            fence: None,
            pin_count: 0,
            active_refs: 0,
            lru_stamp: stamp,
        };
        self.inactive.insert(stamp, obj.id);
        self.bindings.insert(obj.id, binding);
        if let Some(journal) = self.journal.as_mut() {
            journal.created.push(obj.id);
        }
        self.stats.binds += 1;
        log::trace!("gtt: bound {} at {:#x}+{:#x}", obj.id, offset, size);
        Ok(binding)
    }

    /// Remove a binding and return its range
    ///
    /// Unbinding an unbound object is a no-op.
    pub fn unbind(&mut self, object: ObjectId) -> GemResult<()> {
        let Some(binding) = self.bindings.get(&object).copied() else {
            return Ok(());
        };
        if binding.is_active() || binding.is_pinned() {
            return Err(GemError::StillActive);
        }
        if let Some(slot) = self.fences.release(object) {
            self.fence_writer.write_fence(slot, 0);
        }
        self.inactive.remove(&binding.lru_stamp);
        self.bindings.remove(&object);
        self.alloc.free(binding.offset, binding.size);
        if let Some(journal) = self.journal.as_mut() {
            // A binding made under this journal has nothing to restore.
            match journal.created.iter().position(|&o| o == object) {
                Some(pos) => {
                    journal.created.remove(pos);
                }
                None => journal.removed.push(binding),
            }
        }
        self.stats.unbinds += 1;
        Ok(())
    }

    /// Unbind an object that is being destroyed
    ///
    /// Unlike [`unbind`](Self::unbind) this is never journaled, so a rollback
    /// cannot resurrect a binding for a freed object.
    pub fn release(&mut self, object: ObjectId) -> GemResult<()> {
        let journal = self.journal.take();
        let res = self.unbind(object);
        self.journal = journal;
        res
    }

    /// Evict inactive, unpinned bindings in LRU order until a hole of
    /// `min_size` at `alignment` opens in the requested region
    ///
    /// Only the bindings overlapping the hole found are unbound.
    pub fn evict_for(&mut self, min_size: u64, alignment: u64, requires_mappable: bool) -> GemResult<()> {
        let limit = self.limit(requires_mappable);
        let mut roster: Vec<(Range<u64>, ObjectId)> = Vec::new();
        let mut found = None;

        for object in self.inactive.values() {
            let binding = &self.bindings[object];
            if binding.is_pinned() || binding.offset >= limit.end {
                continue;
            }
            roster.push((binding.offset..binding.end(), *object));
            let extra: Vec<Range<u64>> = roster.iter().map(|(r, _)| r.clone()).collect();
            if let Some(addr) = self.alloc.find_fit_with(&extra, min_size, alignment, limit.clone()) {
                found = Some(addr);
                break;
            }
        }

        let addr = found.ok_or_else(|| {
            log::debug!(
                "gtt: eviction for {:#x} bytes (mappable {}) found nothing",
                min_size,
                requires_mappable
            );
            GemError::NoSpace
        })?;
        let hole = addr..addr + min_size;
        let victims: Vec<ObjectId> = roster
            .into_iter()
            .filter(|(r, _)| r.start < hole.end && hole.start < r.end)
            .map(|(_, o)| o)
            .collect();
        for object in victims {
            log::debug!("gtt: evicting {}", object);
            self.unbind(object)?;
            self.stats.evictions += 1;
        }
        Ok(())
    }

    /// Unbind every inactive, unpinned binding; returns how many went
    pub fn evict_everything(&mut self) -> usize {
        let victims: Vec<ObjectId> = self
            .inactive
            .values()
            .copied()
            .filter(|o| !self.bindings[o].is_pinned())
            .collect();
        let mut count = 0;
        for object in victims {
            if self.unbind(object).is_ok() {
                self.stats.evictions += 1;
                count += 1;
            }
        }
        log::debug!("gtt: evicted everything ({} bindings)", count);
        count
    }

    /// Take a pin on an existing binding
    pub fn pin(&mut self, object: ObjectId) -> GemResult<()> {
        let binding = self
            .bindings
            .get_mut(&object)
            .ok_or(GemError::InvalidHandle(object.0))?;
        binding.pin_count += 1;
        Ok(())
    }

    /// Drop a pin
    pub fn unpin(&mut self, object: ObjectId) {
        if let Some(binding) = self.bindings.get_mut(&object) {
            binding.pin_count = binding.pin_count.saturating_sub(1);
        }
    }

    /// Reference the binding from a new request, moving it to the active list
    pub fn mark_active(&mut self, object: ObjectId) {
        if let Some(binding) = self.bindings.get_mut(&object) {
            if binding.active_refs == 0 {
                self.inactive.remove(&binding.lru_stamp);
                self.active.insert(object);
            }
            binding.active_refs += 1;
        }
    }

    /// Drop a request reference; the last one moves the binding to the LRU tail
    pub fn mark_retired(&mut self, object: ObjectId) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(binding) = self.bindings.get_mut(&object) {
            binding.active_refs = binding.active_refs.saturating_sub(1);
            if binding.active_refs == 0 && self.active.remove(&object) {
                binding.lru_stamp = stamp;
                self.inactive.insert(stamp, object);
            }
        }
    }

    /// Move an inactive binding to the most-recently-used end
    pub fn touch(&mut self, object: ObjectId) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(binding) = self.bindings.get_mut(&object) {
            if !binding.is_active() && self.inactive.remove(&binding.lru_stamp).is_some() {
                binding.lru_stamp = stamp;
                self.inactive.insert(stamp, object);
            }
        }
    }

    /// Acquire a fence register for a bound, mappable object
    ///
    /// Reuses the object's slot if it has one, else takes a free slot or
    /// steals the least recently used one from an idle, unpinned owner.
    pub fn get_fence(&mut self, obj: &BufferObject) -> GemResult<usize> {
        let binding = *self
            .bindings
            .get(&obj.id)
            .ok_or(GemError::InvalidHandle(obj.id.0))?;
        if !binding.mappable {
            return Err(GemError::InvalidArgument(format!(
                "{} is not in the mappable aperture",
                obj.id
            )));
        }
        if let Some(slot) = binding.fence {
            self.fences.touch(slot);
            return Ok(slot);
        }

        let bindings = &self.bindings;
        let slot = self
            .fences
            .find_victim(|owner| bindings.get(&owner).map_or(false, |b| b.is_active() || b.is_pinned()))
            .ok_or(GemError::NoSpace)?;
        let previous_value = self.fences.value(slot);
        let value = encode_fence(binding.offset, binding.size, obj.tiling);
        let prev = self.fences.assign(slot, obj.id, value);
        if let Some(prev) = prev {
            if let Some(b) = self.bindings.get_mut(&prev) {
                b.fence = None;
            }
            self.stats.fence_steals += 1;
            log::debug!("gtt: fence {} stolen from {} for {}", slot, prev, obj.id);
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.fences.push(FenceChange {
                slot,
                owner: obj.id,
                previous: prev.map(|p| (p, previous_value)),
            });
        }
        self.fence_writer.write_fence(slot, value);
        if let Some(b) = self.bindings.get_mut(&obj.id) {
            b.fence = Some(slot);
        }
        Ok(slot)
    }

    /// Hold the object's fence across a submission
    pub fn pin_fence(&mut self, object: ObjectId) {
        if let Some(slot) = self.bindings.get(&object).and_then(|b| b.fence) {
            self.fences.pin(slot);
        }
    }

    /// Release a submission hold on the object's fence
    pub fn unpin_fence(&mut self, object: ObjectId) {
        if let Some(slot) = self.bindings.get(&object).and_then(|b| b.fence) {
            self.fences.unpin(slot);
        }
    }

    /// Clear every fence register, for reset recovery
    pub fn reset_fences(&mut self) {
        for binding in self.bindings.values_mut() {
            binding.fence = None;
        }
        for slot in 0..self.fences.capacity() {
            self.fence_writer.write_fence(slot, 0);
        }
        self.fences.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::fence::NullFenceWriter;
    use crate::mm::object::{ObjectStore, Tiling};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    const MB: u64 = 1 << 20;

    fn space(size: u64, mappable: u64) -> AddressSpace {
        let config = GttConfig {
            size,
            mappable_size: mappable,
            ..GttConfig::default()
        };
        AddressSpace::new(&config, Arc::new(NullFenceWriter))
    }

    fn mappable() -> BindRequest {
        BindRequest {
            mappable: true,
            ..BindRequest::default()
        }
    }

    #[test]
    fn test_bind_reuses_existing_binding() {
        let mut store = ObjectStore::new();
        let mut gtt = space(MB, MB / 2);
        let id = store.create(PAGE_SIZE).unwrap();
        let obj = store.get(id).unwrap();
        let first = gtt.bind(obj, BindRequest::default()).unwrap();
        let second = gtt.bind(obj, BindRequest::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(gtt.len(), 1);
    }

    #[test]
    fn test_misfit_binding_is_replaced() {
        let mut store = ObjectStore::new();
        let mut gtt = space(MB, MB / 2);
        let filler = store.create(PAGE_SIZE).unwrap();
        gtt.bind(store.get(filler).unwrap(), BindRequest::default()).unwrap();
        let id = store.create(PAGE_SIZE).unwrap();
        let obj = store.get(id).unwrap();
        let first = gtt.bind(obj, BindRequest::default()).unwrap();
        let aligned = gtt
            .bind(
                obj,
                BindRequest {
                    alignment: 64 * 1024,
                    ..BindRequest::default()
                },
            )
            .unwrap();
        assert_eq!(first.offset, PAGE_SIZE);
        assert_eq!(aligned.offset, 64 * 1024);
        assert_eq!(gtt.len(), 2);
    }

    #[test]
    fn test_unbind_refuses_active_and_pinned() {
        let mut store = ObjectStore::new();
        let mut gtt = space(MB, MB);
        let id = store.create(PAGE_SIZE).unwrap();
        gtt.bind(store.get(id).unwrap(), BindRequest::default()).unwrap();
        gtt.mark_active(id);
        assert!(matches!(gtt.unbind(id), Err(GemError::StillActive)));
        gtt.mark_retired(id);
        gtt.pin(id).unwrap();
        assert!(matches!(gtt.unbind(id), Err(GemError::StillActive)));
        gtt.unpin(id);
        gtt.unbind(id).unwrap();
        assert!(gtt.is_empty());
    }

    #[test]
    fn test_eviction_follows_lru_and_skips_pinned() {
        let mut store = ObjectStore::new();
        let mut gtt = space(4 * PAGE_SIZE, 4 * PAGE_SIZE);
        let ids: Vec<_> = (0..4).map(|_| store.create(PAGE_SIZE).unwrap()).collect();
        for id in &ids {
            gtt.bind(store.get(*id).unwrap(), BindRequest::default()).unwrap();
        }
        // Oldest is pinned, second oldest touched: third oldest goes first.
        gtt.pin(ids[0]).unwrap();
        gtt.touch(ids[1]);
        let extra = store.create(PAGE_SIZE).unwrap();
        gtt.bind(store.get(extra).unwrap(), BindRequest::default()).unwrap();

        assert!(gtt.binding(ids[0]).is_some());
        assert!(gtt.binding(ids[1]).is_some());
        assert!(gtt.binding(ids[2]).is_none());
        assert_eq!(gtt.stats().evictions, 1);
    }

    #[test]
    fn test_active_bindings_never_evicted() {
        let mut store = ObjectStore::new();
        let mut gtt = space(2 * PAGE_SIZE, 2 * PAGE_SIZE);
        let a = store.create(PAGE_SIZE).unwrap();
        let b = store.create(PAGE_SIZE).unwrap();
        gtt.bind(store.get(a).unwrap(), BindRequest::default()).unwrap();
        gtt.bind(store.get(b).unwrap(), BindRequest::default()).unwrap();
        gtt.mark_active(a);
        gtt.mark_active(b);
        let c = store.create(PAGE_SIZE).unwrap();
        let res = gtt.bind(store.get(c).unwrap(), BindRequest::default());
        assert!(matches!(res, Err(GemError::NoSpace)));
        assert_eq!(gtt.len(), 2);
    }

    #[test]
    fn test_no_block_reports_would_block() {
        let mut store = ObjectStore::new();
        let mut gtt = space(PAGE_SIZE, PAGE_SIZE);
        let a = store.create(PAGE_SIZE).unwrap();
        let b = store.create(PAGE_SIZE).unwrap();
        gtt.bind(store.get(a).unwrap(), BindRequest::default()).unwrap();
        let res = gtt.bind(
            store.get(b).unwrap(),
            BindRequest {
                may_block: false,
                ..BindRequest::default()
            },
        );
        assert!(matches!(res, Err(GemError::WouldBlock)));
    }

    #[test]
    fn test_evict_for_frees_only_overlapping_hole() {
        let mut store = ObjectStore::new();
        let mut gtt = space(4 * PAGE_SIZE, 4 * PAGE_SIZE);
        let ids: Vec<_> = (0..4).map(|_| store.create(PAGE_SIZE).unwrap()).collect();
        for id in &ids {
            gtt.bind(store.get(*id).unwrap(), BindRequest::default()).unwrap();
        }
        gtt.evict_for(PAGE_SIZE, PAGE_SIZE, false).unwrap();
        assert_eq!(gtt.len(), 3);
        assert!(gtt.binding(ids[0]).is_none());
    }

    #[test]
    fn test_journal_rollback_restores_occupancy() {
        let mut store = ObjectStore::new();
        let mut gtt = space(2 * PAGE_SIZE, 2 * PAGE_SIZE);
        let a = store.create(PAGE_SIZE).unwrap();
        let b = store.create(PAGE_SIZE).unwrap();
        gtt.bind(store.get(a).unwrap(), BindRequest::default()).unwrap();
        gtt.bind(store.get(b).unwrap(), BindRequest::default()).unwrap();
        let before = gtt.occupancy();

        gtt.begin_journal();
        let c = store.create(2 * PAGE_SIZE).unwrap();
        gtt.bind(store.get(c).unwrap(), BindRequest::default()).unwrap();
        assert_ne!(gtt.occupancy(), before);
        let journal = gtt.take_journal();
        gtt.rollback(journal);

        assert_eq!(gtt.occupancy(), before);
        assert_eq!(gtt.inactive_lru().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_released_binding_survives_rollback() {
        let mut store = ObjectStore::new();
        let mut gtt = space(MB, MB);
        let a = store.create(PAGE_SIZE).unwrap();
        gtt.bind(store.get(a).unwrap(), BindRequest::default()).unwrap();

        gtt.begin_journal();
        gtt.release(a).unwrap();
        let journal = gtt.take_journal();
        assert!(journal.is_empty());
        gtt.rollback(journal);
        assert!(gtt.binding(a).is_none());
    }

    #[test]
    fn test_rebind_under_journal_rolls_back_cleanly() {
        let mut store = ObjectStore::new();
        let mut gtt = space(MB, MB);
        let a = store.create(PAGE_SIZE).unwrap();
        let before = gtt.occupancy();

        gtt.begin_journal();
        gtt.bind(store.get(a).unwrap(), BindRequest::default()).unwrap();
        gtt.evict_everything();
        gtt.bind(store.get(a).unwrap(), BindRequest::default()).unwrap();
        let journal = gtt.take_journal();
        gtt.rollback(journal);

        assert_eq!(gtt.occupancy(), before);
        assert!(gtt.binding(a).is_none());
    }

    #[derive(Default)]
    struct RecordingWriter(Mutex<Vec<(usize, u32)>>);

    impl FenceWriter for RecordingWriter {
        fn write_fence(&self, slot: usize, value: u32) {
            self.0.lock().push((slot, value));
        }
    }

    #[test]
    fn test_fence_lifecycle() {
        let writer = Arc::new(RecordingWriter::default());
        let config = GttConfig {
            size: MB,
            mappable_size: MB,
            fence_registers: 1,
            ..GttConfig::default()
        };
        let mut gtt = AddressSpace::new(&config, writer.clone());
        let mut store = ObjectStore::new();
        let a = store.create(PAGE_SIZE).unwrap();
        let b = store.create(PAGE_SIZE).unwrap();
        store.get_mut(a).unwrap().tiling = Tiling::X;
        store.get_mut(b).unwrap().tiling = Tiling::Y;
        gtt.bind(store.get(a).unwrap(), mappable()).unwrap();
        gtt.bind(store.get(b).unwrap(), mappable()).unwrap();

        assert_eq!(gtt.get_fence(store.get(a).unwrap()).unwrap(), 0);
        gtt.mark_active(a);
        assert!(matches!(gtt.get_fence(store.get(b).unwrap()), Err(GemError::NoSpace)));
        gtt.mark_retired(a);
        assert_eq!(gtt.get_fence(store.get(b).unwrap()).unwrap(), 0);
        assert!(gtt.binding(a).unwrap().fence.is_none());
        assert_eq!(gtt.stats().fence_steals, 1);

        gtt.unbind(b).unwrap();
        assert_eq!(writer.0.lock().last(), Some(&(0, 0)));
        assert_eq!(gtt.fences_in_use(), 0);
    }

    #[test]
    fn test_rollback_returns_stolen_fence() {
        let writer = Arc::new(RecordingWriter::default());
        let config = GttConfig {
            size: MB,
            mappable_size: MB,
            fence_registers: 1,
            ..GttConfig::default()
        };
        let mut gtt = AddressSpace::new(&config, writer.clone());
        let mut store = ObjectStore::new();
        let a = store.create(PAGE_SIZE).unwrap();
        let b = store.create(PAGE_SIZE).unwrap();
        store.get_mut(a).unwrap().tiling = Tiling::X;
        store.get_mut(b).unwrap().tiling = Tiling::Y;
        gtt.bind(store.get(a).unwrap(), mappable()).unwrap();
        gtt.bind(store.get(b).unwrap(), mappable()).unwrap();
        gtt.get_fence(store.get(a).unwrap()).unwrap();
        let programmed = *writer.0.lock().last().unwrap();

        gtt.begin_journal();
        gtt.get_fence(store.get(b).unwrap()).unwrap();
        assert_eq!(gtt.binding(b).unwrap().fence, Some(0));
        let journal = gtt.take_journal();
        gtt.rollback(journal);

        assert_eq!(gtt.binding(a).unwrap().fence, Some(0));
        assert!(gtt.binding(b).unwrap().fence.is_none());
        assert_eq!(gtt.fences_in_use(), 1);
        assert_eq!(writer.0.lock().last(), Some(&programmed));
    }
}
