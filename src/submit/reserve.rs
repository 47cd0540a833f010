//! Binding, pinning and fencing the exec list

use crate::device::{DeviceState, Shared};
use crate::error::{GemError, GemResult};
use crate::mm::{BindRequest, BufferObject, ObjectId, Tiling, PAGE_SIZE};

use super::{ExecObject, ExecObjectFlags};

fn needs_fence(exec: &ExecObject, obj: &BufferObject) -> bool {
    exec.flags.contains(ExecObjectFlags::NEEDS_FENCE) && obj.tiling != Tiling::None
}

fn bind_request(exec: &ExecObject, obj: &BufferObject) -> BindRequest {
    let fenced = needs_fence(exec, obj);
    let mut alignment = exec.alignment.max(PAGE_SIZE);
    if fenced {
        alignment = alignment.max(obj.fence_alignment());
    }
    BindRequest {
        alignment,
        mappable: fenced || exec.flags.contains(ExecObjectFlags::NEEDS_MAPPABLE),
        may_block: true,
    }
}

/// Pins and fences held for one submission attempt
///
/// The address space journals every bind and unbind made while the
/// reservation is open; [`unwind`](Self::unwind) puts them all back.
#[derive(Debug, Default)]
pub(super) struct Reservation {
    pins: Vec<ObjectId>,
    fences: Vec<ObjectId>,
}

impl Reservation {
    /// Bind and pin every object, mappable ones first
    ///
    /// When the space is full the attempt lets go of its pins, retires
    /// finished work (waiting for the GPU to idle unless `nonblocking`),
    /// evicts everything it can and runs the whole pass once more.
    pub(super) fn reserve(
        st: &mut DeviceState,
        shared: &Shared,
        entries: &[(ObjectId, &ExecObject)],
        nonblocking: bool,
    ) -> GemResult<Self> {
        st.gtt.begin_journal();
        let mut res = Reservation::default();
        let outcome = match res.place(st, shared, entries) {
            Err(GemError::NoSpace) => res.retry_after_eviction(st, shared, entries, nonblocking),
            other => other,
        };
        match outcome {
            Ok(()) => Ok(res),
            Err(e) => {
                log::debug!("submit: reservation failed: {}", e);
                res.unwind(st);
                Err(e)
            }
        }
    }

    fn retry_after_eviction(
        &mut self,
        st: &mut DeviceState,
        shared: &Shared,
        entries: &[(ObjectId, &ExecObject)],
        nonblocking: bool,
    ) -> GemResult<()> {
        self.drop_holds(st);
        self.pins.clear();
        self.fences.clear();

        let retired = st.idle_and_retire(shared, !nonblocking)?;
        let evicted = st.gtt.evict_everything();
        log::debug!(
            "submit: out of space, retired {} requests and evicted {} bindings",
            retired,
            evicted
        );
        self.place(st, shared, entries)
    }

    fn place(
        &mut self,
        st: &mut DeviceState,
        shared: &Shared,
        entries: &[(ObjectId, &ExecObject)],
    ) -> GemResult<()> {
        let mut order: Vec<(ObjectId, &ExecObject)> = entries.to_vec();
        order.sort_by_key(|(_, exec)| !exec.flags.contains(ExecObjectFlags::NEEDS_MAPPABLE));

        // Keep what already fits; move what does not once the GPU is done with it.
        for &(id, exec) in &order {
            let req = bind_request(exec, st.objects.get(id)?);
            let Some(binding) = st.gtt.binding(id).copied() else {
                continue;
            };
            if binding.satisfies(&req) {
                st.gtt.pin(id)?;
                self.pins.push(id);
                continue;
            }
            if binding.is_active() {
                st.wait_object_idle(id, shared, false)?;
            }
            st.gtt.unbind(id)?;
        }

        for &(id, exec) in &order {
            if self.pins.contains(&id) {
                continue;
            }
            let obj = st.objects.get(id)?;
            st.gtt.bind(obj, bind_request(exec, obj))?;
            st.gtt.pin(id)?;
            self.pins.push(id);
        }

        for &(id, exec) in &order {
            let obj = st.objects.get(id)?;
            if needs_fence(exec, obj) {
                st.gtt.get_fence(obj)?;
                st.gtt.pin_fence(id);
                self.fences.push(id);
            }
        }
        Ok(())
    }

    /// Objects that hold a fence for this submission
    pub(super) fn fenced(&self) -> &[ObjectId] {
        &self.fences
    }

    /// Drop pins and fences, keeping the new placement
    pub(super) fn release(self, st: &mut DeviceState) {
        self.drop_holds(st);
        st.gtt.take_journal();
    }

    /// Drop pins and fences and restore the previous placement
    ///
    /// Fence slots taken by this attempt go back to their previous owners.
    pub(super) fn unwind(self, st: &mut DeviceState) {
        self.drop_holds(st);
        let journal = st.gtt.take_journal();
        st.gtt.rollback(journal);
    }

    fn drop_holds(&self, st: &mut DeviceState) {
        for &id in &self.fences {
            st.gtt.unpin_fence(id);
        }
        for &id in &self.pins {
            st.gtt.unpin(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_objects_go_mappable() {
        let mut store = crate::mm::ObjectStore::new();
        let id = store.create(64 * 1024).unwrap();
        store.get_mut(id).unwrap().tiling = Tiling::X;
        let obj = store.get(id).unwrap();

        let plain = ExecObject::new(id);
        let req = bind_request(&plain, obj);
        assert!(!req.mappable);
        assert_eq!(req.alignment, PAGE_SIZE);

        let fenced = ExecObject::new(id).with_flags(ExecObjectFlags::NEEDS_FENCE);
        let req = bind_request(&fenced, obj);
        assert!(req.mappable);
        assert_eq!(req.alignment, obj.fence_alignment());
    }

    #[test]
    fn test_fence_ignored_for_linear() {
        let mut store = crate::mm::ObjectStore::new();
        let id = store.create(PAGE_SIZE).unwrap();
        let exec = ExecObject::new(id)
            .with_flags(ExecObjectFlags::NEEDS_FENCE)
            .with_alignment(2 * PAGE_SIZE);
        let req = bind_request(&exec, store.get(id).unwrap());
        assert!(!req.mappable);
        assert_eq!(req.alignment, 2 * PAGE_SIZE);
    }
}
