//! Relocation staging and the domain plan

use std::collections::BTreeMap;

use crate::device::DeviceState;
use crate::error::{GemError, GemResult};
use crate::hw::EngineId;
use crate::mm::{Domains, ObjectId};
use crate::seqno::seqno_passed;

use super::{ExecFlags, ExecObject, ExecObjectFlags, Relocation, SubmitArgs};

/// A relocation value waiting for the commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct StagedWrite {
    pub(super) object: ObjectId,
    pub(super) offset: u64,
    pub(super) value: u32,
}

/// Everything the commit needs besides the exec list
#[derive(Debug, Default)]
pub(super) struct Plan {
    pub(super) writes: Vec<StagedWrite>,
    pub(super) flush: Domains,
    pub(super) invalidate: Domains,
    pub(super) flips: u32,
    pub(super) semaphores: Vec<(EngineId, u32)>,
}

fn check_domains(reloc: &Relocation) -> GemResult<()> {
    let write = reloc.write_domain;
    if write.bits().count_ones() > 1 {
        return Err(GemError::InvalidDomain(format!(
            "{:?} names more than one write domain",
            write
        )));
    }
    if !Domains::GPU.contains(reloc.read_domains | write) {
        return Err(GemError::InvalidDomain(format!(
            "{:?} reaches outside the GPU domains",
            reloc.read_domains | write
        )));
    }
    Ok(())
}

/// Forget the domains accumulated for an abandoned attempt
pub(super) fn clear_pending(st: &mut DeviceState, ids: &[ObjectId]) {
    for &id in ids {
        if let Ok(obj) = st.objects.get_mut(id) {
            obj.pending_read = Domains::empty();
            obj.pending_write = Domains::empty();
        }
    }
}

/// Validate relocations, accumulate pending domains and plan the flushes
///
/// Nothing is written to object memory here; patches are staged and
/// applied by the commit once ring space is held.
pub(super) fn stage(
    st: &mut DeviceState,
    args: &SubmitArgs,
    entries: &[(ObjectId, &ExecObject)],
) -> GemResult<Plan> {
    let mut plan = Plan::default();
    let mut stale = 0;
    clear_pending(st, &entries.iter().map(|(id, _)| *id).collect::<Vec<_>>());

    for &(id, exec) in entries {
        if exec.flags.contains(ExecObjectFlags::WRITE) {
            let obj = st.objects.get_mut(id)?;
            obj.pending_read |= Domains::RENDER;
            obj.pending_write |= Domains::RENDER;
        }
        let source_size = st.objects.get(id)?.size;

        for reloc in &exec.relocations {
            if !entries.iter().any(|(t, _)| *t == reloc.target) {
                return Err(GemError::InvalidHandle(reloc.target.0));
            }
            check_domains(reloc)?;
            let outside = reloc.offset.checked_add(4).map_or(true, |end| end > source_size);
            if reloc.offset % 4 != 0 || outside {
                return Err(GemError::InvalidArgument(format!(
                    "relocation at {:#x} outside {} ({:#x} bytes)",
                    reloc.offset, id, source_size
                )));
            }

            let target = st.objects.get_mut(reloc.target)?;
            if !reloc.write_domain.is_empty()
                && !target.pending_write.is_empty()
                && target.pending_write != reloc.write_domain
            {
                return Err(GemError::InvalidDomain(format!(
                    "{} written through both {:?} and {:?}",
                    reloc.target, target.pending_write, reloc.write_domain
                )));
            }
            target.pending_read |= reloc.read_domains;
            target.pending_write |= reloc.write_domain;

            let target_offset = st
                .gtt
                .binding(reloc.target)
                .ok_or(GemError::InvalidHandle(reloc.target.0))?
                .offset;
            if target_offset == reloc.presumed_offset {
                continue;
            }
            stale += 1;
            plan.writes.push(StagedWrite {
                object: id,
                offset: reloc.offset,
                value: (target_offset + reloc.delta as u64) as u32,
            });
        }
    }
    if stale > 0 && args.flags.contains(ExecFlags::NO_RELOC) {
        log::debug!("submit: {} presumed offsets were stale despite NO_RELOC", stale);
    }

    if let Some(&(batch, _)) = entries.last() {
        let obj = st.objects.get_mut(batch)?;
        if !obj.pending_write.is_empty() {
            return Err(GemError::InvalidDomain(format!(
                "batch {} is written by its own submission",
                batch
            )));
        }
        obj.pending_read |= Domains::COMMAND;
    }

    let mut waits: BTreeMap<EngineId, u32> = BTreeMap::new();
    for &(id, _) in entries {
        let obj = st.objects.get_mut(id)?;
        if obj.pending_read.is_empty() {
            obj.pending_read = Domains::RENDER;
        }
        if !obj.write_domain.is_empty() && obj.write_domain != obj.pending_read {
            plan.flush |= obj.write_domain;
        }
        plan.invalidate |= obj.pending_read.difference(obj.read_domains);
        plan.flips |= obj.pending_flip;

        let mut users = vec![obj.last_write];
        if !obj.pending_write.is_empty() {
            users.push(obj.last_read);
        }
        for (engine, seqno) in users.into_iter().flatten() {
            if engine == args.engine {
                continue;
            }
            let slot = waits.entry(engine).or_insert(seqno);
            if seqno_passed(seqno, *slot) {
                *slot = seqno;
            }
        }
    }
    // Work that already finished is skipped when the commands are built.
    plan.semaphores = waits.into_iter().collect();
    Ok(plan)
}
