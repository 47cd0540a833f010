//! Execbuffer submission pipeline
//!
//! One [`attempt`] runs the whole pipeline under the device lock:
//!
//! 1. validate arguments and resolve handles
//! 2. reserve bindings, pins and fences ([`reserve`])
//! 3. stage relocations and compute the domain plan ([`reloc`])
//! 4. ask the scheduler for admission
//! 5. reserve ring space, patch relocations and emit the request
//!
//! Everything before step 5 is undone on failure or denial, so a failed
//! attempt leaves bindings, occupancy and budgets as they were. The retry
//! loop around denials lives in [`Device::submit`](crate::Device::submit).

mod reloc;
mod reserve;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use chrono::Local;

use crate::device::{DeviceState, Shared};
use crate::error::{GemError, GemResult};
use crate::hw::cmd::{encoded_len, Command};
use crate::hw::{regs, EngineId};
use crate::mm::{Domains, ObjectId};
use crate::ring::Ring;
use crate::sched::{Admission, ClientId};
use crate::seqno::Request;

use reloc::Plan;
use reserve::Reservation;

bitflags! {
    /// Submission-wide flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecFlags: u32 {
        /// Return `WouldBlock` instead of waiting for budget
        const NONBLOCK = 1 << 0;
        /// Privileged batch dispatch
        const SECURE = 1 << 1;
        /// The batch carries no relocations of its own
        const IS_PINNED = 1 << 2;
        /// Presumed offsets are expected to be current
        const NO_RELOC = 1 << 3;
    }
}

impl Default for ExecFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Per-object flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecObjectFlags: u32 {
        /// Access goes through a fence register
        const NEEDS_FENCE = 1 << 0;
        /// Must sit in the CPU-mappable aperture
        const NEEDS_MAPPABLE = 1 << 1;
        /// The batch writes the object outside of any relocation
        const WRITE = 1 << 2;
    }
}

impl Default for ExecObjectFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Patch of one dword inside an object with the GTT address of another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Object whose address is written
    pub target: ObjectId,
    /// Byte offset of the dword to patch in the source object
    pub offset: u64,
    /// Added to the target's offset
    pub delta: u32,
    /// Target offset the caller assumed when building the batch
    pub presumed_offset: u64,
    /// How the batch reads the target
    pub read_domains: Domains,
    /// How the batch writes the target
    pub write_domain: Domains,
}

impl Relocation {
    /// Read-only reference to `target` at `offset`
    pub fn new(target: ObjectId, offset: u64, read_domains: Domains) -> Self {
        Self {
            target,
            offset,
            delta: 0,
            presumed_offset: u64::MAX,
            read_domains,
            write_domain: Domains::empty(),
        }
    }

    /// Mark the reference as a write through `domain`
    pub fn writing(mut self, domain: Domains) -> Self {
        self.read_domains |= domain;
        self.write_domain = domain;
        self
    }

    /// Byte delta added to the target address
    pub fn with_delta(mut self, delta: u32) -> Self {
        self.delta = delta;
        self
    }

    /// Offset the caller expects the target to be bound at
    pub fn presumed(mut self, offset: u64) -> Self {
        self.presumed_offset = offset;
        self
    }
}

/// One entry of the exec list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecObject {
    /// Client handle
    pub handle: ObjectId,
    /// Patches applied to this object
    pub relocations: Vec<Relocation>,
    /// Minimum alignment, 0 for the page size
    pub alignment: u64,
    /// Placement and access flags
    pub flags: ExecObjectFlags,
}

impl ExecObject {
    /// Entry with no relocations or constraints
    pub fn new(handle: ObjectId) -> Self {
        Self {
            handle,
            relocations: Vec::new(),
            alignment: 0,
            flags: ExecObjectFlags::empty(),
        }
    }

    /// Add a relocation
    pub fn with_relocation(mut self, reloc: Relocation) -> Self {
        self.relocations.push(reloc);
        self
    }

    /// Add flags
    pub fn with_flags(mut self, flags: ExecObjectFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Require an alignment
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}

/// Arguments of one submission; the batch buffer is the last object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitArgs {
    /// Target engine
    pub engine: EngineId,
    /// Exec list, batch last
    pub objects: Vec<ExecObject>,
    /// Start of the batch inside its object
    pub batch_start_offset: u64,
    /// Batch length in bytes
    pub batch_len: u64,
    /// Submission flags
    pub flags: ExecFlags,
    /// Hardware context, render engine only
    pub context_id: u32,
}

impl SubmitArgs {
    /// Submission of the first `batch_len` bytes of the last object
    pub fn new(engine: EngineId, objects: Vec<ExecObject>, batch_len: u64) -> Self {
        Self {
            engine,
            objects,
            batch_start_offset: 0,
            batch_len,
            flags: ExecFlags::empty(),
            context_id: 0,
        }
    }

    /// Add flags
    pub fn with_flags(mut self, flags: ExecFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Start the batch at `offset`
    pub fn starting_at(mut self, offset: u64) -> Self {
        self.batch_start_offset = offset;
        self
    }
}

/// Result of one pass through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    /// Request emitted with this seqno
    Committed(u32),
    /// Admission denied; nothing changed, retry after the delay
    Denied(Duration),
}

fn validate(st: &DeviceState, client: ClientId, args: &SubmitArgs) -> GemResult<Vec<ObjectId>> {
    if args.objects.is_empty() {
        return Err(GemError::InvalidArgument("empty exec list".into()));
    }
    if !ExecFlags::all().contains(args.flags) {
        return Err(GemError::InvalidArgument(format!(
            "unknown exec flags {:#x}",
            args.flags.bits()
        )));
    }
    if args.batch_len == 0 || args.batch_len % 8 != 0 || args.batch_start_offset % 8 != 0 {
        return Err(GemError::InvalidArgument(format!(
            "batch {:#x}+{:#x} is not 8-byte aligned",
            args.batch_start_offset, args.batch_len
        )));
    }
    if args.context_id != 0 && args.engine != EngineId::Render {
        return Err(GemError::InvalidArgument(format!(
            "contexts are only supported on {}",
            EngineId::Render
        )));
    }
    if st.enabled & args.engine.mask() == 0 {
        return Err(GemError::InvalidArgument(format!("{} is not enabled", args.engine)));
    }
    if args.flags.contains(ExecFlags::SECURE) && st.sched.client(client)?.priority != 0 {
        return Err(GemError::InvalidArgument(
            "secure dispatch needs a privileged client".into(),
        ));
    }

    let table = st
        .handles
        .get(&client)
        .ok_or(GemError::UnknownClient(client.0))?;
    let mut seen = HashSet::with_capacity(args.objects.len());
    let mut ids = Vec::with_capacity(args.objects.len());
    for exec in &args.objects {
        if !ExecObjectFlags::all().contains(exec.flags) {
            return Err(GemError::InvalidArgument(format!(
                "unknown object flags {:#x} on {}",
                exec.flags.bits(),
                exec.handle
            )));
        }
        if !table.contains(&exec.handle) || !seen.insert(exec.handle) {
            return Err(GemError::InvalidHandle(exec.handle.0));
        }
        st.objects.get(exec.handle)?;
        ids.push(exec.handle);
    }

    let batch = ids[ids.len() - 1];
    let batch_size = st.objects.get(batch)?.size;
    let overruns = args
        .batch_start_offset
        .checked_add(args.batch_len)
        .map_or(true, |end| end > batch_size);
    if overruns {
        return Err(GemError::InvalidArgument(format!(
            "batch {:#x}+{:#x} overruns {} ({:#x} bytes)",
            args.batch_start_offset, args.batch_len, batch, batch_size
        )));
    }
    if args.flags.contains(ExecFlags::IS_PINNED)
        && args.objects.last().map_or(false, |e| !e.relocations.is_empty())
    {
        return Err(GemError::InvalidArgument(
            "pinned batch carries relocations".into(),
        ));
    }
    Ok(ids)
}

/// Run the pipeline once
pub(crate) fn attempt(
    st: &mut DeviceState,
    shared: &Shared,
    client: ClientId,
    args: &SubmitArgs,
    now: Instant,
) -> GemResult<Attempt> {
    let ids = validate(st, client, args)?;
    let entries: Vec<(ObjectId, &ExecObject)> =
        ids.iter().copied().zip(args.objects.iter()).collect();

    let nonblocking = args.flags.contains(ExecFlags::NONBLOCK);
    let reservation = Reservation::reserve(st, shared, &entries, nonblocking)?;
    let plan = match reloc::stage(st, args, &entries) {
        Ok(plan) => plan,
        Err(e) => {
            reloc::clear_pending(st, &ids);
            reservation.unwind(st);
            return Err(e);
        }
    };

    let admission = match st.sched.admit(client, args.engine, now) {
        Ok(admission) => admission,
        Err(e) => {
            reloc::clear_pending(st, &ids);
            reservation.unwind(st);
            return Err(e);
        }
    };

    match admission {
        Admission::Deny { retry_after, reason } => {
            log::debug!(
                "submit: {} on {} throttled ({:?}), retry in {:?}",
                client,
                args.engine,
                reason,
                retry_after
            );
            reloc::clear_pending(st, &ids);
            reservation.unwind(st);
            Ok(Attempt::Denied(retry_after))
        }
        Admission::Admit { priority, charged } => {
            match commit(st, shared, client, priority, args, &ids, &plan, reservation.fenced()) {
                Ok(seqno) => {
                    reservation.release(st);
                    Ok(Attempt::Committed(seqno))
                }
                Err(e) => {
                    st.sched.refund(client, priority, charged);
                    reloc::clear_pending(st, &ids);
                    reservation.unwind(st);
                    Err(e)
                }
            }
        }
    }
}

/// Batch start address and length as the command stream encodes them
fn batch_window(offset: u64, len: u64) -> GemResult<(u32, u32)> {
    let address = u32::try_from(offset).map_err(|_| {
        GemError::InvalidArgument(format!("batch address {:#x} beyond 32 bits", offset))
    })?;
    let length = u32::try_from(len).map_err(|_| {
        GemError::InvalidArgument(format!("batch length {:#x} beyond 32 bits", len))
    })?;
    Ok((address, length))
}

/// Reserve ring space, patch relocations and emit the request
#[allow(clippy::too_many_arguments)]
fn commit(
    st: &mut DeviceState,
    shared: &Shared,
    client: ClientId,
    priority: u32,
    args: &SubmitArgs,
    ids: &[ObjectId],
    plan: &Plan,
    fenced: &[ObjectId],
) -> GemResult<u32> {
    let engine = args.engine;
    let idx = engine.index();
    let batch = ids
        .last()
        .copied()
        .ok_or_else(|| GemError::InvalidArgument("empty exec list".into()))?;
    let batch_offset = st
        .gtt
        .binding(batch)
        .ok_or(GemError::InvalidHandle(batch.0))?
        .offset
        + args.batch_start_offset;
    let (address, length) = batch_window(batch_offset, args.batch_len)?;

    let mut commands = Vec::with_capacity(plan.semaphores.len() + 5);
    if plan.flips != 0 {
        commands.push(Command::WaitForEvent { planes: plan.flips });
    }
    for &(signaller, seqno) in &plan.semaphores {
        if !shared.tracker.is_complete(signaller, seqno) {
            commands.push(Command::SemaphoreWait { signaller, seqno });
        }
    }
    commands.push(Command::Flush {
        invalidate: plan.invalidate.bits(),
        flush: plan.flush.bits(),
    });
    commands.push(Command::BatchStart {
        address,
        length,
        secure: args.flags.contains(ExecFlags::SECURE),
    });
    let store_at = commands.len();
    commands.push(Command::StoreSeqno { seqno: 0 });
    commands.push(Command::UserInterrupt);

    shared.reset.check()?;
    let timeout = shared.config.waits.ring_space_timeout();
    {
        let DeviceState { rings, requests, .. } = &mut *st;
        let queue = &requests[idx];
        rings[idx].begin(encoded_len(&commands), &mut |ring: &Ring, needed: u32| {
            let hw_head = shared.gate.read(engine, regs::RING_HEAD);
            if ring.space_after(hw_head) >= needed {
                return Ok(hw_head);
            }
            let (seqno, tail) = queue
                .first_freeing(|tail| ring.space_after(tail), needed)
                .ok_or(GemError::NoSpace)?;
            log::debug!(
                "submit: {} ring full, waiting for seqno {} to free {} bytes",
                engine,
                seqno,
                needed
            );
            shared.tracker.wait(engine, seqno, timeout, &shared.reset)?;
            Ok(tail)
        })?;
    }

    // Bounds were checked while staging.
    for write in &plan.writes {
        st.objects.get_mut(write.object)?.write_u32(write.offset, write.value)?;
    }

    let seqno = shared.tracker.allocate_seqno(engine);
    commands[store_at] = Command::StoreSeqno { seqno };
    let stopped = st.stop_rings & engine.mask() != 0;
    let ring = &mut st.rings[idx];
    for cmd in &commands {
        ring.emit_command(cmd);
    }
    let emitted_at = Instant::now();
    ring.advance(&shared.gate, stopped);
    let tail = ring.tail();
    if stopped {
        log::warn!("submit: {} is stopped, seqno {} will not execute", engine, seqno);
    }

    for &id in ids {
        let fenced = fenced.contains(&id);
        if let Ok(obj) = st.objects.get_mut(id) {
            obj.read_domains = obj.pending_read;
            obj.write_domain = obj.pending_write;
            obj.last_read = Some((engine, seqno));
            if !obj.pending_write.is_empty() {
                obj.last_write = Some((engine, seqno));
            }
            if fenced {
                obj.last_fenced = Some((engine, seqno));
            }
            obj.pending_read = Domains::empty();
            obj.pending_write = Domains::empty();
            obj.active_refs += 1;
        }
        st.gtt.mark_active(id);
    }

    st.sched.note_submitted(client);
    st.requests[idx].push(Request {
        engine,
        seqno,
        tail,
        emitted_at,
        submitted_at: Local::now(),
        client: Some(client),
        objects: ids.to_vec(),
        priority,
    });
    log::debug!(
        "submit: {} committed seqno {} on {} ({} objects, {} relocations patched)",
        client,
        seqno,
        engine,
        ids.len(),
        plan.writes.len()
    );
    Ok(seqno)
}
