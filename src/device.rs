//! The device handle
//!
//! [`Device`] owns the shared state and four worker threads:
//!
//! - **irq**: turns [`IrqEvent`]s into watermark updates and retire jobs
//! - **retire**: sweeps completed requests under the device lock
//! - **hangcheck**: samples engine progress on a timer
//! - **recovery**: resets the engines after a hang is declared
//!
//! The seqno tracker, wake gate and hang monitor each have their own lock,
//! so the interrupt path and the hang check never wait for the device lock.
//! Dropping the device disconnects the shutdown channel and joins the workers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::DeviceConfig;
use crate::error::{GemError, GemResult};
use crate::hangcheck::{reset_engines, EngineHealth, HangMonitor, ResetHistory};
#[cfg(feature = "sim")]
use crate::hw::sim::SimDevice;
use crate::hw::{regs, EngineId, IrqEvent, RingDevice};
use crate::mm::{
    AddressSpace, AddressSpaceStats, BindRequest, Binding, BufferObject, CacheLevel, Domains,
    ObjectId, ObjectStore, Occupancy, Tiling,
};
use crate::ring::{Ring, WakeGate};
use crate::sched::{parse_controls, ClientId, ControlCommand, PriorityClass, SchedulerReport, SchedulerState};
use crate::seqno::{seqno_passed, Request, RequestQueue, RequestState, ResetState, SeqnoTracker};
use crate::submit::{self, Attempt, ExecFlags, SubmitArgs};

/// Everything the device lock protects
pub(crate) struct DeviceState {
    pub(crate) objects: ObjectStore,
    pub(crate) gtt: AddressSpace,
    pub(crate) rings: Vec<Ring>,
    pub(crate) requests: Vec<RequestQueue>,
    pub(crate) sched: SchedulerState,
    pub(crate) handles: HashMap<ClientId, BTreeSet<ObjectId>>,
    pub(crate) enabled: u32,
    pub(crate) stop_rings: u32,
    last_completion: [Option<Instant>; EngineId::COUNT],
    reset_history: ResetHistory,
}

impl DeviceState {
    fn lookup(&self, client: ClientId, handle: ObjectId) -> GemResult<ObjectId> {
        let table = self
            .handles
            .get(&client)
            .ok_or(GemError::UnknownClient(client.0))?;
        if !table.contains(&handle) {
            return Err(GemError::InvalidHandle(handle.0));
        }
        Ok(handle)
    }

    /// Sweep every request on `engine` up to `watermark`
    pub(crate) fn retire_engine(&mut self, engine: EngineId, watermark: u32) -> usize {
        let done = self.requests[engine.index()].drain_completed(watermark);
        let count = done.len();
        let now = Instant::now();
        for request in done {
            self.retire_request(request, now);
        }
        count
    }

    fn retire_request(&mut self, request: Request, now: Instant) {
        let idx = request.engine.index();
        self.rings[idx].set_head(request.tail);

        // Time queued behind the previous request is not this one's.
        let start = match self.last_completion[idx] {
            Some(prev) if prev > request.emitted_at => prev,
            _ => request.emitted_at,
        };
        let exec = now.saturating_duration_since(start);
        self.last_completion[idx] = Some(now);

        for &id in &request.objects {
            self.gtt.mark_retired(id);
            if let Ok(obj) = self.objects.get_mut(id) {
                obj.active_refs = obj.active_refs.saturating_sub(1);
            }
            self.free_if_orphaned(id);
        }
        if let Some(client) = request.client {
            self.sched
                .on_retire(client, request.priority, exec, request.submitted_at);
        }
        log::trace!(
            "device: retired seqno {} on {} after {}us",
            request.seqno,
            request.engine,
            exec.as_micros()
        );
    }

    fn free_if_orphaned(&mut self, id: ObjectId) {
        let orphaned = self.objects.get(id).map_or(false, |o| o.is_orphaned());
        if !orphaned {
            return;
        }
        match self.gtt.release(id) {
            Ok(()) => {
                self.objects.remove(id);
                log::debug!("device: freed {}", id);
            }
            Err(e) => log::debug!("device: {} stays bound until unpinned: {}", id, e),
        }
    }

    /// Wait until the GPU is done with `id`, then sweep those engines
    ///
    /// With `readonly` only the last write is waited for. The device lock
    /// stays held; the tracker wait returns early on a wedge.
    pub(crate) fn wait_object_idle(
        &mut self,
        id: ObjectId,
        shared: &Shared,
        readonly: bool,
    ) -> GemResult<()> {
        let obj = self.objects.get(id)?;
        let mut users = vec![obj.last_write];
        if !readonly {
            users.push(obj.last_read);
        }
        for (engine, seqno) in users.into_iter().flatten() {
            shared
                .tracker
                .wait(engine, seqno, shared.config.waits.idle_timeout(), &shared.reset)?;
            self.retire_engine(engine, shared.tracker.completed(engine));
        }
        Ok(())
    }

    /// Sweep what the hardware has finished and, with `wait`, block until
    /// every engine is idle first
    ///
    /// Used before evicting everything, so bindings whose requests already
    /// completed stop counting as active.
    pub(crate) fn idle_and_retire(&mut self, shared: &Shared, wait: bool) -> GemResult<usize> {
        shared.poll_completions();
        let mut retired = 0;
        for engine in shared.engines() {
            if wait {
                let last = shared.tracker.last_allocated(engine);
                if !shared.tracker.is_complete(engine, last) {
                    shared.tracker.wait(
                        engine,
                        last,
                        shared.config.waits.idle_timeout(),
                        &shared.reset,
                    )?;
                }
            }
            retired += self.retire_engine(engine, shared.tracker.completed(engine));
        }
        Ok(retired)
    }
}

/// State shared between the handle and its workers
pub(crate) struct Shared {
    pub(crate) config: DeviceConfig,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) tracker: SeqnoTracker,
    pub(crate) reset: ResetState,
    pub(crate) gate: Arc<WakeGate>,
    budget: Condvar,
    reset_done: Condvar,
    monitor: Mutex<HangMonitor>,
    recovery: Sender<()>,
}

impl Shared {
    pub(crate) fn engines(&self) -> Vec<EngineId> {
        EngineId::ALL
            .into_iter()
            .filter(|e| self.config.engines.engines.contains(e))
            .collect()
    }

    pub(crate) fn poll_completions(&self) {
        for engine in self.engines() {
            let seqno = self.gate.device().read_status(engine, regs::STATUS_SEQNO);
            self.tracker.on_interrupt(engine, seqno);
        }
    }

    fn retire(&self, engines: &[EngineId]) -> usize {
        let mut st = self.state.lock();
        let count: usize = engines
            .iter()
            .map(|&e| st.retire_engine(e, self.tracker.completed(e)))
            .sum();
        drop(st);
        if count > 0 {
            self.budget.notify_all();
        }
        count
    }

    fn wait_out_reset(&self, guard: &mut MutexGuard<'_, DeviceState>) -> GemResult<()> {
        let deadline = Instant::now() + self.config.waits.reset_timeout();
        while self.reset.in_progress() {
            if self.reset_done.wait_until(guard, deadline).timed_out() {
                break;
            }
        }
        self.reset.check()
    }

    fn hangcheck(&self) -> Vec<EngineHealth> {
        let mut monitor = self.monitor.lock();
        if self.reset.in_progress() || self.reset.is_terminally_wedged() {
            return monitor.health();
        }
        let engines = self.engines();
        let hung = monitor.check(&self.gate, &self.tracker, &engines, |e| {
            !self.tracker.is_complete(e, self.tracker.last_allocated(e))
        });
        let health = monitor.health();
        drop(monitor);
        if !hung.is_empty() {
            self.declare_wedged(&hung);
        }
        health
    }

    fn declare_wedged(&self, hung: &[EngineId]) {
        if !self.reset.begin() {
            return;
        }
        let names: Vec<&str> = hung.iter().map(|e| e.name()).collect();
        log::error!("device: {} hung, GPU wedged", names.join(", "));
        self.tracker.wake_all();
        self.budget.notify_all();
        if self.recovery.send(()).is_err() {
            log::error!("device: recovery worker is gone");
        }
    }

    fn recover(&self) {
        let engines = self.engines();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let simulated = st.stop_rings != 0;
        log::info!("device: recovering {} engines", engines.len());

        // An induced hang gets one free reset failure before the history counts.
        let mut forgiven = simulated;
        while let Err(e) = reset_engines(&self.gate, &engines) {
            log::error!("device: engine reset failed: {}", e);
            if std::mem::take(&mut forgiven) {
                continue;
            }
            if st.reset_history.record_failure(Instant::now()) {
                log::error!("device: reset failed twice, disabling the GPU");
                self.reset.set_terminal();
                self.tracker.wake_all();
                self.reset_done.notify_all();
                self.budget.notify_all();
                return;
            }
        }

        let now = Instant::now();
        for &engine in &engines {
            let idx = engine.index();
            let last = self.tracker.last_allocated(engine);
            self.tracker.rewind(engine, last);
            let stale = st.requests[idx].take_all();
            if !stale.is_empty() {
                log::info!("device: {} lost {} requests", engine, stale.len());
            }
            for request in stale {
                st.retire_request(request, now);
            }
            st.rings[idx].init(&self.gate);
            self.gate
                .device()
                .write_status(engine, regs::STATUS_SEQNO, last);
        }
        st.gtt.reset_fences();
        st.reset_history.record_success();
        if simulated {
            log::info!("device: induced hang handled, clearing stop_rings {:#x}", st.stop_rings);
            st.stop_rings = 0;
        }
        self.monitor.lock().clear();

        self.reset.finish();
        self.reset_done.notify_all();
        self.budget.notify_all();
        log::info!(
            "device: recovered (reset #{})",
            st.reset_history.resets()
        );
    }
}

fn irq_loop(shared: &Shared, irqs: Receiver<IrqEvent>, retire: Sender<EngineId>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(irqs) -> event => match event {
                Ok(IrqEvent::UserInterrupt(engine)) => {
                    let seqno = shared.gate.device().read_status(engine, regs::STATUS_SEQNO);
                    if shared.tracker.on_interrupt(engine, seqno) && retire.send(engine).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
}

fn retire_loop(shared: &Shared, jobs: Receiver<EngineId>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(jobs) -> job => match job {
                Ok(engine) => {
                    shared.retire(&[engine]);
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
}

fn hangcheck_loop(shared: &Shared, shutdown: Receiver<()>) {
    let interval = shared.config.hangcheck.interval();
    loop {
        select! {
            recv(shutdown) -> _ => break,
            default(interval) => {
                if shared.monitor.lock().config().enabled {
                    shared.hangcheck();
                }
            }
        }
    }
}

fn recovery_loop(shared: &Shared, jobs: Receiver<()>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(jobs) -> job => match job {
                Ok(()) => shared.recover(),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
}

fn spawn_worker(
    name: &str,
    shared: &Arc<Shared>,
    body: impl FnOnce(&Shared) + Send + 'static,
) -> GemResult<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    Ok(thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&shared))?)
}

/// A GPU behind a [`RingDevice`]
///
/// All methods take `&self`; the device is meant to be shared between
/// client threads behind an `Arc`.
pub struct Device {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Option<Sender<()>>,
}

impl Device {
    /// Bring up the configured engines and start the workers
    pub fn new(config: DeviceConfig, hw: Arc<dyn RingDevice>) -> GemResult<Self> {
        config.validate()?;
        let gate = Arc::new(WakeGate::new(Arc::clone(&hw)));
        let enabled = config
            .engines
            .engines
            .iter()
            .fold(0, |mask, e| mask | e.mask());

        let mut rings: Vec<Ring> = EngineId::ALL
            .into_iter()
            .map(|e| Ring::new(e, config.engines.ring_size))
            .collect();
        for ring in rings.iter_mut().filter(|r| enabled & r.engine().mask() != 0) {
            ring.init(&gate);
            hw.write_status(ring.engine(), regs::STATUS_SEQNO, 0);
        }

        let state = DeviceState {
            objects: ObjectStore::new(),
            gtt: AddressSpace::new(&config.gtt, gate.clone()),
            rings,
            requests: (0..EngineId::COUNT).map(|_| RequestQueue::default()).collect(),
            sched: SchedulerState::new(config.scheduler.clone()),
            handles: HashMap::new(),
            enabled,
            stop_rings: 0,
            last_completion: [None; EngineId::COUNT],
            reset_history: ResetHistory::new(config.hangcheck.reset_window()),
        };

        let (irq_tx, irq_rx) = unbounded();
        let (retire_tx, retire_rx) = unbounded();
        let (recovery_tx, recovery_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();

        let shared = Arc::new(Shared {
            monitor: Mutex::new(HangMonitor::new(config.hangcheck.clone())),
            config,
            state: Mutex::new(state),
            tracker: SeqnoTracker::new(),
            reset: ResetState::default(),
            gate,
            budget: Condvar::new(),
            reset_done: Condvar::new(),
            recovery: recovery_tx,
        });
        hw.connect_interrupts(irq_tx);

        let sd = shutdown_rx.clone();
        let irq = spawn_worker("gemsched-irq", &shared, move |s| {
            irq_loop(s, irq_rx, retire_tx, sd)
        })?;
        let sd = shutdown_rx.clone();
        let retire = spawn_worker("gemsched-retire", &shared, move |s| {
            retire_loop(s, retire_rx, sd)
        })?;
        let sd = shutdown_rx.clone();
        let hangcheck = spawn_worker("gemsched-hangcheck", &shared, move |s| {
            hangcheck_loop(s, sd)
        })?;
        let recovery = spawn_worker("gemsched-recovery", &shared, move |s| {
            recovery_loop(s, recovery_rx, shutdown_rx)
        })?;

        log::info!(
            "device: up with engines {:#x}, {} KiB GTT",
            enabled,
            shared.config.gtt.size >> 10
        );
        Ok(Self {
            shared,
            workers: vec![irq, retire, hangcheck, recovery],
            shutdown: Some(shutdown_tx),
        })
    }

    /// Device on a fresh [`SimDevice`]; the simulator is returned for control
    #[cfg(feature = "sim")]
    pub fn simulated(config: DeviceConfig) -> GemResult<(Self, Arc<SimDevice>)> {
        let sim = Arc::new(SimDevice::new());
        let device = Self::new(config, sim.clone())?;
        Ok((device, sim))
    }

    /// Configuration the device was built with
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    // Sessions and objects

    /// Open a client session
    pub fn open_client(&self, class: PriorityClass) -> GemResult<ClientId> {
        let mut st = self.shared.state.lock();
        let id = st.sched.open_client(class)?;
        st.handles.insert(id, BTreeSet::new());
        log::info!("device: opened {} ({:?})", id, class);
        Ok(id)
    }

    /// Close a session without waiting for its work
    ///
    /// Handles are dropped at once; objects still in flight are freed when
    /// their last request retires.
    pub fn close_client(&self, client: ClientId) -> GemResult<()> {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        st.sched.close_client(client)?;
        let handles = st.handles.remove(&client).unwrap_or_default();
        for id in handles {
            if let Ok(obj) = st.objects.get_mut(id) {
                obj.handle_count = obj.handle_count.saturating_sub(1);
            }
            st.free_if_orphaned(id);
        }
        drop(guard);
        self.shared.budget.notify_all();
        log::info!("device: closed {}", client);
        Ok(())
    }

    /// Allocate an object of at least `size` bytes
    pub fn create_object(&self, client: ClientId, size: u64) -> GemResult<ObjectId> {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let table = st
            .handles
            .get_mut(&client)
            .ok_or(GemError::UnknownClient(client.0))?;
        let id = st.objects.create(size)?;
        table.insert(id);
        Ok(id)
    }

    /// Drop a client handle; the object goes once it is idle
    pub fn close_object(&self, client: ClientId, handle: ObjectId) -> GemResult<()> {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let id = st.lookup(client, handle)?;
        if let Some(table) = st.handles.get_mut(&client) {
            table.remove(&id);
        }
        let obj = st.objects.get_mut(id)?;
        obj.handle_count = obj.handle_count.saturating_sub(1);
        st.free_if_orphaned(id);
        Ok(())
    }

    /// CPU write into an object, after the GPU is done with it
    pub fn write_object(&self, client: ClientId, handle: ObjectId, offset: u64, bytes: &[u8]) -> GemResult<()> {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let id = st.lookup(client, handle)?;
        st.wait_object_idle(id, &self.shared, false)?;
        let obj = st.objects.get_mut(id)?;
        obj.write(offset, bytes)?;
        obj.read_domains = Domains::CPU;
        obj.write_domain = Domains::CPU;
        Ok(())
    }

    /// CPU read from an object, after its last GPU write
    pub fn read_object(&self, client: ClientId, handle: ObjectId, offset: u64, len: usize) -> GemResult<Vec<u8>> {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let id = st.lookup(client, handle)?;
        st.wait_object_idle(id, &self.shared, true)?;
        let obj = st.objects.get_mut(id)?;
        if obj.write_domain.intersects(Domains::GPU) {
            obj.write_domain = Domains::empty();
        }
        obj.read_domains |= Domains::CPU;
        obj.read(offset, len)
    }

    /// Change the tiling layout; an existing binding is dropped
    pub fn set_tiling(&self, client: ClientId, handle: ObjectId, tiling: Tiling, stride: u32) -> GemResult<()> {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let id = st.lookup(client, handle)?;
        let obj = st.objects.get(id)?;
        if obj.tiling == tiling && obj.stride == stride {
            return Ok(());
        }
        if obj.is_active() {
            st.wait_object_idle(id, &self.shared, false)?;
        }
        st.gtt.unbind(id)?;
        let obj = st.objects.get_mut(id)?;
        obj.tiling = tiling;
        obj.stride = stride;
        Ok(())
    }

    /// Change the coherency class, after the GPU is done with the object
    pub fn set_cache_level(&self, client: ClientId, handle: ObjectId, level: CacheLevel) -> GemResult<()> {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let id = st.lookup(client, handle)?;
        if st.objects.get(id)?.is_active() {
            st.wait_object_idle(id, &self.shared, false)?;
        }
        st.objects.get_mut(id)?.cache_level = level;
        Ok(())
    }

    /// Snapshot of an object's bookkeeping
    pub fn object(&self, client: ClientId, handle: ObjectId) -> GemResult<BufferObject> {
        let st = self.shared.state.lock();
        let id = st.lookup(client, handle)?;
        Ok(st.objects.get(id)?.clone())
    }

    /// Current binding of an object, if any
    pub fn binding(&self, client: ClientId, handle: ObjectId) -> GemResult<Option<Binding>> {
        let st = self.shared.state.lock();
        let id = st.lookup(client, handle)?;
        Ok(st.gtt.binding(id).copied())
    }

    // Submission and completion

    /// Submit a batch; returns the request's seqno
    ///
    /// Blocks while admission is denied unless [`ExecFlags::NONBLOCK`] is
    /// set, and waits out a reset in progress before retrying.
    pub fn submit(&self, client: ClientId, args: &SubmitArgs) -> GemResult<u32> {
        let shared = &*self.shared;
        let mut guard = shared.state.lock();
        shared.wait_out_reset(&mut guard)?;
        guard.sched.enter(client)?;

        let result = loop {
            match submit::attempt(&mut guard, shared, client, args, Instant::now()) {
                Ok(Attempt::Committed(seqno)) => break Ok(seqno),
                Ok(Attempt::Denied(retry)) if args.flags.contains(ExecFlags::NONBLOCK) => {
                    log::debug!("submit: {} would block for {:?}", client, retry);
                    break Err(GemError::WouldBlock);
                }
                Ok(Attempt::Denied(retry)) => {
                    let slice = retry
                        .min(shared.config.waits.admission_slice())
                        .max(Duration::from_micros(100));
                    shared.budget.wait_for(&mut guard, slice);
                }
                Err(GemError::Wedged) => {
                    if let Err(e) = shared.wait_out_reset(&mut guard) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        guard.sched.exit(client);
        result
    }

    /// Block until the object's last write, and unless `readonly` its last
    /// read, has completed
    pub fn wait_rendering(
        &self,
        client: ClientId,
        handle: ObjectId,
        readonly: bool,
        timeout: Duration,
    ) -> GemResult<()> {
        let users = {
            let st = self.shared.state.lock();
            let obj = st.objects.get(st.lookup(client, handle)?)?;
            let mut users = vec![obj.last_write];
            if !readonly {
                users.push(obj.last_read);
            }
            users
        };
        for (engine, seqno) in users.into_iter().flatten() {
            self.shared
                .tracker
                .wait(engine, seqno, timeout, &self.shared.reset)?;
        }
        self.retire_requests();
        Ok(())
    }

    /// Whether GPU work still references the object
    pub fn busy(&self, client: ClientId, handle: ObjectId) -> GemResult<bool> {
        self.retire_requests();
        let st = self.shared.state.lock();
        let id = st.lookup(client, handle)?;
        Ok(st.objects.get(id)?.is_active())
    }

    /// Poll the status pages and sweep completed requests
    pub fn retire_requests(&self) -> usize {
        self.shared.poll_completions();
        self.shared.retire(&self.shared.engines())
    }

    /// Lifecycle state of a request
    pub fn request_state(&self, engine: EngineId, seqno: u32) -> RequestState {
        let st = self.shared.state.lock();
        let tracker = &self.shared.tracker;
        if st.requests[engine.index()].iter().any(|r| r.seqno == seqno) {
            if tracker.is_complete(engine, seqno) {
                RequestState::Signaled
            } else {
                RequestState::Submitted
            }
        } else if seqno != 0 && seqno_passed(tracker.last_allocated(engine), seqno) {
            RequestState::Retired
        } else {
            RequestState::Pending
        }
    }

    /// Last seqno that completed on `engine`
    pub fn completed_seqno(&self, engine: EngineId) -> u32 {
        self.shared.tracker.completed(engine)
    }

    // Display

    /// Bind for scanout in the mappable aperture and pin; returns the GPU address
    pub fn pin_for_scanout(&self, client: ClientId, handle: ObjectId) -> GemResult<u64> {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let id = st.lookup(client, handle)?;
        let req = BindRequest {
            alignment: self.shared.config.gtt.scanout_alignment,
            mappable: true,
            may_block: true,
        };
        if let Some(existing) = st.gtt.binding(id).copied() {
            if !existing.satisfies(&req) && existing.is_active() {
                st.wait_object_idle(id, &self.shared, false)?;
            }
        }
        let binding = st.gtt.bind(st.objects.get(id)?, req)?;
        st.gtt.pin(id)?;
        log::debug!("device: {} pinned for scanout at {:#x}", id, binding.offset);
        Ok(binding.offset)
    }

    /// Drop a scanout pin
    pub fn unpin_from_scanout(&self, client: ClientId, handle: ObjectId) -> GemResult<()> {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        let id = st.lookup(client, handle)?;
        match st.gtt.binding(id) {
            Some(b) if b.is_pinned() => {
                st.gtt.unpin(id);
                st.free_if_orphaned(id);
                Ok(())
            }
            _ => Err(GemError::InvalidArgument(format!("{} is not pinned", id))),
        }
    }

    /// Note a flip of the object queued on `plane`
    pub fn mark_flip_pending(&self, client: ClientId, handle: ObjectId, plane: u32) -> GemResult<()> {
        if plane >= 32 {
            return Err(GemError::InvalidArgument(format!("no display plane {}", plane)));
        }
        let mut st = self.shared.state.lock();
        let id = st.lookup(client, handle)?;
        st.objects.get_mut(id)?.pending_flip |= 1 << plane;
        Ok(())
    }

    /// The flip on `plane` finished
    pub fn complete_flip(&self, plane: u32) {
        let mut st = self.shared.state.lock();
        let bit = 1u32.checked_shl(plane).unwrap_or(0);
        for obj in st.objects.iter_mut() {
            obj.pending_flip &= !bit;
        }
    }

    /// Block until every engine in `engine_mask` retired its last request
    pub fn wait_for_flip_complete(&self, engine_mask: u32, timeout: Duration) -> GemResult<()> {
        for engine in EngineId::from_mask(engine_mask) {
            let last = self.shared.tracker.last_allocated(engine);
            if last != 0 {
                self.shared
                    .tracker
                    .wait(engine, last, timeout, &self.shared.reset)?;
            }
        }
        self.retire_requests();
        Ok(())
    }

    // Control and health

    /// Apply `key=value` tokens; nothing changes unless all of them are valid
    pub fn apply_control(&self, input: &str) -> GemResult<()> {
        let commands = parse_controls(input)?;
        let mut st = self.shared.state.lock();
        st.sched.apply_all(&commands)?;
        for command in &commands {
            match *command {
                ControlCommand::StopRings(mask) => {
                    log::warn!("device: stop_rings = {:#x}", mask);
                    st.stop_rings = mask;
                }
                ControlCommand::Hangcheck(enabled) => {
                    self.shared.monitor.lock().set_enabled(enabled);
                }
                _ => {}
            }
        }
        drop(st);
        self.shared.budget.notify_all();
        Ok(())
    }

    /// Scheduler, stop-rings and hang-check state
    pub fn control_snapshot(&self) -> SchedulerReport {
        let st = self.shared.state.lock();
        let mut report = st.sched.report();
        report.stop_rings = st.stop_rings;
        drop(st);
        let monitor = self.shared.monitor.lock();
        report.hangcheck_enabled = monitor.config().enabled;
        report.engines = monitor.health();
        report
    }

    /// One hang-check sample, outside the timer
    pub fn run_hangcheck(&self) -> Vec<EngineHealth> {
        self.shared.hangcheck()
    }

    /// Wait for a reset in progress to finish
    ///
    /// Returns `ResetFailed` if the device was given up, `Wedged` if the
    /// reset is still running at the deadline.
    pub fn wait_for_recovery(&self, timeout: Duration) -> GemResult<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock();
        while self.shared.reset.in_progress() {
            if self.shared.reset_done.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
        self.shared.reset.check()
    }

    /// Reset generation; bumps once per completed reset
    pub fn reset_generation(&self) -> u32 {
        self.shared.reset.generation()
    }

    /// Address-space layout
    pub fn occupancy(&self) -> Occupancy {
        self.shared.state.lock().gtt.occupancy()
    }

    /// Address-space counters
    pub fn stats(&self) -> AddressSpaceStats {
        self.shared.state.lock().gtt.stats()
    }

    /// Live objects
    pub fn object_count(&self) -> usize {
        self.shared.state.lock().objects.len()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("device: a worker thread panicked");
            }
        }
    }
}
