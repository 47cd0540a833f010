//! Software command-ring device
//!
//! `SimDevice` executes the command stream synchronously when the tail is
//! published. Tests and tooling steer it through pause, hang, flip and reset
//! controls to reproduce contention and stalls deterministically.

use std::collections::HashMap;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::cmd::{Command, NOOP};
use super::regs;
use super::{EngineId, IrqEvent, RingDevice};
use crate::error::{GemError, GemResult};
use crate::seqno::seqno_passed;

/// Execution mode of a simulated engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    /// Commands execute as soon as the tail moves
    Running,
    /// Tail updates are recorded; commands run only via `process_until`
    Paused,
    /// Nothing executes and the active head is frozen until reset
    Hung,
}

/// A batch the simulated hardware jumped into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedBatch {
    /// Engine that executed it
    pub engine: EngineId,
    /// GPU address
    pub address: u32,
    /// Length in bytes
    pub length: u32,
    /// Privileged dispatch
    pub secure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stall {
    Event(u32),
    Semaphore { signaller: EngineId, seqno: u32 },
}

struct SimEngine {
    ring: Vec<u32>,
    start: u32,
    head: u32,
    tail: u32,
    acthd: u32,
    ctl: u32,
    status: [u32; regs::STATUS_PAGE_DWORDS],
    mode: SimMode,
    stall: Option<Stall>,
    failing_resets: u32,
    resets: u32,
}

impl SimEngine {
    fn new() -> Self {
        Self {
            ring: Vec::new(),
            start: 0,
            head: 0,
            tail: 0,
            acthd: 0,
            ctl: 0,
            status: [0; regs::STATUS_PAGE_DWORDS],
            mode: SimMode::Running,
            stall: None,
            failing_resets: 0,
            resets: 0,
        }
    }

    fn size_bytes(&self) -> u32 {
        (self.ring.len() * 4) as u32
    }

    fn ctl_value(&self) -> u32 {
        let wait = match self.stall {
            Some(Stall::Event(_)) => regs::CTL_WAIT_EVENT,
            Some(Stall::Semaphore { .. }) => regs::CTL_WAIT_SEMAPHORE,
            None => 0,
        };
        self.ctl | wait
    }
}

struct SimState {
    engines: Vec<SimEngine>,
    awake: bool,
    wake_transitions: u32,
    unpowered_accesses: u32,
    pending_flips: u32,
    fences: HashMap<u32, u32>,
    batches: Vec<ExecutedBatch>,
    irq: Option<Sender<IrqEvent>>,
}

impl SimState {
    fn stall_cleared(&self, stall: Stall) -> bool {
        match stall {
            Stall::Event(planes) => planes & self.pending_flips == 0,
            Stall::Semaphore { signaller, seqno } => seqno_passed(
                self.engines[signaller.index()].status[regs::STATUS_SEQNO],
                seqno,
            ),
        }
    }

    /// Execute one command on the engine; returns false if it could not
    fn step(&mut self, idx: usize) -> bool {
        let engine = &self.engines[idx];
        if engine.mode == SimMode::Hung || engine.head == engine.tail || engine.ring.is_empty() {
            return false;
        }
        if let Some(stall) = engine.stall {
            if !self.stall_cleared(stall) {
                return false;
            }
            self.engines[idx].stall = None;
        }

        let engine = &self.engines[idx];
        let pos = (engine.head / 4) as usize;
        let cmd = match Command::decode(&engine.ring[pos..]) {
            Some(cmd) => cmd,
            None => {
                log::warn!(
                    "sim: {} hit undecodable word {:#x} at {:#x}",
                    EngineId::ALL[idx],
                    engine.ring[pos],
                    engine.head
                );
                self.engines[idx].mode = SimMode::Hung;
                return false;
            }
        };

        let id = EngineId::ALL[idx];
        let mut stall = None;
        match cmd {
            Command::Noop | Command::Flush { .. } => {}
            Command::WaitForEvent { planes } => {
                if planes & self.pending_flips != 0 {
                    stall = Some(Stall::Event(planes));
                }
            }
            Command::SemaphoreWait { signaller, seqno } => {
                let candidate = Stall::Semaphore { signaller, seqno };
                if !self.stall_cleared(candidate) {
                    stall = Some(candidate);
                }
            }
            Command::BatchStart {
                address,
                length,
                secure,
            } => {
                self.batches.push(ExecutedBatch {
                    engine: id,
                    address,
                    length,
                    secure,
                });
            }
            Command::StoreSeqno { seqno } => {
                self.engines[idx].status[regs::STATUS_SEQNO] = seqno;
            }
            Command::UserInterrupt => {
                if let Some(sink) = &self.irq {
                    let _ = sink.send(IrqEvent::UserInterrupt(id));
                }
            }
        }

        let engine = &mut self.engines[idx];
        engine.acthd = match cmd {
            Command::BatchStart { address, length, .. } => address.wrapping_add(length),
            _ => engine.start.wrapping_add(engine.head),
        };
        let size = engine.size_bytes();
        engine.head = (engine.head + cmd.len() as u32 * 4) % size;
        engine.stall = stall;
        true
    }

    /// Run every running engine until none can make progress
    fn run(&mut self) {
        loop {
            let mut progressed = false;
            for idx in 0..EngineId::COUNT {
                while self.engines[idx].mode == SimMode::Running && self.step(idx) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn note_access(&mut self, reg: u32) {
        if !self.awake && reg != regs::FORCEWAKE && reg != regs::FORCEWAKE_ACK {
            self.unpowered_accesses += 1;
        }
    }
}

/// Software implementation of [`RingDevice`]
pub struct SimDevice {
    state: Mutex<SimState>,
}

impl SimDevice {
    /// Create an idle device with every engine running
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                engines: (0..EngineId::COUNT).map(|_| SimEngine::new()).collect(),
                awake: false,
                wake_transitions: 0,
                unpowered_accesses: 0,
                pending_flips: 0,
                fences: HashMap::new(),
                batches: Vec::new(),
                irq: None,
            }),
        }
    }

    /// Change an engine's execution mode; switching to `Running` drains it
    pub fn set_mode(&self, engine: EngineId, mode: SimMode) {
        let mut state = self.state.lock();
        state.engines[engine.index()].mode = mode;
        if mode == SimMode::Running {
            state.run();
        }
    }

    /// Current execution mode
    pub fn mode(&self, engine: EngineId) -> SimMode {
        self.state.lock().engines[engine.index()].mode
    }

    /// Stop executing commands on the engine
    pub fn pause(&self, engine: EngineId) {
        self.set_mode(engine, SimMode::Paused);
    }

    /// Resume and drain the engine
    pub fn resume(&self, engine: EngineId) {
        self.set_mode(engine, SimMode::Running);
    }

    /// Freeze the engine until it is reset
    pub fn hang(&self, engine: EngineId) {
        self.set_mode(engine, SimMode::Hung);
    }

    /// Execute a paused engine until its status seqno reaches `seqno`
    pub fn process_until(&self, engine: EngineId, seqno: u32) {
        let mut state = self.state.lock();
        let idx = engine.index();
        while !seqno_passed(state.engines[idx].status[regs::STATUS_SEQNO], seqno) {
            if !state.step(idx) {
                break;
            }
        }
        state.run();
    }

    /// Mark a display flip as pending on a plane
    pub fn queue_flip(&self, plane: u32) {
        self.state.lock().pending_flips |= 1 << plane;
    }

    /// Complete the pending flip on a plane and release engines waiting on it
    pub fn flip_done(&self, plane: u32) {
        let mut state = self.state.lock();
        state.pending_flips &= !(1 << plane);
        state.run();
    }

    /// Make the next `count` resets of the engine fail
    pub fn fail_next_resets(&self, engine: EngineId, count: u32) {
        self.state.lock().engines[engine.index()].failing_resets = count;
    }

    /// Number of successful resets of the engine
    pub fn resets(&self, engine: EngineId) -> u32 {
        self.state.lock().engines[engine.index()].resets
    }

    /// Last seqno stored into the engine's status page
    pub fn completed_seqno(&self, engine: EngineId) -> u32 {
        self.state.lock().engines[engine.index()].status[regs::STATUS_SEQNO]
    }

    /// Batches executed so far, in execution order
    pub fn executed_batches(&self) -> Vec<ExecutedBatch> {
        self.state.lock().batches.clone()
    }

    /// Whether the power domain is currently awake
    pub fn is_awake(&self) -> bool {
        self.state.lock().awake
    }

    /// Number of sleep/wake transitions so far
    pub fn wake_transitions(&self) -> u32 {
        self.state.lock().wake_transitions
    }

    /// Register accesses made while the power domain was asleep
    pub fn unpowered_accesses(&self) -> u32 {
        self.state.lock().unpowered_accesses
    }

    /// Programmed value of a fence register slot
    pub fn fence_value(&self, slot: usize) -> Option<u32> {
        self.state.lock().fences.get(&regs::fence(slot)).copied()
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RingDevice for SimDevice {
    fn read_register(&self, engine: EngineId, reg: u32) -> u32 {
        let mut state = self.state.lock();
        state.note_access(reg);
        let e = &state.engines[engine.index()];
        match reg {
            regs::RING_HEAD => e.head,
            regs::RING_TAIL => e.tail,
            regs::RING_START => e.start,
            regs::RING_CTL => e.ctl_value(),
            regs::RING_ACTHD => e.acthd,
            regs::RING_SEMA_SIGNALLER => match e.stall {
                Some(Stall::Semaphore { signaller, .. }) => signaller.index() as u32,
                _ => 0,
            },
            regs::RING_SEMA_SEQNO => match e.stall {
                Some(Stall::Semaphore { seqno, .. }) => seqno,
                _ => 0,
            },
            regs::FORCEWAKE | regs::FORCEWAKE_ACK => state.awake as u32,
            other => state.fences.get(&other).copied().unwrap_or(0),
        }
    }

    fn write_register(&self, engine: EngineId, reg: u32, value: u32) {
        let mut state = self.state.lock();
        state.note_access(reg);
        let idx = engine.index();
        match reg {
            regs::FORCEWAKE => {
                let awake = value & 1 != 0;
                if awake != state.awake {
                    state.awake = awake;
                    state.wake_transitions += 1;
                }
            }
            regs::RING_HEAD => state.engines[idx].head = value,
            regs::RING_START => state.engines[idx].start = value,
            regs::RING_CTL => {
                let e = &mut state.engines[idx];
                let size = (value & !0xfff) as usize / 4;
                if size != e.ring.len() {
                    e.ring = vec![NOOP; size];
                }
                // Clearing a wait bit kicks the engine out of its stall.
                let stall = e.stall;
                match stall {
                    Some(Stall::Event(_)) if value & regs::CTL_WAIT_EVENT == 0 => e.stall = None,
                    Some(Stall::Semaphore { .. }) if value & regs::CTL_WAIT_SEMAPHORE == 0 => {
                        e.stall = None
                    }
                    _ => {}
                }
                e.ctl = value & !(regs::CTL_WAIT_EVENT | regs::CTL_WAIT_SEMAPHORE);
                state.run();
            }
            regs::RING_TAIL => {
                state.engines[idx].tail = value;
                state.run();
            }
            other => {
                state.fences.insert(other, value);
            }
        }
    }

    fn write_ring(&self, engine: EngineId, offset: u32, words: &[u32]) {
        let mut state = self.state.lock();
        let ring = &mut state.engines[engine.index()].ring;
        let start = (offset / 4) as usize;
        if ring.len() < start + words.len() {
            ring.resize(start + words.len(), NOOP);
        }
        ring[start..start + words.len()].copy_from_slice(words);
    }

    fn read_status(&self, engine: EngineId, index: usize) -> u32 {
        self.state.lock().engines[engine.index()]
            .status
            .get(index)
            .copied()
            .unwrap_or(0)
    }

    fn write_status(&self, engine: EngineId, index: usize, value: u32) {
        let mut state = self.state.lock();
        if let Some(slot) = state.engines[engine.index()].status.get_mut(index) {
            *slot = value;
        }
    }

    fn reset(&self, engine: EngineId) -> GemResult<()> {
        let mut state = self.state.lock();
        let e = &mut state.engines[engine.index()];
        if e.failing_resets > 0 {
            e.failing_resets -= 1;
            return Err(GemError::ResetFailed);
        }
        e.head = 0;
        e.tail = 0;
        e.acthd = 0;
        e.ctl = 0;
        e.stall = None;
        e.mode = SimMode::Running;
        e.ring.iter_mut().for_each(|w| *w = NOOP);
        e.resets += 1;
        Ok(())
    }

    fn connect_interrupts(&self, sink: Sender<IrqEvent>) {
        self.state.lock().irq = Some(sink);
    }
}
