//! Per-engine completion tracking
//!
//! The tracker owns the seqno watermarks under a dedicated lock so the
//! interrupt path never contends with submitters holding the device lock.
//! Request queues live with the rest of the device state; this module only
//! supplies the FIFO container and the completion rule they follow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{GemError, GemResult};
use crate::hw::EngineId;
use crate::mm::ObjectId;
use crate::sched::ClientId;

/// Whether seqno `a` is at or after `b`, tolerant of wraparound
pub fn seqno_passed(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

const RESET_IN_PROGRESS: u32 = 1;
const WEDGED: u32 = u32::MAX;

/// Global reset state shared by waiters, submitters and the hang monitor
///
/// The counter's low bit marks a reset in progress; each completed reset
/// bumps the generation. `u32::MAX` is the terminal, permanently wedged value.
#[derive(Debug, Default)]
pub struct ResetState {
    counter: AtomicU32,
}

impl ResetState {
    /// Raw counter value, used to detect a reset across a wait
    pub fn generation(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    /// A reset has been declared and not yet completed
    pub fn in_progress(&self) -> bool {
        let c = self.generation();
        c != WEDGED && c & RESET_IN_PROGRESS != 0
    }

    /// The device is permanently disabled
    pub fn is_terminally_wedged(&self) -> bool {
        self.generation() == WEDGED
    }

    /// Fail fast if the device is wedged or dead
    pub fn check(&self) -> GemResult<()> {
        let c = self.generation();
        if c == WEDGED {
            Err(GemError::ResetFailed)
        } else if c & RESET_IN_PROGRESS != 0 {
            Err(GemError::Wedged)
        } else {
            Ok(())
        }
    }

    /// Declare a reset; returns false if one was already pending
    pub fn begin(&self) -> bool {
        let prev = self.counter.fetch_or(RESET_IN_PROGRESS, Ordering::AcqRel);
        prev & RESET_IN_PROGRESS == 0
    }

    /// Complete a reset, clearing the in-progress bit
    pub fn finish(&self) {
        let _ = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c == WEDGED || c & RESET_IN_PROGRESS == 0 {
                    None
                } else {
                    Some(c.wrapping_add(1))
                }
            });
    }

    /// Disable the device for good
    pub fn set_terminal(&self) {
        self.counter.store(WEDGED, Ordering::Release);
    }
}

/// Lifecycle of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Seqno allocated, commands not yet published
    Pending,
    /// Published to the ring, not yet observed complete
    Submitted,
    /// Watermark passed, bindings not yet swept
    Signaled,
    /// Swept; no longer tracked
    Retired,
}

/// One submitted batch
#[derive(Debug, Clone)]
pub struct Request {
    /// Engine it runs on
    pub engine: EngineId,
    /// Completion value
    pub seqno: u32,
    /// Ring tail after this request's commands
    pub tail: u32,
    /// When the commands were published
    pub emitted_at: Instant,
    /// Wall-clock submission time
    pub submitted_at: chrono::DateTime<chrono::Local>,
    /// Owning client, if still tracked
    pub client: Option<ClientId>,
    /// Objects whose bindings this request keeps active
    pub objects: Vec<ObjectId>,
    /// Scheduler priority the client had at admission
    pub priority: u32,
}

/// FIFO of outstanding requests on one engine
#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: VecDeque<Request>,
}

impl RequestQueue {
    /// Append a newly committed request
    pub fn push(&mut self, request: Request) {
        debug_assert!(self
            .requests
            .back()
            .map_or(true, |last| !seqno_passed(last.seqno, request.seqno)));
        self.requests.push_back(request);
    }

    /// Pop every request at or below the watermark, stopping at the first incomplete one
    pub fn drain_completed(&mut self, watermark: u32) -> Vec<Request> {
        let mut done = Vec::new();
        while let Some(front) = self.requests.front() {
            if !seqno_passed(watermark, front.seqno) {
                break;
            }
            if let Some(request) = self.requests.pop_front() {
                done.push(request);
            }
        }
        done
    }

    /// Oldest request whose completion frees at least `needed` ring bytes,
    /// as `(seqno, ring tail after it)`
    pub fn first_freeing(&self, mut space_after: impl FnMut(u32) -> u32, needed: u32) -> Option<(u32, u32)> {
        self.requests
            .iter()
            .find(|r| space_after(r.tail) >= needed)
            .map(|r| (r.seqno, r.tail))
    }

    /// Newest seqno in flight
    pub fn last_seqno(&self) -> Option<u32> {
        self.requests.back().map(|r| r.seqno)
    }

    /// Oldest request in flight
    pub fn front(&self) -> Option<&Request> {
        self.requests.front()
    }

    /// Requests in flight, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    /// Number of requests in flight
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// No work outstanding
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Remove everything, for reset recovery
    pub fn take_all(&mut self) -> Vec<Request> {
        self.requests.drain(..).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Watermarks {
    next: [u32; EngineId::COUNT],
    completed: [u32; EngineId::COUNT],
}

/// Seqno allocator, completion watermarks and waiters
pub struct SeqnoTracker {
    marks: Mutex<Watermarks>,
    advanced: Condvar,
}

impl SeqnoTracker {
    /// Create a tracker with every engine at seqno 0
    pub fn new() -> Self {
        Self {
            marks: Mutex::new(Watermarks {
                next: [1; EngineId::COUNT],
                completed: [0; EngineId::COUNT],
            }),
            advanced: Condvar::new(),
        }
    }

    /// Next unused seqno for the engine; never returns 0
    pub fn allocate_seqno(&self, engine: EngineId) -> u32 {
        let mut marks = self.marks.lock();
        let slot = &mut marks.next[engine.index()];
        let seqno = *slot;
        *slot = slot.wrapping_add(1);
        if *slot == 0 {
            *slot = 1;
        }
        seqno
    }

    /// Last seqno handed out for the engine, or 0 if none yet
    pub fn last_allocated(&self, engine: EngineId) -> u32 {
        let next = self.marks.lock().next[engine.index()];
        if next == 1 {
            0
        } else {
            next.wrapping_sub(1)
        }
    }

    /// Last seqno observed complete
    pub fn completed(&self, engine: EngineId) -> u32 {
        self.marks.lock().completed[engine.index()]
    }

    /// Whether `seqno` has been observed complete
    pub fn is_complete(&self, engine: EngineId, seqno: u32) -> bool {
        seqno_passed(self.completed(engine), seqno)
    }

    /// Advance the watermark and wake waiters
    ///
    /// Returns true if the watermark moved. Stale values are ignored so the
    /// watermark never runs backwards.
    pub fn on_interrupt(&self, engine: EngineId, hw_seqno: u32) -> bool {
        let mut marks = self.marks.lock();
        let slot = &mut marks.completed[engine.index()];
        if hw_seqno == *slot || !seqno_passed(hw_seqno, *slot) {
            return false;
        }
        *slot = hw_seqno;
        log::trace!("seqno: {} completed {}", engine, hw_seqno);
        drop(marks);
        self.advanced.notify_all();
        true
    }

    /// Force the watermark, for reset recovery
    pub fn rewind(&self, engine: EngineId, completed: u32) {
        let mut marks = self.marks.lock();
        marks.completed[engine.index()] = completed;
        drop(marks);
        self.advanced.notify_all();
    }

    /// Wake every waiter so it re-examines the reset state
    pub fn wake_all(&self) {
        // Taking the lock orders this against a waiter's flag check.
        let _marks = self.marks.lock();
        self.advanced.notify_all();
    }

    /// Block until `seqno` completes on `engine`
    ///
    /// Returns `Wedged` as soon as a reset is declared, and `Timeout` when the
    /// deadline passes with the request still in flight.
    pub fn wait(
        &self,
        engine: EngineId,
        seqno: u32,
        timeout: Duration,
        reset: &ResetState,
    ) -> GemResult<()> {
        let deadline = Instant::now() + timeout;
        let mut marks = self.marks.lock();
        loop {
            if seqno_passed(marks.completed[engine.index()], seqno) {
                return Ok(());
            }
            reset.check()?;
            if self.advanced.wait_until(&mut marks, deadline).timed_out() {
                if seqno_passed(marks.completed[engine.index()], seqno) {
                    return Ok(());
                }
                reset.check()?;
                log::warn!("seqno: wait for {} on {} timed out", seqno, engine);
                return Err(GemError::Timeout);
            }
        }
    }
}

impl Default for SeqnoTracker {
    fn default() -> Self {
        Self::new()
    }
}
