//! Per-engine command ring writer
//!
//! A [`Ring`] tracks the software view of one engine's ring: cached head,
//! tail, and words emitted since the last publish. Space is reclaimed by
//! waiting on the oldest request whose completion moves the head far enough;
//! the caller supplies that wait so the ring stays independent of the
//! request queues.

mod wake;

pub use wake::{WakeGate, WakeGuard};

use crate::error::{GemError, GemResult};
use crate::hw::cmd::{Command, NOOP};
use crate::hw::{regs, EngineId};

/// Bytes kept free between tail and head so they never meet
pub const RING_FREE_SPACE: u32 = 64;

/// Free bytes between `tail` and `head` on a ring of `size` bytes
pub fn ring_space(head: u32, tail: u32, size: u32) -> u32 {
    let space = head as i64 - (tail as i64 + RING_FREE_SPACE as i64);
    let space = if space < 0 { space + size as i64 } else { space };
    space.max(0) as u32
}

/// Software state of one engine's ring
#[derive(Debug)]
pub struct Ring {
    engine: EngineId,
    size: u32,
    head: u32,
    tail: u32,
    published: u32,
    pending: Vec<u32>,
    pending_start: u32,
    reserved: usize,
}

impl Ring {
    /// Ring of `size` bytes (a power of two) for `engine`
    pub fn new(engine: EngineId, size: u32) -> Self {
        Self {
            engine,
            size,
            head: 0,
            tail: 0,
            published: 0,
            pending: Vec::new(),
            pending_start: 0,
            reserved: 0,
        }
    }

    /// Engine this ring feeds
    pub fn engine(&self) -> EngineId {
        self.engine
    }

    /// Size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Cached head
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Software tail, including unpublished words
    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Tail last written to the hardware
    pub fn published(&self) -> u32 {
        self.published
    }

    /// Free bytes given the cached head
    pub fn space(&self) -> u32 {
        ring_space(self.head, self.tail, self.size)
    }

    /// Free bytes if the head were at `head`
    pub fn space_after(&self, head: u32) -> u32 {
        ring_space(head, self.tail, self.size)
    }

    /// Record a newer head, e.g. the tail of a retired request
    pub fn set_head(&mut self, head: u32) {
        self.head = head % self.size;
    }

    /// Program the ring registers and zero the software pointers
    pub fn init(&mut self, gate: &WakeGate) {
        let guard = gate.acquire();
        guard.write(self.engine, regs::RING_CTL, 0);
        guard.write(self.engine, regs::RING_HEAD, 0);
        guard.write(self.engine, regs::RING_TAIL, 0);
        guard.write(self.engine, regs::RING_START, 0);
        guard.write(self.engine, regs::RING_CTL, self.size | regs::CTL_ENABLE);
        self.head = 0;
        self.tail = 0;
        self.published = 0;
        self.pending.clear();
        self.pending_start = 0;
        self.reserved = 0;
    }

    /// Re-read the hardware head
    pub fn refresh_head(&mut self, gate: &WakeGate) -> u32 {
        self.head = gate.read(self.engine, regs::RING_HEAD) % self.size;
        self.head
    }

    /// Reserve room for `n_words` contiguous words
    ///
    /// Pads to the end of the ring with no-ops when the request would
    /// straddle the wrap point. When space is short `wait_for_space` is
    /// called with the bytes needed and must block until the head has
    /// moved, returning the new head.
    pub fn begin(
        &mut self,
        n_words: usize,
        wait_for_space: &mut dyn FnMut(&Ring, u32) -> GemResult<u32>,
    ) -> GemResult<()> {
        let bytes = n_words as u32 * 4;
        if bytes + RING_FREE_SPACE > self.size {
            return Err(GemError::InvalidArgument(format!(
                "{} words do not fit a {} byte ring",
                n_words, self.size
            )));
        }
        debug_assert_eq!(self.reserved, 0, "begin without matching emits");

        if self.tail + bytes > self.size {
            let rem = self.size - self.tail;
            self.ensure_space(rem, wait_for_space)?;
            log::trace!("ring: {} wraps, padding {} bytes", self.engine, rem);
            self.pending.extend(std::iter::repeat(NOOP).take((rem / 4) as usize));
            self.tail = 0;
        }
        self.ensure_space(bytes, wait_for_space)?;
        self.reserved = n_words;
        Ok(())
    }

    fn ensure_space(
        &mut self,
        bytes: u32,
        wait_for_space: &mut dyn FnMut(&Ring, u32) -> GemResult<u32>,
    ) -> GemResult<()> {
        if self.space() >= bytes {
            return Ok(());
        }
        let head = wait_for_space(self, bytes)?;
        self.set_head(head);
        if self.space() < bytes {
            return Err(GemError::NoSpace);
        }
        Ok(())
    }

    /// Append one command word
    pub fn emit(&mut self, word: u32) {
        debug_assert!(self.reserved > 0, "emit beyond reservation");
        self.reserved = self.reserved.saturating_sub(1);
        self.pending.push(word);
        self.tail = (self.tail + 4) % self.size;
    }

    /// Append an encoded command
    pub fn emit_command(&mut self, cmd: &Command) {
        let mut words = Vec::with_capacity(cmd.len());
        cmd.encode(&mut words);
        for word in words {
            self.emit(word);
        }
    }

    /// Copy pending words to ring memory and publish the tail
    ///
    /// When `stopped` is set the words reach ring memory but the tail
    /// register is left alone, so the hardware never sees them.
    pub fn advance(&mut self, gate: &WakeGate, stopped: bool) {
        debug_assert_eq!(self.reserved, 0, "advance with unfilled reservation");
        if !self.pending.is_empty() {
            let words = std::mem::take(&mut self.pending);
            let first = ((self.size - self.pending_start) / 4) as usize;
            if words.len() > first {
                gate.device().write_ring(self.engine, self.pending_start, &words[..first]);
                gate.device().write_ring(self.engine, 0, &words[first..]);
            } else {
                gate.device().write_ring(self.engine, self.pending_start, &words);
            }
        }
        self.pending_start = self.tail;
        if stopped {
            log::debug!("ring: {} stopped, dropping tail {:#x}", self.engine, self.tail);
            return;
        }
        gate.write(self.engine, regs::RING_TAIL, self.tail);
        self.published = self.tail;
        log::trace!("ring: {} tail -> {:#x}", self.engine, self.tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::MockRingDevice;
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::sync::Arc;

    #[derive(Default)]
    struct Log {
        ring_writes: Vec<(u32, Vec<u32>)>,
        tails: Vec<u32>,
    }

    fn recording_gate() -> (WakeGate, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut mock = MockRingDevice::new();
        mock.expect_read_register()
            .returning(|_, reg| if reg == regs::FORCEWAKE_ACK { 1 } else { 0 });
        let l = log.clone();
        mock.expect_write_register().returning(move |_, reg, value| {
            if reg == regs::RING_TAIL {
                l.lock().tails.push(value);
            }
        });
        let l = log.clone();
        mock.expect_write_ring()
            .returning(move |_, offset, words| l.lock().ring_writes.push((offset, words.to_vec())));
        (WakeGate::new(Arc::new(mock)), log)
    }

    fn no_wait(_: &Ring, _: u32) -> GemResult<u32> {
        Err(GemError::NoSpace)
    }

    #[rstest]
    #[case(0, 0, 4096, 4096 - 64)]
    #[case(128, 0, 4096, 64)]
    #[case(0, 128, 4096, 4096 - 192)]
    #[case(64, 0, 4096, 0)]
    fn test_ring_space(#[case] head: u32, #[case] tail: u32, #[case] size: u32, #[case] expected: u32) {
        assert_eq!(ring_space(head, tail, size), expected);
    }

    #[test]
    fn test_emit_and_advance_publishes_tail() {
        let (gate, log) = recording_gate();
        let mut ring = Ring::new(EngineId::Render, 4096);
        ring.begin(2, &mut no_wait).unwrap();
        ring.emit_command(&Command::StoreSeqno { seqno: 1 });
        ring.advance(&gate, false);
        let log = log.lock();
        assert_eq!(log.tails, vec![8]);
        assert_eq!(log.ring_writes[0].0, 0);
        assert_eq!(log.ring_writes[0].1.len(), 2);
    }

    #[test]
    fn test_stopped_ring_drops_tail_update() {
        let (gate, log) = recording_gate();
        let mut ring = Ring::new(EngineId::Video, 4096);
        ring.begin(1, &mut no_wait).unwrap();
        ring.emit(NOOP);
        ring.advance(&gate, true);
        assert!(log.lock().tails.is_empty());
        assert_eq!(ring.published(), 0);
        assert_eq!(ring.tail(), 4);
    }

    #[test]
    fn test_wrap_pads_with_noops() {
        let (gate, log) = recording_gate();
        let mut ring = Ring::new(EngineId::Blit, 4096);
        // Idle ring whose pointers sit 16 bytes before the end.
        ring.head = 4080;
        ring.tail = 4080;
        ring.pending_start = 4080;
        ring.published = 4080;

        ring.begin(8, &mut no_wait).unwrap();
        for i in 0..8 {
            ring.emit(0x100 + i);
        }
        ring.advance(&gate, false);
        assert_eq!(ring.tail(), 32);

        let log = log.lock();
        assert_eq!(log.ring_writes[0], (4080, vec![NOOP; 4]));
        assert_eq!(log.ring_writes[1].0, 0);
        assert_eq!(log.ring_writes[1].1[0], 0x100);
        assert_eq!(log.tails, vec![32]);
    }

    #[test]
    fn test_begin_waits_for_space() {
        let mut ring = Ring::new(EngineId::Render, 4096);
        ring.set_head(0);
        ring.tail = 4096 - 128;
        ring.head = 4096 - 64;
        let mut calls = 0;
        ring.begin(4, &mut |r, needed| {
            calls += 1;
            assert!(r.space() < needed);
            Ok(1024)
        })
        .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_oversized_reservation_rejected() {
        let mut ring = Ring::new(EngineId::Render, 4096);
        assert!(matches!(
            ring.begin(1024, &mut no_wait),
            Err(GemError::InvalidArgument(_))
        ));
    }
}
