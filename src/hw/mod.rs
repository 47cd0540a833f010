//! Hardware boundary: engines, register names, and the command-ring device trait

pub mod cmd;
#[cfg(feature = "sim")]
pub mod sim;

use std::fmt;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::GemResult;

/// One independent command-execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineId {
    /// 3D/render engine, the only one that accepts hardware contexts
    Render,
    /// Video decode/encode engine
    Video,
    /// Blitter engine
    Blit,
}

impl EngineId {
    /// Number of engines
    pub const COUNT: usize = 3;

    /// All engines in index order
    pub const ALL: [EngineId; 3] = [EngineId::Render, EngineId::Video, EngineId::Blit];

    /// Dense index for per-engine arrays
    pub fn index(self) -> usize {
        match self {
            EngineId::Render => 0,
            EngineId::Video => 1,
            EngineId::Blit => 2,
        }
    }

    /// Inverse of [`EngineId::index`]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Single-bit mask for this engine
    pub fn mask(self) -> u32 {
        1 << self.index()
    }

    /// Engines selected by a bitmask, in index order
    pub fn from_mask(mask: u32) -> impl Iterator<Item = EngineId> {
        Self::ALL.into_iter().filter(move |e| mask & e.mask() != 0)
    }

    /// Short lowercase name
    pub fn name(self) -> &'static str {
        match self {
            EngineId::Render => "render",
            EngineId::Video => "video",
            EngineId::Blit => "blit",
        }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Notification raised by the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    /// A user interrupt command executed on the engine
    UserInterrupt(EngineId),
}

/// Symbolic per-engine register offsets
///
/// These name the handful of registers the core needs; they do not follow
/// any particular hardware generation.
pub mod regs {
    /// Ring head (bytes), advanced by the hardware
    pub const RING_HEAD: u32 = 0x00;
    /// Ring tail (bytes), published by software
    pub const RING_TAIL: u32 = 0x04;
    /// Ring start address
    pub const RING_START: u32 = 0x08;
    /// Ring control: size, enable and wait state bits
    pub const RING_CTL: u32 = 0x0c;
    /// Active head, the address of the command being executed
    pub const RING_ACTHD: u32 = 0x10;
    /// Engine the pending semaphore wait is waiting on
    pub const RING_SEMA_SIGNALLER: u32 = 0x14;
    /// Seqno the pending semaphore wait is waiting for
    pub const RING_SEMA_SEQNO: u32 = 0x18;
    /// Power-domain wake request (global, render block)
    pub const FORCEWAKE: u32 = 0x100;
    /// Power-domain wake acknowledgement (global, render block)
    pub const FORCEWAKE_ACK: u32 = 0x104;
    /// First fence register; each slot spans two dwords
    pub const FENCE_BASE: u32 = 0x200;

    /// Ring enabled
    pub const CTL_ENABLE: u32 = 1 << 0;
    /// Engine is blocked on a semaphore wait
    pub const CTL_WAIT_SEMAPHORE: u32 = 1 << 10;
    /// Engine is blocked on a wait-for-event
    pub const CTL_WAIT_EVENT: u32 = 1 << 11;

    /// Status page dword holding the last stored seqno
    pub const STATUS_SEQNO: usize = 0x20;
    /// Size of the status page in dwords
    pub const STATUS_PAGE_DWORDS: usize = 64;

    /// Register pair for fence slot `slot`
    pub fn fence(slot: usize) -> u32 {
        FENCE_BASE + (slot as u32) * 8
    }
}

/// The opaque command-ring device
///
/// Register accessors must be called with the power domain awake; the core
/// routes them through [`crate::ring::WakeGate`]. The status page is plain
/// memory and may be read from interrupt context without waking anything.
#[cfg_attr(test, mockall::automock)]
pub trait RingDevice: Send + Sync {
    /// Read a per-engine register
    fn read_register(&self, engine: EngineId, reg: u32) -> u32;

    /// Write a per-engine register
    fn write_register(&self, engine: EngineId, reg: u32, value: u32);

    /// Copy command words into the engine's ring memory at a byte offset
    fn write_ring(&self, engine: EngineId, offset: u32, words: &[u32]);

    /// Read a dword of the engine's status page
    fn read_status(&self, engine: EngineId, index: usize) -> u32;

    /// Write a dword of the engine's status page
    fn write_status(&self, engine: EngineId, index: usize, value: u32);

    /// Reset the engine; ring pointers return to zero on success
    fn reset(&self, engine: EngineId) -> GemResult<()>;

    /// Route interrupts to the given sink, replacing any previous one
    fn connect_interrupts(&self, sink: Sender<IrqEvent>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_index_roundtrip() {
        for engine in EngineId::ALL {
            assert_eq!(EngineId::from_index(engine.index()), Some(engine));
        }
        assert_eq!(EngineId::from_index(3), None);
    }

    #[test]
    fn test_engine_mask() {
        let engines: Vec<_> = EngineId::from_mask(0b101).collect();
        assert_eq!(engines, vec![EngineId::Render, EngineId::Blit]);
        assert_eq!(EngineId::Video.to_string(), "video");
    }
}
