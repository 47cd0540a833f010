//! Reference-counted power-domain wake gate
//!
//! The first holder wakes the register block and waits for the
//! acknowledgement; the last holder lets it sleep again. The count has its
//! own lock so the interrupt path and the hang monitor never queue behind a
//! submitter holding the device lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::hw::{regs, EngineId, RingDevice};
use crate::mm::FenceWriter;

const ACK_POLLS: u32 = 1_000;

/// Wake gate around register access
pub struct WakeGate {
    hw: Arc<dyn RingDevice>,
    holders: Mutex<u32>,
}

impl WakeGate {
    /// Gate in front of `hw`
    pub fn new(hw: Arc<dyn RingDevice>) -> Self {
        Self {
            hw,
            holders: Mutex::new(0),
        }
    }

    /// The gated device
    pub fn device(&self) -> &Arc<dyn RingDevice> {
        &self.hw
    }

    /// Current number of holders
    pub fn holders(&self) -> u32 {
        *self.holders.lock()
    }

    /// Keep the power domain awake until the guard drops
    pub fn acquire(&self) -> WakeGuard<'_> {
        let mut holders = self.holders.lock();
        if *holders == 0 {
            self.hw.write_register(EngineId::Render, regs::FORCEWAKE, 1);
            let acked = (0..ACK_POLLS)
                .any(|_| self.hw.read_register(EngineId::Render, regs::FORCEWAKE_ACK) & 1 != 0);
            if !acked {
                log::error!("wake: timed out waiting for power-domain acknowledgement");
            }
        }
        *holders += 1;
        WakeGuard { gate: self }
    }

    fn release(&self) {
        let mut holders = self.holders.lock();
        *holders = holders.saturating_sub(1);
        if *holders == 0 {
            self.hw.write_register(EngineId::Render, regs::FORCEWAKE, 0);
        }
    }

    /// Read a register with the domain held awake for just this access
    pub fn read(&self, engine: EngineId, reg: u32) -> u32 {
        self.acquire().read(engine, reg)
    }

    /// Write a register with the domain held awake for just this access
    pub fn write(&self, engine: EngineId, reg: u32, value: u32) {
        self.acquire().write(engine, reg, value)
    }
}

impl FenceWriter for WakeGate {
    fn write_fence(&self, slot: usize, value: u32) {
        self.write(EngineId::Render, regs::fence(slot), value);
    }
}

/// Scoped hold on the wake gate
pub struct WakeGuard<'a> {
    gate: &'a WakeGate,
}

impl WakeGuard<'_> {
    /// Read a register under this hold
    pub fn read(&self, engine: EngineId, reg: u32) -> u32 {
        self.gate.hw.read_register(engine, reg)
    }

    /// Write a register under this hold
    pub fn write(&self, engine: EngineId, reg: u32, value: u32) {
        self.gate.hw.write_register(engine, reg, value)
    }
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::MockRingDevice;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn mock_with_wake_cycle() -> MockRingDevice {
        let mut mock = MockRingDevice::new();
        let mut seq = Sequence::new();
        mock.expect_write_register()
            .with(eq(EngineId::Render), eq(regs::FORCEWAKE), eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        mock.expect_read_register()
            .with(eq(EngineId::Render), eq(regs::FORCEWAKE_ACK))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(1u32);
        mock.expect_read_register()
            .with(eq(EngineId::Blit), eq(regs::RING_HEAD))
            .times(2)
            .in_sequence(&mut seq)
            .return_const(0x40u32);
        mock.expect_write_register()
            .with(eq(EngineId::Render), eq(regs::FORCEWAKE), eq(0))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        mock
    }

    #[test]
    fn test_nested_holds_wake_once() {
        let gate = WakeGate::new(Arc::new(mock_with_wake_cycle()));
        {
            let outer = gate.acquire();
            assert_eq!(outer.read(EngineId::Blit, regs::RING_HEAD), 0x40);
            {
                let inner = gate.acquire();
                assert_eq!(gate.holders(), 2);
                assert_eq!(inner.read(EngineId::Blit, regs::RING_HEAD), 0x40);
            }
            assert_eq!(gate.holders(), 1);
        }
        assert_eq!(gate.holders(), 0);
    }

    #[test]
    fn test_release_on_early_return() {
        fn probe(gate: &WakeGate) -> Result<u32, ()> {
            let guard = gate.acquire();
            let head = guard.read(EngineId::Blit, regs::RING_HEAD);
            if head != 0 {
                return Err(());
            }
            Ok(guard.read(EngineId::Blit, regs::RING_HEAD))
        }

        let mut mock = MockRingDevice::new();
        mock.expect_write_register()
            .with(eq(EngineId::Render), eq(regs::FORCEWAKE), eq(1))
            .times(1)
            .return_const(());
        mock.expect_read_register()
            .with(eq(EngineId::Render), eq(regs::FORCEWAKE_ACK))
            .return_const(1u32);
        mock.expect_read_register()
            .with(eq(EngineId::Blit), eq(regs::RING_HEAD))
            .times(1)
            .return_const(0x40u32);
        mock.expect_write_register()
            .with(eq(EngineId::Render), eq(regs::FORCEWAKE), eq(0))
            .times(1)
            .return_const(());

        let gate = WakeGate::new(Arc::new(mock));
        assert!(probe(&gate).is_err());
        assert_eq!(gate.holders(), 0);
    }
}
