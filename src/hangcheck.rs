//! Hang detection and reset bookkeeping
//!
//! The monitor samples every engine on a timer. An engine whose seqno has
//! not moved while work is outstanding accumulates score: a little if its
//! active head still moves, more if it had to be kicked out of a wait, a lot
//! if nothing moved at all. Progress decays the score. Crossing the fire
//! threshold declares the device wedged and hands it to recovery.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::HangcheckConfig;
use crate::error::GemResult;
use crate::hw::{regs, EngineId};
use crate::ring::WakeGate;
use crate::seqno::SeqnoTracker;

/// Coarse liveness of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Making progress or idle
    Active,
    /// Stuck for at least one sample
    Suspect,
    /// Over the fire threshold
    Hung,
}

/// What the last sample concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HangAction {
    /// No work outstanding
    Idle,
    /// Seqno advanced
    Progress,
    /// Seqno stuck but the active head moved
    Busy,
    /// Engine was released from a wait
    Kick,
    /// Nothing moved
    Hung,
}

/// Per-engine hang-check view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHealth {
    /// Engine sampled
    pub engine: EngineId,
    /// Status-page seqno at the last sample
    pub seqno: u32,
    /// Active head at the last sample
    pub acthd: u32,
    /// Accumulated score
    pub score: u32,
    /// Liveness derived from the score
    pub state: EngineState,
    /// Outcome of the last sample
    pub action: HangAction,
}

impl EngineHealth {
    fn new(engine: EngineId) -> Self {
        Self {
            engine,
            seqno: 0,
            acthd: 0,
            score: 0,
            state: EngineState::Active,
            action: HangAction::Idle,
        }
    }
}

impl fmt::Display for EngineHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<6} seqno {:>8} acthd {:#010x} score {:>3} {:?} ({:?})",
            self.engine.name(),
            self.seqno,
            self.acthd,
            self.score,
            self.state,
            self.action
        )
    }
}

/// Periodic liveness sampler
#[derive(Debug, Clone)]
pub struct HangMonitor {
    config: HangcheckConfig,
    health: Vec<EngineHealth>,
}

impl HangMonitor {
    /// Monitor with every engine at score zero
    pub fn new(config: HangcheckConfig) -> Self {
        Self {
            config,
            health: EngineId::ALL.into_iter().map(EngineHealth::new).collect(),
        }
    }

    /// Scoring settings
    pub fn config(&self) -> &HangcheckConfig {
        &self.config
    }

    /// Turn the periodic check on or off
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// Current view of every engine
    pub fn health(&self) -> Vec<EngineHealth> {
        self.health.clone()
    }

    /// Forget all scores, after a reset
    pub fn clear(&mut self) {
        for h in &mut self.health {
            *h = EngineHealth::new(h.engine);
        }
    }

    fn classify(&self, score: u32) -> EngineState {
        if score > self.config.fire_score {
            EngineState::Hung
        } else if score > 0 {
            EngineState::Suspect
        } else {
            EngineState::Active
        }
    }

    /// Sample `engines`; `busy` tells whether an engine has requests outstanding
    ///
    /// Returns the engines over the fire threshold.
    pub fn check(
        &mut self,
        gate: &WakeGate,
        tracker: &SeqnoTracker,
        engines: &[EngineId],
        busy: impl Fn(EngineId) -> bool,
    ) -> Vec<EngineId> {
        let guard = gate.acquire();
        let mut hung = Vec::new();
        for &engine in engines {
            let seqno = gate.device().read_status(engine, regs::STATUS_SEQNO);
            let acthd = guard.read(engine, regs::RING_ACTHD);
            let prev = &self.health[engine.index()];
            let (prev_seqno, prev_acthd, mut score) = (prev.seqno, prev.acthd, prev.score);

            let action = if !busy(engine) {
                HangAction::Idle
            } else if seqno != prev_seqno {
                HangAction::Progress
            } else {
                let ctl = guard.read(engine, regs::RING_CTL);
                if ctl & regs::CTL_WAIT_EVENT != 0 {
                    log::warn!("hangcheck: kicking {} out of an event wait", engine);
                    guard.write(engine, regs::RING_CTL, ctl & !regs::CTL_WAIT_EVENT);
                    HangAction::Kick
                } else if ctl & regs::CTL_WAIT_SEMAPHORE != 0 {
                    let signaller = guard.read(engine, regs::RING_SEMA_SIGNALLER);
                    let wanted = guard.read(engine, regs::RING_SEMA_SEQNO);
                    let satisfied = EngineId::from_index(signaller as usize)
                        .map_or(false, |s| tracker.is_complete(s, wanted));
                    if satisfied {
                        log::warn!("hangcheck: kicking {} past a satisfied semaphore", engine);
                        guard.write(engine, regs::RING_CTL, ctl & !regs::CTL_WAIT_SEMAPHORE);
                        HangAction::Kick
                    } else {
                        HangAction::Hung
                    }
                } else if acthd != prev_acthd {
                    HangAction::Busy
                } else {
                    HangAction::Hung
                }
            };

            score = match action {
                HangAction::Idle | HangAction::Progress => score.saturating_sub(1),
                HangAction::Busy => score + self.config.busy_score,
                HangAction::Kick => score + self.config.kick_score,
                HangAction::Hung => score + self.config.hung_score,
            };
            let state = self.classify(score);
            if state == EngineState::Hung {
                log::error!("hangcheck: {} hung at seqno {} (score {})", engine, seqno, score);
                hung.push(engine);
            } else if action == HangAction::Hung {
                log::warn!("hangcheck: {} stuck at seqno {} (score {})", engine, seqno, score);
            }
            self.health[engine.index()] = EngineHealth {
                engine,
                seqno,
                acthd,
                score,
                state,
                action,
            };
        }
        hung
    }
}

/// Reset attempts and the failure window
#[derive(Debug, Clone)]
pub struct ResetHistory {
    window: Duration,
    last_failure: Option<Instant>,
    resets: u64,
}

impl ResetHistory {
    /// Two failures within `window` are terminal
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_failure: None,
            resets: 0,
        }
    }

    /// Completed resets
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Note a successful reset
    pub fn record_success(&mut self) {
        self.resets += 1;
    }

    /// Note a failed reset; returns true when the device must be given up
    pub fn record_failure(&mut self, now: Instant) -> bool {
        let terminal = self
            .last_failure
            .map_or(false, |last| now.saturating_duration_since(last) < self.window);
        self.last_failure = Some(now);
        terminal
    }
}

/// Reset every engine in `engines` with the power domain held awake
pub fn reset_engines(gate: &WakeGate, engines: &[EngineId]) -> GemResult<()> {
    let _guard = gate.acquire();
    for &engine in engines {
        log::info!("hangcheck: resetting {}", engine);
        gate.device().reset(engine)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GemError;
    use crate::hw::MockRingDevice;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Regs {
        seqno: u32,
        acthd: u32,
        ctl: u32,
        sema_signaller: u32,
        sema_seqno: u32,
        ctl_writes: Vec<u32>,
    }

    fn fake_device(regs_state: Arc<Mutex<Regs>>) -> WakeGate {
        let mut mock = MockRingDevice::new();
        let r = regs_state.clone();
        mock.expect_read_status().returning(move |_, _| r.lock().seqno);
        let r = regs_state.clone();
        mock.expect_read_register().returning(move |_, reg| {
            let r = r.lock();
            match reg {
                regs::FORCEWAKE_ACK => 1,
                regs::RING_ACTHD => r.acthd,
                regs::RING_CTL => r.ctl,
                regs::RING_SEMA_SIGNALLER => r.sema_signaller,
                regs::RING_SEMA_SEQNO => r.sema_seqno,
                _ => 0,
            }
        });
        let r = regs_state;
        mock.expect_write_register().returning(move |_, reg, value| {
            if reg == regs::RING_CTL {
                r.lock().ctl_writes.push(value);
            }
        });
        mock.expect_reset().returning(|_| Ok(()));
        WakeGate::new(Arc::new(mock))
    }

    fn monitor() -> HangMonitor {
        HangMonitor::new(HangcheckConfig::default())
    }

    #[test]
    fn test_stuck_engine_fires_after_two_samples() {
        let state = Arc::new(Mutex::new(Regs::default()));
        let gate = fake_device(state);
        let tracker = SeqnoTracker::new();
        let mut mon = monitor();
        let engines = [EngineId::Render];

        assert!(mon.check(&gate, &tracker, &engines, |_| true).is_empty());
        assert_eq!(mon.health()[0].state, EngineState::Suspect);
        assert_eq!(mon.health()[0].score, 20);
        assert_eq!(mon.check(&gate, &tracker, &engines, |_| true), vec![EngineId::Render]);
        assert_eq!(mon.health()[0].state, EngineState::Hung);
    }

    #[test]
    fn test_moving_head_scores_busy() {
        let state = Arc::new(Mutex::new(Regs::default()));
        let gate = fake_device(state.clone());
        let tracker = SeqnoTracker::new();
        let mut mon = monitor();
        for i in 1..=5 {
            state.lock().acthd = i * 0x40;
            assert!(mon.check(&gate, &tracker, &[EngineId::Blit], |_| true).is_empty());
        }
        let health = &mon.health()[EngineId::Blit.index()];
        assert_eq!(health.action, HangAction::Busy);
        assert_eq!(health.score, 5);
    }

    #[test]
    fn test_event_wait_is_kicked() {
        let state = Arc::new(Mutex::new(Regs {
            ctl: regs::CTL_ENABLE | regs::CTL_WAIT_EVENT,
            ..Regs::default()
        }));
        let gate = fake_device(state.clone());
        let tracker = SeqnoTracker::new();
        let mut mon = monitor();
        mon.check(&gate, &tracker, &[EngineId::Render], |_| true);
        assert_eq!(mon.health()[0].action, HangAction::Kick);
        assert_eq!(mon.health()[0].score, 5);
        assert_eq!(state.lock().ctl_writes, vec![regs::CTL_ENABLE]);
    }

    #[test]
    fn test_semaphore_kicked_only_when_satisfied() {
        let state = Arc::new(Mutex::new(Regs {
            ctl: regs::CTL_WAIT_SEMAPHORE,
            sema_signaller: EngineId::Video.index() as u32,
            sema_seqno: 3,
            ..Regs::default()
        }));
        let gate = fake_device(state.clone());
        let tracker = SeqnoTracker::new();
        let mut mon = monitor();

        mon.check(&gate, &tracker, &[EngineId::Render], |_| true);
        assert_eq!(mon.health()[0].action, HangAction::Hung);
        assert!(state.lock().ctl_writes.is_empty());

        tracker.on_interrupt(EngineId::Video, 3);
        mon.check(&gate, &tracker, &[EngineId::Render], |_| true);
        assert_eq!(mon.health()[0].action, HangAction::Kick);
        assert_eq!(mon.health()[0].score, 25);
    }

    #[test]
    fn test_progress_decays_score() {
        let state = Arc::new(Mutex::new(Regs::default()));
        let gate = fake_device(state.clone());
        let tracker = SeqnoTracker::new();
        let mut mon = monitor();
        mon.check(&gate, &tracker, &[EngineId::Render], |_| true);
        state.lock().seqno = 1;
        mon.check(&gate, &tracker, &[EngineId::Render], |_| true);
        let health = &mon.health()[0];
        assert_eq!(health.action, HangAction::Progress);
        assert_eq!(health.score, 19);
        mon.clear();
        assert_eq!(mon.health()[0].score, 0);
    }

    #[test]
    fn test_idle_engine_never_scores() {
        let state = Arc::new(Mutex::new(Regs::default()));
        let gate = fake_device(state);
        let tracker = SeqnoTracker::new();
        let mut mon = monitor();
        for _ in 0..5 {
            assert!(mon.check(&gate, &tracker, &EngineId::ALL, |_| false).is_empty());
        }
        assert!(mon.health().iter().all(|h| h.score == 0 && h.action == HangAction::Idle));
    }

    #[test]
    fn test_second_failure_in_window_is_terminal() {
        let mut history = ResetHistory::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(!history.record_failure(t0));
        assert!(history.record_failure(t0 + Duration::from_secs(1)));
        assert!(!history.record_failure(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_reset_engines_propagates_failure() {
        let mut mock = MockRingDevice::new();
        mock.expect_read_register().returning(|_, _| 1);
        mock.expect_write_register().returning(|_, _, _| ());
        mock.expect_reset()
            .returning(|e| if e == EngineId::Video { Err(GemError::ResetFailed) } else { Ok(()) });
        let gate = WakeGate::new(Arc::new(mock));
        assert!(reset_engines(&gate, &[EngineId::Render]).is_ok());
        assert!(matches!(
            reset_engines(&gate, &EngineId::ALL),
            Err(GemError::ResetFailed)
        ));
    }
}
