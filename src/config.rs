//! Device configuration
//!
//! Everything tunable about the device lives here: the GTT geometry, ring
//! sizes, scheduler budgets and hang-check scoring. The whole tree
//! round-trips through JSON so tooling can load and dump it.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GemError, GemResult};
use crate::hw::EngineId;
use crate::mm::{DEFAULT_FENCE_COUNT, PAGE_SIZE};

/// Highest custom priority; 0 is privileged
pub const MAX_SCHED_PRIORITIES: u32 = 100;
/// Shared bucket for ordinary clients
pub const SHARED_NORMAL_PRIORITY: u32 = MAX_SCHED_PRIORITIES - 1;
/// Penalty bucket for clients over the exec-time trigger
pub const SHARED_ROGUE_PRIORITY: u32 = MAX_SCHED_PRIORITIES;

/// When a bucket is charged for a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeductionPolicy {
    /// Charge the client's average exec time at admission ("AE")
    Admission,
    /// Charge the measured exec time when the request retires ("PE")
    Completion,
}

/// GTT geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GttConfig {
    /// Total address-space size in bytes
    pub size: u64,
    /// CPU-mappable aperture at the bottom of the space
    pub mappable_size: u64,
    /// Number of fence registers
    pub fence_registers: usize,
    /// Alignment of scanout bindings
    pub scanout_alignment: u64,
}

impl Default for GttConfig {
    fn default() -> Self {
        Self {
            size: 256 << 20,
            mappable_size: 64 << 20,
            fence_registers: DEFAULT_FENCE_COUNT,
            scanout_alignment: 64 * 1024,
        }
    }
}

/// Ring geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engines brought up at init
    pub engines: Vec<EngineId>,
    /// Ring size in bytes, a power of two
    pub ring_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engines: EngineId::ALL.to_vec(),
            ring_size: 32 * PAGE_SIZE as u32,
        }
    }
}

/// Admission-control budgets and policies; times in microseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Shared-normal refill period
    pub shared_period_us: u64,
    /// Shared-normal capacity per period
    pub shared_capacity_us: u64,
    /// Charging policy for the shared and private buckets
    pub shared_policy: DeductionPolicy,
    /// Demote clients whose average exec time exceeds the trigger
    pub rogue_enabled: bool,
    /// Rogue refill period
    pub rogue_period_us: u64,
    /// Rogue capacity per period
    pub rogue_capacity_us: u64,
    /// Average exec time above which a client turns rogue
    pub rogue_trigger_us: u64,
    /// Promote video-engine clients out of the shared bucket
    pub video_promotion: bool,
    /// First priority slot tried for a promoted video client
    pub video_priority: u32,
    /// Period given to a promoted video client
    pub video_period_us: u64,
    /// Capacity given to a promoted video client
    pub video_capacity_us: u64,
    /// Retry interval when a higher priority has backlog
    pub contention_backoff_us: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shared_period_us: 50_000,
            shared_capacity_us: 35_000,
            shared_policy: DeductionPolicy::Admission,
            rogue_enabled: true,
            rogue_period_us: 500_000,
            rogue_capacity_us: 1_000,
            rogue_trigger_us: 60_000,
            video_promotion: false,
            video_priority: 50,
            video_period_us: 50_000,
            video_capacity_us: 35_000,
            contention_backoff_us: 100,
        }
    }
}

/// Hang-check scoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HangcheckConfig {
    /// Run the periodic timer
    pub enabled: bool,
    /// Timer period in milliseconds
    pub interval_ms: u64,
    /// Score added when the engine is busy but the seqno is stuck
    pub busy_score: u32,
    /// Score added when the engine had to be kicked
    pub kick_score: u32,
    /// Score added when nothing moved at all
    pub hung_score: u32,
    /// Score above which the device is declared wedged
    pub fire_score: u32,
    /// Two reset failures within this many milliseconds are terminal
    pub reset_window_ms: u64,
}

impl Default for HangcheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_500,
            busy_score: 1,
            kick_score: 5,
            hung_score: 20,
            fire_score: 30,
            reset_window_ms: 5_000,
        }
    }
}

/// Timeouts for blocking paths; milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Waiting for ring space before giving up
    pub ring_space_timeout_ms: u64,
    /// Waiting for an active binding to go idle during reservation
    pub idle_timeout_ms: u64,
    /// Submitters waiting for an in-progress reset
    pub reset_timeout_ms: u64,
    /// Longest single sleep of a denied, blocking submitter
    pub admission_slice_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            ring_space_timeout_ms: 3_000,
            idle_timeout_ms: 3_000,
            reset_timeout_ms: 10_000,
            admission_slice_ms: 10,
        }
    }
}

/// Complete device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    /// Address space
    pub gtt: GttConfig,
    /// Rings
    pub engines: EngineConfig,
    /// Admission control
    pub scheduler: SchedulerConfig,
    /// Hang detection
    pub hangcheck: HangcheckConfig,
    /// Timeouts
    pub waits: WaitConfig,
}

impl DeviceConfig {
    /// Small, deterministic setup: hang-check timer off, 16 MiB GTT
    pub fn testing() -> Self {
        Self {
            gtt: GttConfig {
                size: 16 << 20,
                mappable_size: 4 << 20,
                ..GttConfig::default()
            },
            engines: EngineConfig {
                ring_size: 4 * PAGE_SIZE as u32,
                ..EngineConfig::default()
            },
            hangcheck: HangcheckConfig {
                enabled: false,
                ..HangcheckConfig::default()
            },
            waits: WaitConfig {
                ring_space_timeout_ms: 1_000,
                idle_timeout_ms: 1_000,
                reset_timeout_ms: 2_000,
                admission_slice_ms: 5,
            },
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> GemResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> GemResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> GemResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check internal consistency
    pub fn validate(&self) -> GemResult<()> {
        let gtt = &self.gtt;
        if gtt.size == 0 || gtt.size > 1 << 32 || gtt.size % PAGE_SIZE != 0 {
            return Err(GemError::Config(format!(
                "gtt.size {:#x} must be page aligned and at most 4 GiB",
                gtt.size
            )));
        }
        if gtt.mappable_size > gtt.size {
            return Err(GemError::Config("gtt.mappable_size exceeds gtt.size".into()));
        }
        if gtt.fence_registers == 0 {
            return Err(GemError::Config("gtt.fence_registers must be non-zero".into()));
        }
        let ring = self.engines.ring_size;
        if !ring.is_power_of_two() || (ring as u64) < PAGE_SIZE {
            return Err(GemError::Config(format!(
                "engines.ring_size {} must be a power of two of at least one page",
                ring
            )));
        }
        if self.engines.engines.is_empty() {
            return Err(GemError::Config("at least one engine is required".into()));
        }
        let sched = &self.scheduler;
        if sched.shared_period_us == 0 || sched.rogue_period_us == 0 || sched.video_period_us == 0 {
            return Err(GemError::Config("scheduler periods must be non-zero".into()));
        }
        if sched.video_priority == 0 || sched.video_priority >= SHARED_NORMAL_PRIORITY {
            return Err(GemError::Config(format!(
                "scheduler.video_priority {} must be in 1..{}",
                sched.video_priority, SHARED_NORMAL_PRIORITY
            )));
        }
        if self.hangcheck.interval_ms == 0 {
            return Err(GemError::Config("hangcheck.interval_ms must be non-zero".into()));
        }
        Ok(())
    }
}

impl HangcheckConfig {
    /// Timer period
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Reset-failure window
    pub fn reset_window(&self) -> Duration {
        Duration::from_millis(self.reset_window_ms)
    }
}

impl WaitConfig {
    /// Ring-space wait limit
    pub fn ring_space_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_space_timeout_ms)
    }

    /// Idle wait limit
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Reset wait limit
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Longest admission sleep
    pub fn admission_slice(&self) -> Duration {
        Duration::from_millis(self.admission_slice_ms)
    }
}
