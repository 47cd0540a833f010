//! Admission control
//!
//! A soft real-time scheduler in front of the rings. Every client sits at a
//! numeric priority: 0 is privileged and bypasses admission, 1..=98 are
//! custom slots with a private bucket, 99 is the shared-normal pool and 100
//! the shared-rogue penalty pool. Admission only gates entry; requests on an
//! engine still execute in FIFO order.

mod bucket;
mod control;
mod history;

pub use bucket::{BucketReport, TokenBucket};
pub use control::{parse_controls, ClientReport, ControlCommand, SchedulerReport};
pub use history::{ExecHistory, ExecSample, MOVING_AVG_RANGE};

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::{
    DeductionPolicy, SchedulerConfig, MAX_SCHED_PRIORITIES, SHARED_NORMAL_PRIORITY,
    SHARED_ROGUE_PRIORITY,
};
use crate::error::{GemError, GemResult};
use crate::hw::EngineId;

/// Client session id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Priority requested when a client opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    /// Priority 0: never throttled (compositor, display server)
    Privileged,
    /// The shared-normal pool
    Normal,
    /// A private slot in 1..=98 with its own bucket
    Custom(u32),
}

/// Outcome of one admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead; the request is charged to this priority's bucket
    Admit {
        /// Priority the client holds after promotion or demotion
        priority: u32,
        /// Amount deducted up front, refunded if the submission unwinds
        charged: Duration,
    },
    /// Try again later
    Deny {
        /// Suggested wait before the next attempt
        retry_after: Duration,
        /// Why the attempt failed
        reason: DenyReason,
    },
}

/// Why admission was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// A higher priority has backlog and budget
    Contention(u32),
    /// The client's bucket is empty for the rest of the period
    Exhausted,
}

/// Scheduler bookkeeping for one client
#[derive(Debug, Clone)]
pub struct ClientEntry {
    /// Session id
    pub id: ClientId,
    /// Current priority, 0..=100
    pub priority: u32,
    /// Private bucket, used while the client holds a custom slot
    pub bucket: TokenBucket,
    /// Recent execution times
    pub history: ExecHistory,
    /// Submissions currently inside the pipeline
    pub pending: u32,
    /// Committed requests not yet retired
    pub in_flight: u32,
    /// Still open
    pub alive: bool,
    /// When the session opened
    pub opened_at: DateTime<Local>,
}

fn is_custom(priority: u32) -> bool {
    priority > 0 && priority < SHARED_NORMAL_PRIORITY
}

/// All admission-control state; owned by the device
#[derive(Debug, Clone)]
pub struct SchedulerState {
    config: SchedulerConfig,
    shared: TokenBucket,
    rogue: TokenBucket,
    clients: HashMap<ClientId, ClientEntry>,
    slots: HashMap<u32, ClientId>,
    pending: Vec<u32>,
    next_id: u32,
}

impl SchedulerState {
    /// Fresh scheduler with full shared buckets
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: TokenBucket::from_micros(config.shared_period_us, config.shared_capacity_us),
            rogue: TokenBucket::from_micros(config.rogue_period_us, config.rogue_capacity_us),
            config,
            clients: HashMap::new(),
            slots: HashMap::new(),
            pending: vec![0; MAX_SCHED_PRIORITIES as usize + 1],
            next_id: 0,
        }
    }

    /// Current settings
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a client
    ///
    /// Custom priorities must lie in 1..=98 and be unoccupied; the private
    /// bucket starts with the shared period and capacity.
    pub fn open_client(&mut self, class: PriorityClass) -> GemResult<ClientId> {
        let priority = match class {
            PriorityClass::Privileged => 0,
            PriorityClass::Normal => SHARED_NORMAL_PRIORITY,
            PriorityClass::Custom(p) if is_custom(p) => {
                if self.slots.contains_key(&p) {
                    return Err(GemError::InvalidArgument(format!("priority {} is taken", p)));
                }
                p
            }
            PriorityClass::Custom(p) => {
                return Err(GemError::InvalidArgument(format!(
                    "custom priority {} outside 1..{}",
                    p, SHARED_NORMAL_PRIORITY
                )))
            }
        };
        self.next_id += 1;
        let id = ClientId(self.next_id);
        if is_custom(priority) {
            self.slots.insert(priority, id);
        }
        self.clients.insert(
            id,
            ClientEntry {
                id,
                priority,
                bucket: TokenBucket::from_micros(
                    self.config.shared_period_us,
                    self.config.shared_capacity_us,
                ),
                history: ExecHistory::new(),
                pending: 0,
                in_flight: 0,
                alive: true,
                opened_at: Local::now(),
            },
        );
        log::info!("sched: opened {} at priority {}", id, priority);
        Ok(id)
    }

    /// Mark a client dead; its entry goes once its last request retires
    pub fn close_client(&mut self, id: ClientId) -> GemResult<()> {
        let entry = self.live_mut(id)?;
        entry.alive = false;
        let priority = entry.priority;
        if is_custom(priority) && self.slots.get(&priority) == Some(&id) {
            self.slots.remove(&priority);
        }
        log::info!("sched: closed {}", id);
        self.reap(id);
        Ok(())
    }

    /// Entry for an open client
    pub fn client(&self, id: ClientId) -> GemResult<&ClientEntry> {
        self.clients
            .get(&id)
            .filter(|c| c.alive)
            .ok_or(GemError::UnknownClient(id.0))
    }

    fn live_mut(&mut self, id: ClientId) -> GemResult<&mut ClientEntry> {
        self.clients
            .get_mut(&id)
            .filter(|c| c.alive)
            .ok_or(GemError::UnknownClient(id.0))
    }

    /// Open clients
    pub fn clients(&self) -> impl Iterator<Item = &ClientEntry> {
        self.clients.values().filter(|c| c.alive)
    }

    fn reap(&mut self, id: ClientId) {
        let done = self
            .clients
            .get(&id)
            .map_or(false, |c| !c.alive && c.pending == 0 && c.in_flight == 0);
        if done {
            self.clients.remove(&id);
        }
    }

    /// Submissions waiting at a priority
    pub fn pending_at(&self, priority: u32) -> u32 {
        self.pending.get(priority as usize).copied().unwrap_or(0)
    }

    /// Shared-normal bucket
    pub fn shared_bucket(&self) -> &TokenBucket {
        &self.shared
    }

    /// Shared-rogue bucket
    pub fn rogue_bucket(&self) -> &TokenBucket {
        &self.rogue
    }

    /// A submission from `id` enters the pipeline
    pub fn enter(&mut self, id: ClientId) -> GemResult<()> {
        let entry = self.live_mut(id)?;
        entry.pending += 1;
        let priority = entry.priority as usize;
        self.pending[priority] += 1;
        Ok(())
    }

    /// A submission from `id` leaves the pipeline, admitted or not
    pub fn exit(&mut self, id: ClientId) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.pending = entry.pending.saturating_sub(1);
            let slot = &mut self.pending[entry.priority as usize];
            *slot = slot.saturating_sub(1);
        }
        self.reap(id);
    }

    fn move_client(&mut self, id: ClientId, to: u32) {
        let Some(entry) = self.clients.get_mut(&id) else {
            return;
        };
        let from = entry.priority;
        if from == to {
            return;
        }
        let moved = entry.pending;
        entry.priority = to;
        self.pending[from as usize] = self.pending[from as usize].saturating_sub(moved);
        self.pending[to as usize] += moved;
        if is_custom(from) && self.slots.get(&from) == Some(&id) {
            self.slots.remove(&from);
        }
        if is_custom(to) {
            self.slots.insert(to, id);
        }
    }

    fn promote_video(&mut self, id: ClientId) {
        let free = (self.config.video_priority..SHARED_NORMAL_PRIORITY)
            .find(|p| !self.slots.contains_key(p));
        let Some(slot) = free else {
            log::debug!("sched: no free slot to promote video {}", id);
            return;
        };
        self.move_client(id, slot);
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.bucket =
                TokenBucket::from_micros(self.config.video_period_us, self.config.video_capacity_us);
        }
        log::info!("sched: promoted video {} to priority {}", id, slot);
    }

    fn bucket_has_budget(&self, priority: u32) -> bool {
        match priority {
            SHARED_NORMAL_PRIORITY => self.shared.has_budget(),
            SHARED_ROGUE_PRIORITY => self.rogue.has_budget(),
            p if is_custom(p) => self
                .slots
                .get(&p)
                .and_then(|id| self.clients.get(id))
                .map_or(false, |c| c.bucket.has_budget()),
            _ => false,
        }
    }

    fn bucket_mut(&mut self, id: ClientId, priority: u32) -> Option<&mut TokenBucket> {
        match priority {
            SHARED_NORMAL_PRIORITY => Some(&mut self.shared),
            SHARED_ROGUE_PRIORITY => Some(&mut self.rogue),
            p if is_custom(p) => self.clients.get_mut(&id).map(|c| &mut c.bucket),
            _ => None,
        }
    }

    fn policy_for(&self, priority: u32) -> DeductionPolicy {
        if priority == SHARED_ROGUE_PRIORITY {
            DeductionPolicy::Admission
        } else {
            self.config.shared_policy
        }
    }

    /// One admission attempt for a submission on `engine`
    pub fn admit(&mut self, id: ClientId, engine: EngineId, now: Instant) -> GemResult<Admission> {
        let entry = self.client(id)?;
        if entry.priority == 0 {
            return Ok(Admission::Admit {
                priority: 0,
                charged: Duration::ZERO,
            });
        }

        if self.config.video_promotion
            && engine == EngineId::Video
            && entry.priority == SHARED_NORMAL_PRIORITY
        {
            self.promote_video(id);
        }

        if self.config.rogue_enabled {
            let entry = self.client(id)?;
            let average = entry.history.average();
            if entry.priority != SHARED_ROGUE_PRIORITY
                && average > Duration::from_micros(self.config.rogue_trigger_us)
            {
                log::info!(
                    "sched: {} averages {}us, demoting to rogue",
                    id,
                    average.as_micros()
                );
                self.move_client(id, SHARED_ROGUE_PRIORITY);
            }
        }

        let entry = self.client(id)?;
        let priority = entry.priority;
        let average = entry.history.average();

        if let Some(busy) =
            (0..priority).find(|&p| self.pending[p as usize] > 0 && self.bucket_has_budget(p))
        {
            log::debug!("sched: {} at {} yields to priority {}", id, priority, busy);
            return Ok(Admission::Deny {
                retry_after: Duration::from_micros(self.config.contention_backoff_us),
                reason: DenyReason::Contention(busy),
            });
        }

        let policy = self.policy_for(priority);
        let Some(bucket) = self.bucket_mut(id, priority) else {
            return Ok(Admission::Admit {
                priority,
                charged: Duration::ZERO,
            });
        };
        bucket.refill(now);
        if bucket.has_budget() {
            let before = bucket.balance();
            if policy == DeductionPolicy::Admission {
                bucket.deduct(average);
            }
            Ok(Admission::Admit {
                priority,
                charged: before - bucket.balance(),
            })
        } else {
            let retry_after = bucket.until_refill(now);
            log::debug!(
                "sched: {} at {} out of budget for {:?}",
                id,
                priority,
                retry_after
            );
            Ok(Admission::Deny {
                retry_after,
                reason: DenyReason::Exhausted,
            })
        }
    }

    /// Give back an admission charge for a submission that never reached the ring
    pub fn refund(&mut self, id: ClientId, priority: u32, charged: Duration) {
        if charged.is_zero() {
            return;
        }
        if let Some(bucket) = self.bucket_mut(id, priority) {
            bucket.credit(charged);
        }
    }

    /// A request from `id` was committed to a ring
    pub fn note_submitted(&mut self, id: ClientId) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.in_flight += 1;
        }
    }

    /// A request retired after `exec` of GPU time
    ///
    /// Feeds the moving average and, under completion charging, deducts
    /// from the bucket of the priority the request was admitted at.
    pub fn on_retire(
        &mut self,
        id: ClientId,
        priority: u32,
        exec: Duration,
        submitted_at: DateTime<Local>,
    ) {
        let Some(entry) = self.clients.get_mut(&id) else {
            return;
        };
        entry.history.record(exec, submitted_at);
        entry.in_flight = entry.in_flight.saturating_sub(1);

        if self.policy_for(priority) == DeductionPolicy::Completion {
            let owner = if is_custom(priority) {
                self.slots.get(&priority).copied()
            } else {
                Some(id)
            };
            if let Some(owner) = owner {
                if let Some(bucket) = self.bucket_mut(owner, priority) {
                    bucket.deduct(exec);
                }
            }
        }
        self.reap(id);
    }

    /// Move a client to `priority`, taking its pending count along
    pub fn set_priority(&mut self, id: ClientId, priority: u32) -> GemResult<()> {
        if priority > MAX_SCHED_PRIORITIES {
            return Err(GemError::Config(format!(
                "priority {} above {}",
                priority, MAX_SCHED_PRIORITIES
            )));
        }
        self.client(id)?;
        if is_custom(priority) && self.slots.get(&priority).map_or(false, |&o| o != id) {
            return Err(GemError::Config(format!("priority {} is taken", priority)));
        }
        self.move_client(id, priority);
        Ok(())
    }

    /// Apply one control command; device-level keys are ignored here
    pub fn apply(&mut self, command: &ControlCommand) -> GemResult<()> {
        let us = |d: &Duration| d.as_micros() as u64;
        match command {
            ControlCommand::SharedPeriod(d) => {
                self.config.shared_period_us = us(d);
                self.shared.set_period(*d);
            }
            ControlCommand::SharedCapacity(d) => {
                self.config.shared_capacity_us = us(d);
                self.shared.set_capacity(*d);
            }
            ControlCommand::SharedAe(on) => {
                self.config.shared_policy = if *on {
                    DeductionPolicy::Admission
                } else {
                    DeductionPolicy::Completion
                };
            }
            ControlCommand::RoguePeriod(d) => {
                self.config.rogue_period_us = us(d);
                self.rogue.set_period(*d);
            }
            ControlCommand::RogueCapacity(d) => {
                self.config.rogue_capacity_us = us(d);
                self.rogue.set_capacity(*d);
            }
            ControlCommand::RogueTrigger(d) => self.config.rogue_trigger_us = us(d),
            ControlCommand::RogueEnabled(on) => {
                self.config.rogue_enabled = *on;
                if !*on {
                    let rogues: Vec<ClientId> = self
                        .clients
                        .values()
                        .filter(|c| c.priority == SHARED_ROGUE_PRIORITY)
                        .map(|c| c.id)
                        .collect();
                    for id in rogues {
                        if let Some(entry) = self.clients.get_mut(&id) {
                            entry.history.clear();
                        }
                        self.move_client(id, SHARED_NORMAL_PRIORITY);
                    }
                }
            }
            ControlCommand::VideoEnabled(on) => self.config.video_promotion = *on,
            ControlCommand::VideoPriority(p) => {
                if !is_custom(*p) {
                    return Err(GemError::Config(format!(
                        "videop {} outside 1..{}",
                        p, SHARED_NORMAL_PRIORITY
                    )));
                }
                self.config.video_priority = *p;
            }
            ControlCommand::VideoPeriod(d) => self.config.video_period_us = us(d),
            ControlCommand::VideoCapacity(d) => self.config.video_capacity_us = us(d),
            ControlCommand::ClientPriority(id, p) => self.set_priority(*id, *p)?,
            ControlCommand::ClientPeriod(id, d) => self.live_mut(*id)?.bucket.set_period(*d),
            ControlCommand::ClientCapacity(id, d) => self.live_mut(*id)?.bucket.set_capacity(*d),
            ControlCommand::StopRings(_) | ControlCommand::Hangcheck(_) => {}
        }
        Ok(())
    }

    /// Apply a batch of commands atomically
    pub fn apply_all(&mut self, commands: &[ControlCommand]) -> GemResult<()> {
        let mut staged = self.clone();
        for command in commands {
            staged.apply(command)?;
        }
        *self = staged;
        Ok(())
    }

    /// Serializable snapshot; device-level fields are left at their defaults
    pub fn report(&self) -> SchedulerReport {
        let mut clients: Vec<ClientReport> = self
            .clients()
            .map(|c| ClientReport {
                id: c.id,
                priority: c.priority,
                pending: c.pending,
                in_flight: c.in_flight,
                average_exec_us: c.history.average().as_micros() as u64,
                bucket: is_custom(c.priority).then(|| c.bucket.report()),
                opened_at: c.opened_at,
                history: c.history.samples().cloned().collect(),
            })
            .collect();
        clients.sort_by_key(|c| c.id);
        SchedulerReport {
            generated_at: Local::now(),
            shared: self.shared.report(),
            rogue: self.rogue.report(),
            shared_policy: self.config.shared_policy,
            rogue_enabled: self.config.rogue_enabled,
            rogue_trigger_us: self.config.rogue_trigger_us,
            video_promotion: self.config.video_promotion,
            video_priority: self.config.video_priority,
            pending: self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, &n)| n > 0)
                .map(|(p, &n)| (p as u32, n))
                .collect(),
            clients,
            stop_rings: 0,
            hangcheck_enabled: false,
            engines: Vec::new(),
        }
    }
}
