//! Key/value control surface and the scheduler report

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::{BucketReport, ClientId, ExecSample};
use crate::config::DeductionPolicy;
use crate::error::{GemError, GemResult};
use crate::hangcheck::EngineHealth;

/// One parsed `key=value` token
///
/// Durations are given in milliseconds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// `sharedt`
    SharedPeriod(Duration),
    /// `sharedc`
    SharedCapacity(Duration),
    /// `sharedae`
    SharedAe(bool),
    /// `roguet`
    RoguePeriod(Duration),
    /// `roguec`
    RogueCapacity(Duration),
    /// `roguel`
    RogueTrigger(Duration),
    /// `rogueb`
    RogueEnabled(bool),
    /// `videob`
    VideoEnabled(bool),
    /// `videop`
    VideoPriority(u32),
    /// `videot`
    VideoPeriod(Duration),
    /// `videoc`
    VideoCapacity(Duration),
    /// `pidp=<client>-<priority>`
    ClientPriority(ClientId, u32),
    /// `pidt=<client>-<ms>`
    ClientPeriod(ClientId, Duration),
    /// `pidc=<client>-<ms>`
    ClientCapacity(ClientId, Duration),
    /// `stop_rings=<mask>`
    StopRings(u32),
    /// `hangcheck`
    Hangcheck(bool),
}

fn number(key: &str, value: &str) -> GemResult<u64> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| GemError::Config(format!("{}: '{}' is not a number", key, value)))
}

fn millis(key: &str, value: &str) -> GemResult<Duration> {
    number(key, value).map(Duration::from_millis)
}

fn switch(key: &str, value: &str) -> GemResult<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(GemError::Config(format!("{}: expected 0 or 1, got '{}'", key, value))),
    }
}

fn client_pair(key: &str, value: &str) -> GemResult<(ClientId, u64)> {
    let (client, rest) = value
        .split_once('-')
        .ok_or_else(|| GemError::Config(format!("{}: expected <client>-<value>", key)))?;
    Ok((ClientId(number(key, client)? as u32), number(key, rest)?))
}

impl FromStr for ControlCommand {
    type Err = GemError;

    fn from_str(token: &str) -> GemResult<Self> {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| GemError::Config(format!("'{}' is not key=value", token)))?;
        let (key, value) = (key.trim(), value.trim());
        let cmd = match key {
            "sharedt" => ControlCommand::SharedPeriod(millis(key, value)?),
            "sharedc" => ControlCommand::SharedCapacity(millis(key, value)?),
            "sharedae" => ControlCommand::SharedAe(switch(key, value)?),
            "roguet" => ControlCommand::RoguePeriod(millis(key, value)?),
            "roguec" => ControlCommand::RogueCapacity(millis(key, value)?),
            "roguel" => ControlCommand::RogueTrigger(millis(key, value)?),
            "rogueb" => ControlCommand::RogueEnabled(switch(key, value)?),
            "videob" => ControlCommand::VideoEnabled(switch(key, value)?),
            "videop" => ControlCommand::VideoPriority(number(key, value)? as u32),
            "videot" => ControlCommand::VideoPeriod(millis(key, value)?),
            "videoc" => ControlCommand::VideoCapacity(millis(key, value)?),
            "pidp" => {
                let (id, prio) = client_pair(key, value)?;
                ControlCommand::ClientPriority(id, prio as u32)
            }
            "pidt" => {
                let (id, ms) = client_pair(key, value)?;
                ControlCommand::ClientPeriod(id, Duration::from_millis(ms))
            }
            "pidc" => {
                let (id, ms) = client_pair(key, value)?;
                ControlCommand::ClientCapacity(id, Duration::from_millis(ms))
            }
            "stop_rings" => ControlCommand::StopRings(number(key, value)? as u32),
            "hangcheck" => ControlCommand::Hangcheck(switch(key, value)?),
            other => return Err(GemError::Config(format!("unknown control key '{}'", other))),
        };
        if let ControlCommand::SharedPeriod(d)
        | ControlCommand::RoguePeriod(d)
        | ControlCommand::VideoPeriod(d)
        | ControlCommand::ClientPeriod(_, d) = cmd
        {
            if d.is_zero() {
                return Err(GemError::Config(format!("{}: period must be non-zero", key)));
            }
        }
        Ok(cmd)
    }
}

/// Parse a whitespace- or `;`-separated list of `key=value` tokens
///
/// Nothing is returned unless every token parses.
pub fn parse_controls(input: &str) -> GemResult<Vec<ControlCommand>> {
    input
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|t| !t.is_empty())
        .map(str::parse)
        .collect()
}

/// Per-client slice of the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReport {
    /// Session id
    pub id: ClientId,
    /// Current priority
    pub priority: u32,
    /// Submissions inside the pipeline
    pub pending: u32,
    /// Requests not yet retired
    pub in_flight: u32,
    /// Moving-average execution time
    pub average_exec_us: u64,
    /// Private bucket, for custom priorities
    pub bucket: Option<BucketReport>,
    /// When the session opened
    pub opened_at: DateTime<Local>,
    /// Recent retirements
    pub history: Vec<ExecSample>,
}

/// Snapshot of scheduler and engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerReport {
    /// When the snapshot was taken
    pub generated_at: DateTime<Local>,
    /// Shared-normal bucket
    pub shared: BucketReport,
    /// Shared-rogue bucket
    pub rogue: BucketReport,
    /// Charging policy for shared and private buckets
    pub shared_policy: DeductionPolicy,
    /// Rogue demotion switch
    pub rogue_enabled: bool,
    /// Rogue trigger
    pub rogue_trigger_us: u64,
    /// Video promotion switch
    pub video_promotion: bool,
    /// First slot tried for video promotion
    pub video_priority: u32,
    /// `(priority, submissions waiting)` for every non-empty priority
    pub pending: Vec<(u32, u32)>,
    /// Open clients
    pub clients: Vec<ClientReport>,
    /// Stop-rings debug mask
    pub stop_rings: u32,
    /// Periodic hang check running
    pub hangcheck_enabled: bool,
    /// Hang-check view of each engine
    pub engines: Vec<EngineHealth>,
}

impl SchedulerReport {
    /// Pretty-printed JSON
    pub fn to_json(&self) -> GemResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for SchedulerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bucket = |b: &BucketReport| {
            format!(
                "{}/{}us every {}us",
                b.balance_us, b.capacity_us, b.period_us
            )
        };
        writeln!(f, "Scheduler ({})", self.generated_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "  shared:  {} ({:?})", bucket(&self.shared), self.shared_policy)?;
        writeln!(f, "  rogue:   {}", bucket(&self.rogue))?;
        writeln!(
            f,
            "  rogue demotion: {} (trigger {}us), video promotion: {} (from {})",
            self.rogue_enabled, self.rogue_trigger_us, self.video_promotion, self.video_priority
        )?;
        writeln!(
            f,
            "  stop_rings: {:#x}, hangcheck: {}",
            self.stop_rings, self.hangcheck_enabled
        )?;
        for (priority, count) in &self.pending {
            writeln!(f, "  pending[{}] = {}", priority, count)?;
        }
        for client in &self.clients {
            write!(
                f,
                "  {} prio {} avg {}us pending {} in-flight {}",
                client.id, client.priority, client.average_exec_us, client.pending, client.in_flight
            )?;
            if let Some(b) = &client.bucket {
                write!(f, " bucket {}", bucket(b))?;
            }
            writeln!(f)?;
        }
        for engine in &self.engines {
            writeln!(f, "  {}", engine)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("sharedc=20", ControlCommand::SharedCapacity(Duration::from_millis(20)))]
    #[case("sharedae=0", ControlCommand::SharedAe(false))]
    #[case("roguel=60", ControlCommand::RogueTrigger(Duration::from_millis(60)))]
    #[case("pidp=3-10", ControlCommand::ClientPriority(ClientId(3), 10))]
    #[case("pidc=4-5", ControlCommand::ClientCapacity(ClientId(4), Duration::from_millis(5)))]
    #[case("stop_rings=0x5", ControlCommand::StopRings(5))]
    #[case("hangcheck=1", ControlCommand::Hangcheck(true))]
    fn test_parse_token(#[case] token: &str, #[case] expected: ControlCommand) {
        assert_eq!(token.parse::<ControlCommand>().unwrap(), expected);
    }

    #[rstest]
    #[case("bogus=1")]
    #[case("sharedt")]
    #[case("sharedt=0")]
    #[case("rogueb=2")]
    #[case("pidp=3")]
    #[case("sharedc=abc")]
    fn test_parse_rejects(#[case] token: &str) {
        assert!(matches!(token.parse::<ControlCommand>(), Err(GemError::Config(_))));
    }

    #[test]
    fn test_parse_list_separators() {
        let cmds = parse_controls("sharedt=40; sharedc=30\nvideob=1").unwrap();
        assert_eq!(cmds.len(), 3);
        assert!(parse_controls("sharedt=40 nope").is_err());
        assert!(parse_controls("").unwrap().is_empty());
    }
}
