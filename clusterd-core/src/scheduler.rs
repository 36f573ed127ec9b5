//! Role scheduling: node role, client push interval and master round evaluation.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::status::RoundSnapshot;

/// Configured role of a node. Exactly one master per cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Client => f.write_str("client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
}

/// Client push interval, written `<digits><unit>`: `s` is seconds, any other unit minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct SyncInterval {
    pub magnitude: u64,
    pub unit: IntervalUnit,
}

impl SyncInterval {
    pub fn seconds(magnitude: u64) -> Self {
        Self {
            magnitude,
            unit: IntervalUnit::Seconds,
        }
    }

    pub fn minutes(magnitude: u64) -> Self {
        Self {
            magnitude,
            unit: IntervalUnit::Minutes,
        }
    }

    pub fn as_duration(&self) -> Duration {
        match self.unit {
            IntervalUnit::Seconds => Duration::from_secs(self.magnitude),
            IntervalUnit::Minutes => Duration::from_secs(self.magnitude.saturating_mul(60)),
        }
    }
}

impl FromStr for SyncInterval {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // First run of digits is the magnitude; the last character picks the unit.
        let digits: String = s
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            return Err(ScheduleError::Invalid(s.to_string()));
        }
        let magnitude = digits
            .parse::<u64>()
            .map_err(|_| ScheduleError::Invalid(s.to_string()))?;
        let unit = if s.ends_with('s') {
            IntervalUnit::Seconds
        } else {
            IntervalUnit::Minutes
        };
        Ok(Self { magnitude, unit })
    }
}

impl TryFrom<String> for SyncInterval {
    type Error = ScheduleError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for SyncInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            IntervalUnit::Seconds => write!(f, "{}s", self.magnitude),
            IntervalUnit::Minutes => write!(f, "{}m", self.magnitude),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid interval {0:?}: expected <number><unit>, e.g. 30s or 2m")]
    Invalid(String),
}

/// What the master does after a sync round event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundDecision {
    /// Pushes still running; keep waiting.
    Pending,
    /// Round over, nothing changed.
    Complete,
    /// Round over and these clients pushed files the master did not have.
    Restart(Vec<IpAddr>),
}

/// A round is over once every started push finished and no peer is mid-request.
pub fn evaluate_round(snapshot: &RoundSnapshot, requests_outstanding: bool) -> RoundDecision {
    if !snapshot.is_complete() || requests_outstanding {
        return RoundDecision::Pending;
    }
    if snapshot.restart_after_sync {
        RoundDecision::Restart(snapshot.clients_to_restart.clone())
    } else {
        RoundDecision::Complete
    }
}
