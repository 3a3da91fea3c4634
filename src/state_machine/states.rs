use serde::{Deserialize, Serialize};
use std::fmt;

/// Flow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Flow is waiting on, or processing, agent responses
    #[default]
    Running,
    /// Flow finished without errors
    Succeeded,
    /// Flow ended with a reported error (FlowError, protocol violation, stop, timeout)
    Error,
    /// Flow hit an internal error and was aborted
    Crashed,
}

impl FlowStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Check if the flow counts as a failure for hunt statistics
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Crashed)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Error => write!(f, "error"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "error" => Ok(Self::Error),
            "crashed" => Ok(Self::Crashed),
            _ => Err(format!("Invalid flow status: {s}")),
        }
    }
}

/// Hunt lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HuntState {
    /// Created or paused; check-ins are ignored
    #[default]
    Paused,
    /// Actively fanning out to matching clients
    Started,
    /// Stopped by an operator or the crash limit
    Stopped,
    /// Expired or otherwise finished
    Completed,
}

impl HuntState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }

    pub fn accepts_clients(&self) -> bool {
        matches!(self, Self::Started)
    }
}

impl fmt::Display for HuntState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => write!(f, "paused"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for HuntState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paused" => Ok(Self::Paused),
            "started" => Ok(Self::Started),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid hunt state: {s}")),
        }
    }
}

/// Cron job run status. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CronJobRunStatus {
    #[default]
    Running,
    Finished,
    Error,
    LifetimeExceeded,
}

impl CronJobRunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Terminal states are reachable once, and only from `Running`
    pub fn can_transition_to(&self, target: CronJobRunStatus) -> bool {
        matches!(self, Self::Running) && target.is_terminal()
    }
}

impl fmt::Display for CronJobRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Error => write!(f, "error"),
            Self::LifetimeExceeded => write!(f, "lifetime_exceeded"),
        }
    }
}

impl std::str::FromStr for CronJobRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            "lifetime_exceeded" => Ok(Self::LifetimeExceeded),
            _ => Err(format!("Invalid cron job run status: {s}")),
        }
    }
}
