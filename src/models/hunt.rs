//! Fleet-wide fan-out of one flow type to every matching client.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::HuntId;
use crate::rules::ClientRule;
use crate::state_machine::{FlowStatus, HuntState};

/// Admission budget per time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRate {
    pub max_clients: u64,
    pub window_secs: u64,
}

/// Fan-out and failure limits of a hunt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntLimits {
    /// Total clients the hunt may ever admit
    #[serde(default)]
    pub client_limit: Option<u64>,
    #[serde(default)]
    pub client_rate: Option<ClientRate>,
    /// Failed / completed flows above which the hunt auto-pauses
    #[serde(default)]
    pub max_failure_ratio: Option<f64>,
    /// Completed flows required before the ratio is considered
    #[serde(default)]
    pub min_failure_sample: u64,
    /// Crashed flows above which the hunt is stopped
    #[serde(default)]
    pub crash_limit: Option<u64>,
    /// Deadline applied to every flow the hunt starts
    #[serde(default)]
    pub flow_lifetime_secs: Option<u64>,
    /// Hunt completes this long after it was first started
    pub expiry_secs: u64,
}

impl Default for HuntLimits {
    fn default() -> Self {
        Self {
            client_limit: Some(100),
            client_rate: None,
            max_failure_ratio: None,
            min_failure_sample: 10,
            crash_limit: None,
            flow_lifetime_secs: None,
            expiry_secs: 14 * 24 * 60 * 60,
        }
    }
}

/// Flow every admitted client receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntAction {
    pub flow_type: String,
    #[serde(default)]
    pub flow_args: Value,
}

/// Aggregate counters maintained by the hunt coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HuntCounters {
    pub clients_admitted: u64,
    pub flows_succeeded: u64,
    pub flows_errored: u64,
    pub flows_crashed: u64,
    pub results_count: u64,
}

impl HuntCounters {
    pub fn completed(&self) -> u64 {
        self.flows_succeeded + self.flows_errored + self.flows_crashed
    }

    pub fn failures(&self) -> u64 {
        self.flows_errored + self.flows_crashed
    }

    pub fn failure_ratio(&self) -> f64 {
        match self.completed() {
            0 => 0.0,
            completed => self.failures() as f64 / completed as f64,
        }
    }
}

/// Outcome of asking a hunt for a fan-out slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    ClientLimitReached,
    RateLimited,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Everything needed to create a hunt; cron jobs store one per schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntTemplate {
    pub description: String,
    pub client_rule: ClientRule,
    pub action: HuntAction,
    #[serde(default)]
    pub limits: HuntLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hunt {
    pub hunt_id: HuntId,
    pub description: String,
    pub creator: String,
    pub client_rule: ClientRule,
    pub action: HuntAction,
    pub limits: HuntLimits,
    pub state: HuntState,
    /// Why the hunt was last paused or stopped
    #[serde(default)]
    pub state_reason: Option<String>,
    #[serde(default)]
    pub counters: HuntCounters,
    #[serde(default)]
    pub rate_window_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rate_window_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

impl Hunt {
    pub fn new(
        description: impl Into<String>,
        creator: impl Into<String>,
        client_rule: ClientRule,
        action: HuntAction,
        limits: HuntLimits,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            hunt_id: HuntId::random(),
            description: description.into(),
            creator: creator.into(),
            client_rule,
            action,
            limits,
            state: HuntState::Paused,
            state_reason: None,
            counters: HuntCounters::default(),
            rate_window_started_at: None,
            rate_window_count: 0,
            created_at: now,
            started_at: None,
            expires_at: None,
            last_update: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Deadline for a flow started at `now`
    pub fn flow_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.limits
            .flow_lifetime_secs
            .map(|secs| now + Duration::seconds(secs as i64))
    }

    fn window_is_current(&self, now: DateTime<Utc>) -> bool {
        match (self.rate_window_started_at, self.limits.client_rate) {
            (Some(started), Some(rate)) => now < started + Duration::seconds(rate.window_secs as i64),
            _ => false,
        }
    }

    /// Check the fan-out limits without consuming a slot
    pub fn admission(&self, now: DateTime<Utc>) -> Admission {
        if let Some(limit) = self.limits.client_limit {
            if self.counters.clients_admitted >= limit {
                return Admission::ClientLimitReached;
            }
        }
        if let Some(rate) = self.limits.client_rate {
            if self.window_is_current(now) && self.rate_window_count >= rate.max_clients {
                return Admission::RateLimited;
            }
        }
        Admission::Admitted
    }

    /// Consume a fan-out slot if one is available
    pub fn admit_client(&mut self, now: DateTime<Utc>) -> Admission {
        let admission = self.admission(now);
        if !admission.is_admitted() {
            return admission;
        }
        if self.limits.client_rate.is_some() {
            if !self.window_is_current(now) {
                self.rate_window_started_at = Some(now);
                self.rate_window_count = 0;
            }
            self.rate_window_count += 1;
        }
        self.counters.clients_admitted += 1;
        self.last_update = now;
        admission
    }

    /// Give back a slot consumed for a client whose claim did not go through
    pub fn revoke_admission(&mut self, now: DateTime<Utc>) {
        self.counters.clients_admitted = self.counters.clients_admitted.saturating_sub(1);
        if self.window_is_current(now) {
            self.rate_window_count = self.rate_window_count.saturating_sub(1);
        }
        self.last_update = now;
    }

    pub fn record_outcome(&mut self, status: FlowStatus, results: u64, now: DateTime<Utc>) {
        match status {
            FlowStatus::Succeeded => self.counters.flows_succeeded += 1,
            FlowStatus::Error => self.counters.flows_errored += 1,
            FlowStatus::Crashed => self.counters.flows_crashed += 1,
            FlowStatus::Running => return,
        }
        self.counters.results_count += results;
        self.last_update = now;
    }

    /// Reason to auto-pause, if the failure ratio is over its threshold
    pub fn failure_ratio_breach(&self) -> Option<String> {
        let threshold = self.limits.max_failure_ratio?;
        let completed = self.counters.completed();
        if completed == 0 || completed < self.limits.min_failure_sample {
            return None;
        }
        let ratio = self.counters.failure_ratio();
        (ratio > threshold).then(|| {
            format!(
                "failure ratio {ratio:.2} exceeds {threshold:.2} after {completed} completed flows"
            )
        })
    }

    /// Reason to stop, if the crash limit is exceeded
    pub fn crash_limit_breach(&self) -> Option<String> {
        let limit = self.limits.crash_limit?;
        (self.counters.flows_crashed > limit).then(|| {
            format!(
                "{} crashed flows exceed crash limit {limit}",
                self.counters.flows_crashed
            )
        })
    }
}
