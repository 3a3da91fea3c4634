//! Scheduled triggers for hunts and standalone flows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::hunt::HuntTemplate;
use super::ids::{ClientId, CronJobId, CronRunId, FlowId, HuntId};
use crate::database::lease::Leasable;
use crate::state_machine::CronJobRunStatus;

/// What a cron job does each time it fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CronAction {
    /// Create and start a hunt; the run finishes once the hunt is started
    StartHunt { hunt: HuntTemplate },
    /// Start a flow; the run stays open until the flow terminates
    StartFlow {
        client_id: ClientId,
        flow_type: String,
        #[serde(default)]
        args: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub job_id: CronJobId,
    #[serde(default)]
    pub description: String,
    pub action: CronAction,
    pub frequency_secs: u64,
    /// Runs older than this are closed as `LifetimeExceeded`
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
    #[serde(default)]
    pub allow_overruns: bool,
    pub enabled: bool,
    pub max_run_history: usize,
    #[serde(default)]
    pub last_run_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_status: Option<CronJobRunStatus>,
    /// Runs still `Running`; at most one unless `allow_overruns`
    #[serde(default)]
    pub active_runs: Vec<CronRunId>,
    #[serde(default)]
    pub leased_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub leased_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CronJob {
    pub fn frequency(&self) -> Duration {
        Duration::seconds(self.frequency_secs as i64)
    }

    pub fn lifetime(&self) -> Option<Duration> {
        self.lifetime_secs.map(|secs| Duration::seconds(secs as i64))
    }

    /// When the job fires next; a job that never ran is due immediately
    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.last_run_time.map(|last| last + self.frequency())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_time().map_or(true, |next| next <= now)
    }

    pub fn has_active_run(&self) -> bool {
        !self.active_runs.is_empty()
    }

    /// Whether a new run may start given the runs still open
    pub fn may_start_run(&self) -> bool {
        self.allow_overruns || !self.has_active_run()
    }
}

impl Leasable for CronJob {
    fn leased_by(&self) -> Option<&str> {
        self.leased_by.as_deref()
    }

    fn leased_until(&self) -> Option<DateTime<Utc>> {
        self.leased_until
    }

    fn set_lease(&mut self, leased_by: Option<String>, leased_until: Option<DateTime<Utc>>) {
        self.leased_by = leased_by;
        self.leased_until = leased_until;
    }
}

/// Flow a cron run is waiting on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFlow {
    pub client_id: ClientId,
    pub flow_id: FlowId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJobRun {
    pub job_id: CronJobId,
    pub run_id: CronRunId,
    pub status: CronJobRunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub hunt_id: Option<HuntId>,
    #[serde(default)]
    pub tracked_flow: Option<TrackedFlow>,
}

impl CronJobRun {
    pub fn start(job_id: CronJobId, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            run_id: CronRunId::random(),
            status: CronJobRunStatus::Running,
            started_at: now,
            finished_at: None,
            error_message: None,
            hunt_id: None,
            tracked_flow: None,
        }
    }

    /// Close the run; returns false if it was already closed
    pub fn finish(
        &mut self,
        status: CronJobRunStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.error_message = error_message;
        self.finished_at = Some(now);
        true
    }

    pub fn is_past_lifetime(&self, lifetime: Option<Duration>, now: DateTime<Utc>) -> bool {
        lifetime.is_some_and(|lifetime| self.started_at + lifetime <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(allow_overruns: bool) -> CronJob {
        CronJob {
            job_id: CronJobId::new("hourly-netstat"),
            description: String::new(),
            action: CronAction::StartFlow {
                client_id: ClientId::new("C.1"),
                flow_type: "Netstat".into(),
                args: json!({}),
            },
            frequency_secs: 3600,
            lifetime_secs: None,
            allow_overruns,
            enabled: true,
            max_run_history: 5,
            last_run_time: None,
            last_run_status: None,
            active_runs: Vec::new(),
            leased_until: None,
            leased_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_due_computation() {
        let now = Utc::now();
        let mut job = job(false);
        assert!(job.is_due(now));

        job.last_run_time = Some(now);
        assert!(!job.is_due(now + Duration::minutes(59)));
        assert!(job.is_due(now + Duration::hours(1)));

        job.enabled = false;
        assert!(!job.is_due(now + Duration::hours(2)));
    }

    #[test]
    fn test_overrun_gate() {
        let mut job = job(false);
        job.active_runs.push(CronRunId::new("R1"));
        assert!(!job.may_start_run());
        job.allow_overruns = true;
        assert!(job.may_start_run());
    }

    #[test]
    fn test_run_terminal_states_reached_once() {
        let now = Utc::now();
        let mut run = CronJobRun::start(CronJobId::new("job"), now);
        assert!(run.finish(CronJobRunStatus::Finished, None, now));
        assert!(!run.finish(CronJobRunStatus::Error, Some("late".into()), now));
        assert_eq!(run.status, CronJobRunStatus::Finished);
        assert!(run.error_message.is_none());
    }
}
