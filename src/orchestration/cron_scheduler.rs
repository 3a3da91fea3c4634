//! # Cron Scheduler
//!
//! Fires [`CronJob`]s on their frequency and supervises the runs they
//! start. Any number of coordinators may tick concurrently: a job is only
//! touched by the holder of its lease, and the holder keeps the lease while
//! a run is open so exactly one coordinator supervises it.
//!
//! ## Run lifecycle
//!
//! - `StartHunt` runs finish as soon as the hunt has been created and started.
//! - `StartFlow` runs track their flow and close when it terminates. The flow
//!   id is derived from the run id, so a run interrupted before recording its
//!   flow re-attaches to it on the next supervision.
//! - A run older than the job's lifetime is closed as `LifetimeExceeded` and
//!   its flow is asked to stop.
//!
//! Without `allow_overruns` a due job waits until its open run closes.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::flow_runner::{FlowRunner, FlowStartOptions};
use super::hunt_coordinator::HuntCoordinator;
use crate::constants::{defaults, events};
use crate::database::{DataStore, Leasable};
use crate::error::{HuntsmanError, Result};
use crate::events::EventPublisher;
use crate::logging::{log_cron_operation, log_error};
use crate::models::{CronAction, CronJob, CronJobId, CronJobRun, CronRunId, FlowId, TrackedFlow};
use crate::state_machine::{CronJobRunStatus, FlowStatus};

/// Operator request to schedule a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCronJob {
    pub job_id: CronJobId,
    #[serde(default)]
    pub description: String,
    pub action: CronAction,
    pub frequency_secs: u64,
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
    #[serde(default)]
    pub allow_overruns: bool,
    /// Falls back to the scheduler's configured history size
    #[serde(default)]
    pub max_run_history: Option<usize>,
}

/// Flow id used by the `StartFlow` action of a run
fn run_flow_id(run_id: &CronRunId) -> FlowId {
    FlowId::new(format!("CR-{run_id}"))
}

/// Counters of one scheduler tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CronTickReport {
    pub jobs_checked: usize,
    pub runs_started: usize,
    pub runs_closed: usize,
    pub skipped_leased: usize,
    pub errors: usize,
}

impl CronTickReport {
    fn absorb(&mut self, other: CronTickReport) {
        self.runs_started += other.runs_started;
        self.runs_closed += other.runs_closed;
        self.skipped_leased += other.skipped_leased;
        self.errors += other.errors;
    }
}

pub struct CronScheduler {
    store: Arc<dyn DataStore>,
    hunts: Arc<HuntCoordinator>,
    runner: Arc<FlowRunner>,
    events: EventPublisher,
    owner: String,
    lease_duration: Duration,
    max_run_history: usize,
}

impl CronScheduler {
    pub fn new(
        store: Arc<dyn DataStore>,
        hunts: Arc<HuntCoordinator>,
        runner: Arc<FlowRunner>,
        events: EventPublisher,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            store,
            hunts,
            runner,
            events,
            owner: owner.into(),
            lease_duration: Duration::seconds(defaults::CRON_LEASE_DURATION_SECS as i64),
            max_run_history: defaults::MAX_RUN_HISTORY,
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_max_run_history(mut self, max_run_history: usize) -> Self {
        self.max_run_history = max_run_history.max(1);
        self
    }

    pub async fn create_job(&self, request: CreateCronJob) -> Result<CronJob> {
        if request.job_id.as_str().trim().is_empty() {
            return Err(HuntsmanError::ValidationError("job_id must not be empty".into()));
        }
        if request.frequency_secs == 0 {
            return Err(HuntsmanError::ValidationError(
                "frequency_secs must be greater than 0".into(),
            ));
        }
        if request.lifetime_secs == Some(0) {
            return Err(HuntsmanError::ValidationError(
                "lifetime_secs must be greater than 0".into(),
            ));
        }
        match &request.action {
            CronAction::StartHunt { hunt } => {
                hunt.client_rule.validate()?;
                self.runner
                    .validate_flow(&hunt.action.flow_type, &hunt.action.flow_args)?;
            }
            CronAction::StartFlow {
                flow_type, args, ..
            } => self.runner.validate_flow(flow_type, args)?,
        }
        if self.store.read_cron_job(&request.job_id).await?.is_some() {
            return Err(HuntsmanError::ValidationError(format!(
                "cron job {} already exists",
                request.job_id
            )));
        }

        let job = CronJob {
            job_id: request.job_id,
            description: request.description,
            action: request.action,
            frequency_secs: request.frequency_secs,
            lifetime_secs: request.lifetime_secs,
            allow_overruns: request.allow_overruns,
            enabled: true,
            max_run_history: request.max_run_history.unwrap_or(self.max_run_history).max(1),
            last_run_time: None,
            last_run_status: None,
            active_runs: Vec::new(),
            leased_until: None,
            leased_by: None,
            created_at: Utc::now(),
        };
        self.store.write_cron_job(job.clone()).await?;
        log_cron_operation("create", job.job_id.as_str(), None, "enabled", None);
        Ok(job)
    }

    pub async fn enable_job(&self, job_id: &CronJobId) -> Result<CronJob> {
        self.set_enabled(job_id, true).await
    }

    /// Stop firing; open runs are still supervised
    pub async fn disable_job(&self, job_id: &CronJobId) -> Result<CronJob> {
        self.set_enabled(job_id, false).await
    }

    async fn set_enabled(&self, job_id: &CronJobId, enabled: bool) -> Result<CronJob> {
        let job = self
            .store
            .update_cron_job(
                job_id,
                Box::new(move |job: &mut CronJob| {
                    job.enabled = enabled;
                    true
                }),
            )
            .await?
            .ok_or_else(|| HuntsmanError::NotFound(format!("cron job {job_id}")))?;
        let state = if enabled { "enabled" } else { "disabled" };
        log_cron_operation("set_enabled", job_id.as_str(), None, state, None);
        Ok(job)
    }

    pub async fn delete_job(&self, job_id: &CronJobId) -> Result<bool> {
        let deleted = self.store.delete_cron_job(job_id).await?;
        if deleted {
            log_cron_operation("delete", job_id.as_str(), None, "deleted", None);
        }
        Ok(deleted)
    }

    pub async fn get_job(&self, job_id: &CronJobId) -> Result<CronJob> {
        self.store
            .read_cron_job(job_id)
            .await?
            .ok_or_else(|| HuntsmanError::NotFound(format!("cron job {job_id}")))
    }

    pub async fn list_jobs(&self) -> Result<Vec<CronJob>> {
        self.store.list_cron_jobs().await
    }

    pub async fn list_runs(&self, job_id: &CronJobId) -> Result<Vec<CronJobRun>> {
        self.store.list_cron_job_runs(job_id).await
    }

    /// Drop finished runs beyond each job's history size
    pub async fn trim_history(&self) -> Result<usize> {
        let mut removed = 0;
        for job in self.store.list_cron_jobs().await? {
            removed += self
                .store
                .trim_cron_job_runs(&job.job_id, job.max_run_history)
                .await?;
        }
        if removed > 0 {
            debug!(removed, "Trimmed cron run history");
        }
        Ok(removed)
    }

    /// Supervise open runs and fire due jobs. Errors are isolated per job.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<CronTickReport> {
        let mut report = CronTickReport::default();
        for job in self.store.list_cron_jobs().await? {
            report.jobs_checked += 1;
            match self.tick_job(&job, now).await {
                Ok(step) => report.absorb(step),
                Err(e) if e.is_retryable() => {
                    debug!(job_id = %job.job_id, error = %e, "Cron job contended; retrying next tick");
                }
                Err(e) => {
                    report.errors += 1;
                    log_error("cron_scheduler", "tick", &e.to_string(), Some(job.job_id.as_str()));
                }
            }
        }
        Ok(report)
    }

    async fn tick_job(&self, job: &CronJob, now: DateTime<Utc>) -> Result<CronTickReport> {
        let mut report = CronTickReport::default();
        let wants_start = job.is_due(now) && job.may_start_run();
        if !job.has_active_run() && !wants_start {
            return Ok(report);
        }

        let Some(job) = self
            .store
            .lease_cron_job(&job.job_id, &self.owner, self.lease_duration, now)
            .await?
        else {
            report.skipped_leased += 1;
            return Ok(report);
        };

        for run_id in &job.active_runs {
            if self.supervise_run(&job, run_id, now).await? {
                report.runs_closed += 1;
            }
        }

        let mut job = self.get_job(&job.job_id).await?;
        if job.is_due(now) && job.may_start_run() {
            self.start_run(&job, now).await?;
            report.runs_started += 1;
            job = self.get_job(&job.job_id).await?;
        }

        if !job.has_active_run() || job.allow_overruns {
            let owner = self.owner.clone();
            self.store
                .update_cron_job(
                    &job.job_id,
                    Box::new(move |job: &mut CronJob| job.release(&owner)),
                )
                .await?;
        }
        Ok(report)
    }

    /// Close the run if it is done; returns whether it was closed
    async fn supervise_run(&self, job: &CronJob, run_id: &CronRunId, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut run) = self.store.read_cron_job_run(&job.job_id, run_id).await? else {
            debug!(job_id = %job.job_id, run_id = %run_id, "Dropping unknown active run");
            self.close_on_job(&job.job_id, run_id, None).await?;
            return Ok(true);
        };
        if run.status.is_terminal() {
            self.close_on_job(&job.job_id, run_id, Some(run.status)).await?;
            return Ok(true);
        }

        if run.tracked_flow.is_none() {
            if let Some(tracked) = self.find_run_flow(job, &run).await? {
                debug!(job_id = %job.job_id, run_id = %run_id, "Re-attached flow of an interrupted run");
                run.tracked_flow = Some(tracked);
                self.store.write_cron_job_run(run.clone()).await?;
            }
        }

        let mut closing = None;
        if let Some(tracked) = &run.tracked_flow {
            match self.store.read_flow(&tracked.client_id, &tracked.flow_id).await? {
                Some(flow) if flow.status == FlowStatus::Succeeded => {
                    closing = Some((CronJobRunStatus::Finished, None));
                }
                Some(flow) if !flow.is_running() => {
                    closing = Some((CronJobRunStatus::Error, flow.error_message.clone()));
                }
                Some(_) => {}
                None => {
                    closing = Some((
                        CronJobRunStatus::Error,
                        Some("tracked flow no longer exists".to_string()),
                    ));
                }
            }
        } else {
            closing = Some((
                CronJobRunStatus::Error,
                Some("run was interrupted before its action completed".to_string()),
            ));
        }

        if closing.is_none() && run.is_past_lifetime(job.lifetime(), now) {
            closing = Some((
                CronJobRunStatus::LifetimeExceeded,
                Some("run exceeded the job lifetime".to_string()),
            ));
            if let Some(tracked) = &run.tracked_flow {
                if let Err(e) = self
                    .runner
                    .request_flow_stop(&tracked.client_id, &tracked.flow_id, "cron run lifetime exceeded")
                    .await
                {
                    log_error("cron_scheduler", "stop_flow", &e.to_string(), Some(run_id.as_str()));
                }
            }
        }

        let Some((status, message)) = closing else {
            return Ok(false);
        };
        if run.finish(status, message, now) {
            self.store.write_cron_job_run(run.clone()).await?;
        }
        self.close_on_job(&job.job_id, run_id, Some(run.status)).await?;
        self.publish_finished(&run);
        Ok(true)
    }

    async fn find_run_flow(&self, job: &CronJob, run: &CronJobRun) -> Result<Option<TrackedFlow>> {
        let CronAction::StartFlow { client_id, .. } = &job.action else {
            return Ok(None);
        };
        let flow = self.store.read_flow(client_id, &run_flow_id(&run.run_id)).await?;
        Ok(flow.map(|flow| TrackedFlow {
            client_id: flow.client_id,
            flow_id: flow.flow_id,
        }))
    }

    async fn start_run(&self, job: &CronJob, now: DateTime<Utc>) -> Result<()> {
        let mut run = CronJobRun::start(job.job_id.clone(), now);
        let run_id = run.run_id.clone();

        // the job records the run first so an overlapping tick sees it open
        self.store
            .update_cron_job(
                &job.job_id,
                Box::new(move |job: &mut CronJob| {
                    job.last_run_time = Some(now);
                    job.active_runs.push(run_id);
                    true
                }),
            )
            .await?;
        self.store.write_cron_job_run(run.clone()).await?;

        self.events.publish(
            events::CRON_RUN_STARTED,
            json!({ "job_id": job.job_id, "run_id": run.run_id }),
        );
        log_cron_operation("start_run", job.job_id.as_str(), Some(run.run_id.as_str()), "running", None);

        if let Err(e) = self.execute(job, &mut run, now).await {
            run.finish(CronJobRunStatus::Error, Some(e.to_string()), now);
        }
        self.store.write_cron_job_run(run.clone()).await?;

        if run.status.is_terminal() {
            self.close_on_job(&job.job_id, &run.run_id, Some(run.status)).await?;
            self.publish_finished(&run);
        }
        Ok(())
    }

    async fn execute(&self, job: &CronJob, run: &mut CronJobRun, now: DateTime<Utc>) -> Result<()> {
        let creator = format!("cron:{}", job.job_id);
        match &job.action {
            CronAction::StartHunt { hunt } => {
                let created = self.hunts.create_hunt(hunt.clone(), &creator).await?;
                run.hunt_id = Some(created.hunt_id.clone());
                self.hunts.start_hunt(&created.hunt_id).await?;
                run.finish(CronJobRunStatus::Finished, None, now);
            }
            CronAction::StartFlow {
                client_id,
                flow_type,
                args,
            } => {
                let options = FlowStartOptions::new(creator).with_flow_id(run_flow_id(&run.run_id));
                let flow = self
                    .runner
                    .start_flow(client_id.clone(), flow_type, args.clone(), options)
                    .await?;
                run.tracked_flow = Some(TrackedFlow {
                    client_id: flow.client_id.clone(),
                    flow_id: flow.flow_id.clone(),
                });
                match flow.status {
                    FlowStatus::Running => {}
                    FlowStatus::Succeeded => {
                        run.finish(CronJobRunStatus::Finished, None, now);
                    }
                    _ => {
                        run.finish(CronJobRunStatus::Error, flow.error_message.clone(), now);
                    }
                }
            }
        }
        Ok(())
    }

    async fn close_on_job(
        &self,
        job_id: &CronJobId,
        run_id: &CronRunId,
        status: Option<CronJobRunStatus>,
    ) -> Result<()> {
        let run_id = run_id.clone();
        self.store
            .update_cron_job(
                job_id,
                Box::new(move |job: &mut CronJob| {
                    job.active_runs.retain(|active| active != &run_id);
                    if let Some(status) = status {
                        job.last_run_status = Some(status);
                    }
                    true
                }),
            )
            .await?;
        Ok(())
    }

    fn publish_finished(&self, run: &CronJobRun) {
        self.events.publish(
            events::CRON_RUN_FINISHED,
            json!({
                "job_id": run.job_id,
                "run_id": run.run_id,
                "status": run.status,
                "error_message": run.error_message,
            }),
        );
        log_cron_operation(
            "finish_run",
            run.job_id.as_str(),
            Some(run.run_id.as_str()),
            &run.status.to_string(),
            run.error_message.as_deref(),
        );
        if run.status == CronJobRunStatus::Finished {
            info!(job_id = %run.job_id, run_id = %run.run_id, "Cron run finished");
        }
    }
}
