//! Store wrapper that injects transient claim failures in front of the
//! in-memory store.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use huntsman_core::database::{
    ClientStore, CronJobStore, FlowStore, ForemanRuleStore, HuntStore, InMemoryDataStore,
    MessageHandlerStore, Mutator,
};
use huntsman_core::error::{HuntsmanError, Result};
use huntsman_core::models::{
    ClientId, ClientInfo, CronJob, CronJobId, CronJobRun, CronRunId, Flow, FlowCommit, FlowId,
    FlowRequest, FlowResponse, FlowResult, ForemanRule, ForemanRuleId, Hunt, HuntId,
    MessageHandlerRequest, RequestId, RequestWithResponses,
};

/// Fails the next `claim_failures` calls to `claim_client` with a
/// retryable database error
pub struct FlakyClaimStore {
    inner: Arc<InMemoryDataStore>,
    claim_failures: AtomicUsize,
}

impl FlakyClaimStore {
    pub fn new(inner: Arc<InMemoryDataStore>, claim_failures: usize) -> Self {
        Self {
            inner,
            claim_failures: AtomicUsize::new(claim_failures),
        }
    }
}

#[async_trait]
impl ClientStore for FlakyClaimStore {
    async fn write_client_info(&self, info: ClientInfo) -> Result<()> {
        self.inner.write_client_info(info).await
    }

    async fn read_client_info(&self, client_id: &ClientId) -> Result<Option<ClientInfo>> {
        self.inner.read_client_info(client_id).await
    }

    async fn claim_client(&self, scope: &str, client_id: &ClientId, now: DateTime<Utc>) -> Result<bool> {
        let failing = self
            .claim_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(HuntsmanError::DatabaseError("connection reset".to_string()));
        }
        self.inner.claim_client(scope, client_id, now).await
    }

    async fn is_client_claimed(&self, scope: &str, client_id: &ClientId) -> Result<bool> {
        self.inner.is_client_claimed(scope, client_id).await
    }
}

#[async_trait]
impl FlowStore for FlakyClaimStore {
    async fn create_flow(
        &self,
        flow: Flow,
        requests: Vec<FlowRequest>,
        results: Vec<FlowResult>,
    ) -> Result<bool> {
        self.inner.create_flow(flow, requests, results).await
    }

    async fn write_flow(&self, flow: Flow) -> Result<()> {
        self.inner.write_flow(flow).await
    }

    async fn read_flow(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<Option<Flow>> {
        self.inner.read_flow(client_id, flow_id).await
    }

    async fn update_flow(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        mutator: Mutator<Flow>,
    ) -> Result<Option<Flow>> {
        self.inner.update_flow(client_id, flow_id, mutator).await
    }

    async fn commit_flow_transition(&self, commit: FlowCommit) -> Result<Flow> {
        self.inner.commit_flow_transition(commit).await
    }

    async fn list_flows_for_hunt(&self, hunt_id: &HuntId) -> Result<Vec<Flow>> {
        self.inner.list_flows_for_hunt(hunt_id).await
    }

    async fn list_flows_past_deadline(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Flow>> {
        self.inner.list_flows_past_deadline(now, limit).await
    }

    async fn write_requests(&self, requests: Vec<FlowRequest>) -> Result<()> {
        self.inner.write_requests(requests).await
    }

    async fn read_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<Option<FlowRequest>> {
        self.inner.read_request(client_id, flow_id, request_id).await
    }

    async fn read_requests_with_responses(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> Result<Vec<RequestWithResponses>> {
        self.inner.read_requests_with_responses(client_id, flow_id).await
    }

    async fn read_responses_for_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<Vec<FlowResponse>> {
        self.inner
            .read_responses_for_request(client_id, flow_id, request_id)
            .await
    }

    async fn delete_request(&self, client_id: &ClientId, flow_id: &FlowId, request_id: RequestId) -> Result<()> {
        self.inner.delete_request(client_id, flow_id, request_id).await
    }

    async fn write_flow_responses(&self, responses: Vec<FlowResponse>) -> Result<usize> {
        self.inner.write_flow_responses(responses).await
    }

    async fn read_flow_results(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<Vec<FlowResult>> {
        self.inner.read_flow_results(client_id, flow_id).await
    }

    async fn read_hunt_results(&self, hunt_id: &HuntId, offset: usize, count: usize) -> Result<Vec<FlowResult>> {
        self.inner.read_hunt_results(hunt_id, offset, count).await
    }
}

#[async_trait]
impl MessageHandlerStore for FlakyClaimStore {
    async fn enqueue_message_handler_requests(&self, items: Vec<MessageHandlerRequest>) -> Result<()> {
        self.inner.enqueue_message_handler_requests(items).await
    }

    async fn lease_message_handler_requests(
        &self,
        handler_name: &str,
        owner: &str,
        lease_duration: Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageHandlerRequest>> {
        self.inner
            .lease_message_handler_requests(handler_name, owner, lease_duration, limit, now)
            .await
    }

    async fn delete_message_handler_requests(&self, items: &[MessageHandlerRequest]) -> Result<usize> {
        self.inner.delete_message_handler_requests(items).await
    }

    async fn release_message_handler_requests(
        &self,
        items: &[MessageHandlerRequest],
        owner: &str,
    ) -> Result<usize> {
        self.inner.release_message_handler_requests(items, owner).await
    }

    async fn count_message_handler_requests(&self, handler_name: &str) -> Result<usize> {
        self.inner.count_message_handler_requests(handler_name).await
    }
}

#[async_trait]
impl ForemanRuleStore for FlakyClaimStore {
    async fn write_foreman_rule(&self, rule: ForemanRule) -> Result<()> {
        self.inner.write_foreman_rule(rule).await
    }

    async fn read_all_foreman_rules(&self) -> Result<Vec<ForemanRule>> {
        self.inner.read_all_foreman_rules().await
    }

    async fn remove_foreman_rule(&self, rule_id: &ForemanRuleId) -> Result<bool> {
        self.inner.remove_foreman_rule(rule_id).await
    }

    async fn remove_expired_foreman_rules(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.remove_expired_foreman_rules(now).await
    }
}

#[async_trait]
impl HuntStore for FlakyClaimStore {
    async fn write_hunt(&self, hunt: Hunt) -> Result<()> {
        self.inner.write_hunt(hunt).await
    }

    async fn read_hunt(&self, hunt_id: &HuntId) -> Result<Option<Hunt>> {
        self.inner.read_hunt(hunt_id).await
    }

    async fn update_hunt(&self, hunt_id: &HuntId, mutator: Mutator<Hunt>) -> Result<Option<Hunt>> {
        self.inner.update_hunt(hunt_id, mutator).await
    }

    async fn list_hunts(&self) -> Result<Vec<Hunt>> {
        self.inner.list_hunts().await
    }
}

#[async_trait]
impl CronJobStore for FlakyClaimStore {
    async fn write_cron_job(&self, job: CronJob) -> Result<()> {
        self.inner.write_cron_job(job).await
    }

    async fn read_cron_job(&self, job_id: &CronJobId) -> Result<Option<CronJob>> {
        self.inner.read_cron_job(job_id).await
    }

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        self.inner.list_cron_jobs().await
    }

    async fn delete_cron_job(&self, job_id: &CronJobId) -> Result<bool> {
        self.inner.delete_cron_job(job_id).await
    }

    async fn update_cron_job(&self, job_id: &CronJobId, mutator: Mutator<CronJob>) -> Result<Option<CronJob>> {
        self.inner.update_cron_job(job_id, mutator).await
    }

    async fn write_cron_job_run(&self, run: CronJobRun) -> Result<()> {
        self.inner.write_cron_job_run(run).await
    }

    async fn read_cron_job_run(&self, job_id: &CronJobId, run_id: &CronRunId) -> Result<Option<CronJobRun>> {
        self.inner.read_cron_job_run(job_id, run_id).await
    }

    async fn list_cron_job_runs(&self, job_id: &CronJobId) -> Result<Vec<CronJobRun>> {
        self.inner.list_cron_job_runs(job_id).await
    }

    async fn trim_cron_job_runs(&self, job_id: &CronJobId, keep: usize) -> Result<usize> {
        self.inner.trim_cron_job_runs(job_id, keep).await
    }
}
