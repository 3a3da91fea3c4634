//! # Database Operations
//!
//! Storage seam of the orchestration core. Components never talk to a
//! concrete backend; they hold an `Arc<dyn DataStore>` and use the narrow
//! per-entity traits below.
//!
//! ## Key Components
//!
//! - [`lease`] - lease discipline shared by the queue, cron jobs and client claims
//! - [`memory`] - in-process store used by tests and single-node deployments
//! - [`postgres`] - PostgreSQL store built on SQLx
//!
//! ## Atomicity
//!
//! Every operation that touches more than one row is atomic in both
//! implementations: read-modify-write goes through a [`Mutator`] applied
//! under a row lock (or one critical section), and a flow transition is
//! persisted by a single [`FlowStore::commit_flow_transition`] call guarded
//! by the flow's `version`.
//!
//! ```rust
//! use huntsman_core::database::{memory::InMemoryDataStore, ClientStore};
//! use huntsman_core::models::ClientId;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryDataStore::new();
//! let client = ClientId::new("C.1");
//! assert!(store.claim_client("H1", &client, chrono::Utc::now()).await.unwrap());
//! assert!(!store.claim_client("H1", &client, chrono::Utc::now()).await.unwrap());
//! # });
//! ```

pub mod lease;
pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::models::{
    ClientId, ClientInfo, CronJob, CronJobId, CronJobRun, CronRunId, Flow, FlowCommit, FlowId,
    FlowRequest, FlowResponse, FlowResult, ForemanRule, ForemanRuleId, Hunt, HuntId,
    MessageHandlerRequest, RequestId, RequestWithResponses,
};

pub use lease::{ClaimKey, Leasable};
pub use memory::InMemoryDataStore;
pub use postgres::PgDataStore;

/// Read-modify-write callback. The mutation is persisted only when the
/// callback returns `true`.
pub type Mutator<T> = Box<dyn FnOnce(&mut T) -> bool + Send>;

/// Carries a value computed inside a [`Mutator`] back to the caller.
#[derive(Debug)]
pub struct Captured<T>(Arc<Mutex<Option<T>>>);

impl<T> Clone for Captured<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Captured<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }
}

impl<T> Captured<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: T) {
        *self.0.lock() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.0.lock().take()
    }
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert the flow with its initial requests and results unless a flow
    /// with the same identity exists. Returns whether it was inserted.
    async fn create_flow(
        &self,
        flow: Flow,
        requests: Vec<FlowRequest>,
        results: Vec<FlowResult>,
    ) -> Result<bool>;

    /// Unconditional upsert
    async fn write_flow(&self, flow: Flow) -> Result<()>;

    async fn read_flow(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<Option<Flow>>;

    /// Apply `mutator` atomically; persisted changes bump `version`.
    /// Returns `None` when the flow does not exist.
    async fn update_flow(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        mutator: Mutator<Flow>,
    ) -> Result<Option<Flow>>;

    /// Persist one handler invocation atomically; fails with
    /// `ConcurrentModification` if the stored version moved on.
    async fn commit_flow_transition(&self, commit: FlowCommit) -> Result<Flow>;

    async fn list_flows_for_hunt(&self, hunt_id: &HuntId) -> Result<Vec<Flow>>;

    /// Running flows whose deadline is at or before `now`
    async fn list_flows_past_deadline(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<Flow>>;

    async fn write_requests(&self, requests: Vec<FlowRequest>) -> Result<()>;

    async fn read_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<Option<FlowRequest>>;

    /// Open requests of a flow with their responses, both ordered by id
    async fn read_requests_with_responses(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> Result<Vec<RequestWithResponses>>;

    async fn read_responses_for_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<Vec<FlowResponse>>;

    /// Remove a request together with its responses
    async fn delete_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<()>;

    /// Store responses, ignoring copies of an already stored
    /// `(client_id, flow_id, request_id, response_id)`. Returns how many
    /// rows were new.
    async fn write_flow_responses(&self, responses: Vec<FlowResponse>) -> Result<usize>;

    async fn read_flow_results(&self, client_id: &ClientId, flow_id: &FlowId)
        -> Result<Vec<FlowResult>>;

    async fn read_hunt_results(
        &self,
        hunt_id: &HuntId,
        offset: usize,
        count: usize,
    ) -> Result<Vec<FlowResult>>;
}

#[async_trait]
pub trait MessageHandlerStore: Send + Sync {
    /// Upsert by `(handler_name, request_id)`. An existing item keeps its
    /// lease and gets its generation bumped.
    async fn enqueue_message_handler_requests(&self, items: Vec<MessageHandlerRequest>)
        -> Result<()>;

    /// Atomically lease up to `limit` free or expired items
    async fn lease_message_handler_requests(
        &self,
        handler_name: &str,
        owner: &str,
        lease_duration: Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageHandlerRequest>>;

    /// Remove items whose generation still matches; items that were
    /// re-enqueued meanwhile only lose their lease. Returns the number
    /// actually removed.
    async fn delete_message_handler_requests(&self, items: &[MessageHandlerRequest])
        -> Result<usize>;

    /// Give leases held by `owner` back for immediate redelivery
    async fn release_message_handler_requests(
        &self,
        items: &[MessageHandlerRequest],
        owner: &str,
    ) -> Result<usize>;

    async fn count_message_handler_requests(&self, handler_name: &str) -> Result<usize>;
}

#[async_trait]
pub trait ForemanRuleStore: Send + Sync {
    /// Upsert by rule id
    async fn write_foreman_rule(&self, rule: ForemanRule) -> Result<()>;
    async fn read_all_foreman_rules(&self) -> Result<Vec<ForemanRule>>;
    async fn remove_foreman_rule(&self, rule_id: &ForemanRuleId) -> Result<bool>;
    /// Returns the number of rules removed
    async fn remove_expired_foreman_rules(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait HuntStore: Send + Sync {
    async fn write_hunt(&self, hunt: Hunt) -> Result<()>;
    async fn read_hunt(&self, hunt_id: &HuntId) -> Result<Option<Hunt>>;
    async fn update_hunt(&self, hunt_id: &HuntId, mutator: Mutator<Hunt>) -> Result<Option<Hunt>>;
    async fn list_hunts(&self) -> Result<Vec<Hunt>>;
}

#[async_trait]
pub trait CronJobStore: Send + Sync {
    async fn write_cron_job(&self, job: CronJob) -> Result<()>;
    async fn read_cron_job(&self, job_id: &CronJobId) -> Result<Option<CronJob>>;
    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>>;
    /// Deletes the job and its run history
    async fn delete_cron_job(&self, job_id: &CronJobId) -> Result<bool>;
    async fn update_cron_job(
        &self,
        job_id: &CronJobId,
        mutator: Mutator<CronJob>,
    ) -> Result<Option<CronJob>>;

    /// Compare-and-swap lease acquisition; `None` when the job is missing or
    /// leased by someone else. A lease the caller already holds is extended.
    async fn lease_cron_job(
        &self,
        job_id: &CronJobId,
        owner: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<CronJob>> {
        let owner = owner.to_string();
        let acquired = Captured::new();
        let flag = acquired.clone();
        let job = self
            .update_cron_job(
                job_id,
                Box::new(move |job: &mut CronJob| {
                    let won = job.extend(&owner, now, lease_duration)
                        || job.try_acquire(&owner, now, lease_duration);
                    flag.set(won);
                    won
                }),
            )
            .await?;
        Ok(job.filter(|_| acquired.take().unwrap_or(false)))
    }

    /// Upsert by `(job_id, run_id)`
    async fn write_cron_job_run(&self, run: CronJobRun) -> Result<()>;
    async fn read_cron_job_run(
        &self,
        job_id: &CronJobId,
        run_id: &CronRunId,
    ) -> Result<Option<CronJobRun>>;
    /// Oldest first
    async fn list_cron_job_runs(&self, job_id: &CronJobId) -> Result<Vec<CronJobRun>>;
    /// Drop finished runs beyond the newest `keep`; running runs are kept
    async fn trim_cron_job_runs(&self, job_id: &CronJobId, keep: usize) -> Result<usize>;
}

#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn write_client_info(&self, info: ClientInfo) -> Result<()>;
    async fn read_client_info(&self, client_id: &ClientId) -> Result<Option<ClientInfo>>;
    /// Never-expiring insert-if-absent claim of a client within a scope.
    /// Returns `true` for the single caller that inserted it.
    async fn claim_client(&self, scope: &str, client_id: &ClientId, now: DateTime<Utc>)
        -> Result<bool>;
    async fn is_client_claimed(&self, scope: &str, client_id: &ClientId) -> Result<bool>;
}

/// Everything the orchestration core needs from durable storage
pub trait DataStore:
    FlowStore + MessageHandlerStore + ForemanRuleStore + HuntStore + CronJobStore + ClientStore
{
}

impl<T> DataStore for T where
    T: FlowStore + MessageHandlerStore + ForemanRuleStore + HuntStore + CronJobStore + ClientStore
{
}
