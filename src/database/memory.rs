//! In-process [`DataStore`](super::DataStore) implementation.
//!
//! Flow state lives behind one `parking_lot` mutex so that a transition
//! (flow, requests, responses, results) is applied in a single critical
//! section. Independent entities use `dashmap` maps whose per-entry locks
//! give the mutators their atomicity.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::lease::{ClaimKey, Leasable};
use super::{
    ClientStore, CronJobStore, FlowStore, ForemanRuleStore, HuntStore, MessageHandlerStore,
    Mutator,
};
use crate::error::{HuntsmanError, Result};
use crate::models::{
    ClientId, ClientInfo, CronJob, CronJobId, CronJobRun, CronRunId, Flow, FlowCommit, FlowId,
    FlowRequest, FlowResponse, FlowResult, ForemanRule, ForemanRuleId, Hunt, HuntId,
    MessageHandlerRequest, RequestId, RequestWithResponses, ResponseId,
};

type FlowKey = (ClientId, FlowId);
type RequestKey = (ClientId, FlowId, RequestId);
type ResponseKey = (ClientId, FlowId, RequestId, ResponseId);

#[derive(Default)]
struct FlowTables {
    flows: HashMap<FlowKey, Flow>,
    requests: BTreeMap<RequestKey, FlowRequest>,
    responses: BTreeMap<ResponseKey, FlowResponse>,
    results: Vec<FlowResult>,
}

impl FlowTables {
    fn request_range(
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> std::ops::RangeInclusive<RequestKey> {
        (client_id.clone(), flow_id.clone(), RequestId::MIN)
            ..=(client_id.clone(), flow_id.clone(), RequestId::MAX)
    }

    fn response_range(
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> std::ops::RangeInclusive<ResponseKey> {
        (client_id.clone(), flow_id.clone(), request_id, ResponseId::MIN)
            ..=(client_id.clone(), flow_id.clone(), request_id, ResponseId::MAX)
    }

    fn responses_for(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Vec<FlowResponse> {
        self.responses
            .range(Self::response_range(client_id, flow_id, request_id))
            .map(|(_, response)| response.clone())
            .collect()
    }

    fn remove_request(&mut self, client_id: &ClientId, flow_id: &FlowId, request_id: RequestId) {
        self.requests
            .remove(&(client_id.clone(), flow_id.clone(), request_id));
        let keys: Vec<ResponseKey> = self
            .responses
            .range(Self::response_range(client_id, flow_id, request_id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.responses.remove(&key);
        }
    }

    fn purge_flow_requests(&mut self, client_id: &ClientId, flow_id: &FlowId) {
        let request_ids: Vec<RequestId> = self
            .requests
            .range(Self::request_range(client_id, flow_id))
            .map(|((_, _, request_id), _)| *request_id)
            .collect();
        for request_id in request_ids {
            self.remove_request(client_id, flow_id, request_id);
        }
        // responses may exist for requests that were never written
        self.responses
            .retain(|(c, f, _, _), _| !(c == client_id && f == flow_id));
    }
}

/// Store backed by process memory. Cheap to construct; used by the test
/// suite and by `huntsman-server` when no database is configured.
#[derive(Default)]
pub struct InMemoryDataStore {
    flow_tables: Mutex<FlowTables>,
    queue: Mutex<BTreeMap<(String, String), MessageHandlerRequest>>,
    foreman_rules: DashMap<ForemanRuleId, ForemanRule>,
    hunts: DashMap<HuntId, Hunt>,
    cron_jobs: DashMap<CronJobId, CronJob>,
    cron_runs: Mutex<HashMap<CronJobId, Vec<CronJobRun>>>,
    clients: DashMap<ClientId, ClientInfo>,
    claims: DashMap<ClaimKey, DateTime<Utc>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_mutator<K, T>(map: &DashMap<K, T>, key: &K, mutator: Mutator<T>) -> Option<T>
where
    K: std::hash::Hash + Eq,
    T: Clone,
{
    let mut entry = map.get_mut(key)?;
    let mut candidate = entry.value().clone();
    if mutator(&mut candidate) {
        *entry = candidate;
    }
    Some(entry.value().clone())
}

#[async_trait]
impl FlowStore for InMemoryDataStore {
    async fn create_flow(
        &self,
        flow: Flow,
        requests: Vec<FlowRequest>,
        results: Vec<FlowResult>,
    ) -> Result<bool> {
        let mut tables = self.flow_tables.lock();
        let key = (flow.client_id.clone(), flow.flow_id.clone());
        if tables.flows.contains_key(&key) {
            return Ok(false);
        }
        for request in requests {
            tables.requests.insert(
                (request.client_id.clone(), request.flow_id.clone(), request.request_id),
                request,
            );
        }
        tables.results.extend(results);
        tables.flows.insert(key, flow);
        Ok(true)
    }

    async fn write_flow(&self, flow: Flow) -> Result<()> {
        let mut tables = self.flow_tables.lock();
        tables
            .flows
            .insert((flow.client_id.clone(), flow.flow_id.clone()), flow);
        Ok(())
    }

    async fn read_flow(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<Option<Flow>> {
        let tables = self.flow_tables.lock();
        Ok(tables
            .flows
            .get(&(client_id.clone(), flow_id.clone()))
            .cloned())
    }

    async fn update_flow(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        mutator: Mutator<Flow>,
    ) -> Result<Option<Flow>> {
        let mut tables = self.flow_tables.lock();
        let Some(flow) = tables.flows.get_mut(&(client_id.clone(), flow_id.clone())) else {
            return Ok(None);
        };
        let mut candidate = flow.clone();
        if mutator(&mut candidate) {
            candidate.version = flow.version + 1;
            *flow = candidate;
        }
        Ok(Some(flow.clone()))
    }

    async fn commit_flow_transition(&self, commit: FlowCommit) -> Result<Flow> {
        let mut tables = self.flow_tables.lock();
        let FlowCommit {
            mut flow,
            expected_version,
            new_requests,
            updated_requests,
            consumed_requests,
            results,
            purge_outstanding,
        } = commit;
        let key = (flow.client_id.clone(), flow.flow_id.clone());

        let stored_version = tables
            .flows
            .get(&key)
            .map(|stored| stored.version)
            .ok_or_else(|| HuntsmanError::NotFound(format!("flow {}", flow.urn())))?;
        if stored_version != expected_version {
            debug!(
                flow = %flow.urn(),
                expected_version,
                stored_version,
                "Rejecting stale flow transition"
            );
            return Err(HuntsmanError::concurrent_modification(flow.urn()));
        }

        if purge_outstanding {
            tables.purge_flow_requests(&flow.client_id, &flow.flow_id);
        } else {
            for request_id in consumed_requests {
                tables.remove_request(&flow.client_id, &flow.flow_id, request_id);
            }
        }
        for request in updated_requests.into_iter().chain(new_requests) {
            tables.requests.insert(
                (request.client_id.clone(), request.flow_id.clone(), request.request_id),
                request,
            );
        }
        tables.results.extend(results);

        flow.version = expected_version + 1;
        tables.flows.insert(key, flow.clone());
        Ok(flow)
    }

    async fn list_flows_for_hunt(&self, hunt_id: &HuntId) -> Result<Vec<Flow>> {
        let tables = self.flow_tables.lock();
        let mut flows: Vec<Flow> = tables
            .flows
            .values()
            .filter(|flow| flow.parent_hunt_id.as_ref() == Some(hunt_id))
            .cloned()
            .collect();
        flows.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(flows)
    }

    async fn list_flows_past_deadline(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Flow>> {
        let tables = self.flow_tables.lock();
        Ok(tables
            .flows
            .values()
            .filter(|flow| flow.is_running() && flow.is_past_deadline(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn write_requests(&self, requests: Vec<FlowRequest>) -> Result<()> {
        let mut tables = self.flow_tables.lock();
        for request in requests {
            tables.requests.insert(
                (request.client_id.clone(), request.flow_id.clone(), request.request_id),
                request,
            );
        }
        Ok(())
    }

    async fn read_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<Option<FlowRequest>> {
        let tables = self.flow_tables.lock();
        Ok(tables
            .requests
            .get(&(client_id.clone(), flow_id.clone(), request_id))
            .cloned())
    }

    async fn read_requests_with_responses(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> Result<Vec<RequestWithResponses>> {
        let tables = self.flow_tables.lock();
        Ok(tables
            .requests
            .range(FlowTables::request_range(client_id, flow_id))
            .map(|(_, request)| RequestWithResponses {
                request: request.clone(),
                responses: tables.responses_for(client_id, flow_id, request.request_id),
            })
            .collect())
    }

    async fn read_responses_for_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<Vec<FlowResponse>> {
        let tables = self.flow_tables.lock();
        Ok(tables.responses_for(client_id, flow_id, request_id))
    }

    async fn delete_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<()> {
        self.flow_tables
            .lock()
            .remove_request(client_id, flow_id, request_id);
        Ok(())
    }

    async fn write_flow_responses(&self, responses: Vec<FlowResponse>) -> Result<usize> {
        let mut tables = self.flow_tables.lock();
        let mut written = 0;
        for response in responses {
            let key = (
                response.client_id.clone(),
                response.flow_id.clone(),
                response.request_id,
                response.response_id,
            );
            if let std::collections::btree_map::Entry::Vacant(slot) = tables.responses.entry(key) {
                slot.insert(response);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn read_flow_results(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> Result<Vec<FlowResult>> {
        let tables = self.flow_tables.lock();
        Ok(tables
            .results
            .iter()
            .filter(|r| &r.client_id == client_id && &r.flow_id == flow_id)
            .cloned()
            .collect())
    }

    async fn read_hunt_results(
        &self,
        hunt_id: &HuntId,
        offset: usize,
        count: usize,
    ) -> Result<Vec<FlowResult>> {
        let tables = self.flow_tables.lock();
        Ok(tables
            .results
            .iter()
            .filter(|r| r.hunt_id.as_ref() == Some(hunt_id))
            .skip(offset)
            .take(count)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageHandlerStore for InMemoryDataStore {
    async fn enqueue_message_handler_requests(
        &self,
        items: Vec<MessageHandlerRequest>,
    ) -> Result<()> {
        let mut queue = self.queue.lock();
        for item in items {
            match queue.get_mut(&item.key()) {
                Some(existing) => {
                    existing.payload = item.payload;
                    existing.generation += 1;
                }
                None => {
                    queue.insert(item.key(), item);
                }
            }
        }
        Ok(())
    }

    async fn lease_message_handler_requests(
        &self,
        handler_name: &str,
        owner: &str,
        lease_duration: Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageHandlerRequest>> {
        let mut queue = self.queue.lock();
        let mut candidates: Vec<&mut MessageHandlerRequest> = queue
            .values_mut()
            .filter(|item| item.handler_name == handler_name && !item.is_leased(now))
            .collect();
        candidates.sort_by_key(|item| item.created_at);

        let mut leased = Vec::new();
        for item in candidates.into_iter().take(limit) {
            if item.try_acquire(owner, now, lease_duration) {
                leased.push(item.clone());
            }
        }
        Ok(leased)
    }

    async fn delete_message_handler_requests(
        &self,
        items: &[MessageHandlerRequest],
    ) -> Result<usize> {
        let mut queue = self.queue.lock();
        let mut removed = 0;
        for item in items {
            let key = item.key();
            let same_generation = match queue.get(&key) {
                Some(stored) => stored.generation == item.generation,
                None => continue,
            };
            if same_generation {
                queue.remove(&key);
                removed += 1;
            } else if let (Some(owner), Some(stored)) =
                (item.leased_by.as_deref(), queue.get_mut(&key))
            {
                stored.release(owner);
            }
        }
        Ok(removed)
    }

    async fn release_message_handler_requests(
        &self,
        items: &[MessageHandlerRequest],
        owner: &str,
    ) -> Result<usize> {
        let mut queue = self.queue.lock();
        let mut released = 0;
        for item in items {
            if let Some(stored) = queue.get_mut(&item.key()) {
                if stored.release(owner) {
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn count_message_handler_requests(&self, handler_name: &str) -> Result<usize> {
        let queue = self.queue.lock();
        Ok(queue
            .values()
            .filter(|item| item.handler_name == handler_name)
            .count())
    }
}

#[async_trait]
impl ForemanRuleStore for InMemoryDataStore {
    async fn write_foreman_rule(&self, rule: ForemanRule) -> Result<()> {
        self.foreman_rules.insert(rule.rule_id.clone(), rule);
        Ok(())
    }

    async fn read_all_foreman_rules(&self) -> Result<Vec<ForemanRule>> {
        let mut rules: Vec<ForemanRule> = self
            .foreman_rules
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        rules.sort_by_key(|rule| rule.created_at);
        Ok(rules)
    }

    async fn remove_foreman_rule(&self, rule_id: &ForemanRuleId) -> Result<bool> {
        Ok(self.foreman_rules.remove(rule_id).is_some())
    }

    async fn remove_expired_foreman_rules(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<ForemanRuleId> = self
            .foreman_rules
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(expired
            .iter()
            .filter(|id| {
                self.foreman_rules
                    .remove_if(id, |_, rule| rule.is_expired(now))
                    .is_some()
            })
            .count())
    }
}

#[async_trait]
impl HuntStore for InMemoryDataStore {
    async fn write_hunt(&self, hunt: Hunt) -> Result<()> {
        self.hunts.insert(hunt.hunt_id.clone(), hunt);
        Ok(())
    }

    async fn read_hunt(&self, hunt_id: &HuntId) -> Result<Option<Hunt>> {
        Ok(self.hunts.get(hunt_id).map(|entry| entry.value().clone()))
    }

    async fn update_hunt(&self, hunt_id: &HuntId, mutator: Mutator<Hunt>) -> Result<Option<Hunt>> {
        Ok(apply_mutator(&self.hunts, hunt_id, mutator))
    }

    async fn list_hunts(&self) -> Result<Vec<Hunt>> {
        let mut hunts: Vec<Hunt> = self.hunts.iter().map(|entry| entry.value().clone()).collect();
        hunts.sort_by_key(|hunt| hunt.created_at);
        Ok(hunts)
    }
}

#[async_trait]
impl CronJobStore for InMemoryDataStore {
    async fn write_cron_job(&self, job: CronJob) -> Result<()> {
        self.cron_jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn read_cron_job(&self, job_id: &CronJobId) -> Result<Option<CronJob>> {
        Ok(self.cron_jobs.get(job_id).map(|entry| entry.value().clone()))
    }

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        let mut jobs: Vec<CronJob> = self.cron_jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(jobs)
    }

    async fn delete_cron_job(&self, job_id: &CronJobId) -> Result<bool> {
        self.cron_runs.lock().remove(job_id);
        Ok(self.cron_jobs.remove(job_id).is_some())
    }

    async fn update_cron_job(
        &self,
        job_id: &CronJobId,
        mutator: Mutator<CronJob>,
    ) -> Result<Option<CronJob>> {
        Ok(apply_mutator(&self.cron_jobs, job_id, mutator))
    }

    async fn write_cron_job_run(&self, run: CronJobRun) -> Result<()> {
        let mut runs = self.cron_runs.lock();
        let history = runs.entry(run.job_id.clone()).or_default();
        match history.iter_mut().find(|existing| existing.run_id == run.run_id) {
            Some(existing) => *existing = run,
            None => history.push(run),
        }
        Ok(())
    }

    async fn read_cron_job_run(
        &self,
        job_id: &CronJobId,
        run_id: &CronRunId,
    ) -> Result<Option<CronJobRun>> {
        let runs = self.cron_runs.lock();
        Ok(runs
            .get(job_id)
            .and_then(|history| history.iter().find(|run| &run.run_id == run_id))
            .cloned())
    }

    async fn list_cron_job_runs(&self, job_id: &CronJobId) -> Result<Vec<CronJobRun>> {
        let runs = self.cron_runs.lock();
        let mut history = runs.get(job_id).cloned().unwrap_or_default();
        history.sort_by_key(|run| run.started_at);
        Ok(history)
    }

    async fn trim_cron_job_runs(&self, job_id: &CronJobId, keep: usize) -> Result<usize> {
        let mut runs = self.cron_runs.lock();
        let Some(history) = runs.get_mut(job_id) else {
            return Ok(0);
        };
        history.sort_by_key(|run| run.started_at);
        let finished = history.iter().filter(|run| run.status.is_terminal()).count();
        let mut excess = finished.saturating_sub(keep);
        let before = history.len();
        history.retain(|run| {
            if excess > 0 && run.status.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
        Ok(before - history.len())
    }
}

#[async_trait]
impl ClientStore for InMemoryDataStore {
    async fn write_client_info(&self, info: ClientInfo) -> Result<()> {
        self.clients.insert(info.client_id.clone(), info);
        Ok(())
    }

    async fn read_client_info(&self, client_id: &ClientId) -> Result<Option<ClientInfo>> {
        Ok(self.clients.get(client_id).map(|entry| entry.value().clone()))
    }

    async fn claim_client(
        &self,
        scope: &str,
        client_id: &ClientId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.claims.entry(ClaimKey::new(scope, client_id.as_str())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(true)
            }
        }
    }

    async fn is_client_claimed(&self, scope: &str, client_id: &ClientId) -> Result<bool> {
        Ok(self
            .claims
            .contains_key(&ClaimKey::new(scope, client_id.as_str())))
    }
}
