//! # Flow Runner
//!
//! Starts flows and advances them as responses arrive. One invocation of
//! [`FlowRunner::process_flow`] reads the flow with its outstanding
//! requests, runs every handler that has work, and persists the result in a
//! single version-guarded commit. Requests are handed to the transport only
//! after that commit succeeds.
//!
//! ## Processing Order
//!
//! 1. Callback requests receive newly arrived messages (contiguous from
//!    `next_response_id`, stopping at the first gap).
//! 2. Complete requests are handed to their `next_state` strictly in request
//!    id order starting at `next_request_to_process`.
//! 3. A flow with nothing outstanding afterwards completes.
//!
//! A pending stop, a passed deadline or a stopped parent hunt ends the flow
//! before any handler runs, so none of its unprocessed responses produce
//! results.
//!
//! Losing the commit race surfaces as a retryable
//! [`ConcurrentModification`](crate::error::HuntsmanError::ConcurrentModification);
//! the queue item is released and the whole pass is redone against the
//! fresh flow.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::correlator::{correlate, correlate_partial};
use super::hunt_coordinator::HuntOutcomeRecorder;
use super::task_queue::{MessageHandler, TaskQueue};
use super::transport::AgentTransport;
use crate::constants::{defaults, events, handlers};
use crate::database::{Captured, DataStore};
use crate::error::{HuntsmanError, Result};
use crate::events::EventPublisher;
use crate::flows::{ContextOutput, FlowContext, FlowError, FlowHandler, FlowRegistry, HandlerResult};
use crate::logging::{log_error, log_flow_operation};
use crate::models::message_handler_request::{flow_processing_key, parse_flow_processing_key};
use crate::models::{
    ClientId, Flow, FlowCommit, FlowId, FlowRequest, FlowResult, FlowStatusReport, HuntId,
    MessageHandlerRequest, PendingTermination, RequestId, RequestWithResponses,
};
use crate::state_machine::{flow_state_machine, FlowEvent, FlowStatus, HuntState};

/// Creation options for [`FlowRunner::start_flow`]
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStartOptions {
    /// Fixed id; a flow that already exists under it is returned unchanged
    pub flow_id: Option<FlowId>,
    pub parent_hunt_id: Option<HuntId>,
    pub creator: String,
    /// Defaults to now plus the runner's default lifetime
    pub deadline: Option<DateTime<Utc>>,
}

impl FlowStartOptions {
    pub fn new(creator: impl Into<String>) -> Self {
        Self {
            flow_id: None,
            parent_hunt_id: None,
            creator: creator.into(),
            deadline: None,
        }
    }

    pub fn with_flow_id(mut self, flow_id: FlowId) -> Self {
        self.flow_id = Some(flow_id);
        self
    }

    pub fn with_parent_hunt(mut self, hunt_id: HuntId) -> Self {
        self.parent_hunt_id = Some(hunt_id);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// What one processing pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The flow does not exist (deleted, or a stale queue item)
    NotFound,
    AlreadyTerminal(FlowStatus),
    /// Nothing was ready; no commit was made
    Idle,
    /// A commit was made after `handled` handler invocations
    Progressed { handled: usize, status: FlowStatus },
}

/// Handler output after termination rules have been applied
struct Settled {
    flow: Flow,
    new_requests: Vec<FlowRequest>,
    results: Vec<FlowResult>,
    terminated: bool,
}

pub struct FlowRunner {
    store: Arc<dyn DataStore>,
    registry: Arc<FlowRegistry>,
    transport: Arc<dyn AgentTransport>,
    queue: Arc<TaskQueue>,
    events: EventPublisher,
    hunt_outcomes: HuntOutcomeRecorder,
    default_lifetime: Duration,
}

impl FlowRunner {
    pub fn new(
        store: Arc<dyn DataStore>,
        registry: Arc<FlowRegistry>,
        transport: Arc<dyn AgentTransport>,
        queue: Arc<TaskQueue>,
        events: EventPublisher,
    ) -> Self {
        let hunt_outcomes = HuntOutcomeRecorder::new(store.clone(), events.clone());
        Self {
            store,
            registry,
            transport,
            queue,
            events,
            hunt_outcomes,
            default_lifetime: Duration::seconds(defaults::FLOW_LIFETIME_SECS as i64),
        }
    }

    pub fn with_default_lifetime(mut self, lifetime: Duration) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// Check that `flow_type` exists and accepts `args`
    pub fn validate_flow(&self, flow_type: &str, args: &Value) -> Result<()> {
        let handler = self.registry.get(flow_type)?;
        handler
            .validate_args(args)
            .map_err(|e| HuntsmanError::ValidationError(format!("{flow_type}: {e}")))
    }

    /// Create a flow and run its start state.
    ///
    /// Idempotent under a fixed `flow_id`: if the flow already exists it is
    /// returned as stored and nothing is sent.
    #[instrument(skip(self, args, options), fields(client_id = %client_id, flow_type = %flow_type))]
    pub async fn start_flow(
        &self,
        client_id: ClientId,
        flow_type: &str,
        args: Value,
        options: FlowStartOptions,
    ) -> Result<Flow> {
        self.validate_flow(flow_type, &args)?;
        let handler = self.registry.get(flow_type)?;
        let flow_id = options.flow_id.unwrap_or_else(FlowId::random);

        if let Some(existing) = self.store.read_flow(&client_id, &flow_id).await? {
            debug!(flow = %existing.urn(), "Flow already exists");
            return Ok(existing);
        }

        let now = Utc::now();
        let mut flow = Flow::new(client_id.clone(), flow_id.clone(), flow_type, args, options.creator, now);
        flow.parent_hunt_id = options.parent_hunt_id;
        flow.deadline = Some(options.deadline.unwrap_or(now + self.default_lifetime));

        let mut ctx = FlowContext::new(flow, now);
        let outcome = guarded(|| handler.start(&mut ctx));
        let settled = settle(ctx.into_output(), outcome.err(), now)?;

        let created = self
            .store
            .create_flow(
                settled.flow.clone(),
                settled.new_requests.clone(),
                settled.results,
            )
            .await?;
        if !created {
            debug!(flow_id = %flow_id, "Lost flow creation race; returning stored flow");
            return self
                .store
                .read_flow(&client_id, &flow_id)
                .await?
                .ok_or_else(|| HuntsmanError::NotFound(format!("flow {client_id}/{flow_id}")));
        }

        let flow = settled.flow;
        self.events.publish(
            events::FLOW_STARTED,
            json!({
                "client_id": flow.client_id,
                "flow_id": flow.flow_id,
                "flow_type": flow.flow_type,
                "parent_hunt_id": flow.parent_hunt_id,
            }),
        );
        log_flow_operation(
            "start",
            flow.client_id.as_str(),
            flow.flow_id.as_str(),
            Some(&flow.flow_type),
            &flow.status.to_string(),
            None,
        );
        self.after_commit(&flow, &settled.new_requests, settled.terminated)
            .await;
        Ok(flow)
    }

    /// Advance a flow with whatever responses are ready
    #[instrument(skip(self), fields(client_id = %client_id, flow_id = %flow_id))]
    pub async fn process_flow(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<ProcessOutcome> {
        let Some(flow) = self.store.read_flow(client_id, flow_id).await? else {
            debug!("Processing requested for unknown flow");
            return Ok(ProcessOutcome::NotFound);
        };
        if !flow.is_running() {
            return Ok(ProcessOutcome::AlreadyTerminal(flow.status));
        }

        let now = Utc::now();
        if let Some(pending) = &flow.pending_termination {
            let event = FlowEvent::Fail(pending.reason.clone());
            return self.terminate_at_boundary(flow, event, now).await;
        }
        if flow.is_past_deadline(now) {
            let event = FlowEvent::Fail("flow lifetime exceeded".to_string());
            return self.terminate_at_boundary(flow, event, now).await;
        }
        if self.parent_hunt_stopped(&flow).await? {
            let event = FlowEvent::Fail("parent hunt stopped".to_string());
            return self.terminate_at_boundary(flow, event, now).await;
        }
        let handler = match self.registry.get(&flow.flow_type) {
            Ok(handler) => handler,
            Err(e) => {
                let event = FlowEvent::Crash(e.to_string());
                return self.terminate_at_boundary(flow, event, now).await;
            }
        };

        let expected_version = flow.version;
        let pending = self.store.read_requests_with_responses(client_id, flow_id).await?;
        let mut ctx = FlowContext::new(flow, now);
        let (handled, updated, consumed, failure) = run_handlers(handler.as_ref(), &mut ctx, &pending);

        if handled == 0 {
            return Ok(ProcessOutcome::Idle);
        }

        let protocol_violation = match &failure {
            Some(FlowError::Protocol(message)) => Some(message.clone()),
            _ => None,
        };
        let settled = settle(ctx.into_output(), failure, now)?;
        let updated_requests = if settled.terminated {
            Vec::new()
        } else {
            updated
                .into_iter()
                .filter(|request| !consumed.contains(&request.request_id))
                .collect()
        };

        let commit = FlowCommit {
            flow: settled.flow,
            expected_version,
            new_requests: settled.new_requests.clone(),
            updated_requests,
            consumed_requests: consumed,
            results: settled.results,
            purge_outstanding: settled.terminated,
        };
        let flow = self.store.commit_flow_transition(commit).await?;

        if let Some(message) = protocol_violation {
            warn!(flow = %flow.urn(), error = %message, "Flow protocol violation");
            self.events.publish(
                events::FLOW_PROTOCOL_VIOLATION,
                json!({
                    "client_id": flow.client_id,
                    "flow_id": flow.flow_id,
                    "error": message,
                }),
            );
        }
        self.after_commit(&flow, &settled.new_requests, settled.terminated)
            .await;

        Ok(ProcessOutcome::Progressed {
            handled,
            status: flow.status,
        })
    }

    /// Ask a running flow to stop at its next transition. Returns `false` if
    /// the flow already finished or a stop is already pending.
    pub async fn request_flow_stop(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        reason: impl Into<String>,
    ) -> Result<bool> {
        let reason = reason.into();
        let now = Utc::now();
        let requested = Captured::new();
        let flag = requested.clone();
        let stop_reason = reason.clone();
        let flow = self
            .store
            .update_flow(
                client_id,
                flow_id,
                Box::new(move |flow: &mut Flow| {
                    let apply = flow.is_running() && flow.pending_termination.is_none();
                    if apply {
                        flow.pending_termination = Some(PendingTermination {
                            reason: stop_reason,
                            requested_at: now,
                        });
                    }
                    flag.set(apply);
                    apply
                }),
            )
            .await?
            .ok_or_else(|| HuntsmanError::NotFound(format!("flow {client_id}/{flow_id}")))?;

        let requested = requested.take().unwrap_or(false);
        if requested {
            self.enqueue_processing(client_id, flow_id).await?;
            log_flow_operation(
                "stop_requested",
                client_id.as_str(),
                flow_id.as_str(),
                Some(&flow.flow_type),
                &flow.status.to_string(),
                Some(&reason),
            );
        }
        Ok(requested)
    }

    pub async fn get_flow(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<Flow> {
        self.store
            .read_flow(client_id, flow_id)
            .await?
            .ok_or_else(|| HuntsmanError::NotFound(format!("flow {client_id}/{flow_id}")))
    }

    pub async fn get_flow_status(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<FlowStatusReport> {
        self.get_flow(client_id, flow_id)
            .await
            .map(|flow| FlowStatusReport::from(&flow))
    }

    pub async fn list_flow_results(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<Vec<FlowResult>> {
        self.store.read_flow_results(client_id, flow_id).await
    }

    /// Schedule a processing pass for the flow
    pub async fn enqueue_processing(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<()> {
        self.queue
            .enqueue_one(
                handlers::FLOW_PROCESSING,
                flow_processing_key(client_id, flow_id),
                Value::Null,
            )
            .await
    }

    /// Queue every running flow past its deadline so the next pass ends it
    pub async fn enqueue_overdue_flows(&self, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let overdue = self.store.list_flows_past_deadline(now, limit).await?;
        let items: Vec<MessageHandlerRequest> = overdue
            .iter()
            .map(|flow| {
                MessageHandlerRequest::new(
                    handlers::FLOW_PROCESSING,
                    flow_processing_key(&flow.client_id, &flow.flow_id),
                    Value::Null,
                    now,
                )
            })
            .collect();
        let count = items.len();
        self.queue.enqueue(items).await?;
        if count > 0 {
            debug!(count, "Queued flows past their deadline");
        }
        Ok(count)
    }

    async fn parent_hunt_stopped(&self, flow: &Flow) -> Result<bool> {
        let Some(hunt_id) = &flow.parent_hunt_id else {
            return Ok(false);
        };
        Ok(self
            .store
            .read_hunt(hunt_id)
            .await?
            .is_some_and(|hunt| hunt.state == HuntState::Stopped))
    }

    async fn terminate_at_boundary(
        &self,
        mut flow: Flow,
        event: FlowEvent,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        let expected_version = flow.version;
        apply_termination(&mut flow, &event)?;
        flow.last_update = now;
        let commit = FlowCommit {
            flow,
            expected_version,
            new_requests: Vec::new(),
            updated_requests: Vec::new(),
            consumed_requests: Vec::new(),
            results: Vec::new(),
            purge_outstanding: true,
        };
        let flow = self.store.commit_flow_transition(commit).await?;
        self.on_terminated(&flow).await;
        Ok(ProcessOutcome::Progressed {
            handled: 0,
            status: flow.status,
        })
    }

    async fn after_commit(&self, flow: &Flow, requests: &[FlowRequest], terminated: bool) {
        for request in requests {
            if let Err(e) = self.transport.send_request(&flow.client_id, request).await {
                warn!(
                    flow = %flow.urn(),
                    request_id = request.request_id,
                    error = %e,
                    "Failed to hand request to transport"
                );
            }
        }
        if terminated {
            self.on_terminated(flow).await;
        }
    }

    async fn on_terminated(&self, flow: &Flow) {
        let event = match flow.status {
            FlowStatus::Succeeded => events::FLOW_COMPLETED,
            FlowStatus::Crashed => events::FLOW_CRASHED,
            _ => events::FLOW_FAILED,
        };
        self.events.publish(
            event,
            json!({
                "client_id": flow.client_id,
                "flow_id": flow.flow_id,
                "flow_type": flow.flow_type,
                "status": flow.status,
                "error_message": flow.error_message,
                "parent_hunt_id": flow.parent_hunt_id,
            }),
        );
        log_flow_operation(
            "terminate",
            flow.client_id.as_str(),
            flow.flow_id.as_str(),
            Some(&flow.flow_type),
            &flow.status.to_string(),
            flow.error_message.as_deref(),
        );
        if let Err(e) = self.hunt_outcomes.record(flow, Utc::now()).await {
            log_error(
                "flow_runner",
                "record_hunt_outcome",
                &e.to_string(),
                Some(&flow.urn()),
            );
        }
    }
}

/// Run a handler, turning a panic into a crash of the flow
fn guarded(handler: impl FnOnce() -> HandlerResult) -> HandlerResult {
    catch_unwind(AssertUnwindSafe(handler)).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(FlowError::internal(format!("flow handler panicked: {message}")))
    })
}

/// Deliver callbacks and ordered completions; returns
/// `(handled, updated requests, consumed request ids, failure)`
fn run_handlers(
    handler: &dyn FlowHandler,
    ctx: &mut FlowContext,
    pending: &[RequestWithResponses],
) -> (usize, Vec<FlowRequest>, Vec<RequestId>, Option<FlowError>) {
    let mut handled = 0;
    let mut updated = Vec::new();
    let mut consumed = Vec::new();
    let mut failure = None;

    for entry in pending {
        if failure.is_some() || ctx.is_terminating() {
            break;
        }
        let Some(callback) = entry.request.callback_state.as_deref() else {
            continue;
        };
        if entry.request.request_id < ctx.flow().next_request_to_process {
            continue;
        }
        let fresh = entry.undelivered_messages();
        let Some(last) = fresh.last().map(|row| row.response_id) else {
            continue;
        };
        let outcome = correlate_partial(entry.request.request_id, &fresh)
            .map_err(FlowError::from)
            .and_then(|batch| guarded(|| handler.handle_responses(callback, ctx, batch)));
        handled += 1;

        let mut request = entry.request.clone();
        request.next_response_id = last + 1;
        updated.push(request);
        if let Err(e) = outcome {
            failure = Some(e);
        }
    }

    let mut by_id: BTreeMap<RequestId, &RequestWithResponses> = pending
        .iter()
        .map(|entry| (entry.request.request_id, entry))
        .collect();
    while failure.is_none() && !ctx.is_terminating() {
        let next = ctx.flow().next_request_to_process;
        let Some(entry) = by_id.remove(&next) else {
            break;
        };
        if !entry.is_complete() {
            break;
        }
        let state = entry.request.next_state.clone();
        let outcome = correlate(next, &entry.responses)
            .map_err(FlowError::from)
            .and_then(|batch| guarded(|| handler.handle_responses(&state, ctx, batch)));
        handled += 1;
        consumed.push(next);

        let flow = ctx.flow_mut();
        flow.next_request_to_process = next + 1;
        flow.current_state = state;
        if let Err(e) = outcome {
            failure = Some(e);
        }
    }

    (handled, updated, consumed, failure)
}

/// Apply explicit termination, handler failure or auto-completion
fn settle(output: ContextOutput, failure: Option<FlowError>, now: DateTime<Utc>) -> Result<Settled> {
    let ContextOutput {
        mut flow,
        mut new_requests,
        results,
        termination,
    } = output;

    let event = match failure {
        Some(err) => Some(err.into_event()),
        None => termination,
    }
    .or_else(|| (!flow.has_outstanding_requests()).then_some(FlowEvent::Complete));

    let terminated = event.is_some();
    if let Some(event) = &event {
        apply_termination(&mut flow, event)?;
        new_requests.clear();
    }
    flow.last_update = now;

    Ok(Settled {
        flow,
        new_requests,
        results,
        terminated,
    })
}

/// Move the flow to its terminal status; unanswered requests are discarded
fn apply_termination(flow: &mut Flow, event: &FlowEvent) -> Result<()> {
    flow.status = flow_state_machine::determine_target_state(flow.status, event)?;
    flow.error_message = event.error_message().map(str::to_string);
    flow.pending_termination = None;
    flow.next_request_to_process = flow.next_outbound_id;
    Ok(())
}

/// Queue handler that runs [`FlowRunner::process_flow`] for `client/flow` keys
pub struct FlowProcessingHandler {
    runner: Arc<FlowRunner>,
}

impl FlowProcessingHandler {
    pub fn new(runner: Arc<FlowRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl MessageHandler for FlowProcessingHandler {
    fn handler_name(&self) -> &'static str {
        handlers::FLOW_PROCESSING
    }

    async fn process(&self, item: &MessageHandlerRequest) -> Result<()> {
        let Some((client_id, flow_id)) = parse_flow_processing_key(&item.request_id) else {
            warn!(request_id = %item.request_id, "Dropping malformed flow processing key");
            return Ok(());
        };
        let outcome = self.runner.process_flow(&client_id, &flow_id).await?;
        debug!(client_id = %client_id, flow_id = %flow_id, ?outcome, "Flow processed");
        Ok(())
    }
}
