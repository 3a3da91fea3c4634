//! Persisted flow records and their results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{ClientId, FlowId, HuntId, RequestId};
use super::request::{FlowRequest, Payload};
use crate::state_machine::FlowStatus;

/// Name of the pseudo-state a flow is in before `start` has run
pub const START_STATE: &str = "Start";

/// Termination requested from outside the owning worker (operator stop,
/// protocol violation seen at ingest). Honoured at the next transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTermination {
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

/// One multi-step operation against one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub flow_type: String,
    pub args: Value,
    /// State-local variables owned by the flow handler
    #[serde(default)]
    pub state: Map<String, Value>,
    /// Last state a handler ran in
    pub current_state: String,
    /// Id the next issued request will get
    pub next_outbound_id: RequestId,
    /// Completed requests are delivered strictly in this order
    pub next_request_to_process: RequestId,
    pub status: FlowStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub parent_hunt_id: Option<HuntId>,
    pub creator: String,
    #[serde(default)]
    pub pending_termination: Option<PendingTermination>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub num_replies_sent: u64,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Compare-and-swap guard bumped on every committed transition
    pub version: u64,
}

impl Flow {
    pub fn new(
        client_id: ClientId,
        flow_id: FlowId,
        flow_type: impl Into<String>,
        args: Value,
        creator: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id,
            flow_id,
            flow_type: flow_type.into(),
            args,
            state: Map::new(),
            current_state: START_STATE.to_string(),
            next_outbound_id: 1,
            next_request_to_process: 1,
            status: FlowStatus::Running,
            error_message: None,
            parent_hunt_id: None,
            creator: creator.into(),
            pending_termination: None,
            deadline: None,
            num_replies_sent: 0,
            created_at: now,
            last_update: now,
            version: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == FlowStatus::Running
    }

    /// Whether any issued request has not been handed to its `next_state` yet
    pub fn has_outstanding_requests(&self) -> bool {
        self.next_request_to_process < self.next_outbound_id
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Human-readable identity used in logs and error messages
    pub fn urn(&self) -> String {
        format!("{}/flows/{}", self.client_id, self.flow_id)
    }
}

/// Operator-facing status view of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatusReport {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub flow_type: String,
    pub status: FlowStatus,
    pub current_state: String,
    pub error_message: Option<String>,
    pub outstanding_requests: u64,
    pub num_replies_sent: u64,
    pub last_update: DateTime<Utc>,
}

impl From<&Flow> for FlowStatusReport {
    fn from(flow: &Flow) -> Self {
        Self {
            client_id: flow.client_id.clone(),
            flow_id: flow.flow_id.clone(),
            flow_type: flow.flow_type.clone(),
            status: flow.status,
            current_state: flow.current_state.clone(),
            error_message: flow.error_message.clone(),
            outstanding_requests: flow
                .next_outbound_id
                .saturating_sub(flow.next_request_to_process),
            num_replies_sent: flow.num_replies_sent,
            last_update: flow.last_update,
        }
    }
}

/// A result emitted by a flow via `send_reply`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    #[serde(default)]
    pub hunt_id: Option<HuntId>,
    #[serde(default)]
    pub tag: Option<String>,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

/// Everything one handler invocation produced, committed atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowCommit {
    /// Flow as it should be persisted; its `version` is already bumped
    pub flow: Flow,
    /// Version the worker read; the commit fails if the store moved on
    pub expected_version: u64,
    pub new_requests: Vec<FlowRequest>,
    /// Requests whose `next_response_id` advanced
    pub updated_requests: Vec<FlowRequest>,
    /// Requests delivered to their `next_state`, deleted with their responses
    pub consumed_requests: Vec<RequestId>,
    pub results: Vec<FlowResult>,
    /// Drop every remaining request and response (terminal flows)
    pub purge_outstanding: bool,
}
