//! # Flows
//!
//! A flow is a persisted, resumable state machine driving one multi-step
//! operation against one agent. Flow logic never performs I/O: a state
//! handler reads and writes the flow's state bag, issues requests through
//! [`FlowContext::call_client`] and emits results through
//! [`FlowContext::send_reply`]. The [`FlowRunner`](crate::orchestration::FlowRunner)
//! persists everything a handler produced in one atomic commit.
//!
//! ## Writing a flow
//!
//! Flow kinds implement [`FlowDefinition`] with a closed [`FlowState`] enum.
//! The blanket [`FlowHandler`] impl turns a definition into the
//! string-dispatched handler the [`FlowRegistry`] stores, so every state a
//! request can name is known when the registry is built.
//!
//! ```rust
//! use huntsman_core::flows::{FlowContext, FlowDefinition, FlowState, HandlerResult};
//! use huntsman_core::models::Payload;
//! use huntsman_core::orchestration::correlator::Responses;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! enum PingState {
//!     Pong,
//! }
//!
//! impl FlowState for PingState {
//!     const ALL: &'static [Self] = &[PingState::Pong];
//!
//!     fn name(&self) -> &'static str {
//!         "Pong"
//!     }
//! }
//!
//! struct Ping;
//!
//! impl FlowDefinition for Ping {
//!     type State = PingState;
//!     const FLOW_TYPE: &'static str = "Ping";
//!
//!     fn start(&self, ctx: &mut FlowContext) -> HandlerResult {
//!         ctx.call_client("Echo", Payload::empty("EchoRequest"), PingState::Pong)?;
//!         Ok(())
//!     }
//!
//!     fn handle(&self, _: PingState, ctx: &mut FlowContext, responses: Responses) -> HandlerResult {
//!         for payload in responses {
//!             ctx.send_reply(payload);
//!         }
//!         Ok(())
//!     }
//! }
//! ```

pub mod interrogate;
pub mod list_processes;
pub mod netstat;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::HuntsmanError;
use crate::models::{
    ClientId, Flow, FlowId, FlowRequest, FlowResult, HuntId, Payload, RequestId,
};
use crate::orchestration::correlator::{CorrelationError, Responses};
use crate::state_machine::{FlowEvent, FlowStatus};

pub use interrogate::Interrogate;
pub use list_processes::ListProcesses;
pub use netstat::Netstat;
pub use registry::{FlowRegistry, FlowRegistryBuilder};

/// Terminal outcome of a state handler other than normal return.
///
/// `Failed` and `Protocol` end the flow with `ERROR`; `Internal` marks a bug
/// in flow logic and ends it with `CRASHED`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("{0}")]
    Failed(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn terminal_status(&self) -> FlowStatus {
        match self {
            Self::Failed(_) | Self::Protocol(_) => FlowStatus::Error,
            Self::Internal(_) => FlowStatus::Crashed,
        }
    }

    pub fn into_event(self) -> FlowEvent {
        match self.terminal_status() {
            FlowStatus::Crashed => FlowEvent::Crash(self.to_string()),
            _ => FlowEvent::Fail(self.to_string()),
        }
    }
}

impl From<CorrelationError> for FlowError {
    fn from(err: CorrelationError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<HuntsmanError> for FlowError {
    fn from(err: HuntsmanError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}

pub type HandlerResult = std::result::Result<(), FlowError>;

/// Closed set of states of one flow kind
pub trait FlowState: Copy + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.name() == name)
    }
}

/// Mutable view of a flow handed to a state handler.
///
/// Everything recorded here is persisted atomically after the handler
/// returns, or discarded if the commit loses a race.
#[derive(Debug)]
pub struct FlowContext {
    flow: Flow,
    new_requests: Vec<FlowRequest>,
    results: Vec<FlowResult>,
    termination: Option<FlowEvent>,
    now: DateTime<Utc>,
}

/// What a handler invocation produced
#[derive(Debug)]
pub(crate) struct ContextOutput {
    pub flow: Flow,
    pub new_requests: Vec<FlowRequest>,
    pub results: Vec<FlowResult>,
    pub termination: Option<FlowEvent>,
}

impl FlowContext {
    pub fn new(flow: Flow, now: DateTime<Utc>) -> Self {
        Self {
            flow,
            new_requests: Vec::new(),
            results: Vec::new(),
            termination: None,
            now,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.flow.client_id
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow.flow_id
    }

    pub fn flow_type(&self) -> &str {
        &self.flow.flow_type
    }

    pub fn parent_hunt_id(&self) -> Option<&HuntId> {
        self.flow.parent_hunt_id.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn args(&self) -> &Value {
        &self.flow.args
    }

    /// Flow arguments decoded into the flow's argument type
    pub fn args_as<T: DeserializeOwned>(&self) -> std::result::Result<T, FlowError> {
        serde_json::from_value(self.flow.args.clone())
            .map_err(|e| FlowError::failed(format!("invalid flow arguments: {e}")))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<Option<T>, FlowError> {
        self.flow
            .state
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(FlowError::from)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> HandlerResult {
        self.flow
            .state
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.flow.state.remove(key)
    }

    /// Issue a request; `next_state` runs once its status arrives
    pub fn call_client<S: FlowState>(
        &mut self,
        action: impl Into<String>,
        args: Payload,
        next_state: S,
    ) -> std::result::Result<RequestId, FlowError> {
        self.push_request(action.into(), args, next_state.name(), None)
    }

    /// Like [`call_client`](Self::call_client), additionally delivering
    /// payloads to `callback_state` as they arrive
    pub fn call_client_with_callback<S: FlowState>(
        &mut self,
        action: impl Into<String>,
        args: Payload,
        next_state: S,
        callback_state: S,
    ) -> std::result::Result<RequestId, FlowError> {
        self.push_request(
            action.into(),
            args,
            next_state.name(),
            Some(callback_state.name()),
        )
    }

    fn push_request(
        &mut self,
        action: String,
        args: Payload,
        next_state: &str,
        callback_state: Option<&str>,
    ) -> std::result::Result<RequestId, FlowError> {
        if self.termination.is_some() {
            return Err(FlowError::internal(format!(
                "{action} requested after the flow was terminated"
            )));
        }
        let request_id = self.flow.next_outbound_id;
        self.flow.next_outbound_id += 1;
        self.new_requests.push(FlowRequest {
            client_id: self.flow.client_id.clone(),
            flow_id: self.flow.flow_id.clone(),
            request_id,
            action,
            args,
            next_state: next_state.to_string(),
            callback_state: callback_state.map(str::to_string),
            next_response_id: 1,
            created_at: self.now,
        });
        Ok(request_id)
    }

    /// Emit a result of this flow
    pub fn send_reply(&mut self, payload: Payload) {
        self.send_tagged_reply(None, payload);
    }

    pub fn send_tagged_reply(&mut self, tag: Option<String>, payload: Payload) {
        self.flow.num_replies_sent += 1;
        self.results.push(FlowResult {
            client_id: self.flow.client_id.clone(),
            flow_id: self.flow.flow_id.clone(),
            hunt_id: self.flow.parent_hunt_id.clone(),
            tag,
            payload,
            timestamp: self.now,
        });
    }

    /// End the flow after this handler; requests not yet answered are
    /// discarded
    pub fn terminate(&mut self, event: FlowEvent) {
        self.termination = Some(event);
    }

    /// Shorthand for terminating successfully
    pub fn complete(&mut self) {
        self.terminate(FlowEvent::Complete);
    }

    pub fn is_terminating(&self) -> bool {
        self.termination.is_some()
    }

    pub(crate) fn flow(&self) -> &Flow {
        &self.flow
    }

    pub(crate) fn flow_mut(&mut self) -> &mut Flow {
        &mut self.flow
    }

    pub(crate) fn into_output(self) -> ContextOutput {
        ContextOutput {
            flow: self.flow,
            new_requests: self.new_requests,
            results: self.results,
            termination: self.termination,
        }
    }
}

/// Typed definition of a flow kind
pub trait FlowDefinition: Send + Sync + 'static {
    type State: FlowState;
    const FLOW_TYPE: &'static str;

    /// Reject arguments before a flow is created
    fn validate_args(&self, args: &Value) -> HandlerResult {
        let _ = args;
        Ok(())
    }

    fn start(&self, ctx: &mut FlowContext) -> HandlerResult;

    fn handle(&self, state: Self::State, ctx: &mut FlowContext, responses: Responses)
        -> HandlerResult;
}

/// Object-safe, string-dispatched flow handler stored in the registry
pub trait FlowHandler: Send + Sync {
    fn flow_type(&self) -> &'static str;

    /// Names of every state a request may resume
    fn state_names(&self) -> Vec<&'static str>;

    fn validate_args(&self, args: &Value) -> HandlerResult;

    fn start(&self, ctx: &mut FlowContext) -> HandlerResult;

    fn handle_responses(
        &self,
        state: &str,
        ctx: &mut FlowContext,
        responses: Responses,
    ) -> HandlerResult;
}

impl<D: FlowDefinition> FlowHandler for D {
    fn flow_type(&self) -> &'static str {
        D::FLOW_TYPE
    }

    fn state_names(&self) -> Vec<&'static str> {
        D::State::ALL.iter().map(FlowState::name).collect()
    }

    fn validate_args(&self, args: &Value) -> HandlerResult {
        FlowDefinition::validate_args(self, args)
    }

    fn start(&self, ctx: &mut FlowContext) -> HandlerResult {
        FlowDefinition::start(self, ctx)
    }

    fn handle_responses(
        &self,
        state: &str,
        ctx: &mut FlowContext,
        responses: Responses,
    ) -> HandlerResult {
        let state = D::State::from_name(state).ok_or_else(|| {
            FlowError::internal(format!("{} has no state {state:?}", D::FLOW_TYPE))
        })?;
        self.handle(state, ctx, responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestState {
        Collect,
        Done,
    }

    impl FlowState for TestState {
        const ALL: &'static [Self] = &[TestState::Collect, TestState::Done];

        fn name(&self) -> &'static str {
            match self {
                TestState::Collect => "Collect",
                TestState::Done => "Done",
            }
        }
    }

    fn context() -> FlowContext {
        let mut flow = Flow::new(
            ClientId::new("C.1"),
            FlowId::new("F1"),
            "Test",
            json!({"limit": 3}),
            "test",
            Utc::now(),
        );
        flow.parent_hunt_id = Some(HuntId::new("H1"));
        FlowContext::new(flow, Utc::now())
    }

    #[test]
    fn test_requests_get_monotonic_ids() {
        let mut ctx = context();
        let first = ctx
            .call_client("A", Payload::empty("Args"), TestState::Collect)
            .unwrap();
        let second = ctx
            .call_client_with_callback("B", Payload::empty("Args"), TestState::Done, TestState::Collect)
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let output = ctx.into_output();
        assert_eq!(output.flow.next_outbound_id, 3);
        assert_eq!(output.new_requests[1].callback_state.as_deref(), Some("Collect"));
        assert_eq!(output.new_requests[1].next_state, "Done");
    }

    #[test]
    fn test_no_requests_after_terminate() {
        let mut ctx = context();
        ctx.complete();
        let err = ctx
            .call_client("A", Payload::empty("Args"), TestState::Collect)
            .unwrap_err();
        assert_eq!(err.terminal_status(), FlowStatus::Crashed);
    }

    #[test]
    fn test_state_bag_and_replies() {
        let mut ctx = context();
        ctx.set("seen", 2u32).unwrap();
        assert_eq!(ctx.get::<u32>("seen").unwrap(), Some(2));
        assert_eq!(ctx.get::<u32>("missing").unwrap(), None);
        assert!(ctx.get::<String>("seen").is_err());

        ctx.send_reply(Payload::empty("Process"));
        let output = ctx.into_output();
        assert_eq!(output.flow.num_replies_sent, 1);
        assert_eq!(output.results[0].hunt_id, Some(HuntId::new("H1")));
    }

    #[test]
    fn test_flow_error_statuses() {
        assert_eq!(FlowError::failed("x").terminal_status(), FlowStatus::Error);
        assert_eq!(FlowError::internal("x").terminal_status(), FlowStatus::Crashed);
        let protocol = FlowError::from(CorrelationError::MissingStatus { request_id: 1 });
        assert_eq!(protocol.terminal_status(), FlowStatus::Error);
        assert!(matches!(FlowError::internal("bug").into_event(), FlowEvent::Crash(_)));
    }

    #[test]
    fn test_args_decoding() {
        #[derive(serde::Deserialize)]
        struct Args {
            limit: u32,
        }
        let ctx = context();
        assert_eq!(ctx.args_as::<Args>().unwrap().limit, 3);
        assert!(matches!(ctx.args_as::<Vec<u8>>(), Err(FlowError::Failed(_))));
    }
}
