//! Host interrogation: platform and agent information are requested in
//! parallel and joined in the state bag once both have answered.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{FlowContext, FlowDefinition, FlowState, HandlerResult};
use crate::models::Payload;
use crate::orchestration::correlator::Responses;

pub const GET_PLATFORM_INFO: &str = "GetPlatformInfo";
pub const GET_CLIENT_INFO: &str = "GetClientInfo";
pub const SUMMARY_TYPE: &str = "ClientSummary";

const SYSTEM_INFO_KEY: &str = "system_info";
const CLIENT_INFO_KEY: &str = "client_info";
const ERRORS_KEY: &str = "errors";

/// Combined interrogation result sent as the flow's single reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub system_info: Option<Value>,
    pub client_info: Option<Value>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterrogateState {
    StoreSystemInfo,
    StoreClientInfo,
}

impl FlowState for InterrogateState {
    const ALL: &'static [Self] = &[Self::StoreSystemInfo, Self::StoreClientInfo];

    fn name(&self) -> &'static str {
        match self {
            Self::StoreSystemInfo => "StoreSystemInfo",
            Self::StoreClientInfo => "StoreClientInfo",
        }
    }
}

impl InterrogateState {
    fn key(self) -> &'static str {
        match self {
            Self::StoreSystemInfo => SYSTEM_INFO_KEY,
            Self::StoreClientInfo => CLIENT_INFO_KEY,
        }
    }
}

pub struct Interrogate;

impl Interrogate {
    /// Store one half of the answer. A failed request is recorded as
    /// `Null` so the join still happens.
    fn store(&self, state: InterrogateState, ctx: &mut FlowContext, responses: Responses) -> HandlerResult {
        let value = if responses.success() {
            match responses.first() {
                Some(payload) => payload.decode_json::<Value>()?,
                None => Value::Null,
            }
        } else {
            let message = responses
                .status()
                .and_then(|status| status.error_message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            let mut errors: Vec<String> = ctx.get(ERRORS_KEY)?.unwrap_or_default();
            errors.push(format!("{}: {message}", state.name()));
            ctx.set(ERRORS_KEY, errors)?;
            Value::Null
        };
        ctx.set(state.key(), value)?;
        self.maybe_summarize(ctx)
    }

    fn maybe_summarize(&self, ctx: &mut FlowContext) -> HandlerResult {
        let (Some(system_info), Some(client_info)) = (
            ctx.get::<Value>(SYSTEM_INFO_KEY)?,
            ctx.get::<Value>(CLIENT_INFO_KEY)?,
        ) else {
            return Ok(());
        };
        let summary = ClientSummary {
            system_info: Some(system_info).filter(|v| !v.is_null()),
            client_info: Some(client_info).filter(|v| !v.is_null()),
            errors: ctx.get(ERRORS_KEY)?.unwrap_or_default(),
        };
        debug!(
            client_id = %ctx.client_id(),
            errors = summary.errors.len(),
            "Interrogation complete"
        );
        ctx.send_reply(Payload::json(SUMMARY_TYPE, &summary)?);
        Ok(())
    }
}

impl FlowDefinition for Interrogate {
    type State = InterrogateState;
    const FLOW_TYPE: &'static str = "Interrogate";

    fn start(&self, ctx: &mut FlowContext) -> HandlerResult {
        ctx.call_client(
            GET_PLATFORM_INFO,
            Payload::empty("GetPlatformInfoRequest"),
            InterrogateState::StoreSystemInfo,
        )?;
        ctx.call_client(
            GET_CLIENT_INFO,
            Payload::empty("GetClientInfoRequest"),
            InterrogateState::StoreClientInfo,
        )?;
        Ok(())
    }

    fn handle(
        &self,
        state: InterrogateState,
        ctx: &mut FlowContext,
        responses: Responses,
    ) -> HandlerResult {
        self.store(state, ctx, responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientId, Flow, FlowId, FlowResponse, Status, StatusCode};
    use crate::orchestration::correlator::correlate;
    use chrono::Utc;
    use serde_json::json;

    fn answer(request_id: u64, payload: Option<Value>, status: Status) -> Responses {
        let (client, flow) = (ClientId::new("C.1"), FlowId::new("F1"));
        let mut rows = Vec::new();
        if let Some(value) = payload {
            rows.push(FlowResponse::message(
                client.clone(),
                flow.clone(),
                request_id,
                1,
                Payload::json("Info", &value).unwrap(),
            ));
        }
        rows.push(FlowResponse::status(client, flow, request_id, 2, status));
        correlate(request_id, &rows).unwrap()
    }

    fn started() -> FlowContext {
        let flow = Flow::new(ClientId::new("C.1"), FlowId::new("F1"), "Interrogate", Value::Null, "test", Utc::now());
        let mut ctx = FlowContext::new(flow, Utc::now());
        FlowDefinition::start(&Interrogate, &mut ctx).unwrap();
        ctx
    }

    #[test]
    fn test_summary_sent_once_both_halves_arrive() {
        let mut ctx = started();
        Interrogate
            .handle(
                InterrogateState::StoreClientInfo,
                &mut ctx,
                answer(2, Some(json!({"version": "3.4"})), Status::ok()),
            )
            .unwrap();
        Interrogate
            .handle(
                InterrogateState::StoreSystemInfo,
                &mut ctx,
                answer(1, Some(json!({"os": "Linux"})), Status::ok()),
            )
            .unwrap();

        let output = ctx.into_output();
        assert_eq!(output.new_requests.len(), 2);
        assert_eq!(output.results.len(), 1);
        let summary: ClientSummary = output.results[0].payload.decode_json().unwrap();
        assert_eq!(summary.system_info, Some(json!({"os": "Linux"})));
        assert_eq!(summary.client_info, Some(json!({"version": "3.4"})));
        assert!(summary.errors.is_empty());
    }

    #[test]
    fn test_failed_half_is_reported_in_summary() {
        let mut ctx = started();
        Interrogate
            .handle(
                InterrogateState::StoreSystemInfo,
                &mut ctx,
                answer(1, None, Status::error(StatusCode::GenericError, "no uname")),
            )
            .unwrap();
        assert_eq!(ctx.get::<Value>("system_info").unwrap(), Some(Value::Null));

        Interrogate
            .handle(
                InterrogateState::StoreClientInfo,
                &mut ctx,
                answer(2, Some(json!({"version": "3.4"})), Status::ok()),
            )
            .unwrap();
        let output = ctx.into_output();
        let summary: ClientSummary = output.results[0].payload.decode_json().unwrap();
        assert_eq!(summary.system_info, None);
        assert_eq!(summary.errors, vec!["StoreSystemInfo: no uname".to_string()]);
    }
}
