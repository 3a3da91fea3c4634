//! Network connection listing, with a fallback to the legacy `Netstat`
//! client action for agents that do not support `ListNetworkConnections`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{FlowContext, FlowDefinition, FlowError, FlowState, HandlerResult};
use crate::models::Payload;
use crate::orchestration::correlator::Responses;

pub const LIST_NETWORK_CONNECTIONS: &str = "ListNetworkConnections";
pub const LEGACY_NETSTAT: &str = "Netstat";
pub const CONNECTION_TYPE: &str = "NetworkConnection";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetstatArgs {
    #[serde(default)]
    pub listening_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConnection {
    pub state: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub process_name: Option<String>,
    pub local_address: String,
    #[serde(default)]
    pub remote_address: Option<String>,
}

impl NetworkConnection {
    pub fn is_listening(&self) -> bool {
        self.state.eq_ignore_ascii_case("LISTEN")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetstatState {
    ValidateListNetworkConnections,
    StoreNetstat,
}

impl FlowState for NetstatState {
    const ALL: &'static [Self] = &[Self::ValidateListNetworkConnections, Self::StoreNetstat];

    fn name(&self) -> &'static str {
        match self {
            Self::ValidateListNetworkConnections => "ValidateListNetworkConnections",
            Self::StoreNetstat => "StoreNetstat",
        }
    }
}

pub struct Netstat;

impl Netstat {
    fn store(&self, ctx: &mut FlowContext, responses: Responses) -> HandlerResult {
        if !responses.success() {
            let message = responses
                .status()
                .and_then(|status| status.error_message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(FlowError::failed(format!(
                "Failed to get connections. Err: {message}"
            )));
        }

        let args = ctx.args_as::<Option<NetstatArgs>>()?.unwrap_or_default();
        let mut stored = 0u64;
        for payload in responses {
            let connection: NetworkConnection = payload.decode_json()?;
            if args.listening_only && !connection.is_listening() {
                continue;
            }
            ctx.send_reply(payload);
            stored += 1;
        }
        ctx.set("conn_count", stored)?;
        debug!(client_id = %ctx.client_id(), connections = stored, "Stored network connections");
        Ok(())
    }
}

impl FlowDefinition for Netstat {
    type State = NetstatState;
    const FLOW_TYPE: &'static str = "Netstat";

    fn validate_args(&self, args: &Value) -> HandlerResult {
        if args.is_null() {
            return Ok(());
        }
        serde_json::from_value::<NetstatArgs>(args.clone())
            .map(|_| ())
            .map_err(|e| FlowError::failed(format!("invalid Netstat arguments: {e}")))
    }

    fn start(&self, ctx: &mut FlowContext) -> HandlerResult {
        let args = Payload::json("ListNetworkConnectionsArgs", ctx.args())?;
        ctx.call_client(
            LIST_NETWORK_CONNECTIONS,
            args,
            NetstatState::ValidateListNetworkConnections,
        )?;
        Ok(())
    }

    fn handle(&self, state: NetstatState, ctx: &mut FlowContext, responses: Responses) -> HandlerResult {
        match state {
            NetstatState::ValidateListNetworkConnections if !responses.success() => {
                // older agents only know the legacy action
                debug!(client_id = %ctx.client_id(), "Falling back to legacy Netstat action");
                ctx.call_client(LEGACY_NETSTAT, Payload::empty("NetstatArgs"), NetstatState::StoreNetstat)?;
                Ok(())
            }
            NetstatState::ValidateListNetworkConnections | NetstatState::StoreNetstat => {
                self.store(ctx, responses)
            }
        }
    }
}
