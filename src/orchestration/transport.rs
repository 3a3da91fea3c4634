//! # Agent Transport
//!
//! Outbound seam to the agent fleet. The orchestration core hands over a
//! committed [`FlowRequest`] and never waits for the reply; responses come
//! back through [`ResponseIngestor`](super::inbound::ResponseIngestor).

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::models::{ClientId, FlowRequest};

#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Queue `request` for delivery to `client_id`.
    ///
    /// Called only after the transition that issued the request has been
    /// committed. A failed send leaves the request outstanding; the flow
    /// deadline bounds how long it can stay that way.
    async fn send_request(&self, client_id: &ClientId, request: &FlowRequest) -> Result<()>;
}

/// Transport that only logs; used when no agent link is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTransport;

#[async_trait]
impl AgentTransport for LoggingTransport {
    async fn send_request(&self, client_id: &ClientId, request: &FlowRequest) -> Result<()> {
        debug!(
            client_id = %client_id,
            flow_id = %request.flow_id,
            request_id = request.request_id,
            action = %request.action,
            payload_bytes = request.args.data.len(),
            "Request handed to transport"
        );
        Ok(())
    }
}
