use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ClientId, FlowId};
use crate::database::lease::Leasable;

/// Leasable unit of inbound work, identified by `(handler_name, request_id)`.
///
/// `generation` is bumped every time the same identity is enqueued again
/// while an earlier copy is pending or leased. A worker may only delete the
/// generation it leased; newer work therefore survives the delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHandlerRequest {
    pub handler_name: String,
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub leased_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub leased_by: Option<String>,
}

impl MessageHandlerRequest {
    pub fn new(
        handler_name: impl Into<String>,
        request_id: impl Into<String>,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            handler_name: handler_name.into(),
            request_id: request_id.into(),
            payload,
            generation: 0,
            created_at: now,
            leased_until: None,
            leased_by: None,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.handler_name.clone(), self.request_id.clone())
    }
}

impl Leasable for MessageHandlerRequest {
    fn leased_by(&self) -> Option<&str> {
        self.leased_by.as_deref()
    }

    fn leased_until(&self) -> Option<DateTime<Utc>> {
        self.leased_until
    }

    fn set_lease(&mut self, leased_by: Option<String>, leased_until: Option<DateTime<Utc>>) {
        self.leased_by = leased_by;
        self.leased_until = leased_until;
    }
}

/// Queue key of the flow-processing item for a flow
pub fn flow_processing_key(client_id: &ClientId, flow_id: &FlowId) -> String {
    format!("{client_id}/{flow_id}")
}

/// Inverse of [`flow_processing_key`]
pub fn parse_flow_processing_key(key: &str) -> Option<(ClientId, FlowId)> {
    let (client, flow) = key.split_once('/')?;
    if client.is_empty() || flow.is_empty() {
        return None;
    }
    Some((ClientId::new(client), FlowId::new(flow)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_processing_key() {
        let key = flow_processing_key(&ClientId::new("C.1"), &FlowId::new("F1"));
        assert_eq!(key, "C.1/F1");
        assert_eq!(
            parse_flow_processing_key(&key),
            Some((ClientId::new("C.1"), FlowId::new("F1")))
        );
        assert_eq!(parse_flow_processing_key("no-separator"), None);
        assert_eq!(parse_flow_processing_key("/F1"), None);
    }
}
