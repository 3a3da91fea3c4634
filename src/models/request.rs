//! Outgoing requests to agents and the responses they send back.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

use super::ids::{ClientId, FlowId, RequestId, ResponseId};
use crate::error::Result;

/// Opaque payload tagged with a type identifier. The orchestration core never
/// looks inside `data`; flows that understand the type decode it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub type_name: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(type_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            data,
        }
    }

    pub fn empty(type_name: impl Into<String>) -> Self {
        Self::new(type_name, Vec::new())
    }

    /// JSON-encode a value into a payload
    pub fn json<T: Serialize>(type_name: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(type_name, serde_json::to_vec(value)?))
    }

    /// Decode a JSON-encoded payload
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Agent-reported outcome codes for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    GenericError,
    ClientKilled,
    NetworkLimitExceeded,
    CpuLimitExceeded,
    IoError,
    WorkerStuck,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::GenericError => "GENERIC_ERROR",
            Self::ClientKilled => "CLIENT_KILLED",
            Self::NetworkLimitExceeded => "NETWORK_LIMIT_EXCEEDED",
            Self::CpuLimitExceeded => "CPU_LIMIT_EXCEEDED",
            Self::IoError => "IO_ERROR",
            Self::WorkerStuck => "WORKER_STUCK",
        };
        f.write_str(name)
    }
}

/// Terminal status record sent by the agent as the last response of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub cpu_time_used_ms: u64,
    #[serde(default)]
    pub network_bytes_sent: u64,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            error_message: None,
            cpu_time_used_ms: 0,
            network_bytes_sent: 0,
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            error_message: Some(message.into()),
            cpu_time_used_ms: 0,
            network_bytes_sent: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Wire tags for response rows.
pub mod response_types {
    pub const MESSAGE: &str = "message";
    pub const STATUS: &str = "status";
    /// Legacy streaming tag, no longer accepted
    pub const ITERATOR: &str = "iterator";
}

/// Outgoing call from a flow to its agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: RequestId,
    /// Client action the agent should run
    pub action: String,
    pub args: Payload,
    /// State invoked once with the full batch when the status arrives
    pub next_state: String,
    /// State invoked with each new set of partial replies
    #[serde(default)]
    pub callback_state: Option<String>,
    /// First response id not yet delivered to `callback_state`
    #[serde(default)]
    pub next_response_id: ResponseId,
    pub created_at: DateTime<Utc>,
}

/// One row of an agent's reply stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResponse {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: RequestId,
    pub response_id: ResponseId,
    /// Declared row kind, see [`response_types`]
    pub response_type: String,
    #[serde(default)]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub status: Option<Status>,
    pub received_at: DateTime<Utc>,
}

impl FlowResponse {
    pub fn message(
        client_id: ClientId,
        flow_id: FlowId,
        request_id: RequestId,
        response_id: ResponseId,
        payload: Payload,
    ) -> Self {
        Self {
            client_id,
            flow_id,
            request_id,
            response_id,
            response_type: response_types::MESSAGE.to_string(),
            payload: Some(payload),
            status: None,
            received_at: Utc::now(),
        }
    }

    pub fn status(
        client_id: ClientId,
        flow_id: FlowId,
        request_id: RequestId,
        response_id: ResponseId,
        status: Status,
    ) -> Self {
        Self {
            client_id,
            flow_id,
            request_id,
            response_id,
            response_type: response_types::STATUS.to_string(),
            payload: None,
            status: Some(status),
            received_at: Utc::now(),
        }
    }

    pub fn is_status(&self) -> bool {
        self.response_type == response_types::STATUS
    }
}

/// A request together with every response row stored for it so far.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestWithResponses {
    pub request: FlowRequest,
    pub responses: Vec<FlowResponse>,
}

impl RequestWithResponses {
    /// A status arrived and every response numbered before it is present.
    /// Agents number the responses of a request from 1.
    pub fn is_complete(&self) -> bool {
        let Some(last) = self
            .responses
            .iter()
            .filter(|r| r.is_status())
            .map(|r| r.response_id)
            .max()
        else {
            return false;
        };
        let present = self
            .responses
            .iter()
            .filter(|r| (1..=last).contains(&r.response_id))
            .count() as u64;
        present == last
    }

    /// Messages not yet handed to the callback state, stopping at the first
    /// gap in the sequence
    pub fn undelivered_messages(&self) -> Vec<&FlowResponse> {
        let start = self.request.next_response_id.max(1);
        let mut expected = start;
        let mut ready = Vec::new();
        for response in self.responses.iter().filter(|r| r.response_id >= start) {
            if response.response_id != expected || response.is_status() {
                break;
            }
            ready.push(response);
            expected += 1;
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Conn {
            port: u16,
        }

        let payload = Payload::json("NetworkConnection", &Conn { port: 22 }).unwrap();
        assert_eq!(payload.type_name, "NetworkConnection");
        assert_eq!(payload.decode_json::<Conn>().unwrap(), Conn { port: 22 });
    }

    #[test]
    fn test_status_code_wire_names() {
        assert_eq!(StatusCode::NetworkLimitExceeded.to_string(), "NETWORK_LIMIT_EXCEEDED");
        let json = serde_json::to_string(&StatusCode::ClientKilled).unwrap();
        assert_eq!(json, "\"CLIENT_KILLED\"");
        assert!(Status::ok().is_ok());
        assert!(!Status::error(StatusCode::IoError, "disk").is_ok());
    }

    fn with_rows(next_response_id: ResponseId, rows: Vec<FlowResponse>) -> RequestWithResponses {
        let (client, flow) = (ClientId::new("C.1"), FlowId::new("F1"));
        RequestWithResponses {
            request: FlowRequest {
                client_id: client,
                flow_id: flow,
                request_id: 1,
                action: "ListProcesses".into(),
                args: Payload::empty("Args"),
                next_state: "Done".into(),
                callback_state: Some("Receive".into()),
                next_response_id,
                created_at: Utc::now(),
            },
            responses: rows,
        }
    }

    fn message(response_id: ResponseId) -> FlowResponse {
        FlowResponse::message(ClientId::new("C.1"), FlowId::new("F1"), 1, response_id, Payload::empty("P"))
    }

    fn status(response_id: ResponseId) -> FlowResponse {
        FlowResponse::status(ClientId::new("C.1"), FlowId::new("F1"), 1, response_id, Status::ok())
    }

    #[test]
    fn test_completion_requires_gap_free_sequence() {
        assert!(!with_rows(1, vec![message(1), message(2)]).is_complete());
        assert!(!with_rows(1, vec![message(1), status(3)]).is_complete());
        assert!(with_rows(1, vec![message(1), message(2), status(3)]).is_complete());
    }

    #[test]
    fn test_undelivered_messages_stop_at_gap() {
        let rows = vec![message(1), message(2), message(4), status(5)];
        let ids: Vec<ResponseId> = with_rows(1, rows.clone())
            .undelivered_messages()
            .iter()
            .map(|r| r.response_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(with_rows(3, rows).undelivered_messages().is_empty());
    }
}
