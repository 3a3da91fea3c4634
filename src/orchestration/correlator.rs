//! # Request/Response Correlator
//!
//! Turns the stored response rows of one request into the [`Responses`]
//! batch a flow handler consumes.
//!
//! ## Rules
//!
//! - every row must belong to the request being correlated
//! - every row must be a `message` or a `status`; the legacy `iterator`
//!   kind and anything unknown is rejected
//! - exactly one `status` row must be present; none means the request is not
//!   complete, more than one is a protocol violation
//! - iteration yields the payloads of `message` rows in the order given,
//!   which is arrival order as returned by the store
//!
//! Correlation is pure: it never touches storage and returns the same
//! result for the same input, so a failed correlation leaves nothing
//! half-applied.
//!
//! ```rust
//! use huntsman_core::models::{ClientId, FlowId, FlowResponse, Payload, Status};
//! use huntsman_core::orchestration::correlator::correlate;
//!
//! let (client, flow) = (ClientId::new("C.1"), FlowId::new("F1"));
//! let rows = vec![
//!     FlowResponse::message(client.clone(), flow.clone(), 1, 1, Payload::empty("Conn")),
//!     FlowResponse::status(client, flow, 1, 2, Status::ok()),
//! ];
//! let batch = correlate(1, &rows).unwrap();
//! assert!(batch.success());
//! assert_eq!(batch.len(), 1);
//! ```

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::{HuntsmanError, Result};
use crate::models::request::response_types;
use crate::models::{FlowResponse, Payload, RequestId, ResponseId, Status};

/// Malformed response set. Always fatal to the owning flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("missing status for request {request_id}")]
    MissingStatus { request_id: RequestId },

    #[error("duplicated status for request {request_id}: {count} status rows")]
    DuplicatedStatus { request_id: RequestId, count: usize },

    #[error("unexpected response type {response_type:?} in response {response_id} of request {request_id}")]
    UnexpectedResponseType {
        request_id: RequestId,
        response_id: ResponseId,
        response_type: String,
    },

    #[error("malformed response {response_id} of request {request_id}: {reason}")]
    MalformedRow {
        request_id: RequestId,
        response_id: ResponseId,
        reason: String,
    },

    #[error("response for request {found} correlated with request {expected}")]
    ForeignResponse {
        expected: RequestId,
        found: RequestId,
    },
}

impl From<CorrelationError> for HuntsmanError {
    fn from(err: CorrelationError) -> Self {
        HuntsmanError::ProtocolViolation(err.to_string())
    }
}

/// One request's worth of agent replies, as handed to a flow state
#[derive(Debug, Clone, PartialEq)]
pub struct Responses {
    request_id: RequestId,
    status: Option<Status>,
    payloads: Vec<Payload>,
}

impl Responses {
    /// Batch delivered to a callback state before the request completed
    pub fn partial(request_id: RequestId, payloads: Vec<Payload>) -> Self {
        Self {
            request_id,
            status: None,
            payloads,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// `status.code == OK`; a partial batch counts as successful so far
    pub fn success(&self) -> bool {
        self.status.as_ref().map_or(true, Status::is_ok)
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub fn is_partial(&self) -> bool {
        self.status.is_none()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Payload> {
        self.payloads.iter()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn first(&self) -> Option<&Payload> {
        self.payloads.first()
    }

    /// Decode every payload as JSON
    pub fn decode_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.payloads.iter().map(Payload::decode_json).collect()
    }
}

impl<'a> IntoIterator for &'a Responses {
    type Item = &'a Payload;
    type IntoIter = std::slice::Iter<'a, Payload>;

    fn into_iter(self) -> Self::IntoIter {
        self.payloads.iter()
    }
}

impl IntoIterator for Responses {
    type Item = Payload;
    type IntoIter = std::vec::IntoIter<Payload>;

    fn into_iter(self) -> Self::IntoIter {
        self.payloads.into_iter()
    }
}

fn check_row(request_id: RequestId, row: &FlowResponse) -> std::result::Result<(), CorrelationError> {
    if row.request_id != request_id {
        return Err(CorrelationError::ForeignResponse {
            expected: request_id,
            found: row.request_id,
        });
    }
    let malformed = |reason: &str| CorrelationError::MalformedRow {
        request_id,
        response_id: row.response_id,
        reason: reason.to_string(),
    };
    match row.response_type.as_str() {
        response_types::MESSAGE if row.payload.is_none() => Err(malformed("message without payload")),
        response_types::STATUS if row.status.is_none() => Err(malformed("status row without status")),
        response_types::MESSAGE | response_types::STATUS => Ok(()),
        other => Err(CorrelationError::UnexpectedResponseType {
            request_id,
            response_id: row.response_id,
            response_type: other.to_string(),
        }),
    }
}

/// Correlate the complete response set of a request
pub fn correlate(
    request_id: RequestId,
    rows: &[FlowResponse],
) -> std::result::Result<Responses, CorrelationError> {
    rows.iter().try_for_each(|row| check_row(request_id, row))?;

    let mut statuses = rows
        .iter()
        .filter(|row| row.is_status())
        .filter_map(|row| row.status.as_ref());
    let status = statuses
        .next()
        .cloned()
        .ok_or(CorrelationError::MissingStatus { request_id })?;
    let extra = statuses.count();
    if extra > 0 {
        return Err(CorrelationError::DuplicatedStatus {
            request_id,
            count: extra + 1,
        });
    }

    Ok(Responses {
        request_id,
        status: Some(status),
        payloads: rows
            .iter()
            .filter(|row| !row.is_status())
            .filter_map(|row| row.payload.clone())
            .collect(),
    })
}

/// Correlate messages that arrived before the status, for a callback state.
/// Status rows are not allowed here.
pub fn correlate_partial(
    request_id: RequestId,
    rows: &[&FlowResponse],
) -> std::result::Result<Responses, CorrelationError> {
    let mut payloads = Vec::with_capacity(rows.len());
    for row in rows {
        check_row(request_id, row)?;
        match &row.payload {
            Some(payload) if !row.is_status() => payloads.push(payload.clone()),
            _ => {
                return Err(CorrelationError::MalformedRow {
                    request_id,
                    response_id: row.response_id,
                    reason: "status in partial batch".to_string(),
                })
            }
        }
    }
    Ok(Responses::partial(request_id, payloads))
}
