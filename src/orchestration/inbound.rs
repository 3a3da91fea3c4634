//! # Response Ingestion
//!
//! Entry point for everything agents send back: response rows for running
//! flows and client check-ins. Ingestion only persists and schedules; flow
//! logic runs later in a [`FlowProcessingHandler`](super::flow_runner::FlowProcessingHandler)
//! and foreman evaluation in a [`ForemanCheckInHandler`](super::foreman::ForemanCheckInHandler).
//!
//! Rows are triaged per flow against the stored flow:
//!
//! | row targets | action |
//! |---|---|
//! | unknown flow, or flow no longer running | dropped |
//! | request already delivered | dropped as a late duplicate |
//! | request never issued | nothing written, flow marked for termination |
//! | open request | written; exact duplicates collapse on the row key |

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::task_queue::TaskQueue;
use crate::constants::{events, handlers};
use crate::database::DataStore;
use crate::error::Result;
use crate::events::EventPublisher;
use crate::logging::log_flow_operation;
use crate::models::message_handler_request::flow_processing_key;
use crate::models::{
    ClientId, ClientInfo, Flow, FlowId, FlowResponse, MessageHandlerRequest, PendingTermination,
    RequestId,
};

/// Counters of one ingestion call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub written: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub protocol_violations: usize,
    pub flows_scheduled: usize,
}

pub struct ResponseIngestor {
    store: Arc<dyn DataStore>,
    queue: Arc<TaskQueue>,
    events: EventPublisher,
}

impl ResponseIngestor {
    pub fn new(store: Arc<dyn DataStore>, queue: Arc<TaskQueue>, events: EventPublisher) -> Self {
        Self {
            store,
            queue,
            events,
        }
    }

    /// Persist response rows sent by `client_id` and schedule the flows
    /// that can make progress
    #[instrument(skip(self, rows), fields(client_id = %client_id, rows = rows.len()))]
    pub async fn receive_responses(
        &self,
        client_id: &ClientId,
        rows: Vec<FlowResponse>,
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut by_flow: BTreeMap<FlowId, Vec<FlowResponse>> = BTreeMap::new();
        for row in rows {
            if &row.client_id != client_id {
                warn!(claimed = %row.client_id, "Dropping row attributed to another client");
                report.dropped += 1;
                continue;
            }
            by_flow.entry(row.flow_id.clone()).or_default().push(row);
        }

        let mut schedule = Vec::new();
        for (flow_id, rows) in by_flow {
            let Some(flow) = self.store.read_flow(client_id, &flow_id).await? else {
                debug!(flow_id = %flow_id, count = rows.len(), "Dropping rows for unknown flow");
                report.dropped += rows.len();
                continue;
            };
            if !flow.is_running() {
                debug!(flow_id = %flow_id, status = %flow.status, "Dropping rows for finished flow");
                report.dropped += rows.len();
                continue;
            }

            let (late, open): (Vec<FlowResponse>, Vec<FlowResponse>) = rows
                .into_iter()
                .partition(|row| row.request_id < flow.next_request_to_process);
            if !late.is_empty() {
                debug!(flow_id = %flow_id, count = late.len(), "Dropping late duplicate rows");
                report.dropped += late.len();
            }

            if let Some(unknown) = open
                .iter()
                .map(|row| row.request_id)
                .find(|request_id| *request_id >= flow.next_outbound_id)
            {
                report.dropped += open.len();
                report.protocol_violations += 1;
                self.mark_protocol_violation(&flow, unknown).await?;
                schedule.push(flow_id);
                continue;
            }

            if open.is_empty() {
                continue;
            }
            let wakes = self.wakes_flow(&flow, &open).await?;
            let total = open.len();
            let written = self.store.write_flow_responses(open).await?;
            report.written += written;
            report.duplicates += total - written;
            if wakes && written > 0 {
                schedule.push(flow_id);
            }
        }

        let now = Utc::now();
        report.flows_scheduled = schedule.len();
        self.queue
            .enqueue(
                schedule
                    .iter()
                    .map(|flow_id| {
                        MessageHandlerRequest::new(
                            handlers::FLOW_PROCESSING,
                            flow_processing_key(client_id, flow_id),
                            Value::Null,
                            now,
                        )
                    })
                    .collect(),
            )
            .await?;
        Ok(report)
    }

    /// Record a check-in and schedule foreman evaluation for the client
    pub async fn check_in(&self, mut info: ClientInfo) -> Result<()> {
        let now = Utc::now();
        info.last_seen = now;
        let client_id = info.client_id.clone();
        self.store.write_client_info(info).await?;
        self.queue
            .enqueue(vec![MessageHandlerRequest::new(
                handlers::FOREMAN_CHECK_IN,
                client_id.as_str(),
                Value::Null,
                now,
            )])
            .await?;
        debug!(client_id = %client_id, "Client check-in recorded");
        Ok(())
    }

    /// A status completes a request; plain messages only matter to requests
    /// with a callback state
    async fn wakes_flow(&self, flow: &Flow, rows: &[FlowResponse]) -> Result<bool> {
        if rows.iter().any(FlowResponse::is_status) {
            return Ok(true);
        }
        let request_ids: BTreeSet<RequestId> = rows.iter().map(|row| row.request_id).collect();
        for request_id in request_ids {
            let request = self
                .store
                .read_request(&flow.client_id, &flow.flow_id, request_id)
                .await?;
            if request.is_some_and(|request| request.callback_state.is_some()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_protocol_violation(&self, flow: &Flow, request_id: RequestId) -> Result<()> {
        let reason = format!("response for request {request_id} which was never issued");
        let requested_at = Utc::now();
        let pending = PendingTermination {
            reason: reason.clone(),
            requested_at,
        };
        self.store
            .update_flow(
                &flow.client_id,
                &flow.flow_id,
                Box::new(move |flow: &mut Flow| {
                    if !flow.is_running() || flow.pending_termination.is_some() {
                        return false;
                    }
                    flow.pending_termination = Some(pending);
                    true
                }),
            )
            .await?;

        warn!(flow = %flow.urn(), request_id, "Protocol violation at ingest");
        self.events.publish(
            events::FLOW_PROTOCOL_VIOLATION,
            json!({
                "client_id": flow.client_id,
                "flow_id": flow.flow_id,
                "error": reason,
            }),
        );
        log_flow_operation(
            "protocol_violation",
            flow.client_id.as_str(),
            flow.flow_id.as_str(),
            Some(&flow.flow_type),
            &flow.status.to_string(),
            Some(&reason),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ClientStore, FlowStore, InMemoryDataStore};
    use crate::models::{FlowRequest, Payload, Status};
    use chrono::Duration;

    struct Fixture {
        store: Arc<InMemoryDataStore>,
        queue: Arc<TaskQueue>,
        ingestor: ResponseIngestor,
        flow: Flow,
    }

    async fn fixture(callback: bool) -> Fixture {
        let store = Arc::new(InMemoryDataStore::new());
        let queue = Arc::new(TaskQueue::new(store.clone(), "test", Duration::seconds(60)));
        let ingestor = ResponseIngestor::new(store.clone(), queue.clone(), EventPublisher::new(8));

        let mut flow = Flow::new(
            ClientId::new("C.1"),
            FlowId::new("F1"),
            "Netstat",
            Value::Null,
            "test",
            Utc::now(),
        );
        flow.next_outbound_id = 2;
        let request = FlowRequest {
            client_id: flow.client_id.clone(),
            flow_id: flow.flow_id.clone(),
            request_id: 1,
            action: "Netstat".into(),
            args: Payload::empty("NetstatRequest"),
            next_state: "StoreNetstat".into(),
            callback_state: callback.then(|| "Stream".to_string()),
            next_response_id: 1,
            created_at: Utc::now(),
        };
        store.create_flow(flow.clone(), vec![request], Vec::new()).await.unwrap();
        Fixture {
            store,
            queue,
            ingestor,
            flow,
        }
    }

    fn message(flow: &Flow, request_id: RequestId, response_id: u64) -> FlowResponse {
        FlowResponse::message(
            flow.client_id.clone(),
            flow.flow_id.clone(),
            request_id,
            response_id,
            Payload::empty("NetworkConnection"),
        )
    }

    #[tokio::test]
    async fn test_messages_wait_for_status_without_callback() {
        let f = fixture(false).await;
        let client = f.flow.client_id.clone();

        let report = f
            .ingestor
            .receive_responses(&client, vec![message(&f.flow, 1, 1)])
            .await
            .unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.flows_scheduled, 0);

        let status = FlowResponse::status(client.clone(), f.flow.flow_id.clone(), 1, 2, Status::ok());
        let report = f
            .ingestor
            .receive_responses(&client, vec![message(&f.flow, 1, 1), status])
            .await
            .unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.flows_scheduled, 1);
        assert_eq!(f.queue.pending(handlers::FLOW_PROCESSING).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_callback_requests_are_woken_by_messages() {
        let f = fixture(true).await;
        let report = f
            .ingestor
            .receive_responses(&f.flow.client_id, vec![message(&f.flow, 1, 1)])
            .await
            .unwrap();
        assert_eq!(report.flows_scheduled, 1);
    }

    #[tokio::test]
    async fn test_unknown_request_marks_flow_for_termination() {
        let f = fixture(false).await;
        let report = f
            .ingestor
            .receive_responses(&f.flow.client_id, vec![message(&f.flow, 7, 1)])
            .await
            .unwrap();
        assert_eq!(report.protocol_violations, 1);
        assert_eq!(report.written, 0);

        let flow = f
            .store
            .read_flow(&f.flow.client_id, &f.flow.flow_id)
            .await
            .unwrap()
            .unwrap();
        assert!(flow.pending_termination.unwrap().reason.contains("request 7"));
    }

    #[tokio::test]
    async fn test_rows_for_unknown_flows_and_other_clients_are_dropped() {
        let f = fixture(false).await;
        let mut stray = message(&f.flow, 1, 1);
        stray.flow_id = FlowId::new("F404");
        let mut foreign = message(&f.flow, 1, 1);
        foreign.client_id = ClientId::new("C.2");

        let report = f
            .ingestor
            .receive_responses(&f.flow.client_id, vec![stray, foreign])
            .await
            .unwrap();
        assert_eq!(report.dropped, 2);
        assert_eq!(report.written, 0);
    }

    #[tokio::test]
    async fn test_check_in_records_client_and_schedules_foreman() {
        let f = fixture(false).await;
        f.ingestor
            .check_in(ClientInfo::new("C.9").with_os("Linux"))
            .await
            .unwrap();
        let stored = f.store.read_client_info(&ClientId::new("C.9")).await.unwrap().unwrap();
        assert_eq!(stored.os(), Some("Linux"));
        assert_eq!(f.queue.pending(handlers::FOREMAN_CHECK_IN).await.unwrap(), 1);
    }
}
