//! Test harness: a full orchestration system over the in-memory store with
//! a transport that records every request handed to it.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use huntsman_core::config::HuntsmanConfig;
use huntsman_core::database::InMemoryDataStore;
use huntsman_core::error::Result;
use huntsman_core::flows::FlowRegistry;
use huntsman_core::models::{ClientId, ClientInfo, FlowRequest, FlowResponse, Payload, Status};
use huntsman_core::orchestration::{AgentTransport, IngestReport, OrchestrationSystem, WorkerCycle};

/// Transport that keeps every request instead of sending it
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(ClientId, FlowRequest)>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(ClientId, FlowRequest)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, client_id: &ClientId) -> Vec<FlowRequest> {
        self.sent
            .lock()
            .iter()
            .filter(|(client, _)| client == client_id)
            .map(|(_, request)| request.clone())
            .collect()
    }

    /// Most recent request sent to the client
    pub fn last_to(&self, client_id: &ClientId) -> Option<FlowRequest> {
        self.sent_to(client_id).pop()
    }
}

#[async_trait]
impl AgentTransport for RecordingTransport {
    async fn send_request(&self, client_id: &ClientId, request: &FlowRequest) -> Result<()> {
        self.sent.lock().push((client_id.clone(), request.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub system: OrchestrationSystem,
    pub store: Arc<InMemoryDataStore>,
    pub transport: Arc<RecordingTransport>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: HuntsmanConfig) -> Self {
        let store = Arc::new(InMemoryDataStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let system = OrchestrationSystem::new(
            config,
            store.clone(),
            FlowRegistry::with_builtin_flows().expect("builtin flows"),
            transport.clone(),
        );
        Self {
            system,
            store,
            transport,
        }
    }

    /// Run worker passes until the queue is empty
    pub async fn drain(&self) -> WorkerCycle {
        let worker = self.system.worker();
        let mut total = WorkerCycle::default();
        for _ in 0..20 {
            let cycle = worker.run_once().await.expect("worker pass");
            if cycle.leased == 0 {
                break;
            }
            total.leased += cycle.leased;
            total.processed += cycle.processed;
            total.released += cycle.released;
            total.failed += cycle.failed;
        }
        total
    }

    pub async fn check_in(&self, info: ClientInfo) {
        self.system.ingestor().check_in(info).await.expect("check-in");
    }

    /// Answer a request with messages numbered from 1 followed by `status`
    pub async fn reply(&self, request: &FlowRequest, payloads: Vec<Payload>, status: Status) -> IngestReport {
        let rows = response_rows(request, payloads, Some(status));
        self.system
            .ingestor()
            .receive_responses(&request.client_id, rows)
            .await
            .expect("ingest")
    }
}

pub fn test_config() -> HuntsmanConfig {
    let mut config = HuntsmanConfig::default();
    config.worker.worker_id = "test-worker".to_string();
    config.worker.lease_duration_secs = 60;
    config.worker.poll_interval_ms = 10;
    config
}

/// Response rows for `request`: messages numbered from 1, then the status
pub fn response_rows(request: &FlowRequest, payloads: Vec<Payload>, status: Option<Status>) -> Vec<FlowResponse> {
    let mut rows: Vec<FlowResponse> = payloads
        .into_iter()
        .enumerate()
        .map(|(index, payload)| {
            FlowResponse::message(
                request.client_id.clone(),
                request.flow_id.clone(),
                request.request_id,
                index as u64 + 1,
                payload,
            )
        })
        .collect();
    if let Some(status) = status {
        let response_id = rows.len() as u64 + 1;
        rows.push(FlowResponse::status(
            request.client_id.clone(),
            request.flow_id.clone(),
            request.request_id,
            response_id,
            status,
        ));
    }
    rows
}

pub fn linux_client(id: &str) -> ClientInfo {
    ClientInfo::new(id).with_os("Linux")
}

pub fn connection(state: &str, port: u16) -> Payload {
    Payload::json(
        "NetworkConnection",
        &json!({
            "state": state,
            "local_address": format!("0.0.0.0:{port}"),
        }),
    )
    .expect("connection payload")
}

pub fn process(pid: u32, name: &str) -> Payload {
    Payload::json(
        "Process",
        &json!({
            "pid": pid,
            "name": name,
            "exe": format!("/usr/bin/{name}"),
        }),
    )
    .expect("process payload")
}
