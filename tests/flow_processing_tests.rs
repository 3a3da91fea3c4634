mod common;

use std::sync::Arc;

use common::*;
use serde_json::json;

use huntsman_core::database::FlowStore;
use huntsman_core::models::{ClientId, FlowId, FlowResponse, Status, StatusCode};
use huntsman_core::orchestration::{FlowStartOptions, ProcessOutcome};
use huntsman_core::state_machine::FlowStatus;

async fn start(harness: &Harness, flow_type: &str, args: serde_json::Value) -> (ClientId, FlowId) {
    let flow = harness
        .system
        .flows()
        .start_flow(ClientId::new("C.1"), flow_type, args, FlowStartOptions::new("analyst"))
        .await
        .unwrap();
    (flow.client_id, flow.flow_id)
}

#[tokio::test]
async fn test_partial_responses_reach_handler_once_with_status() {
    let harness = Harness::new();
    let (client, flow_id) = start(&harness, "Netstat", json!({})).await;
    let request = harness.transport.last_to(&client).unwrap();
    assert_eq!(request.action, "ListNetworkConnections");

    // three messages first; nothing is ready without the status
    let mut rows = response_rows(
        &request,
        vec![connection("LISTEN", 22), connection("ESTABLISHED", 443), connection("LISTEN", 80)],
        Some(Status::ok()),
    );
    let status = rows.pop().unwrap();
    let report = harness
        .system
        .ingestor()
        .receive_responses(&client, rows)
        .await
        .unwrap();
    assert_eq!(report.written, 3);
    assert_eq!(report.flows_scheduled, 0);

    let report = harness
        .system
        .ingestor()
        .receive_responses(&client, vec![status])
        .await
        .unwrap();
    assert_eq!(report.flows_scheduled, 1);
    harness.drain().await;

    let flow = harness.system.flows().get_flow(&client, &flow_id).await.unwrap();
    assert_eq!(flow.status, FlowStatus::Succeeded);
    assert_eq!(flow.state["conn_count"], 3);
    let results = harness.system.flows().list_flow_results(&client, &flow_id).await.unwrap();
    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn test_error_status_falls_back_to_legacy_action() {
    let harness = Harness::new();
    let (client, flow_id) = start(&harness, "Netstat", json!({"listening_only": true})).await;
    let first = harness.transport.last_to(&client).unwrap();

    harness
        .reply(&first, vec![], Status::error(StatusCode::GenericError, "unknown action"))
        .await;
    harness.drain().await;

    let legacy = harness.transport.last_to(&client).unwrap();
    assert_eq!(legacy.action, "Netstat");
    assert_eq!(legacy.request_id, 2);

    harness
        .reply(&legacy, vec![connection("LISTEN", 22), connection("CLOSE_WAIT", 8080)], Status::ok())
        .await;
    harness.drain().await;

    let flow = harness.system.flows().get_flow(&client, &flow_id).await.unwrap();
    assert_eq!(flow.status, FlowStatus::Succeeded);
    assert_eq!(flow.num_replies_sent, 1);
}

#[tokio::test]
async fn test_requests_are_handled_in_issue_order() {
    let harness = Harness::new();
    let (client, flow_id) = start(&harness, "Interrogate", serde_json::Value::Null).await;
    let sent = harness.transport.sent_to(&client);
    assert_eq!(sent.len(), 2);

    let platform = huntsman_core::models::Payload::json("PlatformInfo", &json!({"system": "Linux"})).unwrap();
    let info = huntsman_core::models::Payload::json("ClientInformation", &json!({"version": 3})).unwrap();

    // request 2 completes first and has to wait for request 1
    harness.reply(&sent[1], vec![info], Status::ok()).await;
    harness.drain().await;
    let flow = harness.system.flows().get_flow(&client, &flow_id).await.unwrap();
    assert!(flow.is_running());
    assert!(!flow.state.contains_key("client_info"));
    assert_eq!(flow.next_request_to_process, 1);

    harness.reply(&sent[0], vec![platform], Status::ok()).await;
    harness.drain().await;
    let flow = harness.system.flows().get_flow(&client, &flow_id).await.unwrap();
    assert_eq!(flow.status, FlowStatus::Succeeded);
    assert_eq!(
        harness.system.flows().list_flow_results(&client, &flow_id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_callback_state_sees_messages_before_status() {
    let harness = Harness::new();
    let (client, flow_id) = start(&harness, "ListProcesses", json!({})).await;
    let request = harness.transport.last_to(&client).unwrap();

    let rows = response_rows(&request, vec![process(1, "init"), process(42, "sshd")], None);
    harness.system.ingestor().receive_responses(&client, rows).await.unwrap();
    harness.drain().await;

    let flow = harness.system.flows().get_flow(&client, &flow_id).await.unwrap();
    assert!(flow.is_running());
    assert_eq!(
        harness.system.flows().list_flow_results(&client, &flow_id).await.unwrap().len(),
        2
    );

    let status = FlowResponse::status(client.clone(), flow_id.clone(), request.request_id, 3, Status::ok());
    harness.system.ingestor().receive_responses(&client, vec![status]).await.unwrap();
    harness.drain().await;
    let flow = harness.system.flows().get_flow(&client, &flow_id).await.unwrap();
    assert_eq!(flow.status, FlowStatus::Succeeded);
    assert_eq!(
        harness.system.flows().list_flow_results(&client, &flow_id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_redelivered_processing_does_not_duplicate_results() {
    let harness = Harness::new();
    let (client, flow_id) = start(&harness, "Netstat", json!({})).await;
    let request = harness.transport.last_to(&client).unwrap();
    harness.reply(&request, vec![connection("LISTEN", 22)], Status::ok()).await;

    let runner = harness.system.flows();
    let first = runner.process_flow(&client, &flow_id).await.unwrap();
    assert!(matches!(first, ProcessOutcome::Progressed { handled: 1, .. }));
    let again = runner.process_flow(&client, &flow_id).await.unwrap();
    assert_eq!(again, ProcessOutcome::AlreadyTerminal(FlowStatus::Succeeded));
    assert_eq!(runner.list_flow_results(&client, &flow_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_processing_commits_once() {
    let harness = Arc::new(Harness::new());
    let (client, flow_id) = start(&harness, "Netstat", json!({})).await;
    let request = harness.transport.last_to(&client).unwrap();
    harness
        .reply(&request, vec![connection("LISTEN", 22), connection("LISTEN", 25)], Status::ok())
        .await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let harness = harness.clone();
        let (client, flow_id) = (client.clone(), flow_id.clone());
        handles.push(tokio::spawn(async move {
            harness.system.flows().process_flow(&client, &flow_id).await
        }));
    }
    for handle in handles {
        if let Err(e) = handle.await.unwrap() {
            assert!(e.is_retryable(), "unexpected error: {e}");
        }
    }

    let results = harness.system.flows().list_flow_results(&client, &flow_id).await.unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn test_response_for_unissued_request_errors_flow() {
    let harness = Harness::new();
    let (client, flow_id) = start(&harness, "Netstat", json!({})).await;

    let bogus = FlowResponse::status(client.clone(), flow_id.clone(), 9, 1, Status::ok());
    let report = harness
        .system
        .ingestor()
        .receive_responses(&client, vec![bogus])
        .await
        .unwrap();
    assert_eq!(report.protocol_violations, 1);
    harness.drain().await;

    let flow = harness.system.flows().get_flow(&client, &flow_id).await.unwrap();
    assert_eq!(flow.status, FlowStatus::Error);
    assert!(flow.error_message.unwrap().contains("request 9"));
    assert!(harness
        .store
        .read_requests_with_responses(&client, &flow_id)
        .await
        .unwrap()
        .is_empty());
}
