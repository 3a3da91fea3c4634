//! PostgreSQL store tests. `#[sqlx::test]` creates a fresh database per
//! test from `DATABASE_URL` and applies `migrations/`.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;

use common::*;
use huntsman_core::database::{
    ClientStore, CronJobStore, DataStore, FlowStore, MessageHandlerStore, PgDataStore,
};
use huntsman_core::flows::FlowRegistry;
use huntsman_core::models::{
    ClientId, CronAction, CronJob, CronJobId, Flow, FlowId, MessageHandlerRequest, Status,
};
use huntsman_core::orchestration::{FlowStartOptions, OrchestrationSystem};
use huntsman_core::state_machine::FlowStatus;

fn flow(id: &str) -> Flow {
    Flow::new(ClientId::new("C.1"), FlowId::new(id), "Netstat", json!({}), "test", Utc::now())
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL"]
async fn test_create_flow_is_insert_if_absent(pool: PgPool) {
    let store = PgDataStore::new(pool);
    assert!(store.health_check().await.unwrap());

    assert!(store.create_flow(flow("F1"), vec![], vec![]).await.unwrap());
    assert!(!store.create_flow(flow("F1"), vec![], vec![]).await.unwrap());

    let updated = store
        .update_flow(
            &ClientId::new("C.1"),
            &FlowId::new("F1"),
            Box::new(|flow: &mut Flow| {
                flow.current_state = "StoreNetstat".to_string();
                true
            }),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.version, 1);

    let stored = store
        .read_flow(&ClientId::new("C.1"), &FlowId::new("F1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.current_state, "StoreNetstat");
    assert!(store
        .update_flow(&ClientId::new("C.1"), &FlowId::new("missing"), Box::new(|_: &mut Flow| true))
        .await
        .unwrap()
        .is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL"]
async fn test_queue_leases_are_exclusive(pool: PgPool) {
    let store = PgDataStore::new(pool);
    let now = Utc::now();
    let items = (0..10)
        .map(|i| MessageHandlerRequest::new("h", format!("item-{i}"), Value::Null, now))
        .collect();
    store.enqueue_message_handler_requests(items).await.unwrap();

    let lease = Duration::seconds(60);
    let a = store
        .lease_message_handler_requests("h", "worker-a", lease, 6, now)
        .await
        .unwrap();
    let b = store
        .lease_message_handler_requests("h", "worker-b", lease, 6, now)
        .await
        .unwrap();
    assert_eq!(a.len(), 6);
    assert_eq!(b.len(), 4);
    assert!(a.iter().all(|item| !b.iter().any(|other| other.request_id == item.request_id)));

    // re-enqueue while leased bumps the generation, so the delete misses it
    store
        .enqueue_message_handler_requests(vec![MessageHandlerRequest::new("h", "item-0", Value::Null, now)])
        .await
        .unwrap();
    let deleted = store.delete_message_handler_requests(&a).await.unwrap();
    let redo_pending = a.iter().any(|item| item.request_id == "item-0");
    assert_eq!(deleted, if redo_pending { 5 } else { 6 });
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL"]
async fn test_claims_and_cron_leases(pool: PgPool) {
    let store = PgDataStore::new(pool);
    let now = Utc::now();
    let client = ClientId::new("C.1");
    assert!(store.claim_client("hunt-1", &client, now).await.unwrap());
    assert!(!store.claim_client("hunt-1", &client, now).await.unwrap());
    assert!(store.is_client_claimed("hunt-1", &client).await.unwrap());

    store
        .write_cron_job(CronJob {
            job_id: CronJobId::new("job"),
            description: String::new(),
            action: CronAction::StartFlow {
                client_id: client.clone(),
                flow_type: "Netstat".into(),
                args: Value::Null,
            },
            frequency_secs: 60,
            lifetime_secs: None,
            allow_overruns: false,
            enabled: true,
            max_run_history: 10,
            last_run_time: None,
            last_run_status: None,
            active_runs: vec![],
            leased_until: None,
            leased_by: None,
            created_at: now,
        })
        .await
        .unwrap();

    let lease = Duration::seconds(30);
    let job_id = CronJobId::new("job");
    assert!(store.lease_cron_job(&job_id, "a", lease, now).await.unwrap().is_some());
    assert!(store.lease_cron_job(&job_id, "b", lease, now).await.unwrap().is_none());
    assert!(store.lease_cron_job(&job_id, "a", lease, now).await.unwrap().is_some());
    assert!(store
        .lease_cron_job(&job_id, "b", lease, now + Duration::seconds(31))
        .await
        .unwrap()
        .is_some());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL"]
async fn test_netstat_flow_end_to_end(pool: PgPool) {
    let store: Arc<dyn DataStore> = Arc::new(PgDataStore::new(pool));
    let transport = Arc::new(RecordingTransport::default());
    let system = OrchestrationSystem::new(
        test_config(),
        store,
        FlowRegistry::with_builtin_flows().unwrap(),
        transport.clone(),
    );

    let client = ClientId::new("C.1");
    let flow = system
        .flows()
        .start_flow(client.clone(), "Netstat", json!({}), FlowStartOptions::new("analyst"))
        .await
        .unwrap();
    let request = transport.last_to(&client).unwrap();
    let rows = response_rows(
        &request,
        vec![connection("LISTEN", 22), connection("ESTABLISHED", 443)],
        Some(Status::ok()),
    );
    system.ingestor().receive_responses(&client, rows).await.unwrap();
    system.worker().run_once().await.unwrap();

    let stored = system.flows().get_flow(&client, &flow.flow_id).await.unwrap();
    assert_eq!(stored.status, FlowStatus::Succeeded);
    assert_eq!(
        system.flows().list_flow_results(&client, &flow.flow_id).await.unwrap().len(),
        2
    );
}
