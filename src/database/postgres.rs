//! PostgreSQL [`DataStore`](super::DataStore) built on SQLx.
//!
//! Entities are stored as JSONB documents next to the handful of columns
//! the queries filter on. Read-modify-write runs inside a transaction
//! holding `SELECT ... FOR UPDATE`; the task queue leases with
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never block each other
//! and never receive the same row.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info, instrument};

use super::{
    ClientStore, CronJobStore, FlowStore, ForemanRuleStore, HuntStore, MessageHandlerStore,
    Mutator,
};
use crate::error::{HuntsmanError, Result};
use crate::models::{
    ClientId, ClientInfo, CronJob, CronJobId, CronJobRun, CronRunId, Flow, FlowCommit, FlowId,
    FlowRequest, FlowResponse, FlowResult, ForemanRule, ForemanRuleId, Hunt, HuntId,
    MessageHandlerRequest, RequestId, RequestWithResponses,
};

pub struct PgDataStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct MessageHandlerRow {
    handler_name: String,
    request_id: String,
    payload: Value,
    generation: i64,
    created_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
    leased_by: Option<String>,
}

impl From<MessageHandlerRow> for MessageHandlerRequest {
    fn from(row: MessageHandlerRow) -> Self {
        Self {
            handler_name: row.handler_name,
            request_id: row.request_id,
            payload: row.payload,
            generation: row.generation.max(0) as u64,
            created_at: row.created_at,
            leased_until: row.leased_until,
            leased_by: row.leased_by,
        }
    }
}

impl PgDataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        info!(max_connections, "Connected to PostgreSQL data store");
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<bool> {
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}

fn sql_id(id: u64) -> i64 {
    id as i64
}

async fn fetch_for_update<T: DeserializeOwned + Send + Unpin + 'static>(
    conn: &mut PgConnection,
    sql: &str,
    key: &str,
) -> Result<Option<T>> {
    let document: Option<Json<T>> = sqlx::query_scalar(sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(document.map(|Json(value)| value))
}

async fn upsert_flow_row(conn: &mut PgConnection, flow: &Flow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO flows (client_id, flow_id, flow_type, status, parent_hunt_id, deadline,
                           version, document, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (client_id, flow_id) DO UPDATE
        SET status = EXCLUDED.status,
            deadline = EXCLUDED.deadline,
            version = EXCLUDED.version,
            document = EXCLUDED.document,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(flow.client_id.as_str())
    .bind(flow.flow_id.as_str())
    .bind(&flow.flow_type)
    .bind(flow.status.to_string())
    .bind(flow.parent_hunt_id.as_ref().map(|id| id.as_str()))
    .bind(flow.deadline)
    .bind(sql_id(flow.version))
    .bind(Json(flow))
    .bind(flow.created_at)
    .bind(flow.last_update)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_requests(conn: &mut PgConnection, requests: &[FlowRequest]) -> Result<()> {
    for request in requests {
        sqlx::query(
            r#"
            INSERT INTO flow_requests (client_id, flow_id, request_id, document)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (client_id, flow_id, request_id) DO UPDATE
            SET document = EXCLUDED.document
            "#,
        )
        .bind(request.client_id.as_str())
        .bind(request.flow_id.as_str())
        .bind(sql_id(request.request_id))
        .bind(Json(request))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_results(conn: &mut PgConnection, results: &[FlowResult]) -> Result<()> {
    for result in results {
        sqlx::query(
            r#"
            INSERT INTO flow_results (client_id, flow_id, hunt_id, document, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(result.client_id.as_str())
        .bind(result.flow_id.as_str())
        .bind(result.hunt_id.as_ref().map(|id| id.as_str()))
        .bind(Json(result))
        .bind(result.timestamp)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn delete_request_rows(
    conn: &mut PgConnection,
    client_id: &ClientId,
    flow_id: &FlowId,
    request_id: Option<RequestId>,
) -> Result<()> {
    let request_id = request_id.map(sql_id);
    sqlx::query(
        "DELETE FROM flow_responses
         WHERE client_id = $1 AND flow_id = $2 AND ($3::BIGINT IS NULL OR request_id = $3)",
    )
    .bind(client_id.as_str())
    .bind(flow_id.as_str())
    .bind(request_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "DELETE FROM flow_requests
         WHERE client_id = $1 AND flow_id = $2 AND ($3::BIGINT IS NULL OR request_id = $3)",
    )
    .bind(client_id.as_str())
    .bind(flow_id.as_str())
    .bind(request_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn documents<T>(rows: Vec<Json<T>>) -> Vec<T> {
    rows.into_iter().map(|Json(value)| value).collect()
}

fn json_document<T: Serialize>(value: &T) -> Json<&T> {
    Json(value)
}

#[async_trait]
impl FlowStore for PgDataStore {
    #[instrument(skip_all, fields(flow = %flow.urn()))]
    async fn create_flow(
        &self,
        flow: Flow,
        requests: Vec<FlowRequest>,
        results: Vec<FlowResult>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO flows (client_id, flow_id, flow_type, status, parent_hunt_id, deadline,
                               version, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (client_id, flow_id) DO NOTHING
            "#,
        )
        .bind(flow.client_id.as_str())
        .bind(flow.flow_id.as_str())
        .bind(&flow.flow_type)
        .bind(flow.status.to_string())
        .bind(flow.parent_hunt_id.as_ref().map(|id| id.as_str()))
        .bind(flow.deadline)
        .bind(sql_id(flow.version))
        .bind(json_document(&flow))
        .bind(flow.created_at)
        .bind(flow.last_update)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await?;
            debug!("Flow already exists");
            return Ok(false);
        }
        upsert_requests(&mut tx, &requests).await?;
        insert_results(&mut tx, &results).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn write_flow(&self, flow: Flow) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_flow_row(&mut conn, &flow).await
    }

    async fn read_flow(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<Option<Flow>> {
        let document: Option<Json<Flow>> =
            sqlx::query_scalar("SELECT document FROM flows WHERE client_id = $1 AND flow_id = $2")
                .bind(client_id.as_str())
                .bind(flow_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(document.map(|Json(flow)| flow))
    }

    async fn update_flow(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        mutator: Mutator<Flow>,
    ) -> Result<Option<Flow>> {
        let mut tx = self.pool.begin().await?;
        let document: Option<Json<Flow>> = sqlx::query_scalar(
            "SELECT document FROM flows WHERE client_id = $1 AND flow_id = $2 FOR UPDATE",
        )
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(Json(mut flow)) = document else {
            return Ok(None);
        };
        if mutator(&mut flow) {
            flow.version += 1;
            upsert_flow_row(&mut tx, &flow).await?;
        }
        tx.commit().await?;
        Ok(Some(flow))
    }

    #[instrument(skip_all, fields(flow = %commit.flow.urn(), expected_version = commit.expected_version))]
    async fn commit_flow_transition(&self, commit: FlowCommit) -> Result<Flow> {
        let FlowCommit {
            mut flow,
            expected_version,
            new_requests,
            updated_requests,
            consumed_requests,
            results,
            purge_outstanding,
        } = commit;
        flow.version = expected_version + 1;

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE flows
            SET status = $3, deadline = $4, version = $5, document = $6, updated_at = $7
            WHERE client_id = $1 AND flow_id = $2 AND version = $8
            "#,
        )
        .bind(flow.client_id.as_str())
        .bind(flow.flow_id.as_str())
        .bind(flow.status.to_string())
        .bind(flow.deadline)
        .bind(sql_id(flow.version))
        .bind(json_document(&flow))
        .bind(flow.last_update)
        .bind(sql_id(expected_version))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return match self.read_flow(&flow.client_id, &flow.flow_id).await? {
                Some(_) => Err(HuntsmanError::concurrent_modification(flow.urn())),
                None => Err(HuntsmanError::NotFound(format!("flow {}", flow.urn()))),
            };
        }

        if purge_outstanding {
            delete_request_rows(&mut tx, &flow.client_id, &flow.flow_id, None).await?;
        } else {
            for request_id in consumed_requests {
                delete_request_rows(&mut tx, &flow.client_id, &flow.flow_id, Some(request_id))
                    .await?;
            }
        }
        upsert_requests(&mut tx, &updated_requests).await?;
        upsert_requests(&mut tx, &new_requests).await?;
        insert_results(&mut tx, &results).await?;
        tx.commit().await?;
        Ok(flow)
    }

    async fn list_flows_for_hunt(&self, hunt_id: &HuntId) -> Result<Vec<Flow>> {
        let rows: Vec<Json<Flow>> = sqlx::query_scalar(
            "SELECT document FROM flows WHERE parent_hunt_id = $1 ORDER BY client_id",
        )
        .bind(hunt_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(documents(rows))
    }

    async fn list_flows_past_deadline(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Flow>> {
        let rows: Vec<Json<Flow>> = sqlx::query_scalar(
            r#"
            SELECT document FROM flows
            WHERE status = 'running' AND deadline IS NOT NULL AND deadline <= $1
            ORDER BY deadline
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(documents(rows))
    }

    async fn write_requests(&self, requests: Vec<FlowRequest>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_requests(&mut tx, &requests).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<Option<FlowRequest>> {
        let document: Option<Json<FlowRequest>> = sqlx::query_scalar(
            "SELECT document FROM flow_requests
             WHERE client_id = $1 AND flow_id = $2 AND request_id = $3",
        )
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .bind(sql_id(request_id))
        .fetch_optional(&self.pool)
        .await?;
        Ok(document.map(|Json(request)| request))
    }

    async fn read_requests_with_responses(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> Result<Vec<RequestWithResponses>> {
        let requests: Vec<Json<FlowRequest>> = sqlx::query_scalar(
            "SELECT document FROM flow_requests
             WHERE client_id = $1 AND flow_id = $2 ORDER BY request_id",
        )
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        let responses: Vec<Json<FlowResponse>> = sqlx::query_scalar(
            "SELECT document FROM flow_responses
             WHERE client_id = $1 AND flow_id = $2 ORDER BY request_id, response_id",
        )
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut by_request: BTreeMap<RequestId, Vec<FlowResponse>> = BTreeMap::new();
        for response in documents(responses) {
            by_request
                .entry(response.request_id)
                .or_default()
                .push(response);
        }
        Ok(documents(requests)
            .into_iter()
            .map(|request| RequestWithResponses {
                responses: by_request.remove(&request.request_id).unwrap_or_default(),
                request,
            })
            .collect())
    }

    async fn read_responses_for_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<Vec<FlowResponse>> {
        let rows: Vec<Json<FlowResponse>> = sqlx::query_scalar(
            "SELECT document FROM flow_responses
             WHERE client_id = $1 AND flow_id = $2 AND request_id = $3 ORDER BY response_id",
        )
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .bind(sql_id(request_id))
        .fetch_all(&self.pool)
        .await?;
        Ok(documents(rows))
    }

    async fn delete_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        request_id: RequestId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        delete_request_rows(&mut tx, client_id, flow_id, Some(request_id)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_flow_responses(&self, responses: Vec<FlowResponse>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for response in &responses {
            written += sqlx::query(
                r#"
                INSERT INTO flow_responses (client_id, flow_id, request_id, response_id,
                                            response_type, document, received_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (client_id, flow_id, request_id, response_id) DO NOTHING
                "#,
            )
            .bind(response.client_id.as_str())
            .bind(response.flow_id.as_str())
            .bind(sql_id(response.request_id))
            .bind(sql_id(response.response_id))
            .bind(&response.response_type)
            .bind(json_document(response))
            .bind(response.received_at)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn read_flow_results(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> Result<Vec<FlowResult>> {
        let rows: Vec<Json<FlowResult>> = sqlx::query_scalar(
            "SELECT document FROM flow_results
             WHERE client_id = $1 AND flow_id = $2 ORDER BY result_id",
        )
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(documents(rows))
    }

    async fn read_hunt_results(
        &self,
        hunt_id: &HuntId,
        offset: usize,
        count: usize,
    ) -> Result<Vec<FlowResult>> {
        let rows: Vec<Json<FlowResult>> = sqlx::query_scalar(
            "SELECT document FROM flow_results
             WHERE hunt_id = $1 ORDER BY result_id OFFSET $2 LIMIT $3",
        )
        .bind(hunt_id.as_str())
        .bind(offset as i64)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(documents(rows))
    }
}

#[async_trait]
impl MessageHandlerStore for PgDataStore {
    async fn enqueue_message_handler_requests(
        &self,
        items: Vec<MessageHandlerRequest>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for item in &items {
            sqlx::query(
                r#"
                INSERT INTO message_handler_requests (handler_name, request_id, payload,
                                                      generation, created_at)
                VALUES ($1, $2, $3, 0, $4)
                ON CONFLICT (handler_name, request_id) DO UPDATE
                SET payload = EXCLUDED.payload,
                    generation = message_handler_requests.generation + 1
                "#,
            )
            .bind(&item.handler_name)
            .bind(&item.request_id)
            .bind(&item.payload)
            .bind(item.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, lease_duration, now))]
    async fn lease_message_handler_requests(
        &self,
        handler_name: &str,
        owner: &str,
        lease_duration: Duration,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageHandlerRequest>> {
        let rows = sqlx::query_as::<_, MessageHandlerRow>(
            r#"
            UPDATE message_handler_requests
            SET leased_by = $2, leased_until = $3
            WHERE (handler_name, request_id) IN (
                SELECT handler_name, request_id
                FROM message_handler_requests
                WHERE handler_name = $1
                  AND (leased_until IS NULL OR leased_until <= $4)
                ORDER BY created_at
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING handler_name, request_id, payload, generation, created_at,
                      leased_until, leased_by
            "#,
        )
        .bind(handler_name)
        .bind(owner)
        .bind(now + lease_duration)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MessageHandlerRequest::from).collect())
    }

    async fn delete_message_handler_requests(
        &self,
        items: &[MessageHandlerRequest],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for item in items {
            let deleted = sqlx::query(
                "DELETE FROM message_handler_requests
                 WHERE handler_name = $1 AND request_id = $2 AND generation = $3",
            )
            .bind(&item.handler_name)
            .bind(&item.request_id)
            .bind(sql_id(item.generation))
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if deleted == 0 {
                sqlx::query(
                    "UPDATE message_handler_requests
                     SET leased_by = NULL, leased_until = NULL
                     WHERE handler_name = $1 AND request_id = $2 AND leased_by = $3",
                )
                .bind(&item.handler_name)
                .bind(&item.request_id)
                .bind(item.leased_by.as_deref())
                .execute(&mut *tx)
                .await?;
            }
            removed += deleted as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn release_message_handler_requests(
        &self,
        items: &[MessageHandlerRequest],
        owner: &str,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut released = 0;
        for item in items {
            released += sqlx::query(
                "UPDATE message_handler_requests
                 SET leased_by = NULL, leased_until = NULL
                 WHERE handler_name = $1 AND request_id = $2 AND leased_by = $3",
            )
            .bind(&item.handler_name)
            .bind(&item.request_id)
            .bind(owner)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(released)
    }

    async fn count_message_handler_requests(&self, handler_name: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM message_handler_requests WHERE handler_name = $1",
        )
        .bind(handler_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl ForemanRuleStore for PgDataStore {
    async fn write_foreman_rule(&self, rule: ForemanRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO foreman_rules (rule_id, expires_at, document, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (rule_id) DO UPDATE
            SET expires_at = EXCLUDED.expires_at, document = EXCLUDED.document
            "#,
        )
        .bind(rule.rule_id.as_str())
        .bind(rule.expires_at)
        .bind(json_document(&rule))
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_all_foreman_rules(&self) -> Result<Vec<ForemanRule>> {
        let rows: Vec<Json<ForemanRule>> =
            sqlx::query_scalar("SELECT document FROM foreman_rules ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(documents(rows))
    }

    async fn remove_foreman_rule(&self, rule_id: &ForemanRuleId) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM foreman_rules WHERE rule_id = $1")
            .bind(rule_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    async fn remove_expired_foreman_rules(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = sqlx::query("DELETE FROM foreman_rules WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed as usize)
    }
}

async fn upsert_hunt_row(conn: &mut PgConnection, hunt: &Hunt) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO hunts (hunt_id, state, document, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (hunt_id) DO UPDATE
        SET state = EXCLUDED.state, document = EXCLUDED.document
        "#,
    )
    .bind(hunt.hunt_id.as_str())
    .bind(hunt.state.to_string())
    .bind(json_document(hunt))
    .bind(hunt.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl HuntStore for PgDataStore {
    async fn write_hunt(&self, hunt: Hunt) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_hunt_row(&mut conn, &hunt).await
    }

    async fn read_hunt(&self, hunt_id: &HuntId) -> Result<Option<Hunt>> {
        let document: Option<Json<Hunt>> =
            sqlx::query_scalar("SELECT document FROM hunts WHERE hunt_id = $1")
                .bind(hunt_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(document.map(|Json(hunt)| hunt))
    }

    async fn update_hunt(&self, hunt_id: &HuntId, mutator: Mutator<Hunt>) -> Result<Option<Hunt>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut hunt) = fetch_for_update::<Hunt>(
            &mut tx,
            "SELECT document FROM hunts WHERE hunt_id = $1 FOR UPDATE",
            hunt_id.as_str(),
        )
        .await?
        else {
            return Ok(None);
        };
        if mutator(&mut hunt) {
            upsert_hunt_row(&mut tx, &hunt).await?;
        }
        tx.commit().await?;
        Ok(Some(hunt))
    }

    async fn list_hunts(&self) -> Result<Vec<Hunt>> {
        let rows: Vec<Json<Hunt>> =
            sqlx::query_scalar("SELECT document FROM hunts ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(documents(rows))
    }
}

async fn upsert_cron_job_row(conn: &mut PgConnection, job: &CronJob) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cron_jobs (job_id, document) VALUES ($1, $2)
        ON CONFLICT (job_id) DO UPDATE SET document = EXCLUDED.document
        "#,
    )
    .bind(job.job_id.as_str())
    .bind(json_document(job))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl CronJobStore for PgDataStore {
    async fn write_cron_job(&self, job: CronJob) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_cron_job_row(&mut conn, &job).await
    }

    async fn read_cron_job(&self, job_id: &CronJobId) -> Result<Option<CronJob>> {
        let document: Option<Json<CronJob>> =
            sqlx::query_scalar("SELECT document FROM cron_jobs WHERE job_id = $1")
                .bind(job_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(document.map(|Json(job)| job))
    }

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        let rows: Vec<Json<CronJob>> =
            sqlx::query_scalar("SELECT document FROM cron_jobs ORDER BY job_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(documents(rows))
    }

    async fn delete_cron_job(&self, job_id: &CronJobId) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM cron_jobs WHERE job_id = $1")
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    async fn update_cron_job(
        &self,
        job_id: &CronJobId,
        mutator: Mutator<CronJob>,
    ) -> Result<Option<CronJob>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = fetch_for_update::<CronJob>(
            &mut tx,
            "SELECT document FROM cron_jobs WHERE job_id = $1 FOR UPDATE",
            job_id.as_str(),
        )
        .await?
        else {
            return Ok(None);
        };
        if mutator(&mut job) {
            upsert_cron_job_row(&mut tx, &job).await?;
        }
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn write_cron_job_run(&self, run: CronJobRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cron_job_runs (job_id, run_id, status, started_at, document)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id, run_id) DO UPDATE
            SET status = EXCLUDED.status, document = EXCLUDED.document
            "#,
        )
        .bind(run.job_id.as_str())
        .bind(run.run_id.as_str())
        .bind(run.status.to_string())
        .bind(run.started_at)
        .bind(json_document(&run))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_cron_job_run(
        &self,
        job_id: &CronJobId,
        run_id: &CronRunId,
    ) -> Result<Option<CronJobRun>> {
        let document: Option<Json<CronJobRun>> = sqlx::query_scalar(
            "SELECT document FROM cron_job_runs WHERE job_id = $1 AND run_id = $2",
        )
        .bind(job_id.as_str())
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(document.map(|Json(run)| run))
    }

    async fn list_cron_job_runs(&self, job_id: &CronJobId) -> Result<Vec<CronJobRun>> {
        let rows: Vec<Json<CronJobRun>> = sqlx::query_scalar(
            "SELECT document FROM cron_job_runs WHERE job_id = $1 ORDER BY started_at",
        )
        .bind(job_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(documents(rows))
    }

    async fn trim_cron_job_runs(&self, job_id: &CronJobId, keep: usize) -> Result<usize> {
        let removed = sqlx::query(
            r#"
            DELETE FROM cron_job_runs
            WHERE job_id = $1 AND run_id IN (
                SELECT run_id FROM cron_job_runs
                WHERE job_id = $1 AND status <> 'running'
                ORDER BY started_at DESC
                OFFSET $2
            )
            "#,
        )
        .bind(job_id.as_str())
        .bind(keep as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed as usize)
    }
}

#[async_trait]
impl ClientStore for PgDataStore {
    async fn write_client_info(&self, info: ClientInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clients (client_id, document, last_seen) VALUES ($1, $2, $3)
            ON CONFLICT (client_id) DO UPDATE
            SET document = EXCLUDED.document, last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(info.client_id.as_str())
        .bind(json_document(&info))
        .bind(info.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_client_info(&self, client_id: &ClientId) -> Result<Option<ClientInfo>> {
        let document: Option<Json<ClientInfo>> =
            sqlx::query_scalar("SELECT document FROM clients WHERE client_id = $1")
                .bind(client_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(document.map(|Json(info)| info))
    }

    async fn claim_client(
        &self,
        scope: &str,
        client_id: &ClientId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO client_claims (scope, client_id, claimed_at) VALUES ($1, $2, $3)
             ON CONFLICT (scope, client_id) DO NOTHING",
        )
        .bind(scope)
        .bind(client_id.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn is_client_claimed(&self, scope: &str, client_id: &ClientId) -> Result<bool> {
        let claimed: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM client_claims WHERE scope = $1 AND client_id = $2)",
        )
        .bind(scope)
        .bind(client_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(claimed)
    }
}
