//! # Foreman
//!
//! Evaluates the active [`ForemanRule`]s against a client each time it
//! checks in and dispatches the matching actions. Every action is
//! idempotent per `(rule, client)`, so a check-in redelivered by the queue
//! never starts duplicate work.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::flow_runner::{FlowRunner, FlowStartOptions};
use super::hunt_coordinator::{CheckInOutcome, HuntCoordinator};
use super::task_queue::MessageHandler;
use crate::constants::handlers;
use crate::database::DataStore;
use crate::error::{HuntsmanError, Result};
use crate::logging::log_error;
use crate::models::{ClientId, ClientInfo, FlowId, ForemanAction, ForemanRule, MessageHandlerRequest};

/// What happened for each rule that matched a check-in
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckInReport {
    pub rules_evaluated: usize,
    pub rules_matched: usize,
    pub flows_started: Vec<FlowId>,
    pub errors: usize,
}

pub struct Foreman {
    store: Arc<dyn DataStore>,
    hunts: Arc<HuntCoordinator>,
    runner: Arc<FlowRunner>,
}

impl Foreman {
    pub fn new(store: Arc<dyn DataStore>, hunts: Arc<HuntCoordinator>, runner: Arc<FlowRunner>) -> Self {
        Self { store, hunts, runner }
    }

    /// Publish a standalone rule; hunts publish their own through the
    /// [`HuntCoordinator`]
    pub async fn add_rule(&self, rule: ForemanRule) -> Result<()> {
        rule.client_rule.validate()?;
        if let ForemanAction::StartFlow { flow_type, args } = &rule.action {
            self.runner.validate_flow(flow_type, args)?;
        }
        self.store.write_foreman_rule(rule).await
    }

    pub async fn list_rules(&self) -> Result<Vec<ForemanRule>> {
        self.store.read_all_foreman_rules().await
    }

    /// Evaluate every live rule against the client's stored info.
    ///
    /// Failures are isolated per rule. The call fails only when a rule hit
    /// a retryable error, so the queue redelivers the check-in.
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn check_in(&self, client_id: &ClientId) -> Result<CheckInReport> {
        let Some(client) = self.store.read_client_info(client_id).await? else {
            debug!("Check-in for client without stored info");
            return Ok(CheckInReport::default());
        };
        let now = Utc::now();
        let rules = self.store.read_all_foreman_rules().await?;

        let mut report = CheckInReport::default();
        let mut retry: Option<HuntsmanError> = None;
        for rule in rules.iter().filter(|rule| !rule.is_expired(now)) {
            report.rules_evaluated += 1;
            if !rule.client_rule.matches(&client) {
                continue;
            }
            report.rules_matched += 1;
            match self.dispatch(rule, &client, now).await {
                Ok(Some(flow_id)) => report.flows_started.push(flow_id),
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    log_error("foreman", "dispatch", &e.to_string(), Some(rule.rule_id.as_str()));
                    if e.is_retryable() {
                        retry = Some(e);
                    }
                }
            }
        }

        if !report.flows_started.is_empty() {
            info!(flows_started = report.flows_started.len(), "Foreman started flows");
        }
        match retry {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn dispatch(
        &self,
        rule: &ForemanRule,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<Option<FlowId>> {
        match &rule.action {
            ForemanAction::StartHunt { hunt_id } => {
                match self.hunts.on_client_check_in(hunt_id, client, now).await? {
                    CheckInOutcome::Started(flow_id) => Ok(Some(flow_id)),
                    outcome => {
                        debug!(hunt_id = %hunt_id, ?outcome, "Hunt did not start a flow");
                        Ok(None)
                    }
                }
            }
            ForemanAction::StartFlow { flow_type, args } => {
                let flow_id = FlowId::new(format!("R-{}", rule.rule_id));
                if !self
                    .store
                    .claim_client(&rule.claim_scope(), &client.client_id, now)
                    .await?
                {
                    // claimed earlier; repair a start lost to a crash
                    if self.store.read_flow(&client.client_id, &flow_id).await?.is_some() {
                        return Ok(None);
                    }
                }
                let options = FlowStartOptions::new(format!("foreman:{}", rule.rule_id))
                    .with_flow_id(flow_id);
                let flow = self
                    .runner
                    .start_flow(client.client_id.clone(), flow_type, args.clone(), options)
                    .await?;
                Ok(Some(flow.flow_id))
            }
        }
    }

    /// Drop rules past their expiry
    pub async fn remove_expired_rules(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.remove_expired_foreman_rules(now).await?;
        if removed > 0 {
            info!(removed, "Removed expired foreman rules");
        }
        Ok(removed)
    }
}

/// Queue handler for check-ins; the item's `request_id` is the client id
pub struct ForemanCheckInHandler {
    foreman: Arc<Foreman>,
}

impl ForemanCheckInHandler {
    pub fn new(foreman: Arc<Foreman>) -> Self {
        Self { foreman }
    }
}

#[async_trait]
impl MessageHandler for ForemanCheckInHandler {
    fn handler_name(&self) -> &'static str {
        handlers::FOREMAN_CHECK_IN
    }

    async fn process(&self, item: &MessageHandlerRequest) -> Result<()> {
        if item.payload != Value::Null {
            warn!(request_id = %item.request_id, "Ignoring unexpected check-in payload");
        }
        let client_id = ClientId::new(item.request_id.clone());
        self.foreman.check_in(&client_id).await.map(|_| ())
    }
}
