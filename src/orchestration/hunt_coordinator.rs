//! # Hunt Coordinator
//!
//! Owns the hunt lifecycle and fan-out. A started hunt is represented to
//! the foreman by a [`ForemanRule`]; every matching check-in is offered to
//! [`HuntCoordinator::on_client_check_in`], which admits the client against
//! the hunt's limits, claims it, and starts the hunt's flow on it.
//!
//! Per-client idempotency rests on the claim table: a client is claimed
//! once per hunt and every hunt flow uses the flow id derived from the hunt
//! id, so repeated check-ins never start a second flow.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::flow_runner::{FlowRunner, FlowStartOptions};
use crate::constants::events;
use crate::database::{Captured, DataStore};
use crate::error::{HuntsmanError, Result};
use crate::events::EventPublisher;
use crate::logging::{log_error, log_hunt_operation};
use crate::models::{
    Admission, ClientId, ClientInfo, Flow, FlowId, FlowResult, FlowStatusReport, ForemanRule,
    ForemanRuleId, Hunt, HuntAction, HuntId, HuntLimits, HuntTemplate,
};
use crate::rules::ClientRule;
use crate::state_machine::{hunt_state_machine, HuntEvent, HuntState, StateMachineError};

/// Result of offering a client to a hunt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInOutcome {
    /// The hunt's flow was started on the client
    Started(FlowId),
    /// The client was already claimed by this hunt
    AlreadyProcessed,
    Inactive(HuntState),
    Expired,
    NotMatched,
    /// The hunt is at a limit; the client may be admitted on a later check-in
    Deferred(Admission),
    NotFound,
}

/// Apply a validated transition to a hunt record
fn apply_hunt_event(hunt: &mut Hunt, target: HuntState, event: &HuntEvent, now: DateTime<Utc>) {
    hunt.state = target;
    hunt.state_reason = event.reason().map(str::to_string);
    if matches!(event, HuntEvent::Start) && hunt.started_at.is_none() {
        hunt.started_at = Some(now);
        hunt.expires_at = Some(now + Duration::seconds(hunt.limits.expiry_secs as i64));
    }
    hunt.last_update = now;
}

fn hunt_context(hunt: &Hunt) -> serde_json::Value {
    json!({
        "hunt_id": hunt.hunt_id,
        "state": hunt.state,
        "reason": hunt.state_reason,
        "flow_type": hunt.action.flow_type,
    })
}

/// Folds terminal flow outcomes into the parent hunt's counters and
/// enforces the failure limits
#[derive(Clone)]
pub struct HuntOutcomeRecorder {
    store: Arc<dyn DataStore>,
    events: EventPublisher,
}

impl HuntOutcomeRecorder {
    pub fn new(store: Arc<dyn DataStore>, events: EventPublisher) -> Self {
        Self { store, events }
    }

    /// Record a flow that just reached a terminal status. Flows without a
    /// parent hunt, and flows of a stopped hunt, are ignored.
    pub async fn record(&self, flow: &Flow, now: DateTime<Utc>) -> Result<()> {
        let Some(hunt_id) = flow.parent_hunt_id.clone() else {
            return Ok(());
        };
        let status = flow.status;
        let results = flow.num_replies_sent;
        let change = Captured::new();
        let slot = change.clone();

        let hunt = self
            .store
            .update_hunt(
                &hunt_id,
                Box::new(move |hunt: &mut Hunt| {
                    if hunt.state == HuntState::Stopped {
                        return false;
                    }
                    hunt.record_outcome(status, results, now);
                    if hunt.state == HuntState::Started {
                        let event = hunt
                            .crash_limit_breach()
                            .map(HuntEvent::Stop)
                            .or_else(|| hunt.failure_ratio_breach().map(HuntEvent::AutoPause));
                        if let Some(event) = event {
                            if let Ok(target) = hunt_state_machine::determine_target_state(hunt.state, &event) {
                                apply_hunt_event(hunt, target, &event, now);
                                slot.set(event);
                            }
                        }
                    }
                    true
                }),
            )
            .await?;

        let Some(hunt) = hunt else {
            debug!(hunt_id = %hunt_id, "Parent hunt no longer exists");
            return Ok(());
        };

        match change.take() {
            Some(HuntEvent::Stop(reason)) => {
                self.store
                    .remove_foreman_rule(&ForemanRuleId::from(&hunt_id))
                    .await?;
                warn!(hunt_id = %hunt_id, reason = %reason, "Hunt stopped by crash limit");
                self.events.publish(events::HUNT_STOPPED, hunt_context(&hunt));
                log_hunt_operation("stop", hunt_id.as_str(), &hunt.state.to_string(), Some(&reason));
            }
            Some(HuntEvent::AutoPause(reason)) => {
                warn!(hunt_id = %hunt_id, reason = %reason, "Hunt auto-paused");
                self.events.publish(events::HUNT_AUTO_PAUSED, hunt_context(&hunt));
                log_hunt_operation("auto_pause", hunt_id.as_str(), &hunt.state.to_string(), Some(&reason));
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct HuntCoordinator {
    store: Arc<dyn DataStore>,
    runner: Arc<FlowRunner>,
    events: EventPublisher,
    default_limits: HuntLimits,
}

impl HuntCoordinator {
    pub fn new(store: Arc<dyn DataStore>, runner: Arc<FlowRunner>, events: EventPublisher) -> Self {
        Self {
            store,
            runner,
            events,
            default_limits: HuntLimits::default(),
        }
    }

    pub fn with_default_limits(mut self, limits: HuntLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Template carrying the configured default limits
    pub fn template(
        &self,
        description: impl Into<String>,
        client_rule: ClientRule,
        action: HuntAction,
    ) -> HuntTemplate {
        HuntTemplate {
            description: description.into(),
            client_rule,
            action,
            limits: self.default_limits.clone(),
        }
    }

    /// Validate and persist a new hunt in `Paused`
    #[instrument(skip(self, template), fields(flow_type = %template.action.flow_type))]
    pub async fn create_hunt(&self, template: HuntTemplate, creator: &str) -> Result<Hunt> {
        template.client_rule.validate()?;
        self.runner
            .validate_flow(&template.action.flow_type, &template.action.flow_args)?;
        if let Some(ratio) = template.limits.max_failure_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(HuntsmanError::ValidationError(format!(
                    "max_failure_ratio {ratio} must be within [0, 1]"
                )));
            }
        }
        if template.limits.expiry_secs == 0 {
            return Err(HuntsmanError::ValidationError(
                "expiry_secs must be greater than 0".to_string(),
            ));
        }

        let hunt = Hunt::new(
            template.description,
            creator,
            template.client_rule,
            template.action,
            template.limits,
            Utc::now(),
        );
        self.store.write_hunt(hunt.clone()).await?;

        self.events.publish(events::HUNT_CREATED, hunt_context(&hunt));
        log_hunt_operation("create", hunt.hunt_id.as_str(), &hunt.state.to_string(), None);
        Ok(hunt)
    }

    /// Start a new hunt or resume a paused one and publish its rule
    pub async fn start_hunt(&self, hunt_id: &HuntId) -> Result<Hunt> {
        let now = Utc::now();
        let current = self.get_hunt(hunt_id).await?;
        if current.is_expired(now) {
            return Err(HuntsmanError::ValidationError(format!(
                "hunt {hunt_id} expired at {}",
                current.expires_at.unwrap_or(now)
            )));
        }

        let hunt = self.transition(hunt_id, HuntEvent::Start, now).await?;
        let expires_at = hunt
            .expires_at
            .unwrap_or(now + Duration::seconds(hunt.limits.expiry_secs as i64));
        self.store
            .write_foreman_rule(ForemanRule::for_hunt(
                &hunt.hunt_id,
                hunt.client_rule.clone(),
                now,
                expires_at,
            ))
            .await?;

        info!(hunt_id = %hunt_id, expires_at = %expires_at, "Hunt started");
        self.events.publish(events::HUNT_STARTED, hunt_context(&hunt));
        log_hunt_operation("start", hunt_id.as_str(), &hunt.state.to_string(), None);
        Ok(hunt)
    }

    pub async fn resume_hunt(&self, hunt_id: &HuntId) -> Result<Hunt> {
        self.start_hunt(hunt_id).await
    }

    /// Pause admission; the rule stays so resuming needs no re-publication
    pub async fn pause_hunt(&self, hunt_id: &HuntId) -> Result<Hunt> {
        let hunt = self.transition(hunt_id, HuntEvent::Pause, Utc::now()).await?;
        self.events.publish(events::HUNT_PAUSED, hunt_context(&hunt));
        log_hunt_operation("pause", hunt_id.as_str(), &hunt.state.to_string(), None);
        Ok(hunt)
    }

    /// Stop for good. Running hunt flows are queued so their next pass
    /// ends them without delivering further results.
    pub async fn stop_hunt(&self, hunt_id: &HuntId, reason: &str) -> Result<Hunt> {
        let hunt = self
            .transition(hunt_id, HuntEvent::Stop(reason.to_string()), Utc::now())
            .await?;
        self.store
            .remove_foreman_rule(&ForemanRuleId::from(hunt_id))
            .await?;
        for flow in self.store.list_flows_for_hunt(hunt_id).await? {
            if flow.is_running() {
                self.runner
                    .enqueue_processing(&flow.client_id, &flow.flow_id)
                    .await?;
            }
        }
        self.events.publish(events::HUNT_STOPPED, hunt_context(&hunt));
        log_hunt_operation("stop", hunt_id.as_str(), &hunt.state.to_string(), Some(reason));
        Ok(hunt)
    }

    /// Complete every hunt past its expiry; returns how many were completed
    pub async fn expire_hunts(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for hunt in self.store.list_hunts().await? {
            if hunt.state.is_terminal() || !hunt.is_expired(now) {
                continue;
            }
            match self.transition(&hunt.hunt_id, HuntEvent::Complete, now).await {
                Ok(hunt) => {
                    self.store
                        .remove_foreman_rule(&ForemanRuleId::from(&hunt.hunt_id))
                        .await?;
                    self.events.publish(events::HUNT_COMPLETED, hunt_context(&hunt));
                    log_hunt_operation("expire", hunt.hunt_id.as_str(), &hunt.state.to_string(), None);
                    expired += 1;
                }
                Err(e) => log_error(
                    "hunt_coordinator",
                    "expire_hunts",
                    &e.to_string(),
                    Some(hunt.hunt_id.as_str()),
                ),
            }
        }
        Ok(expired)
    }

    pub async fn get_hunt(&self, hunt_id: &HuntId) -> Result<Hunt> {
        self.store
            .read_hunt(hunt_id)
            .await?
            .ok_or_else(|| HuntsmanError::NotFound(format!("hunt {hunt_id}")))
    }

    pub async fn list_hunts(&self) -> Result<Vec<Hunt>> {
        self.store.list_hunts().await
    }

    pub async fn list_hunt_flows(&self, hunt_id: &HuntId) -> Result<Vec<FlowStatusReport>> {
        Ok(self
            .store
            .list_flows_for_hunt(hunt_id)
            .await?
            .iter()
            .map(FlowStatusReport::from)
            .collect())
    }

    pub async fn list_hunt_results(
        &self,
        hunt_id: &HuntId,
        offset: usize,
        count: usize,
    ) -> Result<Vec<FlowResult>> {
        self.store.read_hunt_results(hunt_id, offset, count).await
    }

    /// Offer a checked-in client to a hunt
    #[instrument(skip(self, client), fields(client_id = %client.client_id))]
    pub async fn on_client_check_in(
        &self,
        hunt_id: &HuntId,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<CheckInOutcome> {
        let Some(hunt) = self.store.read_hunt(hunt_id).await? else {
            return Ok(CheckInOutcome::NotFound);
        };
        if hunt.state != HuntState::Started {
            return Ok(CheckInOutcome::Inactive(hunt.state));
        }
        if hunt.is_expired(now) {
            return Ok(CheckInOutcome::Expired);
        }
        if !hunt.client_rule.matches(client) {
            return Ok(CheckInOutcome::NotMatched);
        }

        let scope = hunt_id.to_string();
        if self.store.is_client_claimed(&scope, &client.client_id).await? {
            // a worker may have died between claim and flow creation
            if self
                .store
                .read_flow(&client.client_id, &FlowId::from(hunt_id))
                .await?
                .is_none()
            {
                debug!(hunt_id = %hunt_id, "Claimed client has no hunt flow; starting it");
                self.start_hunt_flow(&hunt, &client.client_id, now).await?;
            }
            return Ok(CheckInOutcome::AlreadyProcessed);
        }

        let admission = Captured::new();
        let slot = admission.clone();
        let Some(hunt) = self
            .store
            .update_hunt(
                hunt_id,
                Box::new(move |hunt: &mut Hunt| {
                    if hunt.state != HuntState::Started {
                        return false;
                    }
                    let outcome = hunt.admit_client(now);
                    slot.set(outcome);
                    outcome.is_admitted()
                }),
            )
            .await?
        else {
            return Ok(CheckInOutcome::NotFound);
        };
        match admission.take() {
            None => return Ok(CheckInOutcome::Inactive(hunt.state)),
            Some(outcome) if !outcome.is_admitted() => {
                debug!(hunt_id = %hunt_id, ?outcome, "Client deferred by hunt limits");
                return Ok(CheckInOutcome::Deferred(outcome));
            }
            Some(_) => {}
        }

        // the admission is only kept once the claim is ours
        match self.store.claim_client(&scope, &client.client_id, now).await {
            Ok(true) => {}
            Ok(false) => {
                self.revoke_admission(hunt_id, now).await?;
                return Ok(CheckInOutcome::AlreadyProcessed);
            }
            Err(e) => {
                if let Err(revoke) = self.revoke_admission(hunt_id, now).await {
                    log_error(
                        "hunt_coordinator",
                        "revoke_admission",
                        &revoke.to_string(),
                        Some(hunt_id.as_str()),
                    );
                }
                return Err(e);
            }
        }

        let flow = self.start_hunt_flow(&hunt, &client.client_id, now).await?;
        Ok(CheckInOutcome::Started(flow.flow_id))
    }

    async fn revoke_admission(&self, hunt_id: &HuntId, now: DateTime<Utc>) -> Result<()> {
        self.store
            .update_hunt(
                hunt_id,
                Box::new(move |hunt: &mut Hunt| {
                    hunt.revoke_admission(now);
                    true
                }),
            )
            .await?;
        Ok(())
    }

    async fn start_hunt_flow(&self, hunt: &Hunt, client_id: &ClientId, now: DateTime<Utc>) -> Result<Flow> {
        let options = FlowStartOptions::new(hunt.creator.clone())
            .with_flow_id(FlowId::from(&hunt.hunt_id))
            .with_parent_hunt(hunt.hunt_id.clone())
            .with_deadline(hunt.flow_deadline(now));
        self.runner
            .start_flow(
                client_id.clone(),
                &hunt.action.flow_type,
                hunt.action.flow_args.clone(),
                options,
            )
            .await
    }

    async fn transition(&self, hunt_id: &HuntId, event: HuntEvent, now: DateTime<Utc>) -> Result<Hunt> {
        let rejected: Captured<StateMachineError> = Captured::new();
        let slot = rejected.clone();
        let hunt = self
            .store
            .update_hunt(
                hunt_id,
                Box::new(move |hunt: &mut Hunt| {
                    match hunt_state_machine::determine_target_state(hunt.state, &event) {
                        Ok(target) => {
                            apply_hunt_event(hunt, target, &event, now);
                            true
                        }
                        Err(e) => {
                            slot.set(e);
                            false
                        }
                    }
                }),
            )
            .await?
            .ok_or_else(|| HuntsmanError::NotFound(format!("hunt {hunt_id}")))?;
        match rejected.take() {
            Some(err) => Err(err.into()),
            None => Ok(hunt),
        }
    }
}
