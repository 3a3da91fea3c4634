//! # Orchestration System
//!
//! Wires the orchestration components from a [`HuntsmanConfig`] and runs
//! the background loops of one coordinator process:
//!
//! - the queue worker (flow processing and foreman check-ins)
//! - the cron tick
//! - maintenance: expired rules, expired hunts, overdue flows, run history
//!
//! Any number of coordinators may run against the same durable store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use super::cron_scheduler::CronScheduler;
use super::flow_runner::{FlowProcessingHandler, FlowRunner};
use super::foreman::{Foreman, ForemanCheckInHandler};
use super::hunt_coordinator::HuntCoordinator;
use super::inbound::ResponseIngestor;
use super::task_queue::{QueueWorker, TaskQueue};
use super::transport::AgentTransport;
use crate::config::HuntsmanConfig;
use crate::database::{DataStore, InMemoryDataStore, PgDataStore};
use crate::error::Result;
use crate::events::EventPublisher;
use crate::flows::FlowRegistry;

/// Counters of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rules_removed: usize,
    pub hunts_expired: usize,
    pub flows_overdue: usize,
    pub runs_trimmed: usize,
}

/// Durable store selected by `database.url`; in-memory when unset
pub async fn connect_store(config: &HuntsmanConfig) -> Result<Arc<dyn DataStore>> {
    match &config.database.url {
        Some(url) => {
            let store = PgDataStore::connect(url, config.database.max_connections).await?;
            info!("Using PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database URL configured; state will not survive restarts");
            Ok(Arc::new(InMemoryDataStore::new()))
        }
    }
}

pub struct OrchestrationSystem {
    config: HuntsmanConfig,
    store: Arc<dyn DataStore>,
    events: EventPublisher,
    queue: Arc<TaskQueue>,
    runner: Arc<FlowRunner>,
    hunts: Arc<HuntCoordinator>,
    foreman: Arc<Foreman>,
    cron: Arc<CronScheduler>,
    ingestor: Arc<ResponseIngestor>,
    shutdown: watch::Sender<bool>,
}

impl OrchestrationSystem {
    pub fn new(
        config: HuntsmanConfig,
        store: Arc<dyn DataStore>,
        registry: FlowRegistry,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        let events = EventPublisher::new(config.events.channel_capacity);
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            config.worker.worker_id.clone(),
            config.worker.lease_duration(),
        ));
        let runner = Arc::new(
            FlowRunner::new(
                store.clone(),
                Arc::new(registry),
                transport,
                queue.clone(),
                events.clone(),
            )
            .with_default_lifetime(config.flows.default_lifetime()),
        );
        let hunts = Arc::new(
            HuntCoordinator::new(store.clone(), runner.clone(), events.clone())
                .with_default_limits(config.hunts.default_limits()),
        );
        let foreman = Arc::new(Foreman::new(store.clone(), hunts.clone(), runner.clone()));
        let cron = Arc::new(
            CronScheduler::new(
                store.clone(),
                hunts.clone(),
                runner.clone(),
                events.clone(),
                config.worker.worker_id.clone(),
            )
            .with_lease_duration(config.cron.lease_duration())
            .with_max_run_history(config.cron.max_run_history),
        );
        let ingestor = Arc::new(ResponseIngestor::new(store.clone(), queue.clone(), events.clone()));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store,
            events,
            queue,
            runner,
            hunts,
            foreman,
            cron,
            ingestor,
            shutdown,
        }
    }

    pub fn config(&self) -> &HuntsmanConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn flows(&self) -> &Arc<FlowRunner> {
        &self.runner
    }

    pub fn hunts(&self) -> &Arc<HuntCoordinator> {
        &self.hunts
    }

    pub fn foreman(&self) -> &Arc<Foreman> {
        &self.foreman
    }

    pub fn cron(&self) -> &Arc<CronScheduler> {
        &self.cron
    }

    pub fn ingestor(&self) -> &Arc<ResponseIngestor> {
        &self.ingestor
    }

    /// Queue worker serving both built-in handlers
    pub fn worker(&self) -> QueueWorker {
        QueueWorker::new(self.queue.clone(), self.config.worker.batch_size)
            .with_handler(Arc::new(FlowProcessingHandler::new(self.runner.clone())))
            .with_handler(Arc::new(ForemanCheckInHandler::new(self.foreman.clone())))
    }

    pub async fn run_maintenance_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        Ok(MaintenanceReport {
            rules_removed: self.foreman.remove_expired_rules(now).await?,
            hunts_expired: self.hunts.expire_hunts(now).await?,
            flows_overdue: self
                .runner
                .enqueue_overdue_flows(now, self.config.flows.deadline_sweep_limit)
                .await?,
            runs_trimmed: self.cron.trim_history().await?,
        })
    }

    /// Run every loop until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) {
        info!(
            worker_id = %self.config.worker.worker_id,
            cron_enabled = self.config.cron.enabled,
            "🚀 Starting orchestration system"
        );
        let worker = self.worker();
        tokio::join!(
            worker.run(self.config.worker.poll_interval(), self.shutdown.subscribe()),
            self.cron_loop(self.shutdown.subscribe()),
            self.maintenance_loop(self.shutdown.subscribe()),
        );
        info!("Orchestration system stopped");
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.send_replace(true);
    }

    async fn cron_loop(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.cron.enabled {
            info!("Cron scheduler disabled");
            return;
        }
        let mut interval = tokio::time::interval(self.config.cron.tick_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.cron.tick(Utc::now()).await {
                        warn!(error = %e, "Cron tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn maintenance_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.foreman.sweep_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_maintenance_once(Utc::now()).await {
                        Ok(report) if report != MaintenanceReport::default() => {
                            info!(?report, "Maintenance pass");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Maintenance pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientInfo, ForemanAction, ForemanRule, ForemanRuleId};
    use crate::orchestration::transport::LoggingTransport;
    use crate::rules::ClientRule;
    use crate::state_machine::FlowStatus;
    use chrono::Duration;
    use serde_json::json;

    fn system() -> OrchestrationSystem {
        OrchestrationSystem::new(
            HuntsmanConfig::default(),
            Arc::new(InMemoryDataStore::new()),
            FlowRegistry::with_builtin_flows().unwrap(),
            Arc::new(LoggingTransport),
        )
    }

    #[tokio::test]
    async fn test_check_in_flows_through_worker() {
        let system = system();
        let now = Utc::now();
        system
            .foreman()
            .add_rule(ForemanRule {
                rule_id: ForemanRuleId::new("interrogate-all"),
                client_rule: ClientRule::match_all(),
                action: ForemanAction::StartFlow {
                    flow_type: "Interrogate".into(),
                    args: json!({}),
                },
                created_at: now,
                expires_at: now + Duration::hours(1),
            })
            .await
            .unwrap();

        system.ingestor().check_in(ClientInfo::new("C.1")).await.unwrap();
        let cycle = system.worker().run_once().await.unwrap();
        assert_eq!(cycle.processed, 1);

        let flow = system
            .flows()
            .get_flow_status(&"C.1".into(), &"R-interrogate-all".into())
            .await
            .unwrap();
        assert_eq!(flow.status, FlowStatus::Running);
        assert_eq!(flow.outstanding_requests, 2);
    }

    #[tokio::test]
    async fn test_maintenance_on_empty_store_is_quiet() {
        let system = system();
        let report = system.run_maintenance_once(Utc::now()).await.unwrap();
        assert_eq!(report, MaintenanceReport::default());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let system = Arc::new(system());
        let running = {
            let system = system.clone();
            tokio::spawn(async move { system.run().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        system.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }
}
