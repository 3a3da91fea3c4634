//! # Orchestration Engine
//!
//! Coordinates flows, hunts, foreman rules and cron jobs across any number
//! of coordinator processes sharing one durable store.
//!
//! ## Core Components
//!
//! - **FlowRunner**: starts flows and advances them as responses arrive
//! - **ResponseIngestor**: persists agent responses and check-ins, schedules work
//! - **TaskQueue / QueueWorker**: leased at-least-once work queue and its worker loop
//! - **Foreman**: evaluates client rules on check-in
//! - **HuntCoordinator**: hunt lifecycle, admission limits and failure tracking
//! - **CronScheduler**: recurring hunts and flows with run supervision
//! - **OrchestrationSystem**: wires everything from configuration and runs the loops
//!
//! ## Data Path
//!
//! ```text
//! agent -> ResponseIngestor -> store + queue -> QueueWorker -> FlowRunner -> commit -> AgentTransport
//! ```

pub mod correlator;
pub mod cron_scheduler;
pub mod flow_runner;
pub mod foreman;
pub mod hunt_coordinator;
pub mod inbound;
pub mod system;
pub mod task_queue;
pub mod transport;

// Re-export core types and components for easy access
pub use correlator::{correlate, correlate_partial, CorrelationError, Responses};
pub use cron_scheduler::{CreateCronJob, CronScheduler, CronTickReport};
pub use flow_runner::{FlowProcessingHandler, FlowRunner, FlowStartOptions, ProcessOutcome};
pub use foreman::{CheckInReport, Foreman, ForemanCheckInHandler};
pub use hunt_coordinator::{CheckInOutcome, HuntCoordinator, HuntOutcomeRecorder};
pub use inbound::{IngestReport, ResponseIngestor};
pub use system::{connect_store, MaintenanceReport, OrchestrationSystem};
pub use task_queue::{MessageHandler, QueueWorker, TaskQueue, WorkerCycle};
pub use transport::{AgentTransport, LoggingTransport};
