//! # System Constants
//!
//! Names shared across the orchestration core: message handler names,
//! operator-visible event names and the defaults used when configuration
//! leaves a value unset.

/// Message handlers served by the task queue
pub mod handlers {
    /// Resume one flow; items are keyed `client_id/flow_id`
    pub const FLOW_PROCESSING: &str = "flow_processing";
    /// Run the foreman for a client that just checked in
    pub const FOREMAN_CHECK_IN: &str = "foreman_check_in";
}

/// Operator-visible events published on the event channel
pub mod events {
    // Hunt lifecycle events
    pub const HUNT_CREATED: &str = "hunt.created";
    pub const HUNT_STARTED: &str = "hunt.started";
    pub const HUNT_PAUSED: &str = "hunt.paused";
    pub const HUNT_AUTO_PAUSED: &str = "hunt.auto_paused";
    pub const HUNT_STOPPED: &str = "hunt.stopped";
    pub const HUNT_COMPLETED: &str = "hunt.completed";

    // Flow lifecycle events
    pub const FLOW_STARTED: &str = "flow.started";
    pub const FLOW_COMPLETED: &str = "flow.completed";
    pub const FLOW_FAILED: &str = "flow.failed";
    pub const FLOW_CRASHED: &str = "flow.crashed";
    pub const FLOW_PROTOCOL_VIOLATION: &str = "flow.protocol_violation";

    // Cron events
    pub const CRON_RUN_STARTED: &str = "cron.run_started";
    pub const CRON_RUN_FINISHED: &str = "cron.run_finished";
}

/// Defaults for values configuration leaves unset
pub mod defaults {
    pub const LEASE_DURATION_SECS: u64 = 600;
    pub const LEASE_BATCH_SIZE: usize = 50;
    pub const POLL_INTERVAL_MS: u64 = 500;
    pub const FLOW_LIFETIME_SECS: u64 = 7 * 24 * 60 * 60;
    pub const RULE_SWEEP_INTERVAL_SECS: u64 = 60;
    pub const CRON_TICK_INTERVAL_SECS: u64 = 60;
    pub const CRON_LEASE_DURATION_SECS: u64 = 10 * 60;
    pub const MAX_RUN_HISTORY: usize = 10;
    pub const EVENT_CHANNEL_CAPACITY: usize = 1000;
    pub const DEADLINE_SWEEP_LIMIT: usize = 500;
}
