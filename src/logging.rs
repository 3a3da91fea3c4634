//! # Structured Logging Module
//!
//! Environment-aware structured logging for the coordinator. Output goes to
//! the console, as JSON when `HUNTSMAN_LOG_FORMAT=json`.

use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("RUST_LOG")
            .ok()
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var("HUNTSMAN_LOG_FORMAT").is_ok_and(|format| format == "json");

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Use try_init to avoid panic if global subscriber already set
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
pub fn get_environment() -> String {
    std::env::var("HUNTSMAN_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for flow operations
pub fn log_flow_operation(
    operation: &str,
    client_id: &str,
    flow_id: &str,
    flow_type: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        client_id = %client_id,
        flow_id = %flow_id,
        flow_type = flow_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔁 FLOW_OPERATION"
    );
}

/// Log structured data for hunt operations
pub fn log_hunt_operation(operation: &str, hunt_id: &str, state: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        hunt_id = %hunt_id,
        state = %state,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🎯 HUNT_OPERATION"
    );
}

/// Log structured data for cron operations
pub fn log_cron_operation(
    operation: &str,
    job_id: &str,
    run_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = %job_id,
        run_id = run_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "⏰ CRON_OPERATION"
    );
}

/// Log structured data for task queue operations
pub fn log_queue_operation(operation: &str, handler_name: &str, count: usize, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        handler_name = %handler_name,
        count = count,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📬 QUEUE_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
