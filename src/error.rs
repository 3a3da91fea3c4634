use thiserror::Error;

/// Top-level error type for the orchestration core.
///
/// Flow-local failures never surface through this type; they are carried by
/// [`crate::flows::FlowError`] and recorded on the flow itself.
#[derive(Debug, Error)]
pub enum HuntsmanError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Concurrent modification detected for {entity}")]
    ConcurrentModification { entity: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State transition error: {0}")]
    StateTransitionError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Unknown flow type: {0}")]
    UnknownFlowType(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Orchestration error: {0}")]
    OrchestrationError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HuntsmanError {
    /// Whether the operation can be retried on the next tick without
    /// operator involvement (lease contention, lost CAS, flaky store).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::DatabaseError(_)
        )
    }

    pub fn concurrent_modification(entity: impl Into<String>) -> Self {
        Self::ConcurrentModification {
            entity: entity.into(),
        }
    }
}

impl From<sqlx::Error> for HuntsmanError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // 40001 serialization_failure, 40P01 deadlock_detected
            if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
                return Self::concurrent_modification(db_err.message().to_string());
            }
        }
        Self::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for HuntsmanError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::DatabaseError(format!("migration failed: {err}"))
    }
}

impl From<crate::state_machine::StateMachineError> for HuntsmanError {
    fn from(err: crate::state_machine::StateMachineError) -> Self {
        Self::StateTransitionError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HuntsmanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(HuntsmanError::concurrent_modification("flow C.1/F:1").is_retryable());
        assert!(HuntsmanError::DatabaseError("connection reset".into()).is_retryable());
        assert!(!HuntsmanError::ValidationError("bad rule".into()).is_retryable());
        assert!(!HuntsmanError::UnknownFlowType("Nope".into()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = HuntsmanError::NotFound("hunt H:1234".into());
        assert_eq!(err.to_string(), "Not found: hunt H:1234");

        let err = HuntsmanError::concurrent_modification("cron job daily");
        assert_eq!(
            err.to_string(),
            "Concurrent modification detected for cron job daily"
        );
    }
}
