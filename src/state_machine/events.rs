use serde::{Deserialize, Serialize};

/// Events that can trigger flow status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FlowEvent {
    /// All requests answered and handled
    Complete,
    /// Handler reported a failure, or the flow was stopped / timed out
    Fail(String),
    /// Internal error or handler panic
    Crash(String),
}

impl FlowEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Crash(_) => "crash",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) | Self::Crash(msg) => Some(msg),
            Self::Complete => None,
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}

/// Events that can trigger hunt lifecycle transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum HuntEvent {
    /// Start a freshly created hunt or resume a paused one
    Start,
    /// Operator pause
    Pause,
    /// Failure-ratio breach
    AutoPause(String),
    /// Operator stop or crash limit
    Stop(String),
    /// Expiry
    Complete,
}

impl HuntEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::AutoPause(_) => "auto_pause",
            Self::Stop(_) => "stop",
            Self::Complete => "complete",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::AutoPause(reason) | Self::Stop(reason) => Some(reason),
            _ => None,
        }
    }
}
