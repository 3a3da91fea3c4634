//! Identity types shared by flows, hunts, cron jobs and the task queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Agent identity, e.g. `C.1a2b3c4d5e6f7a8b`.
    ClientId
);
string_id!(
    /// Flow identity, unique per client.
    FlowId
);
string_id!(
    /// Hunt identity. Hunt-spawned flows reuse it as their flow id.
    HuntId
);
string_id!(
    /// Cron job name.
    CronJobId
);
string_id!(CronRunId);
string_id!(
    /// Foreman rule identity: the hunt or job the rule belongs to.
    ForemanRuleId
);

/// Monotonic per-flow outgoing request number, starting at 1.
pub type RequestId = u64;

/// Agent-assigned response number within one request.
pub type ResponseId = u64;

fn random_hex(len: usize) -> String {
    Uuid::new_v4().simple().to_string()[..len].to_uppercase()
}

impl FlowId {
    pub fn random() -> Self {
        Self(random_hex(8))
    }
}

impl HuntId {
    pub fn random() -> Self {
        Self(random_hex(8))
    }
}

impl CronRunId {
    pub fn random() -> Self {
        Self(random_hex(8))
    }
}

impl From<&HuntId> for FlowId {
    fn from(hunt_id: &HuntId) -> Self {
        FlowId(hunt_id.0.clone())
    }
}

impl From<&HuntId> for ForemanRuleId {
    fn from(hunt_id: &HuntId) -> Self {
        ForemanRuleId(format!("hunt:{}", hunt_id.0))
    }
}
