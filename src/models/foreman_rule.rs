use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ForemanRuleId, HuntId};
use crate::rules::ClientRule;

/// What the foreman does for a client that matches a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForemanAction {
    /// Offer the client to a hunt
    StartHunt { hunt_id: HuntId },
    /// Start a standalone flow, once per client
    StartFlow {
        flow_type: String,
        #[serde(default)]
        args: Value,
    },
}

/// Expiring client-selection rule read on every agent check-in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForemanRule {
    pub rule_id: ForemanRuleId,
    pub client_rule: ClientRule,
    pub action: ForemanAction,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ForemanRule {
    pub fn for_hunt(
        hunt_id: &HuntId,
        client_rule: ClientRule,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            rule_id: ForemanRuleId::from(hunt_id),
            client_rule,
            action: ForemanAction::StartHunt {
                hunt_id: hunt_id.clone(),
            },
            created_at,
            expires_at,
        }
    }

    /// Expired rules never match and are swept by the foreman
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Claim scope used for per-client idempotency of this rule's action
    pub fn claim_scope(&self) -> String {
        match &self.action {
            ForemanAction::StartHunt { hunt_id } => hunt_id.to_string(),
            ForemanAction::StartFlow { .. } => self.rule_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let rule = ForemanRule::for_hunt(
            &HuntId::new("H1"),
            ClientRule::match_all(),
            now,
            now + Duration::hours(1),
        );
        assert!(!rule.is_expired(now));
        assert!(rule.is_expired(now + Duration::hours(1)));
        assert_eq!(rule.rule_id.as_str(), "hunt:H1");
        assert_eq!(rule.claim_scope(), "H1");
    }
}
