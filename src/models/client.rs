//! Fleet metadata reported by an agent at check-in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::ids::ClientId;

/// Well-known attribute names populated by interrogation.
pub mod attributes {
    pub const OS: &str = "os";
    pub const OS_RELEASE: &str = "os_release";
    pub const HOSTNAME: &str = "hostname";
    pub const FQDN: &str = "fqdn";
    pub const CLIENT_VERSION: &str = "client_version";
    pub const LAST_BOOT_TIME: &str = "last_boot_time";
}

/// A single client attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Integer(i64),
    Text(String),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::Integer(_) => None,
        }
    }

    /// Integer view; numeric text is accepted so agents that report
    /// versions as strings still compare.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Text(value) => value.trim().parse().ok(),
        }
    }

    /// Text view used by regex rules; integers are rendered in decimal.
    pub fn render(&self) -> String {
        match self {
            Self::Integer(value) => value.to_string(),
            Self::Text(value) => value.clone(),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Snapshot of what the coordinator knows about one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    pub last_seen: DateTime<Utc>,
}

impl ClientInfo {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            labels: BTreeSet::new(),
            attributes: BTreeMap::new(),
            last_seen: Utc::now(),
        }
    }

    pub fn with_os(self, os: &str) -> Self {
        self.with_attribute(attributes::OS, os)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn os(&self) -> Option<&str> {
        self.attributes
            .get(attributes::OS)
            .and_then(AttributeValue::as_text)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}
