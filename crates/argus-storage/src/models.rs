//! Storage-only row types. Domain records live in `argus_core`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use argus_core::{Rule, RuleKind};

/// A configuration key-value pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub key: String,
    pub value: serde_json::Value,
}

/// A rule row as persisted, with its insertion metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRule {
    pub id: i64,
    pub kind: RuleKind,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl StoredRule {
    pub fn rule(&self) -> Rule {
        Rule {
            kind: self.kind,
            value: self.value.clone(),
        }
    }
}
