//! # Logs
//!
//! The append-only audit trail of credential removals and completed
//! sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifier::CredentialTypeIdentifier;

/// What a log entry records.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    /// Credentials were removed.
    Removal,
    /// A disclosure session completed.
    Disclosing,
    /// A signature session completed.
    Signing,
    /// An issuance session completed.
    Issuing,
}

/// One entry of the audit trail.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogEntry {
    /// The entry kind.
    #[serde(rename = "type")]
    pub kind: LogType,

    /// When the event happened.
    pub time: DateTime<Utc>,

    /// For removals: the removed attribute values by credential type.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub removed: HashMap<CredentialTypeIdentifier, Vec<String>>,
}

impl LogEntry {
    /// A removal entry timestamped now.
    #[must_use]
    pub fn removal(removed: HashMap<CredentialTypeIdentifier, Vec<String>>) -> Self {
        Self { kind: LogType::Removal, time: Utc::now(), removed }
    }

    /// A session entry timestamped now.
    #[must_use]
    pub fn session(kind: LogType) -> Self {
        Self { kind, time: Utc::now(), removed: HashMap::new() }
    }
}
