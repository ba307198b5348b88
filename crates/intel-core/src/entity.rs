use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The tracked business entity (a contractor) every module operates on.
///
/// Only the fields executors need to identify the entity are kept here; the
/// full contractor record lives in the CRUD backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub id: u64,
    /// Registered legal title, used as the search key by most executors.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl EntityDescriptor {
    pub fn new(id: u64, name: impl Into<String>, short_name: Option<String>) -> Self {
        Self {
            id,
            name: name.into(),
            short_name,
            updated_at: Utc::now(),
        }
    }

    /// Name to show in log lines: the short name when one is set.
    pub fn display_name(&self) -> &str {
        self.short_name.as_deref().unwrap_or(&self.name)
    }
}
