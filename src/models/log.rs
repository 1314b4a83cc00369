//! Status log entity
//!
//! One record per orchestrated operation. The message is a narrative: new
//! fragments are appended, never substituted.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::batch::{BatchRecord, format_timestamp, is_empty_value};
use crate::status::codes;

/// Durable record of one operation's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusLog {
    /// Assigned on first persistence
    pub id: Option<i64>,
    pub endpoint: Option<String>,
    pub layer: Option<String>,
    pub status: i32,
    pub message: Option<String>,
    pub url: Option<String>,
    pub metadata: Option<Value>,
    pub batch_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field changes applied by [`StatusLog::update`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub status: Option<i32>,
    pub message_append: Option<String>,
    pub metadata: Option<Value>,
    pub batch_id: Option<i64>,
    pub layer: Option<String>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for an update that only appends a fragment
    pub fn append(fragment: impl Into<String>) -> Self {
        Self::new().message_append(fragment)
    }

    pub fn status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message_append(mut self, fragment: impl Into<String>) -> Self {
        self.message_append = Some(fragment.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn batch(mut self, batch_id: i64) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }
}

/// Client-facing projection of a status log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchRecord>,
}

impl StatusLog {
    /// Fresh record in the received state
    pub fn received(endpoint: impl Into<String>, layer: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            endpoint: Some(endpoint.into()),
            layer: layer.map(str::to_string),
            status: codes::RECEIVED,
            message: Some("Received.".to_string()),
            url: None,
            metadata: None,
            batch_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        codes::is_terminal(self.status)
    }

    /// Apply field changes.
    ///
    /// Returns `false` and leaves the record untouched when it is already
    /// terminal.
    pub fn update(&mut self, update: StatusUpdate) -> bool {
        if self.is_terminal() {
            tracing::warn!(
                log_id = ?self.id,
                status = self.status,
                "Ignoring update to terminal status log"
            );
            return false;
        }

        if let Some(fragment) = update.message_append {
            self.message_append(&fragment);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(metadata) = update.metadata {
            self.metadata = Some(metadata);
        }
        if let Some(batch_id) = update.batch_id {
            self.batch_id = Some(batch_id);
        }
        if let Some(layer) = update.layer {
            self.layer = Some(layer);
        }
        self.updated_at = Utc::now();
        true
    }

    /// Concatenate a fragment onto the narrative.
    ///
    /// Both sides are trimmed of dots and spaces, joined with `". "` and
    /// terminated with a single dot.
    pub fn message_append(&mut self, fragment: &str) {
        let old = self
            .message
            .as_deref()
            .unwrap_or_default()
            .trim_matches(|c| c == '.' || c == ' ');
        let new = fragment.trim_matches(|c| c == '.' || c == ' ');
        self.message = Some(match (old.is_empty(), new.is_empty()) {
            (true, _) => format!("{}.", new),
            (false, true) => format!("{}.", old),
            (false, false) => format!("{}. {}.", old, new),
        });
    }

    /// Recompute the self-referencing URL from the assigned id
    pub fn refresh_url(&mut self, base_url: &str) {
        self.url = self
            .id
            .map(|id| format!("{}/status/record/{}", base_url.trim_end_matches('/'), id));
    }

    /// Client-facing projection with empty fields omitted
    pub fn record(&self, offset: FixedOffset, batch: Option<BatchRecord>) -> StatusRecord {
        StatusRecord {
            endpoint: self.endpoint.clone().filter(|s| !s.is_empty()),
            status: self.status,
            message: self.message.clone().filter(|s| !s.is_empty()),
            url: self.url.clone(),
            timestamp: format_timestamp(self.created_at, offset),
            metadata: self.metadata.clone().filter(|v| !is_empty_value(v)),
            batch,
        }
    }
}
