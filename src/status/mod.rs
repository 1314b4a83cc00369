//! Pollable status logs
//!
//! A [`Tracker`] binds one [`StatusLog`] to the store it lives in. Every
//! `keep_track` call applies an update and persists it immediately, so a
//! client polling the log sees each step as soon as it completes.

pub mod adapter;
pub mod codes;

use chrono::{FixedOffset, Offset, Utc};
use std::sync::Arc;

use crate::config::Settings;
use crate::error::{LayerError, LayerResult};
use crate::models::{StatusLog, StatusRecord, StatusUpdate};
use crate::store::SpatialStore;

/// How status logs render themselves to clients
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Base under which `/status/record/<id>` is served
    pub base_url: String,
    /// Offset used for client timestamps
    pub client_offset: FixedOffset,
}

impl TrackerConfig {
    pub fn from_settings(settings: &Settings) -> LayerResult<Self> {
        Ok(Self {
            base_url: settings.service.base_url.clone(),
            client_offset: settings.client_offset()?,
        })
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            client_offset: Utc.fix(),
        }
    }
}

/// Handle on a persisted status log
pub struct Tracker {
    store: Arc<dyn SpatialStore>,
    config: TrackerConfig,
    log: StatusLog,
}

impl Tracker {
    /// Create and persist a fresh log in the received state
    pub async fn received(
        store: Arc<dyn SpatialStore>,
        config: TrackerConfig,
        endpoint: &str,
        layer: Option<&str>,
    ) -> LayerResult<Self> {
        let mut log = StatusLog::received(endpoint, layer);
        log.id = Some(store.insert_log(&log).await?);
        log.refresh_url(&config.base_url);
        store.save_log(&log).await?;

        tracing::info!(log_id = ?log.id, endpoint, "Status log received");
        Ok(Self { store, config, log })
    }

    /// Load an existing log
    pub async fn load(
        store: Arc<dyn SpatialStore>,
        config: TrackerConfig,
        id: i64,
    ) -> LayerResult<Self> {
        let log = store
            .get_log(id)
            .await?
            .ok_or_else(|| LayerError::not_found(format!("Status log {} doesn't exist.", id)))?;
        Ok(Self { store, config, log })
    }

    /// Apply an update and persist it.
    ///
    /// Updates to a terminal log are dropped with a warning.
    pub async fn keep_track(&mut self, update: StatusUpdate) -> LayerResult<()> {
        if !self.log.update(update) {
            return Ok(());
        }
        self.log.refresh_url(&self.config.base_url);
        self.store.save_log(&self.log).await
    }

    /// Append one narrative fragment
    pub async fn append(&mut self, fragment: impl Into<String>) -> LayerResult<()> {
        self.keep_track(StatusUpdate::append(fragment)).await
    }

    pub fn id(&self) -> Option<i64> {
        self.log.id
    }

    pub fn status(&self) -> i32 {
        self.log.status
    }

    pub fn log(&self) -> &StatusLog {
        &self.log
    }

    pub fn is_terminal(&self) -> bool {
        self.log.is_terminal()
    }

    /// Client-facing projection, including the attached batch
    pub async fn record(&self) -> LayerResult<StatusRecord> {
        let batch = match self.log.batch_id {
            Some(batch_id) => self
                .store
                .get_batch(batch_id)
                .await?
                .map(|batch| batch.record(self.config.client_offset)),
            None => None,
        };
        Ok(self.log.record(self.config.client_offset, batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> Arc<dyn SpatialStore> {
        Arc::new(MemoryStore::new(4326))
    }

    #[tokio::test]
    async fn test_received_assigns_id_and_url() {
        let store = store();
        let tracker = Tracker::received(store.clone(), TrackerConfig::default(), "create", None)
            .await
            .unwrap();

        let id = tracker.id().unwrap();
        let persisted = store.get_log(id).await.unwrap().unwrap();
        assert_eq!(persisted.status, codes::RECEIVED);
        assert_eq!(
            persisted.url,
            Some(format!("http://localhost:5000/status/record/{}", id))
        );
    }

    #[tokio::test]
    async fn test_keep_track_persists_each_step() {
        let store = store();
        let mut tracker =
            Tracker::received(store.clone(), TrackerConfig::default(), "create", None)
                .await
                .unwrap();
        tracker.append("A.").await.unwrap();
        tracker.append("B.").await.unwrap();

        let reloaded = Tracker::load(store, TrackerConfig::default(), tracker.id().unwrap())
            .await
            .unwrap();
        assert!(reloaded.log().message.as_deref().unwrap().ends_with("A. B."));
    }

    #[tokio::test]
    async fn test_terminal_log_ignores_updates() {
        let store = store();
        let mut tracker =
            Tracker::received(store.clone(), TrackerConfig::default(), "create", None)
                .await
                .unwrap();
        tracker
            .keep_track(StatusUpdate::append("Success").status(codes::SUCCESS))
            .await
            .unwrap();
        tracker
            .keep_track(StatusUpdate::append("Late").status(codes::FAILED_UPSTREAM))
            .await
            .unwrap();

        let persisted = store.get_log(tracker.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(persisted.status, codes::SUCCESS);
        assert!(!persisted.message.unwrap().contains("Late"));
    }

    #[tokio::test]
    async fn test_load_unknown_log_is_not_found() {
        let err = Tracker::load(store(), TrackerConfig::default(), 999)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
