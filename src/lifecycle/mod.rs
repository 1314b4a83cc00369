//! Layer lifecycle orchestration
//!
//! A layer lives in two systems at once: a row plus a view in the spatial
//! store, and a published layer on the tile server. The [`Orchestrator`]
//! walks each operation through both in a fixed order and appends one
//! fragment to the status log after every completed step, so a failure
//! midway leaves a narrative of what was done.

pub mod locks;

pub use locks::LayerLocks;

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::error::{LayerError, LayerResult};
use crate::geometry::{BoundarySource, DEFAULT_CHUNK_SIZE, ErrorPolicy};
use crate::ingest::generate_batch;
use crate::models::{BatchMetadata, BoundingBox, ExistsPolicy, MissingPolicy, StatusUpdate};
use crate::publish::TilePublisher;
use crate::status::Tracker;
use crate::store::SpatialStore;
use crate::store::schema::STORE_TABLES;

static RE_LAYER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,62}$").expect("Invalid regex"));

/// Reject names that are not safe as both a SQL view and a tile layer name
pub fn validate_layer_name(layer: &str) -> LayerResult<()> {
    if !RE_LAYER_NAME.is_match(layer) {
        return Err(LayerError::validation(format!(
            "Invalid layer name '{}'. Use letters, digits, '_', '-' or '.', at most 63 characters.",
            layer
        )));
    }
    if STORE_TABLES
        .iter()
        .any(|table| table.eq_ignore_ascii_case(layer))
    {
        return Err(LayerError::validation(format!(
            "Invalid layer name '{}'. The name is reserved for a store table.",
            layer
        )));
    }
    Ok(())
}

/// Liveness of both collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HealthReport {
    pub store: bool,
    pub publisher: bool,
}

/// Drives layer operations across the spatial store and the tile server
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn SpatialStore>,
    publisher: Arc<dyn TilePublisher>,
    chunk_size: usize,
    locks: LayerLocks,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn SpatialStore>, publisher: Arc<dyn TilePublisher>) -> Self {
        Self {
            store,
            publisher,
            chunk_size: DEFAULT_CHUNK_SIZE,
            locks: LayerLocks::new(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn SpatialStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<dyn TilePublisher> {
        &self.publisher
    }

    pub async fn health_check(&self) -> HealthReport {
        HealthReport {
            store: self.store.health_check().await.unwrap_or(false),
            publisher: self.publisher.health_check().await.unwrap_or(false),
        }
    }

    /// Extent handed to the tile server, falling back to the default extent
    async fn layer_bbox(&self, layer: &str) -> LayerResult<BoundingBox> {
        match self.store.bbox(layer).await? {
            Some(bbox) => Ok(bbox),
            None => {
                tracing::warn!(layer, "Layer has no geometries, publishing default extent");
                self.store.default_extent().await
            }
        }
    }

    /// Create a layer in both systems from boundary files
    pub async fn create(
        &self,
        layer: &str,
        sources: &[BoundarySource],
        metadata: BatchMetadata,
        policy: ErrorPolicy,
        tracker: &mut Tracker,
    ) -> LayerResult<()> {
        validate_layer_name(layer)?;
        let _guard = self.locks.acquire(layer).await;

        if self.publisher.layer_exists(layer).await? {
            return Err(LayerError::conflict(format!(
                "Layer '{}' already exists on Geoserver.",
                layer
            )));
        }
        if self.store.get_layer(layer).await?.is_some() {
            return Err(LayerError::conflict(format!(
                "Layer '{}' already exists on Postgis.",
                layer
            )));
        }

        let batch = generate_batch(sources, metadata, policy, self.chunk_size).await?;
        let (_, batch_id) = self.store.create_layer_with_batch(layer, &batch).await?;
        tracker
            .keep_track(
                StatusUpdate::append("PostGIS KML ingested.")
                    .batch(batch_id)
                    .layer(layer),
            )
            .await?;

        self.store.create_view(layer, ExistsPolicy::Replace).await?;
        tracker.append("PostGIS view created.").await?;

        let bbox = self.layer_bbox(layer).await?;
        self.publisher
            .create_layer(layer, bbox, ExistsPolicy::Fail)
            .await?;
        tracker.append("Geoserver layer created.").await?;

        tracing::info!(layer, batch_id, geometries = batch.len(), "Layer created");
        Ok(())
    }

    /// Add a batch to a layer present in both systems and republish it
    pub async fn append(
        &self,
        layer: &str,
        sources: &[BoundarySource],
        metadata: BatchMetadata,
        policy: ErrorPolicy,
        tracker: &mut Tracker,
    ) -> LayerResult<()> {
        validate_layer_name(layer)?;
        let _guard = self.locks.acquire(layer).await;

        let stored = self.store.get_layer(layer).await?.ok_or_else(|| {
            LayerError::not_found(format!("Layer {} doesn't exist on Postgis.", layer))
        })?;
        if !self.publisher.layer_exists(layer).await? {
            return Err(LayerError::not_found(format!(
                "Layer {} doesn't exist on Geoserver.",
                layer
            )));
        }

        let batch = generate_batch(sources, metadata, policy, self.chunk_size).await?;
        let batch_id = self.store.insert_batch(Some(stored.id), &batch).await?;
        tracker
            .keep_track(
                StatusUpdate::append("PostGIS KML ingested.")
                    .batch(batch_id)
                    .layer(layer),
            )
            .await?;

        self.refresh_remote(layer, tracker).await?;
        tracing::info!(layer, batch_id, geometries = batch.len(), "Layer appended");
        Ok(())
    }

    /// Re-run the publishing half of an append whose batch is already stored
    ///
    /// The tile server side may be missing at this point, so only the store
    /// row is required.
    pub async fn republish(&self, layer: &str, tracker: &mut Tracker) -> LayerResult<()> {
        validate_layer_name(layer)?;
        let _guard = self.locks.acquire(layer).await;

        if self.store.get_layer(layer).await?.is_none() {
            return Err(LayerError::not_found(format!(
                "Layer {} doesn't exist on Postgis.",
                layer
            )));
        }
        self.refresh_remote(layer, tracker).await?;
        tracing::info!(layer, "Layer republished");
        Ok(())
    }

    /// Ensure the view, then replace the remote layer with a fresh extent
    async fn refresh_remote(&self, layer: &str, tracker: &mut Tracker) -> LayerResult<()> {
        if !self.store.list_views().await?.iter().any(|v| v == layer) {
            tracing::warn!(layer, "View missing, recreating");
            self.store.create_view(layer, ExistsPolicy::Replace).await?;
            tracker.append("PostGIS view created.").await?;
        }

        let bbox = self.layer_bbox(layer).await?;
        self.publisher
            .delete_layer(layer, MissingPolicy::Ignore)
            .await?;
        self.publisher
            .create_layer(layer, bbox, ExistsPolicy::Fail)
            .await?;
        tracker.append("Geoserver layer updated.").await?;
        Ok(())
    }

    /// Remove a layer from both systems
    ///
    /// Under [`MissingPolicy::Ignore`] a layer unknown to both systems is a
    /// successful no-op.
    pub async fn delete(
        &self,
        layer: &str,
        delete_geometries: bool,
        if_missing: MissingPolicy,
        tracker: &mut Tracker,
    ) -> LayerResult<()> {
        validate_layer_name(layer)?;
        let _guard = self.locks.acquire(layer).await;

        let stored = self.store.get_layer(layer).await?.is_some();
        let remote = self.publisher.layer_exists(layer).await?;
        if !stored && !remote {
            return match if_missing {
                MissingPolicy::Fail => Err(LayerError::not_found(format!(
                    "Layer {} doesn't exist on Postgis nor Geoserver.",
                    layer
                ))),
                MissingPolicy::Ignore => {
                    tracing::info!(layer, "Nothing to delete");
                    Ok(())
                }
            };
        }
        tracker
            .keep_track(StatusUpdate::new().layer(layer))
            .await?;

        self.store
            .drop_view(layer, MissingPolicy::Ignore, true)
            .await?;
        tracker.append("View deleted.").await?;

        self.store
            .drop_layer(layer, MissingPolicy::Ignore, delete_geometries)
            .await?;
        tracker
            .append(if delete_geometries {
                "Postgis layer and geometries deleted."
            } else {
                "Postgis layer deleted."
            })
            .await?;

        self.publisher
            .delete_layer(layer, MissingPolicy::Ignore)
            .await?;
        tracker.append("Geoserver layer deleted.").await?;

        tracing::info!(layer, delete_geometries, "Layer deleted");
        Ok(())
    }

    /// Publish an existing layer's view, creating the layer row if needed
    pub async fn publish_view(
        &self,
        layer: &str,
        if_exists: ExistsPolicy,
        tracker: &mut Tracker,
    ) -> LayerResult<()> {
        validate_layer_name(layer)?;
        let _guard = self.locks.acquire(layer).await;

        self.store.get_or_create_layer(layer).await?;
        tracker
            .keep_track(StatusUpdate::new().layer(layer))
            .await?;

        self.store.create_view(layer, ExistsPolicy::Replace).await?;
        tracker.append("View created.").await?;

        let bbox = self.layer_bbox(layer).await?;
        self.publisher.create_layer(layer, bbox, if_exists).await?;
        tracker.append("Geoserver layer created.").await?;
        Ok(())
    }

    /// Store a batch that belongs to no layer, returning its id
    pub async fn ingest_batch(
        &self,
        sources: &[BoundarySource],
        metadata: BatchMetadata,
        policy: ErrorPolicy,
        tracker: &mut Tracker,
    ) -> LayerResult<i64> {
        let batch = generate_batch(sources, metadata, policy, self.chunk_size).await?;
        let batch_id = self.store.insert_batch(None, &batch).await?;
        tracker
            .keep_track(StatusUpdate::append("PostGIS KML ingested.").batch(batch_id))
            .await?;
        Ok(batch_id)
    }

    pub async fn delete_batches(
        &self,
        ids: &[i64],
        cascade: bool,
        tracker: &mut Tracker,
    ) -> LayerResult<u64> {
        if ids.is_empty() {
            return Err(LayerError::validation("No batch ids given."));
        }
        let deleted = self.store.drop_batches(ids, cascade).await?;
        tracker
            .append(format!("Postgis deleted {} geometries.", deleted))
            .await?;
        Ok(deleted)
    }

    pub async fn delete_geometries(&self, ids: &[i64], tracker: &mut Tracker) -> LayerResult<u64> {
        if ids.is_empty() {
            return Err(LayerError::validation("No geometry ids given."));
        }
        let deleted = self.store.drop_geometries(ids).await?;
        tracker
            .append(format!("Postgis deleted {} geometries.", deleted))
            .await?;
        Ok(deleted)
    }

    pub async fn push_style(
        &self,
        name: &str,
        sld: &str,
        if_exists: ExistsPolicy,
        tracker: &mut Tracker,
    ) -> LayerResult<()> {
        if name.trim().is_empty() {
            return Err(LayerError::validation("Style name can't be empty."));
        }
        self.publisher.push_style(name, sld, if_exists).await?;
        tracker.append(format!("{} style created.", name)).await
    }

    pub async fn assign_style(
        &self,
        style: &str,
        layer: &str,
        tracker: &mut Tracker,
    ) -> LayerResult<()> {
        let _guard = self.locks.acquire(layer).await;
        self.publisher.assign_style(style, layer).await?;
        tracker
            .append(format!("{} style assigned to {}.", style, layer))
            .await
    }

    pub async fn delete_style(
        &self,
        name: &str,
        recurse: bool,
        tracker: &mut Tracker,
    ) -> LayerResult<()> {
        self.publisher.delete_style(name, true, recurse).await?;
        tracker.append(format!("{} style deleted.", name)).await
    }
}
