//! In-process spatial store
//!
//! Mirrors the PostGIS backend's constraints: unique layer names,
//! `ON DELETE SET NULL` from batches to layers, and `RESTRICT` from
//! geometries and logs to batches. Geometries are kept as EWKT and cannot be
//! reprojected, so only geometries already in the store's SRID are accepted.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::SpatialStore;
use crate::error::{LayerError, LayerResult};
use crate::geometry::wkt::{KML_SRID, split_ewkt};
use crate::models::{
    Batch, BatchMetadata, BoundingBox, DEFAULT_BBOX, ExistsPolicy, GeometryRecord, Layer,
    MissingPolicy, NewBatch, StatusLog,
};

#[derive(Debug, Clone)]
struct StoredBatch {
    layer_id: Option<i64>,
    metadata: BatchMetadata,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    layers: BTreeMap<i64, Layer>,
    batches: BTreeMap<i64, StoredBatch>,
    geometries: BTreeMap<i64, GeometryRecord>,
    logs: BTreeMap<i64, StatusLog>,
    views: BTreeSet<String>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn layer_by_name(&self, name: &str) -> Option<&Layer> {
        self.layers.values().find(|layer| layer.name == name)
    }

    fn layer_geometries(&self, name: &str) -> impl Iterator<Item = &GeometryRecord> {
        let layer_id = self.layer_by_name(name).map(|layer| layer.id);
        let batch_ids: BTreeSet<i64> = self
            .batches
            .iter()
            .filter(|(_, batch)| layer_id.is_some() && batch.layer_id == layer_id)
            .map(|(id, _)| *id)
            .collect();
        self.geometries
            .values()
            .filter(move |g| g.batch_id.is_some_and(|id| batch_ids.contains(&id)))
    }

    fn insert_layer(&mut self, name: &str) -> Layer {
        let layer = Layer {
            id: self.next_id(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.layers.insert(layer.id, layer.clone());
        layer
    }

    fn insert_batch(&mut self, layer_id: Option<i64>, batch: &NewBatch) -> i64 {
        let batch_id = self.next_id();
        self.batches.insert(
            batch_id,
            StoredBatch {
                layer_id,
                metadata: batch.metadata.clone(),
                created_at: Utc::now(),
            },
        );
        for geometry in &batch.geometries {
            let id = self.next_id();
            self.geometries.insert(
                id,
                GeometryRecord {
                    id,
                    batch_id: Some(batch_id),
                    geometry: geometry.geometry.clone(),
                    name: geometry.name.clone(),
                    description: geometry.description.clone(),
                    metadata: geometry.metadata.clone(),
                },
            );
        }
        batch_id
    }
}

/// Spatial store kept in memory
pub struct MemoryStore {
    srid: i32,
    state: Mutex<State>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new(srid: i32) -> Self {
        Self {
            srid,
            state: Mutex::new(State::default()),
            offline: AtomicBool::new(false),
        }
    }

    /// Make every call fail as if the database were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> LayerResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LayerError::upstream(
                "PostGIS connection unavailable: store is offline",
            ));
        }
        Ok(())
    }

    fn check_srids(&self, batch: &NewBatch) -> LayerResult<()> {
        for geometry in &batch.geometries {
            match split_ewkt(&geometry.geometry) {
                Some((srid, _)) if srid == self.srid => {}
                Some((srid, _)) => {
                    return Err(LayerError::upstream(format!(
                        "In-memory store can't transform SRID {} to {}",
                        srid, self.srid
                    )));
                }
                None => {
                    return Err(LayerError::validation(format!(
                        "Geometry '{}' is not EWKT",
                        geometry.geometry
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SpatialStore for MemoryStore {
    async fn initialize(&self) -> LayerResult<()> {
        self.ensure_online()
    }

    async fn list_layers(&self) -> LayerResult<Vec<String>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state.layers.values().map(|layer| layer.name.clone()).collect())
    }

    async fn list_views(&self) -> LayerResult<Vec<String>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state.views.iter().cloned().collect())
    }

    async fn get_layer(&self, name: &str) -> LayerResult<Option<Layer>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state.layer_by_name(name).cloned())
    }

    async fn get_or_create_layer(&self, name: &str) -> LayerResult<Layer> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if let Some(layer) = state.layer_by_name(name) {
            return Ok(layer.clone());
        }
        Ok(state.insert_layer(name))
    }

    async fn create_layer_with_batch(
        &self,
        name: &str,
        batch: &NewBatch,
    ) -> LayerResult<(Layer, i64)> {
        self.ensure_online()?;
        self.check_srids(batch)?;
        let mut state = self.state.lock().await;
        if state.layer_by_name(name).is_some() {
            return Err(LayerError::conflict(format!(
                "Layer '{}' already exists on Postgis.",
                name
            )));
        }
        let layer = state.insert_layer(name);
        let batch_id = state.insert_batch(Some(layer.id), batch);
        Ok((layer, batch_id))
    }

    async fn insert_batch(&self, layer_id: Option<i64>, batch: &NewBatch) -> LayerResult<i64> {
        self.ensure_online()?;
        self.check_srids(batch)?;
        let mut state = self.state.lock().await;
        if let Some(id) = layer_id
            && !state.layers.contains_key(&id)
        {
            return Err(LayerError::upstream(format!(
                "Layer id {} violates batches.layer_id foreign key",
                id
            )));
        }
        Ok(state.insert_batch(layer_id, batch))
    }

    async fn get_batch(&self, id: i64) -> LayerResult<Option<Batch>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state.batches.get(&id).map(|stored| Batch {
            id,
            layer_id: stored.layer_id,
            layer: stored
                .layer_id
                .and_then(|layer_id| state.layers.get(&layer_id))
                .map(|layer| layer.name.clone()),
            metadata: stored.metadata.clone(),
            geometry_count: state
                .geometries
                .values()
                .filter(|g| g.batch_id == Some(id))
                .count() as u64,
            created_at: stored.created_at,
        }))
    }

    async fn list_geometries(&self, batch_id: i64) -> LayerResult<Vec<GeometryRecord>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state
            .geometries
            .values()
            .filter(|g| g.batch_id == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn create_view(&self, layer: &str, if_exists: ExistsPolicy) -> LayerResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if state.views.contains(layer) {
            match if_exists {
                ExistsPolicy::Fail => {
                    return Err(LayerError::conflict(format!(
                        "View '{}' already exists on Postgis.",
                        layer
                    )));
                }
                ExistsPolicy::Ignore | ExistsPolicy::Replace => return Ok(()),
            }
        }
        state.views.insert(layer.to_string());
        Ok(())
    }

    async fn drop_view(
        &self,
        layer: &str,
        if_missing: MissingPolicy,
        _cascade: bool,
    ) -> LayerResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if !state.views.remove(layer) && if_missing == MissingPolicy::Fail {
            return Err(LayerError::not_found(format!(
                "View {} doesn't exist on Postgis.",
                layer
            )));
        }
        Ok(())
    }

    async fn drop_layer(
        &self,
        layer: &str,
        if_missing: MissingPolicy,
        cascade: bool,
    ) -> LayerResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let Some(layer_id) = state.layer_by_name(layer).map(|l| l.id) else {
            return match if_missing {
                MissingPolicy::Fail => Err(LayerError::not_found(format!(
                    "Layer {} doesn't exist on Postgis.",
                    layer
                ))),
                MissingPolicy::Ignore => Ok(()),
            };
        };

        if cascade {
            let doomed: Vec<i64> = state.layer_geometries(layer).map(|g| g.id).collect();
            for id in doomed {
                state.geometries.remove(&id);
            }
        }
        state.layers.remove(&layer_id);
        for batch in state.batches.values_mut() {
            if batch.layer_id == Some(layer_id) {
                batch.layer_id = None;
            }
        }
        Ok(())
    }

    async fn drop_batches(&self, ids: &[i64], cascade: bool) -> LayerResult<u64> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let targets: BTreeSet<i64> = ids.iter().copied().collect();
        let attached: Vec<i64> = state
            .geometries
            .values()
            .filter(|g| g.batch_id.is_some_and(|id| targets.contains(&id)))
            .map(|g| g.id)
            .collect();

        if !cascade {
            if !attached.is_empty() {
                return Err(LayerError::validation(format!(
                    "Batch deletion prevented! There are {} geometries attached to this batch. \
                     Set 'cascade' to true to proceed with Geometry deletion as well.",
                    attached.len()
                )));
            }
            if state
                .logs
                .values()
                .any(|log| log.batch_id.is_some_and(|id| targets.contains(&id)))
            {
                return Err(LayerError::validation(
                    "Batch deletion prevented! Status logs reference this batch. \
                     Set 'cascade' to true to detach them.",
                ));
            }
        }

        for log in state.logs.values_mut() {
            if log.batch_id.is_some_and(|id| targets.contains(&id)) {
                log.batch_id = None;
            }
        }
        for id in &attached {
            state.geometries.remove(id);
        }
        for id in &targets {
            state.batches.remove(id);
        }
        Ok(attached.len() as u64)
    }

    async fn drop_geometries(&self, ids: &[i64]) -> LayerResult<u64> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter(|id| state.geometries.remove(*id).is_some())
            .count() as u64)
    }

    async fn count_layer_geometries(&self, layer: &str) -> LayerResult<u64> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state.layer_geometries(layer).count() as u64)
    }

    async fn bbox(&self, layer: &str) -> LayerResult<Option<BoundingBox>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state
            .layer_geometries(layer)
            .filter_map(|g| extent(&g.geometry))
            .reduce(BoundingBox::union))
    }

    async fn default_extent(&self) -> LayerResult<BoundingBox> {
        self.ensure_online()?;
        if self.srid != KML_SRID {
            return Err(LayerError::validation(format!(
                "The in-memory store cannot reproject the default extent to EPSG:{}.",
                self.srid
            )));
        }
        Ok(DEFAULT_BBOX)
    }

    async fn insert_log(&self, log: &StatusLog) -> LayerResult<i64> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let mut stored = log.clone();
        stored.id = Some(id);
        state.logs.insert(id, stored);
        Ok(id)
    }

    async fn get_log(&self, id: i64) -> LayerResult<Option<StatusLog>> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state.logs.get(&id).cloned())
    }

    async fn save_log(&self, log: &StatusLog) -> LayerResult<()> {
        self.ensure_online()?;
        let id = log
            .id
            .ok_or_else(|| LayerError::validation("Status log has no id"))?;
        let mut state = self.state.lock().await;
        if let Some(batch_id) = log.batch_id
            && !state.batches.contains_key(&batch_id)
        {
            return Err(LayerError::upstream(format!(
                "Batch id {} violates logs.batch_id foreign key",
                batch_id
            )));
        }
        state.logs.insert(id, log.clone());
        Ok(())
    }

    async fn health_check(&self) -> LayerResult<bool> {
        Ok(!self.offline.load(Ordering::SeqCst))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Planar extent of an EWKT geometry's coordinates
fn extent(ewkt: &str) -> Option<BoundingBox> {
    let body = split_ewkt(ewkt).map(|(_, body)| body).unwrap_or(ewkt);
    let cleaned = body.replace(['(', ')'], " ");
    cleaned
        .split(',')
        .filter_map(|tuple| {
            let mut numbers = tuple
                .split_whitespace()
                .filter_map(|token| token.parse::<f64>().ok());
            let x = numbers.next()?;
            let y = numbers.next()?;
            Some(BoundingBox {
                minx: x,
                miny: y,
                maxx: x,
                maxy: y,
            })
        })
        .reduce(BoundingBox::union)
}
