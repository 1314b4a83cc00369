//! Spatial store abstraction
//!
//! The store keeps layers, batches, geometries and status logs, and one
//! read-only view per layer. Two implementations are provided:
//! - PostGIS: the production backend (feature `postgres-backend`)
//! - Memory: an in-process store for tests and dry runs
//!
//! Every method is one logical step. Implementations that write must commit
//! the whole step or nothing.

use async_trait::async_trait;

pub mod memory;
pub mod schema;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

pub use memory::MemoryStore;
pub use schema::StoreSchema;

#[cfg(feature = "postgres-backend")]
pub use self::postgres::PostgisStore;

use crate::error::LayerResult;
use crate::models::{
    Batch, BoundingBox, ExistsPolicy, GeometryRecord, Layer, MissingPolicy, NewBatch, StatusLog,
};

/// Spatial store operations
#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Create tables and indexes if missing
    async fn initialize(&self) -> LayerResult<()>;

    /// Names of all layers
    async fn list_layers(&self) -> LayerResult<Vec<String>>;

    /// Names of all views in the schema
    async fn list_views(&self) -> LayerResult<Vec<String>>;

    async fn get_layer(&self, name: &str) -> LayerResult<Option<Layer>>;

    /// Return the named layer, inserting it when missing
    async fn get_or_create_layer(&self, name: &str) -> LayerResult<Layer>;

    /// Insert a new layer together with its first batch, in one transaction.
    ///
    /// Fails with a conflict when the layer name is taken.
    async fn create_layer_with_batch(&self, name: &str, batch: &NewBatch)
    -> LayerResult<(Layer, i64)>;

    /// Insert a batch with its geometries, attached to `layer_id` when given.
    ///
    /// Returns the new batch id.
    async fn insert_batch(&self, layer_id: Option<i64>, batch: &NewBatch) -> LayerResult<i64>;

    async fn get_batch(&self, id: i64) -> LayerResult<Option<Batch>>;

    /// Geometries of a batch, re-read in the deployment SRID
    async fn list_geometries(&self, batch_id: i64) -> LayerResult<Vec<GeometryRecord>>;

    /// Create the read-only projection of a layer
    async fn create_view(&self, layer: &str, if_exists: ExistsPolicy) -> LayerResult<()>;

    async fn drop_view(&self, layer: &str, if_missing: MissingPolicy, cascade: bool)
    -> LayerResult<()>;

    /// Delete a layer row; with `cascade`, its batches' geometries go too
    async fn drop_layer(&self, layer: &str, if_missing: MissingPolicy, cascade: bool)
    -> LayerResult<()>;

    /// Delete batches.
    ///
    /// Without `cascade` the call is refused while geometries remain. With
    /// `cascade` logs are detached and geometries deleted first. Returns the
    /// number of geometries deleted.
    async fn drop_batches(&self, ids: &[i64], cascade: bool) -> LayerResult<u64>;

    /// Delete geometries by id, returning how many existed
    async fn drop_geometries(&self, ids: &[i64]) -> LayerResult<u64>;

    /// Geometries reachable from a layer through its batches
    async fn count_layer_geometries(&self, layer: &str) -> LayerResult<u64>;

    /// Extent of a layer's geometries; `None` when it has none
    async fn bbox(&self, layer: &str) -> LayerResult<Option<BoundingBox>>;

    /// [`DEFAULT_BBOX`](crate::models::DEFAULT_BBOX) in the deployment SRID
    async fn default_extent(&self) -> LayerResult<BoundingBox>;

    /// Persist a new status log and return its id
    async fn insert_log(&self, log: &StatusLog) -> LayerResult<i64>;

    async fn get_log(&self, id: i64) -> LayerResult<Option<StatusLog>>;

    /// Overwrite a persisted status log
    async fn save_log(&self, log: &StatusLog) -> LayerResult<()>;

    async fn health_check(&self) -> LayerResult<bool>;

    fn backend_type(&self) -> &'static str;
}
