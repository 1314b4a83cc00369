//! PostGIS store implementation
//!
//! Uses connection pooling via deadpool-postgres. Each trait method runs in
//! its own transaction, so a failed step leaves nothing behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Client, Manager, ManagerConfig, Pool, RecyclingMethod, Transaction};
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use super::SpatialStore;
use super::schema::{SCHEMA_VERSION, StoreSchema};
use crate::error::{LayerError, LayerResult};
use crate::models::{
    Batch, BatchMetadata, BoundingBox, DEFAULT_BBOX, ExistsPolicy, GeometryRecord, Layer, MissingPolicy,
    NewBatch, Provenance, StatusLog,
};

/// Spatial store backed by PostgreSQL with the PostGIS extension
pub struct PostgisStore {
    /// Connection string
    connection_string: String,
    pool: Pool,
    schema: StoreSchema,
}

impl PostgisStore {
    /// Create a pooled store
    ///
    /// # Arguments
    /// * `connection_string` - PostgreSQL connection string
    /// * `schema` - schema holding the store's tables
    /// * `srid` - deployment coordinate system of the geometry column
    /// * `pool_size` - maximum number of pooled connections
    pub fn new(
        connection_string: &str,
        schema: &str,
        srid: i32,
        pool_size: usize,
    ) -> LayerResult<Self> {
        let config: tokio_postgres::Config = connection_string
            .parse()
            .map_err(|e| {
                LayerError::validation(format!("Invalid PostGIS connection string: {}", e))
            })?;
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| LayerError::upstream(format!("Failed to build PostGIS pool: {}", e)))?;

        let store = Self {
            connection_string: connection_string.to_string(),
            pool,
            schema: StoreSchema::new(schema, srid),
        };
        tracing::info!(
            connection = %store.connection_string_masked(),
            schema,
            srid,
            "PostGIS store configured"
        );
        Ok(store)
    }

    /// Get the connection string (masked for security)
    pub fn connection_string_masked(&self) -> String {
        mask_connection_string(&self.connection_string)
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    async fn view_exists(&self, client: &Client, layer: &str) -> LayerResult<bool> {
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.views \
                 WHERE table_schema::text = $1 AND table_name::text = $2)",
                &[&self.schema.schema, &layer],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    /// Insert a batch row and its geometries inside an open transaction
    async fn write_batch(
        &self,
        tx: &Transaction<'_>,
        layer_id: Option<i64>,
        batch: &NewBatch,
    ) -> LayerResult<i64> {
        let columns = batch.metadata.provenance.columns();
        let extra = batch.metadata.extra.clone();
        let mut params: Vec<&(dyn ToSql + Sync)> = columns
            .iter()
            .map(|column| column as &(dyn ToSql + Sync))
            .collect();
        params.push(&extra);
        params.push(&layer_id);

        let row = tx
            .query_one(&self.schema.insert_batch_sql(), &params)
            .await?;
        let batch_id: i64 = row.try_get(0)?;

        let statement = tx.prepare(&self.schema.insert_geometry_sql()).await?;
        for geometry in &batch.geometries {
            let metadata = geometry.metadata.clone().map(Value::Object);
            tx.execute(
                &statement,
                &[
                    &geometry.geometry,
                    &geometry.name,
                    &geometry.description,
                    &metadata,
                    &batch_id,
                ],
            )
            .await?;
        }

        tracing::debug!(batch_id, geometries = batch.len(), "Batch written");
        Ok(batch_id)
    }
}

/// Replace the password of a connection string with `****`
pub fn mask_connection_string(connection_string: &str) -> String {
    if let Some(at_pos) = connection_string.find('@')
        && let Some(colon_pos) = connection_string[..at_pos].rfind(':')
        && !connection_string[..colon_pos].ends_with('/')
        && connection_string[..colon_pos].contains("//")
    {
        let prefix = &connection_string[..colon_pos + 1];
        let suffix = &connection_string[at_pos..];
        return format!("{}****{}", prefix, suffix);
    }
    connection_string.to_string()
}

/// Serialize writers on one layer across processes until the transaction ends
async fn lock_layer(tx: &Transaction<'_>, layer: &str) -> LayerResult<()> {
    tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&layer])
        .await?;
    Ok(())
}

fn parse_extent(text: &str) -> LayerResult<BoundingBox> {
    BoundingBox::parse_box2d(text)
        .ok_or_else(|| LayerError::upstream(format!("Unreadable extent from PostGIS: '{}'", text)))
}

fn conflict_or(error: tokio_postgres::Error, message: String) -> LayerError {
    if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        LayerError::conflict(message)
    } else {
        error.into()
    }
}

fn layer_from_row(row: &Row) -> LayerResult<Layer> {
    Ok(Layer {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn batch_from_row(row: &Row) -> LayerResult<Batch> {
    let mut provenance: [Option<String>; 12] = Default::default();
    for (offset, column) in provenance.iter_mut().enumerate() {
        *column = row.try_get(3 + offset)?;
    }
    let count: i64 = row.try_get("geometries")?;
    Ok(Batch {
        id: row.try_get(0)?,
        layer_id: row.try_get(1)?,
        layer: row.try_get(2)?,
        metadata: BatchMetadata {
            provenance: Provenance::from_columns(provenance),
            extra: row.try_get(15)?,
        },
        geometry_count: count.max(0) as u64,
        created_at: row.try_get(16)?,
    })
}

fn log_from_row(row: &Row) -> LayerResult<StatusLog> {
    Ok(StatusLog {
        id: Some(row.try_get("id")?),
        endpoint: row.try_get("endpoint")?,
        layer: row.try_get("layer")?,
        status: row.try_get::<_, Option<i32>>("status")?.unwrap_or_default(),
        message: row.try_get("message")?,
        url: row.try_get("url")?,
        metadata: row.try_get("json")?,
        batch_id: row.try_get("batch_id")?,
        created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
        updated_at: row.try_get::<_, DateTime<Utc>>("updated_at")?,
    })
}

#[async_trait]
impl SpatialStore for PostgisStore {
    async fn initialize(&self) -> LayerResult<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&self.schema.create_tables_sql())
            .await
            .map_err(|e| LayerError::upstream(format!("Failed to create tables: {}", e)))?;
        client
            .execute(
                &format!(
                    "INSERT INTO {} (version) VALUES ($1) ON CONFLICT (version) DO NOTHING",
                    self.schema.table("schema_version")
                ),
                &[&SCHEMA_VERSION],
            )
            .await
            .map_err(|e| {
                LayerError::upstream(format!("Failed to record schema version: {}", e))
            })?;
        tracing::info!(schema = %self.schema.schema, "PostGIS schema ready");
        Ok(())
    }

    async fn list_layers(&self) -> LayerResult<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!("SELECT name FROM {} ORDER BY id", self.schema.table("layers")),
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(LayerError::from))
            .collect()
    }

    async fn list_views(&self) -> LayerResult<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT table_name::text FROM information_schema.views \
                 WHERE table_schema::text = $1 ORDER BY table_name",
                &[&self.schema.schema],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(LayerError::from))
            .collect()
    }

    async fn get_layer(&self, name: &str) -> LayerResult<Option<Layer>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT id, name, created_at FROM {} WHERE name = $1",
                    self.schema.table("layers")
                ),
                &[&name],
            )
            .await?;
        row.as_ref().map(layer_from_row).transpose()
    }

    async fn get_or_create_layer(&self, name: &str) -> LayerResult<Layer> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO {} (name) VALUES ($1) \
                     ON CONFLICT (name) DO UPDATE SET updated_at = now() \
                     RETURNING id, name, created_at",
                    self.schema.table("layers")
                ),
                &[&name],
            )
            .await?;
        layer_from_row(&row)
    }

    async fn create_layer_with_batch(
        &self,
        name: &str,
        batch: &NewBatch,
    ) -> LayerResult<(Layer, i64)> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let conflict = || format!("Layer '{}' already exists on Postgis.", name);
        lock_layer(&tx, name).await?;

        let row = tx
            .query_one(
                &format!(
                    "INSERT INTO {} (name) VALUES ($1) RETURNING id, name, created_at",
                    self.schema.table("layers")
                ),
                &[&name],
            )
            .await
            .map_err(|e| conflict_or(e, conflict()))?;
        let layer = layer_from_row(&row)?;
        let batch_id = self.write_batch(&tx, Some(layer.id), batch).await?;
        tx.commit().await?;

        tracing::info!(layer = name, batch_id, "Layer created");
        Ok((layer, batch_id))
    }

    async fn insert_batch(&self, layer_id: Option<i64>, batch: &NewBatch) -> LayerResult<i64> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let batch_id = self.write_batch(&tx, layer_id, batch).await?;
        tx.commit().await?;
        Ok(batch_id)
    }

    async fn get_batch(&self, id: i64) -> LayerResult<Option<Batch>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(&self.schema.select_batch_sql(), &[&id])
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn list_geometries(&self, batch_id: i64) -> LayerResult<Vec<GeometryRecord>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT id, batch_id, ST_AsEWKT(geometry) AS geometry, name, description, json \
                     FROM {} WHERE batch_id = $1 ORDER BY id",
                    self.schema.table("geometries")
                ),
                &[&batch_id],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let metadata: Option<Value> = row.try_get("json")?;
                Ok(GeometryRecord {
                    id: row.try_get("id")?,
                    batch_id: row.try_get("batch_id")?,
                    geometry: row.try_get("geometry")?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    metadata: match metadata {
                        Some(Value::Object(map)) => Some(map),
                        _ => None,
                    },
                })
            })
            .collect()
    }

    async fn create_view(&self, layer: &str, if_exists: ExistsPolicy) -> LayerResult<()> {
        let client = self.pool.get().await?;
        if self.view_exists(&client, layer).await? {
            match if_exists {
                ExistsPolicy::Fail => {
                    return Err(LayerError::conflict(format!(
                        "View '{}' already exists on Postgis.",
                        layer
                    )));
                }
                ExistsPolicy::Ignore => return Ok(()),
                ExistsPolicy::Replace => {}
            }
        }
        client
            .batch_execute(&self.schema.create_view_sql(layer))
            .await?;
        tracing::info!(layer, "View created");
        Ok(())
    }

    async fn drop_view(
        &self,
        layer: &str,
        if_missing: MissingPolicy,
        cascade: bool,
    ) -> LayerResult<()> {
        let client = self.pool.get().await?;
        if !self.view_exists(&client, layer).await? {
            return match if_missing {
                MissingPolicy::Fail => Err(LayerError::not_found(format!(
                    "View {} doesn't exist on Postgis.",
                    layer
                ))),
                MissingPolicy::Ignore => Ok(()),
            };
        }
        client
            .batch_execute(&self.schema.drop_view_sql(layer, cascade))
            .await?;
        tracing::info!(layer, "View dropped");
        Ok(())
    }

    async fn drop_layer(
        &self,
        layer: &str,
        if_missing: MissingPolicy,
        cascade: bool,
    ) -> LayerResult<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        lock_layer(&tx, layer).await?;

        if cascade {
            let deleted = tx
                .execute(&self.schema.delete_layer_geometries_sql(), &[&layer])
                .await?;
            tracing::debug!(layer, deleted, "Layer geometries deleted");
        }
        let removed = tx
            .execute(
                &format!("DELETE FROM {} WHERE name = $1", self.schema.table("layers")),
                &[&layer],
            )
            .await?;
        if removed == 0 && if_missing == MissingPolicy::Fail {
            return Err(LayerError::not_found(format!(
                "Layer {} doesn't exist on Postgis.",
                layer
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn drop_batches(&self, ids: &[i64], cascade: bool) -> LayerResult<u64> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let geometries = self.schema.table("geometries");

        let row = tx
            .query_one(
                &format!("SELECT count(*) FROM {} WHERE batch_id = ANY($1)", geometries),
                &[&ids],
            )
            .await?;
        let attached: i64 = row.try_get(0)?;
        if !cascade && attached > 0 {
            return Err(LayerError::validation(format!(
                "Batch deletion prevented! There are {} geometries attached to this batch. \
                 Set 'cascade' to true to proceed with Geometry deletion as well.",
                attached
            )));
        }

        if cascade {
            tx.execute(
                &format!(
                    "UPDATE {} SET batch_id = NULL WHERE batch_id = ANY($1)",
                    self.schema.table("logs")
                ),
                &[&ids],
            )
            .await?;
        }
        let deleted = tx
            .execute(
                &format!("DELETE FROM {} WHERE batch_id = ANY($1)", geometries),
                &[&ids],
            )
            .await?;
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ANY($1)", self.schema.table("batches")),
            &[&ids],
        )
        .await
        .map_err(|e| {
            if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                LayerError::validation(
                    "Batch deletion prevented! Status logs reference this batch. \
                     Set 'cascade' to true to detach them.",
                )
            } else {
                e.into()
            }
        })?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn drop_geometries(&self, ids: &[i64]) -> LayerResult<u64> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                &format!(
                    "DELETE FROM {} WHERE id = ANY($1)",
                    self.schema.table("geometries")
                ),
                &[&ids],
            )
            .await?;
        Ok(deleted)
    }

    async fn count_layer_geometries(&self, layer: &str) -> LayerResult<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(&self.schema.count_layer_geometries_sql(), &[&layer])
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn bbox(&self, layer: &str) -> LayerResult<Option<BoundingBox>> {
        let client = self.pool.get().await?;
        let row = client.query_one(&self.schema.bbox_sql(), &[&layer]).await?;
        let text: Option<String> = row.try_get(0)?;
        text.as_deref().map(parse_extent).transpose()
    }

    async fn default_extent(&self) -> LayerResult<BoundingBox> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &self.schema.default_extent_sql(),
                &[
                    &DEFAULT_BBOX.minx,
                    &DEFAULT_BBOX.miny,
                    &DEFAULT_BBOX.maxx,
                    &DEFAULT_BBOX.maxy,
                ],
            )
            .await?;
        let text: String = row.try_get(0)?;
        parse_extent(&text)
    }

    async fn insert_log(&self, log: &StatusLog) -> LayerResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO {} (endpoint, layer, status, message, url, json, batch_id, \
                     created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     RETURNING id",
                    self.schema.table("logs")
                ),
                &[
                    &log.endpoint,
                    &log.layer,
                    &log.status,
                    &log.message,
                    &log.url,
                    &log.metadata,
                    &log.batch_id,
                    &log.created_at,
                    &log.updated_at,
                ],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn get_log(&self, id: i64) -> LayerResult<Option<StatusLog>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT id, endpoint, layer, status, message, url, json, batch_id, \
                     created_at, updated_at FROM {} WHERE id = $1",
                    self.schema.table("logs")
                ),
                &[&id],
            )
            .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn save_log(&self, log: &StatusLog) -> LayerResult<()> {
        let id = log
            .id
            .ok_or_else(|| LayerError::validation("Status log has no id"))?;
        let client = self.pool.get().await?;
        client
            .execute(
                &format!(
                    "UPDATE {} SET endpoint = $2, layer = $3, status = $4, message = $5, url = $6, \
                     json = $7, batch_id = $8, updated_at = $9 WHERE id = $1",
                    self.schema.table("logs")
                ),
                &[
                    &id,
                    &log.endpoint,
                    &log.layer,
                    &log.status,
                    &log.message,
                    &log.url,
                    &log.metadata,
                    &log.batch_id,
                    &log.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> LayerResult<bool> {
        let client = match self.pool.get().await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "PostGIS health check failed");
                return Ok(false);
            }
        };
        match client.query_one("SELECT 1", &[]).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "PostGIS health check failed");
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &'static str {
        "postgis"
    }
}
