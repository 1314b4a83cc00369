//! PostGIS schema definitions and SQL builders
//!
//! Table and view names are interpolated into SQL text, so they always pass
//! through [`quote_ident`] / [`quote_literal`]. Values travel as bind
//! parameters everywhere else.

/// Schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Tables sharing the schema with the per-layer views
pub const STORE_TABLES: [&str; 5] = ["layers", "batches", "geometries", "logs", "schema_version"];

/// Provenance columns of `batches` in storage order
pub const PROVENANCE_COLUMNS: [&str; 12] = [
    "project",
    "program",
    "province",
    "department",
    "municipality",
    "locality",
    "state",
    "description",
    "quantity",
    "category",
    "agency",
    "source",
];

/// View column aliases for each provenance column, as published to the
/// tile server
const VIEW_ALIASES: [&str; 12] = [
    "obra",
    "operatoria",
    "provincia",
    "departamento",
    "municipio",
    "localidad",
    "estado",
    "descripción",
    "cantidad",
    "categoría",
    "ente",
    "fuente",
];

/// SQL for one configured schema and deployment SRID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSchema {
    pub schema: String,
    pub srid: i32,
}

impl StoreSchema {
    pub fn new(schema: impl Into<String>, srid: i32) -> Self {
        Self {
            schema: schema.into(),
            srid,
        }
    }

    /// Qualified name of a table in the configured schema
    pub fn table(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(name))
    }

    /// Tables, indexes and extension
    pub fn create_tables_sql(&self) -> String {
        let layers = self.table("layers");
        let batches = self.table("batches");
        let geometries = self.table("geometries");
        let logs = self.table("logs");
        let provenance: String = PROVENANCE_COLUMNS
            .iter()
            .map(|column| format!("    {} TEXT,\n", column))
            .collect();

        format!(
            r#"
CREATE EXTENSION IF NOT EXISTS postgis;
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {schema}.schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS {layers} (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS {batches} (
    id BIGSERIAL PRIMARY KEY,
{provenance}    json JSONB,
    layer_id BIGINT REFERENCES {layers}(id) ON DELETE SET NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS {geometries} (
    id BIGSERIAL PRIMARY KEY,
    geometry geometry(GEOMETRYZ, {srid}) NOT NULL,
    name TEXT,
    description TEXT,
    json JSONB,
    batch_id BIGINT REFERENCES {batches}(id) ON DELETE RESTRICT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS {logs} (
    id BIGSERIAL PRIMARY KEY,
    endpoint TEXT,
    layer TEXT,
    status INTEGER,
    message TEXT,
    url TEXT,
    json JSONB,
    batch_id BIGINT REFERENCES {batches}(id) ON DELETE RESTRICT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_batches_layer ON {batches}(layer_id);
CREATE INDEX IF NOT EXISTS idx_geometries_batch ON {geometries}(batch_id);
CREATE INDEX IF NOT EXISTS idx_geometries_geometry ON {geometries} USING GIST (geometry);
CREATE INDEX IF NOT EXISTS idx_logs_updated_at ON {logs}(updated_at);
"#,
            schema = quote_ident(&self.schema),
            srid = self.srid,
        )
    }

    /// Projection of one layer's geometries with batch provenance
    pub fn create_view_sql(&self, layer: &str) -> String {
        let columns: String = PROVENANCE_COLUMNS
            .iter()
            .zip(VIEW_ALIASES.iter())
            .map(|(column, alias)| format!("        ba.{} AS {},\n", column, quote_ident(alias)))
            .collect();

        format!(
            r#"CREATE OR REPLACE VIEW {view} AS (
    SELECT
        ge.name AS "nombre",
{columns}        la.name AS "layer",
        ge.geometry AS "geometry"
    FROM {layers} AS la
        JOIN {batches} AS ba ON la.id = ba.layer_id
        JOIN {geometries} AS ge ON ba.id = ge.batch_id
    WHERE la.name = {name}
)"#,
            view = self.table(layer),
            layers = self.table("layers"),
            batches = self.table("batches"),
            geometries = self.table("geometries"),
            name = quote_literal(layer),
        )
    }

    pub fn drop_view_sql(&self, layer: &str, cascade: bool) -> String {
        format!(
            "DROP VIEW IF EXISTS {}{}",
            self.table(layer),
            if cascade { " CASCADE" } else { "" }
        )
    }

    /// Extent of a layer's geometries, as `BOX(minx miny,maxx maxy)` text.
    ///
    /// Reads the tables directly so it does not depend on the view existing.
    pub fn bbox_sql(&self) -> String {
        format!(
            "SELECT ST_Extent(ge.geometry)::text AS bbox {}",
            self.layer_geometries_from()
        )
    }

    /// A lon/lat envelope (`$1..$4`) reprojected to the deployment SRID
    pub fn default_extent_sql(&self) -> String {
        format!(
            "SELECT Box2D(ST_Transform(ST_MakeEnvelope($1, $2, $3, $4, 4326), {}))::text",
            self.srid
        )
    }

    pub fn count_layer_geometries_sql(&self) -> String {
        format!("SELECT count(*) {}", self.layer_geometries_from())
    }

    fn layer_geometries_from(&self) -> String {
        format!(
            "FROM {} AS ge JOIN {} AS ba ON ba.id = ge.batch_id \
             JOIN {} AS la ON la.id = ba.layer_id WHERE la.name = $1",
            self.table("geometries"),
            self.table("batches"),
            self.table("layers"),
        )
    }

    /// Insert one geometry, reprojecting from the EWKT's SRID
    pub fn insert_geometry_sql(&self) -> String {
        format!(
            "INSERT INTO {} (geometry, name, description, json, batch_id) \
             VALUES (ST_Transform(ST_Force3D(ST_GeomFromEWKT($1)), {}), $2, $3, $4, $5)",
            self.table("geometries"),
            self.srid
        )
    }

    pub fn insert_batch_sql(&self) -> String {
        let placeholders: Vec<String> = (1..=PROVENANCE_COLUMNS.len() + 2)
            .map(|i| format!("${}", i))
            .collect();
        format!(
            "INSERT INTO {} ({}, json, layer_id) VALUES ({}) RETURNING id",
            self.table("batches"),
            PROVENANCE_COLUMNS.join(", "),
            placeholders.join(", ")
        )
    }

    pub fn select_batch_sql(&self) -> String {
        format!(
            "SELECT ba.id, ba.layer_id, la.name, {}, ba.json, ba.created_at, \
             (SELECT count(*) FROM {} AS ge WHERE ge.batch_id = ba.id) AS geometries \
             FROM {} AS ba LEFT JOIN {} AS la ON la.id = ba.layer_id WHERE ba.id = $1",
            PROVENANCE_COLUMNS
                .iter()
                .map(|c| format!("ba.{}", c))
                .collect::<Vec<_>>()
                .join(", "),
            self.table("geometries"),
            self.table("batches"),
            self.table("layers"),
        )
    }

    /// Remove a layer's geometries through its batches
    pub fn delete_layer_geometries_sql(&self) -> String {
        format!(
            "DELETE FROM {} AS ge USING {} AS ba, {} AS la \
             WHERE ge.batch_id = ba.id AND ba.layer_id = la.id AND la.name = $1",
            self.table("geometries"),
            self.table("batches"),
            self.table("layers"),
        )
    }
}

/// Quote a SQL identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL string literal, doubling embedded quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
