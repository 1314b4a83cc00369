//! Geolayer SDK - boundary file ingestion and layer publishing
//!
//! Provides unified interfaces for:
//! - KML parsing with degenerate ring repair (`geometry`)
//! - Batch generation from boundary files (`ingest`)
//! - Spatial storage on PostGIS or in memory (`store`)
//! - Tile server publishing on Geoserver or in memory (`publish`)
//! - Layer lifecycle across both systems (`lifecycle`)
//! - Pollable status logs (`status`)
//! - Background jobs with bounded retries (`jobs`)

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod geometry;
pub mod ingest;
pub mod jobs;
pub mod lifecycle;
pub mod models;
pub mod publish;
pub mod status;
pub mod store;

// Re-export commonly used types
pub use config::{Settings, sample_config};
pub use error::{ErrorKind, LayerError, LayerResult};
pub use geometry::{BoundaryFile, BoundarySource, ErrorPolicy};
pub use ingest::generate_batch;
pub use jobs::{Job, JobContext, JobKind, JobRunner, RetryPolicy, RunnerConfig, Staging};
pub use lifecycle::{HealthReport, Orchestrator};
pub use publish::{GeoserverClient, GeoserverConfig, MemoryPublisher, TilePublisher};
pub use status::{Tracker, TrackerConfig};
pub use store::{MemoryStore, SpatialStore};

#[cfg(feature = "postgres-backend")]
pub use store::PostgisStore;

// Re-export models
pub use models::{
    BatchMetadata, BoundingBox, ExistsPolicy, MissingPolicy, Provenance, StatusLog, StatusRecord,
    StatusUpdate,
};
