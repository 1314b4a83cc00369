//! Persistent entities of the layer store
//!
//! Layers own batches, batches own geometries, and status logs narrate the
//! operations that touch them.

pub mod batch;
pub mod log;
pub mod policy;

pub use batch::{
    Batch, BatchMetadata, BatchRecord, GeometryRecord, Layer, NewBatch, NewGeometry, Provenance,
};
pub use log::{StatusLog, StatusRecord, StatusUpdate};
pub use policy::{ExistsPolicy, MissingPolicy};

use serde::{Deserialize, Serialize};

/// Default extent of a layer without rows, in EPSG:4326 degrees
///
/// Stores reproject it to the deployment SRID before it is published.
pub const DEFAULT_BBOX: BoundingBox = BoundingBox {
    minx: -73.4154357571,
    miny: -53.628348965,
    maxx: -55.25,
    maxy: -21.8323104794,
};

/// Planar extent in the deployment coordinate system
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BoundingBox {
    /// Parse the text form returned by `ST_Extent`, e.g. `BOX(1 2,3 4)`.
    pub fn parse_box2d(text: &str) -> Option<Self> {
        let inner = text.trim().strip_prefix("BOX(")?.strip_suffix(')')?;
        let (min, max) = inner.split_once(',')?;
        let mut min = min.split_whitespace().map(str::parse::<f64>);
        let mut max = max.split_whitespace().map(str::parse::<f64>);
        Some(Self {
            minx: min.next()?.ok()?,
            miny: min.next()?.ok()?,
            maxx: max.next()?.ok()?,
            maxy: max.next()?.ok()?,
        })
    }

    /// Smallest box covering both
    pub fn union(self, other: BoundingBox) -> BoundingBox {
        BoundingBox {
            minx: self.minx.min(other.minx),
            miny: self.miny.min(other.miny),
            maxx: self.maxx.max(other.maxx),
            maxy: self.maxy.max(other.maxy),
        }
    }
}
