//! Tile-publishing abstraction
//!
//! A publisher exposes stored views as named layers of a tile server and
//! manages the styles they render with. Two implementations are provided:
//! - GeoServer REST: the production target
//! - Memory: an in-process target for tests and dry runs

use async_trait::async_trait;

pub mod geoserver;
pub mod memory;

pub use geoserver::{GeoserverClient, GeoserverConfig};
pub use memory::MemoryPublisher;

use crate::error::{LayerError, LayerResult};
use crate::models::{BoundingBox, ExistsPolicy, MissingPolicy};

/// Tile server operations
#[async_trait]
pub trait TilePublisher: Send + Sync {
    /// Names of the layers published in the configured workspace
    async fn list_layers(&self) -> LayerResult<Vec<String>>;

    async fn layer_exists(&self, layer: &str) -> LayerResult<bool> {
        Ok(self.list_layers().await?.iter().any(|name| name == layer))
    }

    /// Publish the store view named `layer` with the given native extent
    async fn create_layer(
        &self,
        layer: &str,
        bbox: BoundingBox,
        if_exists: ExistsPolicy,
    ) -> LayerResult<()>;

    /// Remove a published layer and its feature type
    async fn delete_layer(&self, layer: &str, if_missing: MissingPolicy) -> LayerResult<()>;

    /// Names of the styles in the configured workspace
    async fn list_styles(&self) -> LayerResult<Vec<String>>;

    /// Upload an SLD document as a named style
    async fn push_style(&self, name: &str, sld: &str, if_exists: ExistsPolicy)
    -> LayerResult<()>;

    /// Make `style` the default style of `layer`
    async fn assign_style(&self, style: &str, layer: &str) -> LayerResult<()>;

    /// Delete a style; without `recurse` a style in use is refused
    async fn delete_style(&self, name: &str, purge: bool, recurse: bool) -> LayerResult<()>;

    async fn health_check(&self) -> LayerResult<bool>;

    fn backend_type(&self) -> &'static str;
}

pub(crate) fn layer_exists_error(layer: &str) -> LayerError {
    LayerError::conflict(format!("Layer '{}' already exists on Geoserver.", layer))
}

pub(crate) fn layer_missing_error(layer: &str) -> LayerError {
    LayerError::not_found(format!("Layer {} doesn't exist on Geoserver.", layer))
}

pub(crate) fn style_exists_error(style: &str, workspace: &str) -> LayerError {
    LayerError::conflict(format!(
        "Style '{}' already exists on workspace '{}'.",
        style, workspace
    ))
}

pub(crate) fn style_missing_error(style: &str, workspace: &str) -> LayerError {
    LayerError::not_found(format!(
        "Style '{}' doesn't exist on workspace '{}'.",
        style, workspace
    ))
}

pub(crate) fn style_in_use_error(style: &str, workspace: &str) -> LayerError {
    LayerError::validation(format!(
        "Style '{}' on workspace '{}' can't be deleted while it is currently being used by \
         some layer. Try to free it using Geoserver or force delete using parameter \
         'recurse=True'",
        style, workspace
    ))
}
