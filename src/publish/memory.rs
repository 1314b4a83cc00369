//! In-process tile publisher

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{
    TilePublisher, layer_exists_error, layer_missing_error, style_exists_error,
    style_in_use_error, style_missing_error,
};
use crate::error::{LayerError, LayerResult};
use crate::models::{BoundingBox, ExistsPolicy, MissingPolicy};

const WORKSPACE: &str = "memory";

#[derive(Debug, Default)]
struct State {
    layers: BTreeMap<String, BoundingBox>,
    styles: BTreeMap<String, String>,
    default_styles: BTreeMap<String, String>,
}

/// Tile publisher kept in memory, with failure injection for tests
#[derive(Default)]
pub struct MemoryPublisher {
    state: Mutex<State>,
    failing_creates: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` layer creations fail with an upstream error
    pub fn fail_next_creates(&self, times: usize) {
        self.failing_creates.store(times, Ordering::SeqCst);
    }

    /// Make every call fail as if the server were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Extent a layer was published with
    pub async fn layer_bbox(&self, layer: &str) -> Option<BoundingBox> {
        self.state.lock().await.layers.get(layer).copied()
    }

    pub async fn default_style(&self, layer: &str) -> Option<String> {
        self.state.lock().await.default_styles.get(layer).cloned()
    }

    fn ensure_online(&self) -> LayerResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LayerError::upstream(
                "HTTP error: Geoserver is unreachable",
            ));
        }
        Ok(())
    }

    fn injected_create_failure(&self) -> bool {
        self.failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TilePublisher for MemoryPublisher {
    async fn list_layers(&self) -> LayerResult<Vec<String>> {
        self.ensure_online()?;
        Ok(self.state.lock().await.layers.keys().cloned().collect())
    }

    async fn create_layer(
        &self,
        layer: &str,
        bbox: BoundingBox,
        if_exists: ExistsPolicy,
    ) -> LayerResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if state.layers.contains_key(layer) {
            match if_exists {
                ExistsPolicy::Fail => return Err(layer_exists_error(layer)),
                ExistsPolicy::Ignore => return Ok(()),
                ExistsPolicy::Replace => {
                    state.layers.remove(layer);
                    state.default_styles.remove(layer);
                }
            }
        }
        if self.injected_create_failure() {
            return Err(LayerError::upstream(format!(
                "Geoserver request {} failed with 503 Service Unavailable: ",
                layer
            )));
        }
        state.layers.insert(layer.to_string(), bbox);
        Ok(())
    }

    async fn delete_layer(&self, layer: &str, if_missing: MissingPolicy) -> LayerResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if state.layers.remove(layer).is_none() && if_missing == MissingPolicy::Fail {
            return Err(layer_missing_error(layer));
        }
        state.default_styles.remove(layer);
        Ok(())
    }

    async fn list_styles(&self) -> LayerResult<Vec<String>> {
        self.ensure_online()?;
        Ok(self.state.lock().await.styles.keys().cloned().collect())
    }

    async fn push_style(
        &self,
        name: &str,
        sld: &str,
        if_exists: ExistsPolicy,
    ) -> LayerResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if state.styles.contains_key(name) {
            match if_exists {
                ExistsPolicy::Fail => return Err(style_exists_error(name, WORKSPACE)),
                ExistsPolicy::Ignore => return Ok(()),
                ExistsPolicy::Replace => {}
            }
        }
        state.styles.insert(name.to_string(), sld.to_string());
        Ok(())
    }

    async fn assign_style(&self, style: &str, layer: &str) -> LayerResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if !state.layers.contains_key(layer) {
            return Err(layer_missing_error(layer));
        }
        if !state.styles.contains_key(style) {
            return Err(style_missing_error(style, WORKSPACE));
        }
        state
            .default_styles
            .insert(layer.to_string(), style.to_string());
        Ok(())
    }

    async fn delete_style(&self, name: &str, _purge: bool, recurse: bool) -> LayerResult<()> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        if !state.styles.contains_key(name) {
            return Err(style_missing_error(name, WORKSPACE));
        }
        let in_use = state.default_styles.values().any(|style| style == name);
        if in_use && !recurse {
            return Err(style_in_use_error(name, WORKSPACE));
        }
        state.default_styles.retain(|_, style| style != name);
        state.styles.remove(name);
        Ok(())
    }

    async fn health_check(&self) -> LayerResult<bool> {
        Ok(!self.offline.load(Ordering::SeqCst))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
