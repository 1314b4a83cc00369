//! GeoServer REST client
//!
//! Publishes store views as feature types of one workspace/datastore pair.
//! All calls use basic auth against `<base_url>/rest`.

use async_trait::async_trait;
use quick_xml::escape::escape;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

use super::{
    TilePublisher, layer_exists_error, layer_missing_error, style_exists_error,
    style_in_use_error, style_missing_error,
};
use crate::config::Settings;
use crate::error::{LayerError, LayerResult};
use crate::models::{BoundingBox, ExistsPolicy, MissingPolicy};

const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Connection settings for one GeoServer workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoserverConfig {
    /// e.g. `http://localhost:8080/geoserver`
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub workspace: String,
    pub datastore: String,
    /// Coordinate system declared on published feature types
    pub srs: String,
}

impl GeoserverConfig {
    pub fn from_settings(settings: &Settings) -> LayerResult<Self> {
        let section = &settings.geoserver;
        if section.base_url.trim().is_empty() {
            return Err(LayerError::validation("Geoserver base_url is not configured"));
        }
        Ok(Self {
            base_url: section.base_url.clone(),
            username: section.username.clone(),
            password: section.password.clone(),
            workspace: section.workspace.clone(),
            datastore: section.datastore.clone(),
            srs: format!("EPSG:{}", settings.srid_code()?),
        })
    }

    /// Absolute URL of a REST resource
    pub fn rest_url(&self, path: &str) -> String {
        format!(
            "{}/rest/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// GeoServer REST client
pub struct GeoserverClient {
    http: Client,
    config: GeoserverConfig,
}

impl GeoserverClient {
    pub fn new(config: GeoserverConfig) -> LayerResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| LayerError::upstream(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &GeoserverConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.config.rest_url(path))
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    async fn get_json(&self, path: &str) -> LayerResult<Value> {
        let response = self
            .request(Method::GET, path)
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = ensure_success(response, path).await?;
        Ok(response.json().await?)
    }

    fn featuretypes_path(&self) -> String {
        format!(
            "workspaces/{}/datastores/{}/featuretypes",
            self.config.workspace, self.config.datastore
        )
    }

    async fn style_exists(&self, name: &str) -> LayerResult<bool> {
        Ok(self.list_styles().await?.iter().any(|style| style == name))
    }
}

/// Turn a non-2xx response into an upstream error carrying the body head
async fn ensure_success(response: Response, path: &str) -> LayerResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LayerError::upstream(format!(
        "Geoserver request {} failed with {}: {}",
        path,
        status,
        body.chars().take(200).collect::<String>()
    )))
}

/// Layer names from a `layers.json` listing
///
/// An empty workspace is reported as `{"layers": ""}`.
pub fn parse_layer_listing(listing: &Value) -> Vec<String> {
    named_entries(listing, "layers", "layer")
}

/// Style names from a `styles.json` listing
pub fn parse_style_listing(listing: &Value) -> Vec<String> {
    named_entries(listing, "styles", "style")
}

fn named_entries(listing: &Value, outer: &str, inner: &str) -> Vec<String> {
    listing
        .get(outer)
        .and_then(Value::as_object)
        .and_then(|entries| entries.get(inner))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Body of a feature type creation request
pub fn feature_type_xml(layer: &str, srs: &str, bbox: &BoundingBox) -> String {
    let srs = escape(srs);
    format!(
        "<featureType><name>{name}</name><nativeCRS>{srs}</nativeCRS><srs>{srs}</srs>\
         <nativeBoundingBox><minx>{minx}</minx><maxx>{maxx}</maxx><miny>{miny}</miny>\
         <maxy>{maxy}</maxy><crs>{srs}</crs></nativeBoundingBox></featureType>",
        name = escape(layer),
        srs = srs,
        minx = bbox.minx,
        maxx = bbox.maxx,
        miny = bbox.miny,
        maxy = bbox.maxy,
    )
}

/// Body of a default style assignment
pub fn default_style_xml(style: &str) -> String {
    format!(
        "<layer><defaultStyle><name>{}</name></defaultStyle></layer>",
        escape(style)
    )
}

#[async_trait]
impl TilePublisher for GeoserverClient {
    async fn list_layers(&self) -> LayerResult<Vec<String>> {
        let listing = self
            .get_json(&format!("workspaces/{}/layers.json", self.config.workspace))
            .await?;
        Ok(parse_layer_listing(&listing))
    }

    async fn create_layer(
        &self,
        layer: &str,
        bbox: BoundingBox,
        if_exists: ExistsPolicy,
    ) -> LayerResult<()> {
        if self.layer_exists(layer).await? {
            match if_exists {
                ExistsPolicy::Fail => return Err(layer_exists_error(layer)),
                ExistsPolicy::Ignore => return Ok(()),
                ExistsPolicy::Replace => self.delete_layer(layer, MissingPolicy::Ignore).await?,
            }
        }

        let path = self.featuretypes_path();
        let response = self
            .request(Method::POST, &path)
            .header("Content-Type", "text/xml")
            .body(feature_type_xml(layer, &self.config.srs, &bbox))
            .send()
            .await?;
        ensure_success(response, &path).await?;
        tracing::info!(
            layer,
            workspace = %self.config.workspace,
            minx = bbox.minx,
            miny = bbox.miny,
            maxx = bbox.maxx,
            maxy = bbox.maxy,
            "Geoserver layer published"
        );
        Ok(())
    }

    async fn delete_layer(&self, layer: &str, if_missing: MissingPolicy) -> LayerResult<()> {
        if !self.layer_exists(layer).await? {
            return match if_missing {
                MissingPolicy::Fail => Err(layer_missing_error(layer)),
                MissingPolicy::Ignore => Ok(()),
            };
        }

        let layer_path = format!("layers/{}:{}.xml", self.config.workspace, layer);
        let response = self.request(Method::DELETE, &layer_path).send().await?;
        ensure_success(response, &layer_path).await?;

        let featuretype_path = format!("{}/{}.xml", self.featuretypes_path(), layer);
        let response = self
            .request(Method::DELETE, &featuretype_path)
            .send()
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            ensure_success(response, &featuretype_path).await?;
        }
        tracing::info!(layer, workspace = %self.config.workspace, "Geoserver layer deleted");
        Ok(())
    }

    async fn list_styles(&self) -> LayerResult<Vec<String>> {
        let listing = self
            .get_json(&format!("workspaces/{}/styles.json", self.config.workspace))
            .await?;
        Ok(parse_style_listing(&listing))
    }

    async fn push_style(
        &self,
        name: &str,
        sld: &str,
        if_exists: ExistsPolicy,
    ) -> LayerResult<()> {
        if self.style_exists(name).await? {
            match if_exists {
                ExistsPolicy::Fail => {
                    return Err(style_exists_error(name, &self.config.workspace));
                }
                ExistsPolicy::Ignore => return Ok(()),
                ExistsPolicy::Replace => self.delete_style(name, true, true).await?,
            }
        }

        let path = format!(
            "workspaces/{}/styles?name={}",
            self.config.workspace,
            urlencoding::encode(name)
        );
        let response = self
            .request(Method::POST, &path)
            .header("Content-Type", "application/vnd.ogc.sld+xml")
            .body(sld.to_string())
            .send()
            .await?;
        ensure_success(response, &path).await?;
        tracing::info!(style = name, workspace = %self.config.workspace, "Style uploaded");
        Ok(())
    }

    async fn assign_style(&self, style: &str, layer: &str) -> LayerResult<()> {
        if !self.layer_exists(layer).await? {
            return Err(layer_missing_error(layer));
        }
        if !self.style_exists(style).await? {
            return Err(style_missing_error(style, &self.config.workspace));
        }
        let path = format!("workspaces/{}/layers/{}", self.config.workspace, layer);
        let response = self
            .request(Method::PUT, &path)
            .header("Content-Type", "text/xml")
            .body(default_style_xml(style))
            .send()
            .await?;
        ensure_success(response, &path).await?;
        Ok(())
    }

    async fn delete_style(&self, name: &str, purge: bool, recurse: bool) -> LayerResult<()> {
        if !self.style_exists(name).await? {
            return Err(style_missing_error(name, &self.config.workspace));
        }
        let path = format!(
            "workspaces/{}/styles/{}?purge={}&recurse={}",
            self.config.workspace,
            urlencoding::encode(name),
            purge,
            recurse
        );
        let response = self.request(Method::DELETE, &path).send().await?;
        if response.status() == StatusCode::FORBIDDEN {
            return Err(style_in_use_error(name, &self.config.workspace));
        }
        ensure_success(response, &path).await?;
        Ok(())
    }

    async fn health_check(&self) -> LayerResult<bool> {
        match self
            .request(Method::GET, "about/system-status")
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!(error = %e, "Geoserver health check failed");
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &'static str {
        "geoserver"
    }
}
