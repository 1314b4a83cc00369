//! Wiring shared by the commands

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;

use crate::cli::error::CliError;
use crate::config::Settings;
use crate::jobs::{JobContext, RetryPolicy, Staging};
use crate::lifecycle::Orchestrator;
use crate::publish::{GeoserverClient, GeoserverConfig};
use crate::status::TrackerConfig;
use crate::store::PostgisStore;

/// Store, tile server and tracking configured from one settings file
pub struct Services {
    pub settings: Settings,
    pub store: Arc<PostgisStore>,
    pub orchestrator: Orchestrator,
    pub tracker_config: TrackerConfig,
}

impl Services {
    pub fn connect(settings_path: Option<&Path>) -> anyhow::Result<Self> {
        let settings = Settings::load(settings_path).context("Failed to load settings")?;

        let connection_string = settings.postgis.connection_string.as_deref().context(
            "PostGIS connection string not configured. Set [postgis] connection_string or GEOLAYER_POSTGIS_URL.",
        )?;
        let srid = settings.srid_code()?;
        let store = Arc::new(
            PostgisStore::new(
                connection_string,
                &settings.postgis.schema,
                srid,
                settings.postgis.pool_size,
            )
            .context("Failed to configure PostGIS store")?,
        );

        let geoserver = GeoserverConfig::from_settings(&settings)
            .context("Failed to configure Geoserver client")?;
        let publisher = Arc::new(GeoserverClient::new(geoserver)?);

        let orchestrator = Orchestrator::new(store.clone(), publisher)
            .with_chunk_size(settings.parser.chunk_size);
        let tracker_config = TrackerConfig::from_settings(&settings)?;

        Ok(Self {
            settings,
            store,
            orchestrator,
            tracker_config,
        })
    }

    /// Job context that runs attempts inline, with the configured retries
    pub fn job_context(&self) -> JobContext {
        JobContext::new(
            self.orchestrator.clone(),
            Staging::new(&self.settings.staging.root),
            self.tracker_config.clone(),
            RetryPolicy::from_settings(&self.settings.jobs),
        )
    }
}

pub fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::IoError(format!("Failed to create runtime: {}", e)))
}
