//! Setup and inspection commands

use std::path::{Path, PathBuf};

use super::setup::{Services, runtime};
use crate::cli::error::CliError;
use crate::config::{CONFIG_FILENAME, sample_config};
use crate::status::Tracker;
use crate::store::SpatialStore;

/// Create the store schema
pub fn handle_init(settings: Option<PathBuf>) -> Result<(), CliError> {
    let rt = runtime()?;
    rt.block_on(async {
        let services = Services::connect(settings.as_deref())?;
        services.store.initialize().await?;
        eprintln!(
            "Initialized schema '{}' on {}",
            services.settings.postgis.schema,
            services.store.connection_string_masked()
        );
        Ok::<(), CliError>(())
    })
}

/// Print a status log as a client would poll it
pub fn handle_status(settings: Option<PathBuf>, log_id: i64) -> Result<(), CliError> {
    let rt = runtime()?;
    rt.block_on(async {
        let services = Services::connect(settings.as_deref())?;
        let tracker =
            Tracker::load(services.store.clone(), services.tracker_config.clone(), log_id).await?;
        let record = tracker.record().await?;
        let output = serde_json::to_string_pretty(&record)
            .map_err(|e| CliError::IoError(format!("Failed to render status: {}", e)))?;
        println!("{}", output);
        Ok::<(), CliError>(())
    })
}

/// Check that the store and the tile server answer
pub fn handle_health(settings: Option<PathBuf>) -> Result<(), CliError> {
    let rt = runtime()?;
    rt.block_on(async {
        let services = Services::connect(settings.as_deref())?;
        let report = services.orchestrator.health_check().await;
        let output = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::IoError(format!("Failed to render health: {}", e)))?;
        println!("{}", output);
        if report.store && report.publisher {
            Ok::<(), CliError>(())
        } else {
            Err(CliError::Setup("Health check failed".to_string()))
        }
    })
}

/// Print the sample settings file, or write it when `output` is given
pub fn handle_sample_config(output: Option<&Path>, force: bool) -> Result<(), CliError> {
    let Some(output) = output else {
        print!("{}", sample_config());
        return Ok(());
    };

    let target = if output.is_dir() {
        output.join(CONFIG_FILENAME)
    } else {
        output.to_path_buf()
    };
    if target.exists() && !force {
        return Err(CliError::InvalidArgument(format!(
            "{} already exists. Use --force to overwrite.",
            target.display()
        )));
    }
    std::fs::write(&target, sample_config())
        .map_err(|e| CliError::IoError(format!("Failed to write {}: {}", target.display(), e)))?;
    eprintln!("Wrote {}", target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use tempfile::tempdir;

    #[test]
    fn test_sample_config_written_into_directory() {
        let dir = tempdir().unwrap();
        handle_sample_config(Some(dir.path()), false).unwrap();

        let written = std::fs::read_to_string(dir.path().join(CONFIG_FILENAME)).unwrap();
        assert!(Settings::parse(&written).is_ok());
        assert!(matches!(
            handle_sample_config(Some(dir.path()), false),
            Err(CliError::InvalidArgument(_))
        ));
        handle_sample_config(Some(dir.path()), true).unwrap();
    }
}
