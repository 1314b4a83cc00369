//! CLI-specific error types

use std::path::PathBuf;
use thiserror::Error;

use crate::error::LayerError;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("{0}")]
    Layer(#[from] LayerError),

    #[error("Job {log_id} finished with status {status}")]
    JobFailed { log_id: i64, status: i32 },

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<anyhow::Error> for CliError {
    fn from(error: anyhow::Error) -> Self {
        CliError::Setup(format!("{:#}", error))
    }
}
