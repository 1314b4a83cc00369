//! Background execution of layer operations
//!
//! A [`Job`] names one orchestrator operation, the status log narrating it,
//! and the staged files it reads. The [`JobRunner`] executes jobs on a pool
//! of tokio workers with bounded retries for upstream failures.

pub mod retry;
pub mod runner;
pub mod staging;

pub use retry::RetryPolicy;
pub use runner::{JobContext, JobRunner, RunnerConfig};
pub use staging::Staging;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::geometry::ErrorPolicy;
use crate::models::{BatchMetadata, ExistsPolicy, MissingPolicy};
use crate::status::adapter::debug_metadata;

/// Operation carried by a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Create {
        layer: String,
        #[serde(default)]
        metadata: BatchMetadata,
        #[serde(default)]
        error_handle: ErrorPolicy,
    },
    Append {
        layer: String,
        #[serde(default)]
        metadata: BatchMetadata,
        #[serde(default)]
        error_handle: ErrorPolicy,
    },
    Delete {
        layer: String,
        #[serde(default)]
        delete_geometries: bool,
        #[serde(default)]
        error_handle: MissingPolicy,
    },
    IngestBatch {
        #[serde(default)]
        metadata: BatchMetadata,
        #[serde(default)]
        error_handle: ErrorPolicy,
    },
    PublishView {
        layer: String,
        #[serde(default)]
        if_exists: ExistsPolicy,
    },
    DeleteBatches {
        ids: Vec<i64>,
        #[serde(default)]
        cascade: bool,
    },
    DeleteGeometries {
        ids: Vec<i64>,
    },
}

impl JobKind {
    /// Endpoint recorded on the status log
    pub fn endpoint(&self) -> &'static str {
        match self {
            JobKind::Create { .. } => "layer/create",
            JobKind::Append { .. } => "layer/append",
            JobKind::Delete { .. } => "layer/delete",
            JobKind::IngestBatch { .. } => "batch/create",
            JobKind::PublishView { .. } => "view/push",
            JobKind::DeleteBatches { .. } => "batch/delete",
            JobKind::DeleteGeometries { .. } => "geometry/delete",
        }
    }

    pub fn layer(&self) -> Option<&str> {
        match self {
            JobKind::Create { layer, .. }
            | JobKind::Append { layer, .. }
            | JobKind::Delete { layer, .. }
            | JobKind::PublishView { layer, .. } => Some(layer),
            _ => None,
        }
    }

    /// Whether the operation reads boundary files
    pub fn needs_files(&self) -> bool {
        matches!(
            self,
            JobKind::Create { .. } | JobKind::Append { .. } | JobKind::IngestBatch { .. }
        )
    }
}

/// A unit of work bound to a status log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub log_id: i64,
    #[serde(flatten)]
    pub kind: JobKind,
    /// Staged copies of the uploaded files
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl Job {
    pub fn new(log_id: i64, kind: JobKind, files: Vec<PathBuf>) -> Self {
        Self {
            log_id,
            kind,
            files,
        }
    }

    /// Redacted arguments recorded with a failure
    pub fn debug_metadata(&self) -> Value {
        let params = serde_json::to_value(&self.kind).unwrap_or(Value::Null);
        debug_metadata(&params, &self.files)
    }
}
