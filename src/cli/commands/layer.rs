//! Layer and batch commands
//!
//! Every command stages its files, opens a status log and runs the job
//! inline. The final status record is printed as JSON on stdout.

use std::path::PathBuf;

use super::setup::{Services, runtime};
use crate::cli::error::CliError;
use crate::geometry::{BoundarySource, ErrorPolicy};
use crate::jobs::JobKind;
use crate::models::{BatchMetadata, ExistsPolicy, MissingPolicy, Provenance};
use crate::status::{Tracker, codes};

/// Provenance flags shared by the ingesting commands
#[derive(Debug, Clone, Default)]
pub struct ProvenanceArgs {
    pub project: Option<String>,
    pub program: Option<String>,
    pub province: Option<String>,
    pub department: Option<String>,
    pub municipality: Option<String>,
    pub locality: Option<String>,
    pub state: Option<String>,
    pub description: Option<String>,
    pub quantity: Option<String>,
    pub category: Option<String>,
    pub agency: Option<String>,
    pub source: Option<String>,
    /// Free-form JSON stored beside the provenance columns
    pub extra: Option<String>,
}

impl ProvenanceArgs {
    pub fn into_metadata(self) -> Result<BatchMetadata, CliError> {
        let extra = self
            .extra
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| CliError::InvalidArgument(format!("--extra is not valid JSON: {}", e)))?;
        Ok(BatchMetadata {
            provenance: Provenance {
                project: self.project,
                program: self.program,
                province: self.province,
                department: self.department,
                municipality: self.municipality,
                locality: self.locality,
                state: self.state,
                description: self.description,
                quantity: self.quantity,
                category: self.category,
                agency: self.agency,
                source: self.source,
            },
            extra,
        })
    }
}

/// Arguments of `create`, `append` and `ingest`
#[derive(Debug, Clone)]
pub struct IngestArgs {
    pub settings: Option<PathBuf>,
    /// Target layer; `None` for a standalone batch
    pub layer: Option<String>,
    /// Paths or URLs of boundary files
    pub files: Vec<String>,
    pub error_handle: ErrorPolicy,
    pub provenance: ProvenanceArgs,
}

#[derive(Debug, Clone)]
pub struct DeleteArgs {
    pub settings: Option<PathBuf>,
    pub layer: String,
    pub delete_geometries: bool,
    pub if_missing: MissingPolicy,
}

#[derive(Debug, Clone)]
pub struct PublishViewArgs {
    pub settings: Option<PathBuf>,
    pub layer: String,
    pub if_exists: ExistsPolicy,
}

fn boundary_sources(files: &[String]) -> Result<Vec<BoundarySource>, CliError> {
    if files.is_empty() {
        return Err(CliError::InvalidArgument(
            "At least one boundary file is required".to_string(),
        ));
    }
    files
        .iter()
        .map(|file| match BoundarySource::parse(file) {
            BoundarySource::Path(path) if !path.exists() => Err(CliError::FileNotFound(path)),
            source => Ok(source),
        })
        .collect()
}

fn require_layer(args: &IngestArgs) -> Result<String, CliError> {
    args.layer
        .clone()
        .ok_or_else(|| CliError::InvalidArgument("A layer name is required".to_string()))
}

/// Run one job to completion and print its status record
fn run_job(
    settings: Option<PathBuf>,
    kind: JobKind,
    uploads: Vec<BoundarySource>,
) -> Result<(), CliError> {
    let rt = runtime()?;
    rt.block_on(run_job_async(settings, kind, uploads))
}

async fn run_job_async(
    settings: Option<PathBuf>,
    kind: JobKind,
    uploads: Vec<BoundarySource>,
) -> Result<(), CliError> {
    let services = Services::connect(settings.as_deref())?;
    let context = services.job_context();

    let job = context.accept(kind, &uploads).await?;
    let log = context.run(&job).await?;

    let tracker = Tracker::load(
        services.store.clone(),
        services.tracker_config.clone(),
        job.log_id,
    )
    .await?;
    let record = tracker.record().await?;
    let output = serde_json::to_string_pretty(&record)
        .map_err(|e| CliError::IoError(format!("Failed to render status: {}", e)))?;
    println!("{}", output);

    if log.status == codes::SUCCESS {
        Ok(())
    } else {
        Err(CliError::JobFailed {
            log_id: job.log_id,
            status: log.status,
        })
    }
}

pub fn handle_create(args: IngestArgs) -> Result<(), CliError> {
    let layer = require_layer(&args)?;
    let uploads = boundary_sources(&args.files)?;
    let kind = JobKind::Create {
        layer,
        metadata: args.provenance.into_metadata()?,
        error_handle: args.error_handle,
    };
    run_job(args.settings, kind, uploads)
}

pub fn handle_append(args: IngestArgs) -> Result<(), CliError> {
    let layer = require_layer(&args)?;
    let uploads = boundary_sources(&args.files)?;
    let kind = JobKind::Append {
        layer,
        metadata: args.provenance.into_metadata()?,
        error_handle: args.error_handle,
    };
    run_job(args.settings, kind, uploads)
}

pub fn handle_ingest(args: IngestArgs) -> Result<(), CliError> {
    let uploads = boundary_sources(&args.files)?;
    let kind = JobKind::IngestBatch {
        metadata: args.provenance.into_metadata()?,
        error_handle: args.error_handle,
    };
    run_job(args.settings, kind, uploads)
}

pub fn handle_delete(args: DeleteArgs) -> Result<(), CliError> {
    let kind = JobKind::Delete {
        layer: args.layer,
        delete_geometries: args.delete_geometries,
        error_handle: args.if_missing,
    };
    run_job(args.settings, kind, Vec::new())
}

pub fn handle_publish_view(args: PublishViewArgs) -> Result<(), CliError> {
    let kind = JobKind::PublishView {
        layer: args.layer,
        if_exists: args.if_exists,
    };
    run_job(args.settings, kind, Vec::new())
}

pub fn handle_delete_batches(
    settings: Option<PathBuf>,
    ids: Vec<i64>,
    cascade: bool,
) -> Result<(), CliError> {
    run_job(settings, JobKind::DeleteBatches { ids, cascade }, Vec::new())
}

pub fn handle_delete_geometries(settings: Option<PathBuf>, ids: Vec<i64>) -> Result<(), CliError> {
    run_job(settings, JobKind::DeleteGeometries { ids }, Vec::new())
}
