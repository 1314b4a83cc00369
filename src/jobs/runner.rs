//! Worker pool executing jobs against the orchestrator
//!
//! Each job runs attempt by attempt. An attempt marks the log as processing,
//! runs the operation and either promotes the log to success or records the
//! failure. Only upstream failures are retried; everything else is final on
//! the first attempt. Staged files are purged once the job is over.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::{Job, JobKind, RetryPolicy, Staging};
use crate::config::Settings;
use crate::error::{LayerError, LayerResult};
use crate::geometry::BoundarySource;
use crate::lifecycle::Orchestrator;
use crate::models::{ExistsPolicy, StatusLog, StatusUpdate};
use crate::status::adapter::{failure_update, retry_update};
use crate::status::{Tracker, TrackerConfig, codes};

/// Runner tuning
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub tracker: TrackerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            retry: RetryPolicy::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn from_settings(settings: &Settings) -> LayerResult<Self> {
        Ok(Self {
            workers: settings.jobs.workers.max(1),
            queue_capacity: settings.jobs.queue_capacity.max(1),
            retry: RetryPolicy::from_settings(&settings.jobs),
            tracker: TrackerConfig::from_settings(settings)?,
        })
    }
}

/// Everything a worker needs to run a job
#[derive(Clone)]
pub struct JobContext {
    orchestrator: Orchestrator,
    staging: Staging,
    tracker_config: TrackerConfig,
    retry: RetryPolicy,
}

impl JobContext {
    pub fn new(
        orchestrator: Orchestrator,
        staging: Staging,
        tracker_config: TrackerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            orchestrator,
            staging,
            tracker_config,
            retry,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn staging(&self) -> &Staging {
        &self.staging
    }

    /// Stage the uploads and open a status log for a new job
    pub async fn accept(&self, kind: JobKind, uploads: &[BoundarySource]) -> LayerResult<Job> {
        if kind.needs_files() && uploads.is_empty() {
            return Err(LayerError::validation(format!(
                "No boundary files given for {}.",
                kind.endpoint()
            )));
        }
        let files = if uploads.is_empty() {
            Vec::new()
        } else {
            self.staging.store(uploads).await?
        };

        let tracker = Tracker::received(
            self.orchestrator.store().clone(),
            self.tracker_config.clone(),
            kind.endpoint(),
            kind.layer(),
        )
        .await;
        let tracker = match tracker {
            Ok(tracker) => tracker,
            Err(e) => {
                self.staging.purge(&files).await;
                return Err(e);
            }
        };
        let log_id = tracker
            .id()
            .ok_or_else(|| LayerError::upstream("Status log was saved without an id."))?;

        Ok(Job::new(log_id, kind, files))
    }

    /// Run a job to its terminal state and return the final log
    ///
    /// Operation failures are recorded on the log and are not errors here;
    /// an error means the log itself could not be read or written.
    pub async fn run(&self, job: &Job) -> LayerResult<StatusLog> {
        let outcome = self.drive(job).await;
        let purged = self.staging.purge(&job.files).await;
        tracing::debug!(log_id = job.log_id, purged, "Staged files purged");
        outcome
    }

    async fn drive(&self, job: &Job) -> LayerResult<StatusLog> {
        let mut tracker = Tracker::load(
            self.orchestrator.store().clone(),
            self.tracker_config.clone(),
            job.log_id,
        )
        .await?;
        if tracker.is_terminal() {
            tracing::warn!(log_id = job.log_id, status = tracker.status(), "Job already finished");
            return Ok(tracker.log().clone());
        }

        let sources: Vec<BoundarySource> =
            job.files.iter().cloned().map(BoundarySource::Path).collect();
        let mut attempt: u32 = 1;
        loop {
            match self.attempt(job, &sources, &mut tracker).await {
                Ok(()) => {
                    if tracker.status() == codes::PROCESSING {
                        tracker
                            .keep_track(StatusUpdate::append("Success").status(codes::SUCCESS))
                            .await?;
                    }
                    tracing::info!(
                        log_id = job.log_id,
                        endpoint = job.kind.endpoint(),
                        attempts = attempt,
                        "Job succeeded"
                    );
                    break;
                }
                Err(e) if e.is_retryable() && self.retry.allows_retry(attempt) => {
                    tracing::error!(
                        log_id = job.log_id,
                        endpoint = job.kind.endpoint(),
                        attempt,
                        error = %e,
                        "Job attempt failed, retrying"
                    );
                    if let Err(record_error) = tracker
                        .keep_track(retry_update(&e, attempt, job.debug_metadata()))
                        .await
                    {
                        tracing::warn!(log_id = job.log_id, error = %record_error, "Failed to record retry");
                    }
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(
                            log_id = job.log_id,
                            endpoint = job.kind.endpoint(),
                            attempts = attempt,
                            error = %e,
                            "Job failed"
                        );
                    } else {
                        tracing::warn!(
                            log_id = job.log_id,
                            endpoint = job.kind.endpoint(),
                            error = %e,
                            "Job rejected"
                        );
                    }
                    tracker
                        .keep_track(failure_update(&e, job.debug_metadata()))
                        .await?;
                    break;
                }
            }
        }
        Ok(tracker.log().clone())
    }

    async fn attempt(
        &self,
        job: &Job,
        sources: &[BoundarySource],
        tracker: &mut Tracker,
    ) -> LayerResult<()> {
        tracker
            .keep_track(StatusUpdate::append("Processing").status(codes::PROCESSING))
            .await?;
        self.execute(&job.kind, sources, tracker).await
    }

    async fn execute(
        &self,
        kind: &JobKind,
        sources: &[BoundarySource],
        tracker: &mut Tracker,
    ) -> LayerResult<()> {
        let orchestrator = &self.orchestrator;
        match kind {
            // A create whose batch is already stored resumes at the publish step.
            JobKind::Create { layer, .. } if tracker.log().batch_id.is_some() => {
                orchestrator
                    .publish_view(layer, ExistsPolicy::Replace, tracker)
                    .await
            }
            JobKind::Create {
                layer,
                metadata,
                error_handle,
            } => {
                orchestrator
                    .create(layer, sources, metadata.clone(), *error_handle, tracker)
                    .await
            }
            // Same for an append: its remote layer may already be gone.
            JobKind::Append { layer, .. } if tracker.log().batch_id.is_some() => {
                orchestrator.republish(layer, tracker).await
            }
            JobKind::Append {
                layer,
                metadata,
                error_handle,
            } => {
                orchestrator
                    .append(layer, sources, metadata.clone(), *error_handle, tracker)
                    .await
            }
            JobKind::Delete {
                layer,
                delete_geometries,
                error_handle,
            } => {
                orchestrator
                    .delete(layer, *delete_geometries, *error_handle, tracker)
                    .await
            }
            JobKind::IngestBatch {
                metadata,
                error_handle,
            } => orchestrator
                .ingest_batch(sources, metadata.clone(), *error_handle, tracker)
                .await
                .map(|_| ()),
            JobKind::PublishView { layer, if_exists } => {
                orchestrator.publish_view(layer, *if_exists, tracker).await
            }
            JobKind::DeleteBatches { ids, cascade } => orchestrator
                .delete_batches(ids, *cascade, tracker)
                .await
                .map(|_| ()),
            JobKind::DeleteGeometries { ids } => orchestrator
                .delete_geometries(ids, tracker)
                .await
                .map(|_| ()),
        }
    }
}

/// Bounded job queue drained by a fixed set of tokio workers
pub struct JobRunner {
    context: JobContext,
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl JobRunner {
    /// Spawn the workers; must be called inside a tokio runtime
    pub fn start(orchestrator: Orchestrator, staging: Staging, config: RunnerConfig) -> Self {
        let context = JobContext::new(orchestrator, staging, config.tracker, config.retry);
        let (sender, receiver) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let context = context.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job) = next else { break };
                        match context.run(&job).await {
                            Ok(log) => tracing::debug!(
                                worker,
                                log_id = job.log_id,
                                status = log.status,
                                "Job finished"
                            ),
                            Err(e) => tracing::error!(
                                worker,
                                log_id = job.log_id,
                                error = %e,
                                "Job could not be tracked"
                            ),
                        }
                    }
                    tracing::debug!(worker, "Job worker stopped");
                })
            })
            .collect();

        tracing::info!(workers = config.workers.max(1), "Job runner started");
        Self {
            context,
            sender,
            workers,
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    /// Queue a job, waiting while the queue is full
    pub async fn submit(&self, job: Job) -> LayerResult<()> {
        self.sender
            .send(job)
            .await
            .map_err(|e| LayerError::upstream(format!("Job queue is closed; job {} dropped.", e.0.log_id)))
    }

    /// Accept uploads and queue the job, returning the status log id
    pub async fn enqueue(&self, kind: JobKind, uploads: &[BoundarySource]) -> LayerResult<i64> {
        let job = self.context.accept(kind, uploads).await?;
        let log_id = job.log_id;
        self.submit(job).await?;
        Ok(log_id)
    }

    /// Run a job on the calling task with the same semantics as a worker
    pub async fn run_once(&self, job: &Job) -> LayerResult<StatusLog> {
        self.context.run(job).await
    }

    /// Close the queue and wait for queued jobs to drain
    pub async fn shutdown(self) {
        let Self {
            sender, workers, ..
        } = self;
        drop(sender);
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Job worker panicked");
            }
        }
        tracing::info!("Job runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ErrorPolicy;
    use crate::models::{BatchMetadata, MissingPolicy};
    use crate::publish::{MemoryPublisher, TilePublisher};
    use crate::store::{MemoryStore, SpatialStore};
    use tempfile::{TempDir, tempdir};

    const TWO_POINTS: &str = r#"<kml><Document>
        <Placemark><name>a</name><Point><coordinates>-60,-34</coordinates></Point></Placemark>
        <Placemark><name>b</name><Point><coordinates>-58,-31</coordinates></Point></Placemark>
        </Document></kml>"#;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        publisher: Arc<MemoryPublisher>,
        context: JobContext,
    }

    fn fixture(retries: u32) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(4326));
        let publisher = Arc::new(MemoryPublisher::new());
        let orchestrator = Orchestrator::new(store.clone(), publisher.clone());
        let context = JobContext::new(
            orchestrator,
            Staging::new(dir.path()),
            TrackerConfig::default(),
            RetryPolicy::immediate(retries),
        );
        Fixture {
            _dir: dir,
            store,
            publisher,
            context,
        }
    }

    fn uploads() -> Vec<BoundarySource> {
        vec![BoundarySource::Bytes {
            name: "puntos.kml".into(),
            data: TWO_POINTS.as_bytes().to_vec(),
        }]
    }

    fn create(layer: &str) -> JobKind {
        JobKind::Create {
            layer: layer.into(),
            metadata: BatchMetadata::default(),
            error_handle: ErrorPolicy::Replace,
        }
    }

    fn occurrences(log: &StatusLog, needle: &str) -> usize {
        log.message.as_deref().unwrap_or_default().matches(needle).count()
    }

    #[tokio::test]
    async fn test_create_job_succeeds_and_purges() {
        let f = fixture(3);
        let job = f.context.accept(create("puntos"), &uploads()).await.unwrap();
        assert_eq!(job.files.len(), 1);
        assert!(job.files[0].exists());

        let log = f.context.run(&job).await.unwrap();
        assert_eq!(log.status, codes::SUCCESS);
        assert_eq!(
            log.message.as_deref(),
            Some(
                "Received. Processing. PostGIS KML ingested. PostGIS view created. \
                 Geoserver layer created. Success."
            )
        );
        assert_eq!(log.layer.as_deref(), Some("puntos"));
        assert!(!job.files[0].exists());
        assert_eq!(f.store.count_layer_geometries("puntos").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_file_jobs_require_uploads() {
        let f = fixture(0);
        let err = f.context.accept(create("vacia"), &[]).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
        assert!(f.store.get_log(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_is_final() {
        let f = fixture(3);
        let first = f.context.accept(create("puntos"), &uploads()).await.unwrap();
        f.context.run(&first).await.unwrap();

        let second = f.context.accept(create("puntos"), &uploads()).await.unwrap();
        let log = f.context.run(&second).await.unwrap();
        assert_eq!(log.status, codes::FAILED_VALIDATION);
        assert_eq!(occurrences(&log, "Processing"), 1);
        assert!(
            log.message
                .as_deref()
                .unwrap()
                .ends_with("Layer 'puntos' already exists on Geoserver.")
        );
        let metadata = log.metadata.unwrap();
        assert_eq!(metadata["layer"], "puntos");
        assert_eq!(metadata["files"][0], "0000_puntos.kml");
        assert!(!second.files[0].exists());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_retried_and_resumes() {
        let f = fixture(3);
        f.publisher.fail_next_creates(1);
        let job = f.context.accept(create("puntos"), &uploads()).await.unwrap();

        let log = f.context.run(&job).await.unwrap();
        assert_eq!(log.status, codes::SUCCESS);
        assert_eq!(occurrences(&log, "Attempt 1 failed"), 1);
        assert_eq!(occurrences(&log, "PostGIS KML ingested"), 1);
        assert!(log.message.as_deref().unwrap().contains("Geoserver layer created."));
        assert!(f.publisher.layer_exists("puntos").await.unwrap());
        assert_eq!(f.store.count_layer_geometries("puntos").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_append_retry_republishes_missing_remote_layer() {
        let f = fixture(3);
        let job = f.context.accept(create("capa"), &uploads()).await.unwrap();
        assert_eq!(f.context.run(&job).await.unwrap().status, codes::SUCCESS);

        f.publisher.fail_next_creates(1);
        let append = JobKind::Append {
            layer: "capa".into(),
            metadata: BatchMetadata::default(),
            error_handle: ErrorPolicy::Replace,
        };
        let job = f.context.accept(append, &uploads()).await.unwrap();
        let log = f.context.run(&job).await.unwrap();

        assert_eq!(log.status, codes::SUCCESS);
        assert_eq!(occurrences(&log, "Attempt 1 failed"), 1);
        assert_eq!(occurrences(&log, "PostGIS KML ingested"), 1);
        assert_eq!(occurrences(&log, "Geoserver layer updated."), 1);
        assert!(f.publisher.layer_exists("capa").await.unwrap());
        assert_eq!(f.store.count_layer_geometries("capa").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_upstream_failure_exhausts_retries() {
        let f = fixture(2);
        f.publisher.set_offline(true);
        let job = f
            .context
            .accept(
                JobKind::PublishView {
                    layer: "vacia".into(),
                    if_exists: ExistsPolicy::Fail,
                },
                &[],
            )
            .await
            .unwrap();

        let log = f.context.run(&job).await.unwrap();
        assert_eq!(log.status, codes::FAILED_UPSTREAM);
        assert_eq!(occurrences(&log, "Processing"), 3);
        assert_eq!(occurrences(&log, "Retrying"), 2);
    }

    #[tokio::test]
    async fn test_finished_job_is_not_rerun() {
        let f = fixture(0);
        let job = f
            .context
            .accept(
                JobKind::Delete {
                    layer: "nada".into(),
                    delete_geometries: false,
                    error_handle: MissingPolicy::Ignore,
                },
                &[],
            )
            .await
            .unwrap();
        let first = f.context.run(&job).await.unwrap();
        assert_eq!(first.status, codes::SUCCESS);

        let again = f.context.run(&job).await.unwrap();
        assert_eq!(again.message, first.message);
    }

    #[tokio::test]
    async fn test_runner_drains_queue_on_shutdown() {
        let f = fixture(0);
        let runner = JobRunner::start(
            f.context.orchestrator().clone(),
            f.context.staging().clone(),
            RunnerConfig {
                workers: 2,
                queue_capacity: 4,
                retry: RetryPolicy::immediate(0),
                tracker: TrackerConfig::default(),
            },
        );

        let mut ids = Vec::new();
        for layer in ["uno", "dos", "tres"] {
            ids.push(runner.enqueue(create(layer), &uploads()).await.unwrap());
        }
        runner.shutdown().await;

        for id in ids {
            let log = f.store.get_log(id).await.unwrap().unwrap();
            assert_eq!(log.status, codes::SUCCESS);
        }
        assert_eq!(f.publisher.list_layers().await.unwrap().len(), 3);
    }
}
