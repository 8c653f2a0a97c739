//! Job registry and lifecycle: `pending -> processing -> completed | failed`.
//!
//! A job maps an opaque id to an input video and, once processed, to an
//! annotated output with its statistics. At most one pipeline run is active
//! per job id; the claim is a check-and-set under the registry entry lock.

pub mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{CounterError, ErrorKind, Result};
use crate::inference::{DetectionAdapter, DetectorProvider};
use crate::processing::{CentroidTracker, FrameAnnotator, ProcessingResult, VideoPipeline};
use crate::video::VideoBackend;
use storage::FileStorage;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProcessingJob {
    pub job_id: Uuid,
    pub input_path: PathBuf,
    pub status: JobStatus,
    pub output_path: Option<PathBuf>,
    pub total_unique_count: Option<u64>,
    pub total_frames: Option<u64>,
    /// Frames written by the latest run, including a failed one.
    pub frames_processed: u64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<u64>,
}

impl ProcessingJob {
    fn new(job_id: Uuid, input_path: PathBuf) -> Self {
        Self {
            job_id,
            input_path,
            status: JobStatus::Pending,
            output_path: None,
            total_unique_count: None,
            total_frames: None,
            frames_processed: 0,
            error: None,
            error_kind: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
        }
    }

    fn start(&mut self) {
        self.status = JobStatus::Processing;
        self.output_path = None;
        self.total_unique_count = None;
        self.total_frames = None;
        self.frames_processed = 0;
        self.error = None;
        self.error_kind = None;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.processing_time_ms = None;
    }

    fn complete(&mut self, result: &ProcessingResult) {
        self.status = JobStatus::Completed;
        self.output_path = Some(result.output_path.clone());
        self.total_unique_count = Some(result.total_unique_count);
        self.total_frames = Some(result.total_frames);
        self.frames_processed = result.frames_written;
        self.completed_at = Some(Utc::now());
        self.processing_time_ms = Some(result.processing_time.as_millis() as u64);
    }

    fn fail(&mut self, error: &CounterError, frames_processed: u64) {
        self.frames_processed = frames_processed;
        self.mark_failed(error.kind(), error.to_string());
    }

    /// The run went away without reporting; its frame count is unknown.
    fn abandon(&mut self) {
        self.mark_failed(ErrorKind::Cancelled, "Run dropped before it finished".to_string());
    }

    fn mark_failed(&mut self, kind: ErrorKind, message: String) {
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error = Some(message);
        self.error_kind = Some(kind);
        self.completed_at = Some(now);
        self.processing_time_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

struct Inner {
    jobs: DashMap<Uuid, ProcessingJob>,
    running: DashMap<Uuid, CancellationToken>,
    storage: FileStorage,
    backend: Arc<dyn VideoBackend>,
    detectors: Arc<dyn DetectorProvider>,
    config: NodeConfig,
    permits: Semaphore,
    shutdown: CancellationToken,
}

/// Shared handle to the job registry. Clones refer to the same registry.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(config: NodeConfig, backend: Arc<dyn VideoBackend>, detectors: Arc<dyn DetectorProvider>) -> Self {
        let storage = FileStorage::new(&config.storage);
        let permits = Semaphore::new(config.processing.max_concurrent_jobs.max(1));
        info!(
            "Job manager ready: backend {}, {} concurrent jobs",
            backend.name(),
            config.processing.max_concurrent_jobs
        );
        Self {
            inner: Arc::new(Inner {
                jobs: DashMap::new(),
                running: DashMap::new(),
                storage,
                backend,
                detectors,
                config,
                permits,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers an existing input: a video file with an allowed extension, or a frame directory.
    pub async fn create_job(&self, input: &Path) -> Result<Uuid> {
        let metadata = tokio::fs::metadata(input)
            .await
            .map_err(|e| CounterError::InvalidInput(format!("{}: {}", input.display(), e)))?;

        if metadata.is_file() && !self.inner.storage.is_allowed(input) {
            return Err(CounterError::InvalidInput(format!(
                "{} has an unsupported extension",
                input.display()
            )));
        }
        if !metadata.is_file() && !metadata.is_dir() {
            return Err(CounterError::InvalidInput(format!(
                "{} is neither a file nor a directory",
                input.display()
            )));
        }

        Ok(self.register(Uuid::new_v4(), input.to_path_buf()))
    }

    /// Stores uploaded bytes under the upload directory and registers a job for them.
    pub async fn upload(&self, content: &[u8], original_filename: &str) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let path = self.inner.storage.save_upload(job_id, content, original_filename).await?;
        Ok(self.register(job_id, path))
    }

    fn register(&self, job_id: Uuid, input_path: PathBuf) -> Uuid {
        info!("Created job {} for {}", job_id, input_path.display());
        self.inner.jobs.insert(job_id, ProcessingJob::new(job_id, input_path));
        job_id
    }

    pub fn get_status(&self, job_id: Uuid) -> Result<ProcessingJob> {
        self.inner
            .jobs
            .get(&job_id)
            .map(|job| job.clone())
            .ok_or(CounterError::JobNotFound(job_id))
    }

    /// All jobs, newest first.
    pub fn list_jobs(&self) -> Vec<ProcessingJob> {
        let mut jobs: Vec<ProcessingJob> = self.inner.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        jobs
    }

    /// Output of a completed job; `None` while the job has not completed.
    pub fn output_location(&self, job_id: Uuid) -> Result<Option<PathBuf>> {
        let job = self.get_status(job_id)?;
        Ok(match job.status {
            JobStatus::Completed => job.output_path,
            _ => None,
        })
    }

    pub fn job_stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for entry in self.inner.jobs.iter() {
            stats.total += 1;
            match entry.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub async fn process(&self, job_id: Uuid) -> Result<ProcessingJob> {
        self.process_with_cancel(job_id, self.inner.shutdown.child_token()).await
    }

    /// Runs the job's pipeline to completion. Pipeline failures are recorded on the
    /// returned job; only `JobNotFound` and `AlreadyProcessing` are returned as errors.
    /// A completed job is returned unchanged without running again.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn process_with_cancel(&self, job_id: Uuid, cancel: CancellationToken) -> Result<ProcessingJob> {
        let input = match self.claim(job_id)? {
            Claim::Started(input) => input,
            Claim::AlreadyCompleted(job) => {
                info!("Job {} already completed", job_id);
                return Ok(job);
            }
        };
        info!("Processing job {} ({})", job_id, input.display());

        let mut run = RunGuard::new(self.inner.clone(), job_id, cancel.clone());
        let (outcome, frames_processed) = self.execute(&input, &cancel).await;
        run.release();

        let mut job = self
            .inner
            .jobs
            .get_mut(&job_id)
            .ok_or(CounterError::JobNotFound(job_id))?;
        match outcome {
            Ok(result) => {
                info!(
                    "Job {} completed: {} frames, {} unique persons, {} ms",
                    job_id,
                    result.total_frames,
                    result.total_unique_count,
                    result.processing_time.as_millis()
                );
                job.complete(&result);
            }
            Err(e) => {
                error!(
                    "Job {} failed ({:?}) after {} frames: {}",
                    job_id,
                    e.kind(),
                    frames_processed,
                    e
                );
                job.fail(&e, frames_processed);
            }
        }
        Ok(job.clone())
    }

    /// Runs `process` on a Tokio task.
    pub fn spawn(&self, job_id: Uuid) -> JoinHandle<Result<ProcessingJob>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.process(job_id).await })
    }

    /// Requests cancellation of a running job at its next frame boundary.
    /// Returns whether a run was signalled.
    pub fn cancel(&self, job_id: Uuid) -> Result<bool> {
        if !self.inner.jobs.contains_key(&job_id) {
            return Err(CounterError::JobNotFound(job_id));
        }
        Ok(match self.inner.running.get(&job_id) {
            Some(token) => {
                warn!("Cancelling job {}", job_id);
                token.cancel();
                true
            }
            None => false,
        })
    }

    /// Cancels every running job.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for entry in self.inner.running.iter() {
            entry.value().cancel();
        }
    }

    fn claim(&self, job_id: Uuid) -> Result<Claim> {
        let mut job = self
            .inner
            .jobs
            .get_mut(&job_id)
            .ok_or(CounterError::JobNotFound(job_id))?;
        match job.status {
            JobStatus::Processing => Err(CounterError::AlreadyProcessing(job_id)),
            JobStatus::Completed => Ok(Claim::AlreadyCompleted(job.clone())),
            JobStatus::Pending | JobStatus::Failed => {
                job.start();
                Ok(Claim::Started(job.input_path.clone()))
            }
        }
    }

    async fn execute(&self, input: &Path, cancel: &CancellationToken) -> (Result<ProcessingResult>, u64) {
        let mut frames_processed = 0;
        let outcome = async {
            let _permit = self
                .inner
                .permits
                .acquire()
                .await
                .map_err(|e| CounterError::ConfigError(e.to_string()))?;

            let config = &self.inner.config;
            let output = self.inner.storage.output_path_for(input).await?;
            let detector = self.inner.detectors.create()?;
            let mut pipeline = VideoPipeline::new(
                DetectionAdapter::from_config(detector, &config.detection),
                CentroidTracker::new(config.tracker),
                FrameAnnotator::new(config.annotation.clone())?,
                config.processing.progress_interval_frames,
            );

            let result = pipeline.run(self.inner.backend.as_ref(), input, &output, cancel).await;
            frames_processed = pipeline.frames_processed();
            result
        }
        .await;
        (outcome, frames_processed)
    }
}

enum Claim {
    Started(PathBuf),
    AlreadyCompleted(ProcessingJob),
}

/// Registers a claimed run as cancellable. If the run future is dropped
/// before `release`, the job is marked failed instead of staying `processing`.
struct RunGuard {
    inner: Arc<Inner>,
    job_id: Uuid,
    armed: bool,
}

impl RunGuard {
    fn new(inner: Arc<Inner>, job_id: Uuid, cancel: CancellationToken) -> Self {
        inner.running.insert(job_id, cancel);
        Self {
            inner,
            job_id,
            armed: true,
        }
    }

    fn release(&mut self) {
        self.inner.running.remove(&self.job_id);
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.running.remove(&self.job_id);
        if let Some(mut job) = self.inner.jobs.get_mut(&self.job_id) {
            if job.status == JobStatus::Processing {
                warn!("Job {} was dropped mid-run, marking it failed", self.job_id);
                job.abandon();
            }
        }
    }
}
