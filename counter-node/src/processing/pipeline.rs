use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use headcount_common::utils::format_duration;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{CounterError, Result};
use crate::inference::DetectionAdapter;
use crate::processing::annotator::FrameAnnotator;
use crate::processing::tracker::CentroidTracker;
use crate::video::{FrameSink, FrameSource, VideoBackend};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Opening,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProcessingResult {
    pub total_frames: u64,
    /// Distinct identities created over the whole run.
    pub total_unique_count: u64,
    pub frames_written: u64,
    pub output_path: PathBuf,
    pub processing_time: Duration,
    pub average_fps: f64,
}

/// One offline pass over a video: detect, track, annotate, write.
pub struct VideoPipeline {
    adapter: DetectionAdapter,
    tracker: CentroidTracker,
    annotator: FrameAnnotator,
    progress_interval: u64,
    state: PipelineState,
    frames_processed: u64,
    unique_count: u64,
}

impl VideoPipeline {
    pub fn new(
        adapter: DetectionAdapter,
        tracker: CentroidTracker,
        annotator: FrameAnnotator,
        progress_interval: u64,
    ) -> Self {
        Self {
            adapter,
            tracker,
            annotator,
            progress_interval: progress_interval.max(1),
            state: PipelineState::Opening,
            frames_processed: 0,
            unique_count: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Frames fully processed and written so far, also after a failure.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn unique_count(&self) -> u64 {
        self.unique_count
    }

    pub fn tracker(&self) -> &CentroidTracker {
        &self.tracker
    }

    #[instrument(skip_all, fields(input = %input.display(), backend = backend.name()))]
    pub async fn run(
        &mut self,
        backend: &dyn VideoBackend,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult> {
        if self.state != PipelineState::Opening {
            return Err(CounterError::InvalidInput(format!(
                "pipeline already ran to {:?}",
                self.state
            )));
        }

        let started = Instant::now();
        match self.execute(backend, input, output, cancel).await {
            Ok(frames_written) => {
                self.transition(PipelineState::Done);
                let processing_time = started.elapsed();
                let secs = processing_time.as_secs_f64();
                let average_fps = if secs > 0.0 {
                    self.frames_processed as f64 / secs
                } else {
                    0.0
                };
                info!(
                    "Processed {} frames in {}, {} unique",
                    self.frames_processed,
                    format_duration(processing_time),
                    self.unique_count
                );
                Ok(ProcessingResult {
                    total_frames: self.frames_processed,
                    total_unique_count: self.unique_count,
                    frames_written,
                    output_path: output.to_path_buf(),
                    processing_time,
                    average_fps,
                })
            }
            Err(e) => {
                self.transition(PipelineState::Failed);
                warn!("Pipeline failed after {} frames: {}", self.frames_processed, e);
                Err(e)
            }
        }
    }

    async fn execute(
        &mut self,
        backend: &dyn VideoBackend,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut source = open_source(backend, input).await?;
        let info = source.info();
        if info.width == 0 || info.height == 0 {
            return Err(CounterError::UnreadableInput(format!(
                "{} reports empty frame size {}x{}",
                input.display(),
                info.width,
                info.height
            )));
        }
        debug!(
            "Using detector {} on {}x{} @ {:.2} fps",
            self.adapter.detector_name(),
            info.width,
            info.height,
            info.fps
        );

        let mut sink = backend.create_sink(output, info).await.map_err(|e| match e {
            CounterError::WriteError { .. } => e,
            other => CounterError::write(0, other),
        })?;

        self.transition(PipelineState::Streaming);
        self.stream(source.as_mut(), sink.as_mut(), cancel).await?;

        self.transition(PipelineState::Finalizing);
        let written = sink.frames_written();
        sink.finish().await.map_err(|e| match e {
            CounterError::WriteError { .. } => e,
            other => CounterError::write(written, other),
        })?;
        Ok(written)
    }

    async fn stream(
        &mut self,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(CounterError::Cancelled {
                    frames_processed: self.frames_processed,
                });
            }

            let Some(mut frame) = source.next_frame().await? else {
                return Ok(());
            };

            let boxes = self.adapter.detect(&frame).await?;
            self.tracker.update(&boxes);
            self.unique_count = self.unique_count.max(self.tracker.total_unique());

            self.annotator.annotate(&mut frame, &self.tracker, self.unique_count)?;
            sink.write_frame(&frame).await?;
            self.frames_processed += 1;

            if self.frames_processed % self.progress_interval == 0 {
                info!(
                    "Processed {} frames, {} unique, {} active",
                    self.frames_processed,
                    self.unique_count,
                    self.tracker.active_count()
                );
            }
        }
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("Pipeline {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

async fn open_source(backend: &dyn VideoBackend, input: &Path) -> Result<Box<dyn FrameSource>> {
    backend.open_source(input).await.map_err(|e| match e {
        CounterError::UnreadableInput(_) => e,
        other => CounterError::UnreadableInput(format!("{}: {}", input.display(), other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnnotationConfig, TrackerConfig};
    use crate::inference::Detector;
    use crate::video::memory::MemoryBackend;
    use async_trait::async_trait;
    use headcount_common::{BBox, Detection, VideoFrame};

    /// Reports one person box per frame, drifting right by 2 pixels per frame.
    struct WalkingPerson;

    #[async_trait]
    impl Detector for WalkingPerson {
        async fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>> {
            let x = 4.0 + 2.0 * frame.sequence_num as f32;
            Ok(vec![Detection {
                bbox: BBox::new(x, 4.0, x + 10.0, 20.0),
                confidence: 0.9,
                class_id: 0,
                class_label: "person".to_string(),
            }])
        }

        fn name(&self) -> &str {
            "walking"
        }
    }

    struct FailsOnFrame(u64);

    #[async_trait]
    impl Detector for FailsOnFrame {
        async fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>> {
            if frame.sequence_num == self.0 {
                return Err(CounterError::InvalidInput("model crashed".to_string()));
            }
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn pipeline(detector: Box<dyn Detector>) -> VideoPipeline {
        VideoPipeline::new(
            DetectionAdapter::new(detector, "person", 0.5),
            CentroidTracker::new(TrackerConfig::default()),
            FrameAnnotator::new(AnnotationConfig::default()).unwrap(),
            30,
        )
    }

    #[tokio::test]
    async fn test_run_counts_single_walker() {
        let backend = MemoryBackend::new();
        backend.insert_blank_clip("walk.mp4", 64, 32, 25.0, 10);

        let mut pipeline = pipeline(Box::new(WalkingPerson));
        let result = pipeline
            .run(&backend, Path::new("walk.mp4"), Path::new("out.mp4"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.total_frames, 10);
        assert_eq!(result.frames_written, 10);
        assert_eq!(result.total_unique_count, 1);
        assert_eq!(pipeline.state(), PipelineState::Done);

        let output = backend.output(Path::new("out.mp4")).unwrap();
        assert!(output.finished);
        assert_eq!(output.frames.len(), 10);
        assert_eq!(output.info.unwrap().fps, 25.0);
        assert_eq!(output.frames[0].pixel(4, 4), Some([0, 255, 0]));
    }

    #[tokio::test]
    async fn test_unique_count_survives_disappearance() {
        struct Blink;

        #[async_trait]
        impl Detector for Blink {
            async fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>> {
                if frame.sequence_num == 0 {
                    Ok(vec![Detection {
                        bbox: BBox::new(0.0, 0.0, 4.0, 4.0),
                        confidence: 0.8,
                        class_id: 0,
                        class_label: "person".to_string(),
                    }])
                } else {
                    Ok(Vec::new())
                }
            }

            fn name(&self) -> &str {
                "blink"
            }
        }

        let backend = MemoryBackend::new();
        backend.insert_blank_clip("blink.mp4", 16, 16, 30.0, 15);

        let mut pipeline = pipeline(Box::new(Blink));
        let result = pipeline
            .run(&backend, Path::new("blink.mp4"), Path::new("out.mp4"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(pipeline.tracker().active_count(), 0);
        assert_eq!(result.total_unique_count, 1);
    }

    #[tokio::test]
    async fn test_missing_input_is_unreadable() {
        let backend = MemoryBackend::new();
        let mut pipeline = pipeline(Box::new(WalkingPerson));
        let err = pipeline
            .run(&backend, Path::new("nope.mp4"), Path::new("out.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CounterError::UnreadableInput(_)));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(backend.output(Path::new("out.mp4")).is_none());
    }

    #[tokio::test]
    async fn test_zero_sized_source_is_unreadable() {
        let backend = MemoryBackend::new();
        backend.insert_clip(
            "empty.mp4",
            headcount_common::VideoInfo { width: 0, height: 0, fps: 30.0 },
            Vec::new(),
        );
        let mut pipeline = pipeline(Box::new(WalkingPerson));
        let err = pipeline
            .run(&backend, Path::new("empty.mp4"), Path::new("out.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CounterError::UnreadableInput(_)));
    }

    #[tokio::test]
    async fn test_detector_failure_aborts_with_frame() {
        let backend = MemoryBackend::new();
        backend.insert_blank_clip("clip.mp4", 8, 8, 30.0, 6);

        let mut pipeline = pipeline(Box::new(FailsOnFrame(3)));
        let err = pipeline
            .run(&backend, Path::new("clip.mp4"), Path::new("out.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CounterError::DetectionAdapterError { frame: 3, .. }));
        assert_eq!(pipeline.frames_processed(), 3);
        assert_eq!(backend.output(Path::new("out.mp4")).unwrap().frames.len(), 3);
    }

    #[tokio::test]
    async fn test_write_failure_reports_frames_written() {
        let backend = MemoryBackend::new();
        backend.insert_blank_clip("clip.mp4", 8, 8, 30.0, 6);
        backend.fail_writes_after("out.mp4", 4);

        let mut pipeline = pipeline(Box::new(WalkingPerson));
        let err = pipeline
            .run(&backend, Path::new("clip.mp4"), Path::new("out.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CounterError::WriteError { frames_written: 4, .. }));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_frame() {
        let backend = MemoryBackend::new();
        backend.insert_blank_clip("clip.mp4", 8, 8, 30.0, 6);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut pipeline = pipeline(Box::new(WalkingPerson));
        let err = pipeline
            .run(&backend, Path::new("clip.mp4"), Path::new("out.mp4"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, CounterError::Cancelled { frames_processed: 0 }));
        assert_eq!(pipeline.tracker().next_id(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_runs_once() {
        let backend = MemoryBackend::new();
        backend.insert_blank_clip("clip.mp4", 8, 8, 30.0, 2);

        let mut pipeline = pipeline(Box::new(WalkingPerson));
        let cancel = CancellationToken::new();
        pipeline
            .run(&backend, Path::new("clip.mp4"), Path::new("out.mp4"), &cancel)
            .await
            .unwrap();
        let err = pipeline
            .run(&backend, Path::new("clip.mp4"), Path::new("out.mp4"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CounterError::InvalidInput(_)));
    }
}
