//! In-process backend: clips are registered by path and outputs are captured in memory.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{check_dimensions, FrameSink, FrameSource, VideoBackend, VideoFrame, VideoInfo};
use crate::error::{CounterError, Result};

#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub info: Option<VideoInfo>,
    pub frames: Vec<VideoFrame>,
    pub finished: bool,
}

#[derive(Default)]
struct Store {
    clips: HashMap<PathBuf, (VideoInfo, Vec<VideoFrame>)>,
    outputs: HashMap<PathBuf, CapturedOutput>,
    write_limits: HashMap<PathBuf, u64>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_clip(&self, path: impl Into<PathBuf>, info: VideoInfo, frames: Vec<VideoFrame>) {
        self.lock().clips.insert(path.into(), (info, frames));
    }

    /// Registers `count` solid gray frames of the given size.
    pub fn insert_blank_clip(&self, path: impl Into<PathBuf>, width: u32, height: u32, fps: f64, count: u64) {
        let frames = (0..count)
            .map(|n| VideoFrame::filled(width, height, [64, 64, 64], n))
            .collect();
        self.insert_clip(path, VideoInfo { width, height, fps }, frames);
    }

    /// Makes sinks at `path` fail once `frames` frames have been written.
    pub fn fail_writes_after(&self, path: impl Into<PathBuf>, frames: u64) {
        self.lock().write_limits.insert(path.into(), frames);
    }

    pub fn output(&self, path: &Path) -> Option<CapturedOutput> {
        self.lock().outputs.get(path).cloned()
    }
}

#[async_trait]
impl VideoBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let store = self.lock();
        let (info, frames) = store
            .clips
            .get(path)
            .cloned()
            .ok_or_else(|| CounterError::UnreadableInput(format!("no clip registered at {}", path.display())))?;
        Ok(Box::new(MemorySource {
            info,
            frames: frames.into(),
        }))
    }

    async fn create_sink(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn FrameSink>> {
        let mut store = self.lock();
        let write_limit = store.write_limits.get(path).copied();
        store.outputs.insert(
            path.to_path_buf(),
            CapturedOutput {
                info: Some(info),
                frames: Vec::new(),
                finished: false,
            },
        );
        Ok(Box::new(MemorySink {
            store: self.store.clone(),
            path: path.to_path_buf(),
            info,
            frames_written: 0,
            write_limit,
            finished: false,
        }))
    }
}

pub struct MemorySource {
    info: VideoInfo,
    frames: VecDeque<VideoFrame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    async fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        Ok(self.frames.pop_front())
    }
}

pub struct MemorySink {
    store: Arc<Mutex<Store>>,
    path: PathBuf,
    info: VideoInfo,
    frames_written: u64,
    write_limit: Option<u64>,
    finished: bool,
}

impl MemorySink {
    fn with_output<R>(&self, f: impl FnOnce(&mut CapturedOutput) -> R) -> R {
        let mut store = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(store.outputs.entry(self.path.clone()).or_default())
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        if self.finished {
            return Err(CounterError::write(self.frames_written, "sink already finished"));
        }
        if self.write_limit.is_some_and(|limit| self.frames_written >= limit) {
            return Err(CounterError::write(self.frames_written, "no space left on device"));
        }
        check_dimensions(frame, &self.info).map_err(|e| CounterError::write(self.frames_written, e))?;

        self.with_output(|output| output.frames.push(frame.clone()));
        self.frames_written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        self.with_output(|output| output.finished = true);
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_through_memory() {
        let backend = MemoryBackend::new();
        backend.insert_blank_clip("in.mp4", 8, 6, 25.0, 3);

        let mut source = backend.open_source(Path::new("in.mp4")).await.unwrap();
        let mut sink = backend.create_sink(Path::new("out.mp4"), source.info()).await.unwrap();
        while let Some(frame) = source.next_frame().await.unwrap() {
            sink.write_frame(&frame).await.unwrap();
        }
        sink.finish().await.unwrap();

        let output = backend.output(Path::new("out.mp4")).unwrap();
        assert!(output.finished);
        assert_eq!(output.frames.len(), 3);
        assert_eq!(output.info.unwrap().fps, 25.0);
    }

    #[tokio::test]
    async fn test_unknown_clip_is_unreadable() {
        let backend = MemoryBackend::new();
        let err = backend.open_source(Path::new("missing.mp4")).await.err().unwrap();
        assert!(matches!(err, CounterError::UnreadableInput(_)));
    }

    #[tokio::test]
    async fn test_sink_rejects_mismatched_frame() {
        let backend = MemoryBackend::new();
        let info = VideoInfo { width: 4, height: 4, fps: 30.0 };
        let mut sink = backend.create_sink(Path::new("out.mp4"), info).await.unwrap();
        let err = sink
            .write_frame(&VideoFrame::filled(5, 4, [0, 0, 0], 0))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CounterError::WriteError { frames_written: 0, .. }));
    }

    #[tokio::test]
    async fn test_write_limit() {
        let backend = MemoryBackend::new();
        backend.fail_writes_after("out.mp4", 1);
        let info = VideoInfo { width: 2, height: 2, fps: 30.0 };
        let mut sink = backend.create_sink(Path::new("out.mp4"), info).await.unwrap();
        sink.write_frame(&VideoFrame::filled(2, 2, [0, 0, 0], 0)).await.unwrap();
        let err = sink.write_frame(&VideoFrame::filled(2, 2, [0, 0, 0], 1)).await.err().unwrap();
        assert!(matches!(err, CounterError::WriteError { frames_written: 1, .. }));
    }
}
