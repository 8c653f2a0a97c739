use std::path::Path;

use async_trait::async_trait;
pub use headcount_common::{VideoFrame, VideoInfo};

use crate::error::Result;

#[cfg(feature = "gstreamer")]
pub mod gstreamer;
pub mod image_sequence;
pub mod memory;

/// Sequential frame reader yielding frames in presentation order.
#[async_trait]
pub trait FrameSource: Send {
    fn info(&self) -> VideoInfo;
    /// Next frame, or `None` at end of stream.
    async fn next_frame(&mut self) -> Result<Option<VideoFrame>>;
}

/// Sequential frame writer. Every frame must match the `VideoInfo` the sink was created with.
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: &VideoFrame) -> Result<()>;
    /// Flushes and closes the output. No frames may be written afterwards.
    async fn finish(&mut self) -> Result<()>;
    fn frames_written(&self) -> u64;
}

/// Opens sources and creates sinks for a container/codec family.
#[async_trait]
pub trait VideoBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
    async fn create_sink(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn FrameSink>>;
}

pub(crate) fn check_dimensions(frame: &VideoFrame, info: &VideoInfo) -> std::result::Result<(), String> {
    if frame.width != info.width || frame.height != info.height {
        return Err(format!(
            "frame {} is {}x{}, stream is {}x{}",
            frame.sequence_num, frame.width, frame.height, info.width, info.height
        ));
    }
    if !frame.is_consistent() {
        return Err(format!(
            "frame {} carries {} bytes, expected {}",
            frame.sequence_num,
            frame.data.len(),
            frame.expected_len()
        ));
    }
    Ok(())
}
