//! Directory-of-images backend.
//!
//! A source is a directory of PNG/JPEG frames read in lexical file-name order.
//! A sink is a directory receiving `frame_NNNNNN.png` files plus a
//! `sequence.json` manifest carrying the stream's dimensions and frame rate;
//! when a source directory contains a manifest, its frame rate is used.
//! Creating a sink replaces the frames and manifest of an earlier run.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use super::{check_dimensions, FrameSink, FrameSource, VideoBackend, VideoFrame, VideoInfo};
use crate::error::{CounterError, Result};

const MANIFEST: &str = "sequence.json";
const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    info: VideoInfo,
    frames: u64,
}

pub struct ImageSequenceBackend {
    default_fps: f64,
}

impl ImageSequenceBackend {
    pub fn new(default_fps: f64) -> Self {
        Self { default_fps }
    }
}

async fn decode(path: &Path) -> Result<RgbImage> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| CounterError::UnreadableInput(format!("{}: {}", path.display(), e)))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| CounterError::UnreadableInput(format!("{}: {}", path.display(), e)))?;
    Ok(image.to_rgb8())
}

fn is_sink_file(name: &str) -> bool {
    name == MANIFEST || (name.starts_with("frame_") && name.ends_with(".png"))
}

/// Removes sink output left in `dir` by a previous run. Other files are kept.
async fn clear_sink_files(dir: &Path) -> Result<usize> {
    let mut entries = fs::read_dir(dir).await?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let stale = entry.file_name().to_str().map(is_sink_file).unwrap_or(false);
        if stale && entry.file_type().await?.is_file() {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| CounterError::UnreadableInput(format!("{}: {}", dir.display(), e)))?;

    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_frame = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_frame && entry.file_type().await?.is_file() {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

#[async_trait]
impl VideoBackend for ImageSequenceBackend {
    fn name(&self) -> &str {
        "image-sequence"
    }

    async fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let frames = list_frames(path).await?;
        let first = frames
            .first()
            .ok_or_else(|| CounterError::UnreadableInput(format!("{} contains no frames", path.display())))?;
        let probe = decode(first).await?;

        let fps = match fs::read(path.join(MANIFEST)).await {
            Ok(bytes) => serde_json::from_slice::<Manifest>(&bytes)
                .map(|m| m.info.fps)
                .unwrap_or(self.default_fps),
            Err(_) => self.default_fps,
        };

        let info = VideoInfo {
            width: probe.width(),
            height: probe.height(),
            fps,
        };
        debug!("Opened image sequence {} ({} frames, {:?})", path.display(), frames.len(), info);

        Ok(Box::new(ImageSequenceSource {
            info,
            frames,
            position: 0,
        }))
    }

    async fn create_sink(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn FrameSink>> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| CounterError::write(0, format!("{}: {}", path.display(), e)))?;
        let removed = clear_sink_files(path)
            .await
            .map_err(|e| CounterError::write(0, format!("clearing {}: {}", path.display(), e)))?;
        if removed > 0 {
            debug!("Removed {} files of a previous run from {}", removed, path.display());
        }
        Ok(Box::new(ImageSequenceSink {
            dir: path.to_path_buf(),
            info,
            frames_written: 0,
        }))
    }
}

pub struct ImageSequenceSource {
    info: VideoInfo,
    frames: Vec<PathBuf>,
    position: usize,
}

#[async_trait]
impl FrameSource for ImageSequenceSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    async fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        let Some(path) = self.frames.get(self.position) else {
            return Ok(None);
        };
        let image = decode(path).await?;
        if image.width() != self.info.width || image.height() != self.info.height {
            return Err(CounterError::UnreadableInput(format!(
                "{} is {}x{}, sequence is {}x{}",
                path.display(),
                image.width(),
                image.height(),
                self.info.width,
                self.info.height
            )));
        }

        let frame = VideoFrame::new(image.into_raw(), self.info.width, self.info.height, self.position as u64);
        self.position += 1;
        Ok(Some(frame))
    }
}

pub struct ImageSequenceSink {
    dir: PathBuf,
    info: VideoInfo,
    frames_written: u64,
}

#[async_trait]
impl FrameSink for ImageSequenceSink {
    async fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        let written = self.frames_written;
        check_dimensions(frame, &self.info).map_err(|e| CounterError::write(written, e))?;

        let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| CounterError::write(written, "frame buffer size mismatch"))?;
        let mut encoded = Cursor::new(Vec::new());
        image
            .write_to(&mut encoded, ImageFormat::Png)
            .map_err(|e| CounterError::write(written, e))?;

        let path = self.dir.join(format!("frame_{:06}.png", written));
        fs::write(&path, encoded.into_inner())
            .await
            .map_err(|e| CounterError::write(written, format!("{}: {}", path.display(), e)))?;
        self.frames_written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let manifest = Manifest {
            info: self.info,
            frames: self.frames_written,
        };
        let json = serde_json::to_vec_pretty(&manifest).map_err(|e| CounterError::write(self.frames_written, e))?;
        fs::write(self.dir.join(MANIFEST), json)
            .await
            .map_err(|e| CounterError::write(self.frames_written, e))?;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32, rgb: [u8; 3]) {
        let image = RgbImage::from_pixel(width, height, image::Rgb(rgb));
        image.save(dir.join(name)).unwrap();
    }

    #[tokio::test]
    async fn test_reads_frames_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", 4, 3, [0, 0, 255]);
        write_png(dir.path(), "a.png", 4, 3, [255, 0, 0]);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let backend = ImageSequenceBackend::new(12.0);
        let mut source = backend.open_source(dir.path()).await.unwrap();
        assert_eq!(source.info(), VideoInfo { width: 4, height: 3, fps: 12.0 });

        let first = source.next_frame().await.unwrap().unwrap();
        assert_eq!(first.sequence_num, 0);
        assert_eq!(first.pixel(0, 0), Some([255, 0, 0]));
        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!(second.pixel(3, 2), Some([0, 0, 255]));
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_directory_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ImageSequenceBackend::new(30.0);
        let err = backend.open_source(dir.path()).await.err().unwrap();
        assert!(matches!(err, CounterError::UnreadableInput(_)));
    }

    #[tokio::test]
    async fn test_sink_output_preserves_frame_rate() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let backend = ImageSequenceBackend::new(30.0);
        let info = VideoInfo { width: 2, height: 2, fps: 24.0 };

        let mut sink = backend.create_sink(&out, info).await.unwrap();
        for n in 0..3 {
            sink.write_frame(&VideoFrame::filled(2, 2, [9, 9, 9], n)).await.unwrap();
        }
        sink.finish().await.unwrap();
        assert_eq!(sink.frames_written(), 3);

        let mut source = backend.open_source(&out).await.unwrap();
        assert_eq!(source.info().fps, 24.0);
        let mut count = 0;
        while let Some(frame) = source.next_frame().await.unwrap() {
            assert_eq!(frame.pixel(1, 1), Some([9, 9, 9]));
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_new_sink_replaces_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let backend = ImageSequenceBackend::new(30.0);
        let info = VideoInfo { width: 2, height: 2, fps: 24.0 };

        let mut first = backend.create_sink(&out, info).await.unwrap();
        for n in 0..3 {
            first.write_frame(&VideoFrame::filled(2, 2, [1, 1, 1], n)).await.unwrap();
        }
        first.finish().await.unwrap();
        std::fs::write(out.join("notes.txt"), "kept").unwrap();

        let mut second = backend.create_sink(&out, info).await.unwrap();
        second.write_frame(&VideoFrame::filled(2, 2, [7, 7, 7], 0)).await.unwrap();
        second.finish().await.unwrap();

        assert_eq!(list_frames(&out).await.unwrap(), vec![out.join("frame_000000.png")]);
        assert!(out.join("notes.txt").exists());
        let manifest: Manifest = serde_json::from_slice(&std::fs::read(out.join(MANIFEST)).unwrap()).unwrap();
        assert_eq!(manifest.frames, 1);

        let mut source = backend.open_source(&out).await.unwrap();
        assert_eq!(source.next_frame().await.unwrap().unwrap().pixel(0, 0), Some([7, 7, 7]));
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_sink_leaves_no_old_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let backend = ImageSequenceBackend::new(30.0);
        let info = VideoInfo { width: 2, height: 2, fps: 24.0 };

        let mut first = backend.create_sink(&out, info).await.unwrap();
        first.write_frame(&VideoFrame::filled(2, 2, [1, 1, 1], 0)).await.unwrap();
        first.finish().await.unwrap();

        let _second = backend.create_sink(&out, info).await.unwrap();
        assert!(!out.join(MANIFEST).exists());
        assert!(list_frames(&out).await.unwrap().is_empty());
    }
}
