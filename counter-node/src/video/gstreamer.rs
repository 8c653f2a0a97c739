use std::path::Path;

use anyhow::anyhow;
use async_trait::async_trait;
use ::gstreamer as gst;
use gst::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video::{VideoFormat, VideoFrameRef, VideoInfo as GstVideoInfo};
use tracing::{debug, info, warn};

use super::{check_dimensions, FrameSink, FrameSource, VideoBackend, VideoFrame, VideoInfo};
use crate::error::{CounterError, Result};

/// Container files decoded and encoded through GStreamer.
pub struct GstBackend {
    encoder: String,
}

impl GstBackend {
    pub fn new(encoder: impl Into<String>) -> Result<Self> {
        gst::init().map_err(|e| CounterError::ConfigError(format!("Failed to initialize GStreamer: {}", e)))?;
        Ok(Self {
            encoder: encoder.into(),
        })
    }

    fn muxer_for(path: &Path) -> &'static str {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("mkv") => "matroskamux",
            Some("avi") => "avimux",
            Some("mov") => "qtmux",
            _ => "mp4mux",
        }
    }
}

fn quote(path: &Path) -> String {
    format!("\"{}\"", path.display().to_string().replace('"', "\\\""))
}

fn launch(description: &str) -> anyhow::Result<gst::Pipeline> {
    gst::parse::launch(description)?
        .downcast::<gst::Pipeline>()
        .map_err(|_| anyhow!("Failed to downcast to pipeline"))
}

fn stream_info(caps: &gst::CapsRef) -> anyhow::Result<(GstVideoInfo, VideoInfo)> {
    let gst_info = GstVideoInfo::from_caps(caps).map_err(|_| anyhow!("Failed to get video info"))?;
    let fps = gst_info.fps();
    let fps = if fps.denom() > 0 && fps.numer() > 0 {
        fps.numer() as f64 / fps.denom() as f64
    } else {
        30.0
    };
    let info = VideoInfo {
        width: gst_info.width(),
        height: gst_info.height(),
        fps,
    };
    Ok((gst_info, info))
}

/// Copies a mapped RGB buffer into a tightly packed frame, dropping row padding.
fn pack_rgb(buffer: &gst::BufferRef, gst_info: &GstVideoInfo, sequence_num: u64) -> anyhow::Result<VideoFrame> {
    let frame = VideoFrameRef::from_buffer_ref_readable(buffer, gst_info)
        .map_err(|_| anyhow!("Failed to map buffer"))?;
    let width = gst_info.width() as usize;
    let height = gst_info.height() as usize;
    let stride = frame.plane_stride()[0] as usize;
    let plane = frame.plane_data(0).map_err(|_| anyhow!("Failed to read plane"))?;

    let row_bytes = width * VideoFrame::CHANNELS;
    let mut data = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        data.extend_from_slice(&plane[start..start + row_bytes]);
    }

    Ok(VideoFrame::new(data, width as u32, height as u32, sequence_num))
}

#[async_trait]
impl VideoBackend for GstBackend {
    fn name(&self) -> &str {
        "gstreamer"
    }

    async fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        if !path.is_file() {
            return Err(CounterError::UnreadableInput(format!("{} is not a file", path.display())));
        }
        let description = format!(
            "filesrc location={} ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink name=sink sync=false",
            quote(path)
        );
        let path_display = path.display().to_string();

        tokio::task::spawn_blocking(move || -> anyhow::Result<GstFrameSource> {
            info!("Creating GStreamer pipeline: {}", description);
            let pipeline = launch(&description)?;
            let appsink = pipeline
                .by_name("sink")
                .ok_or_else(|| anyhow!("No appsink element found in pipeline"))?
                .downcast::<AppSink>()
                .map_err(|_| anyhow!("Failed to downcast to AppSink"))?;

            pipeline.set_state(gst::State::Paused)?;
            let preroll = appsink
                .pull_preroll()
                .map_err(|_| anyhow!("No decodable video stream"))?;
            let caps = preroll.caps().ok_or_else(|| anyhow!("Failed to get caps"))?;
            let (gst_info, info) = stream_info(caps)?;
            pipeline.set_state(gst::State::Playing)?;

            Ok(GstFrameSource {
                pipeline,
                appsink,
                gst_info,
                info,
                sequence_num: 0,
            })
        })
        .await
        .map_err(|e| CounterError::UnreadableInput(e.to_string()))?
        .map(|source| Box::new(source) as Box<dyn FrameSource>)
        .map_err(|e| CounterError::UnreadableInput(format!("{}: {}", path_display, e)))
    }

    async fn create_sink(&self, path: &Path, info: VideoInfo) -> Result<Box<dyn FrameSink>> {
        let description = format!(
            "appsrc name=src is-live=false format=time ! videoconvert ! {} ! {} ! filesink location={}",
            self.encoder,
            Self::muxer_for(path),
            quote(path)
        );

        let build = move || -> anyhow::Result<GstFrameSink> {
            info!("Creating GStreamer pipeline: {}", description);
            let pipeline = launch(&description)?;
            let appsrc = pipeline
                .by_name("src")
                .ok_or_else(|| anyhow!("No appsrc element found in pipeline"))?
                .downcast::<AppSrc>()
                .map_err(|_| anyhow!("Failed to downcast to AppSrc"))?;

            let fps = gst::Fraction::approximate_f64(info.fps).unwrap_or_else(|| gst::Fraction::new(30, 1));
            let caps = GstVideoInfo::builder(VideoFormat::Rgb, info.width, info.height)
                .fps(fps)
                .build()?
                .to_caps()?;
            appsrc.set_caps(Some(&caps));
            appsrc.set_format(gst::Format::Time);
            pipeline.set_state(gst::State::Playing)?;

            let frame_duration = gst::ClockTime::from_nseconds((1_000_000_000f64 / info.fps.max(0.1)) as u64);
            Ok(GstFrameSink {
                pipeline,
                appsrc,
                info,
                frame_duration,
                frames_written: 0,
                finished: false,
            })
        };

        tokio::task::spawn_blocking(build)
            .await
            .map_err(|e| CounterError::write(0, e))?
            .map(|sink| Box::new(sink) as Box<dyn FrameSink>)
            .map_err(|e| CounterError::write(0, e))
    }
}

pub struct GstFrameSource {
    pipeline: gst::Pipeline,
    appsink: AppSink,
    gst_info: GstVideoInfo,
    info: VideoInfo,
    sequence_num: u64,
}

#[async_trait]
impl FrameSource for GstFrameSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    async fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        let appsink = self.appsink.clone();
        let gst_info = self.gst_info.clone();
        let sequence_num = self.sequence_num;

        let frame = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<VideoFrame>> {
            let sample = match appsink.pull_sample() {
                Ok(sample) => sample,
                Err(_) if appsink.is_eos() => return Ok(None),
                Err(_) => return Err(anyhow!("Failed to pull sample")),
            };
            let buffer = sample.buffer().ok_or_else(|| anyhow!("Failed to get buffer"))?;
            pack_rgb(buffer, &gst_info, sequence_num).map(Some)
        })
        .await
        .map_err(|e| CounterError::UnreadableInput(e.to_string()))?
        .map_err(|e| CounterError::UnreadableInput(format!("frame {}: {}", sequence_num, e)))?;

        if frame.is_some() {
            self.sequence_num += 1;
        }
        Ok(frame)
    }
}

impl Drop for GstFrameSource {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop decode pipeline: {}", e);
        }
    }
}

pub struct GstFrameSink {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    info: VideoInfo,
    frame_duration: gst::ClockTime,
    frames_written: u64,
    finished: bool,
}

#[async_trait]
impl FrameSink for GstFrameSink {
    async fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        if self.finished {
            return Err(CounterError::write(self.frames_written, "sink already finished"));
        }
        check_dimensions(frame, &self.info).map_err(|e| CounterError::write(self.frames_written, e))?;

        let mut buffer = gst::Buffer::from_mut_slice(frame.data.clone());
        if let Some(buffer) = buffer.get_mut() {
            let pts = self.frame_duration * self.frames_written;
            buffer.set_pts(pts);
            buffer.set_duration(self.frame_duration);
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| CounterError::write(self.frames_written, format!("{:?}", e)))?;
        self.frames_written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let frames_written = self.frames_written;
        self.appsrc
            .end_of_stream()
            .map_err(|e| CounterError::write(frames_written, format!("{:?}", e)))?;

        let pipeline = self.pipeline.clone();
        let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let bus = pipeline.bus().ok_or_else(|| anyhow!("Pipeline has no bus"))?;
            let result = match bus.timed_pop_filtered(
                gst::ClockTime::NONE,
                &[gst::MessageType::Eos, gst::MessageType::Error],
            ) {
                Some(msg) => match msg.view() {
                    gst::MessageView::Error(err) => Err(anyhow!("{}", err.error())),
                    _ => Ok(()),
                },
                None => Err(anyhow!("Bus closed before end of stream")),
            };
            pipeline.set_state(gst::State::Null)?;
            result
        })
        .await
        .map_err(|e| CounterError::write(frames_written, e))?;

        outcome.map_err(|e| CounterError::write(frames_written, e))?;
        debug!("Encoder finalized after {} frames", frames_written);
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Drop for GstFrameSink {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}
