//! Detector that replays precomputed detections from a JSON-lines file.
//!
//! Each line is one frame record:
//! `{"frame": 12, "detections": [{"bbox": {...}, "confidence": 0.8, "class_id": 0, "class_label": "person"}]}`
//! Frames without a record produce no detections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use headcount_common::{Detection, VideoFrame};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Detector, DetectorProvider};
use crate::error::{CounterError, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FrameDetections {
    pub frame: u64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

pub struct ReplayDetector {
    frames: Arc<HashMap<u64, Vec<Detection>>>,
}

impl ReplayDetector {
    pub fn from_records(records: Vec<FrameDetections>) -> Self {
        let mut frames: HashMap<u64, Vec<Detection>> = HashMap::new();
        for record in records {
            frames.entry(record.frame).or_default().extend(record.detections);
        }
        Self {
            frames: Arc::new(frames),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CounterError::ConfigError(format!("Cannot read detections file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record: FrameDetections = serde_json::from_str(line).map_err(|e| {
                CounterError::SerializationError(format!("line {}: {}", line_no + 1, e))
            })?;
            records.push(record);
        }
        Ok(Self::from_records(records))
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl Detector for ReplayDetector {
    async fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>> {
        Ok(self
            .frames
            .get(&frame.sequence_num)
            .cloned()
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "replay"
    }
}

/// Parses the detections file once and hands out detectors sharing it.
pub struct ReplayProvider {
    frames: Arc<HashMap<u64, Vec<Detection>>>,
}

impl ReplayProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let detector = ReplayDetector::from_path(&path)?;
        info!(
            "Loaded replay detections for {} frames from {}",
            detector.frame_count(),
            path.display()
        );
        Ok(Self {
            frames: detector.frames,
        })
    }
}

impl DetectorProvider for ReplayProvider {
    fn create(&self) -> Result<Box<dyn Detector>> {
        Ok(Box::new(ReplayDetector {
            frames: self.frames.clone(),
        }))
    }
}
