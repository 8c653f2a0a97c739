use async_trait::async_trait;
use headcount_common::{Detection, VideoFrame};
use tracing::debug;

use crate::config::DetectionConfig;
use crate::error::{CounterError, Result};
use crate::processing::tracker::BoundingBox;

#[cfg(feature = "onnx")]
pub mod ort_engine;
pub mod replay;

/// Black-box object detector.
#[async_trait]
pub trait Detector: Send {
    async fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>>;
    fn name(&self) -> &str;
}

/// Builds a fresh detector for each pipeline run.
pub trait DetectorProvider: Send + Sync {
    fn create(&self) -> Result<Box<dyn Detector>>;
}

impl<F> DetectorProvider for F
where
    F: Fn() -> Result<Box<dyn Detector>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Detector>> {
        self()
    }
}

/// Narrows raw detector output to the boxes the tracker should see.
pub struct DetectionAdapter {
    detector: Box<dyn Detector>,
    target_class: String,
    confidence_threshold: f32,
}

impl DetectionAdapter {
    pub fn new(detector: Box<dyn Detector>, target_class: impl Into<String>, confidence_threshold: f32) -> Self {
        Self {
            detector,
            target_class: target_class.into(),
            confidence_threshold,
        }
    }

    pub fn from_config(detector: Box<dyn Detector>, config: &DetectionConfig) -> Self {
        Self::new(detector, config.target_class.clone(), config.confidence_threshold)
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Runs the detector on `frame` and keeps `target_class` boxes scoring at
    /// least the threshold. Any detector failure is fatal for the frame.
    pub async fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<BoundingBox>> {
        let raw = self
            .detector
            .detect(frame)
            .await
            .map_err(|e| CounterError::DetectionAdapterError {
                frame: frame.sequence_num,
                reason: e.to_string(),
            })?;

        let total = raw.len();
        let boxes: Vec<BoundingBox> = raw
            .iter()
            .filter(|d| d.class_label == self.target_class && d.confidence >= self.confidence_threshold)
            .map(BoundingBox::from)
            .collect();

        debug!(
            "Frame {}: {} of {} detections kept",
            frame.sequence_num,
            boxes.len(),
            total
        );
        Ok(boxes)
    }
}
