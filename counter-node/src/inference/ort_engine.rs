use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use headcount_common::{BBox, Detection, VideoFrame};
use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::{debug, info, instrument};

use super::{Detector, DetectorProvider};
use crate::config::DetectionConfig;
use crate::error::{CounterError, Result};

/// YOLOv8-style detector running on ONNX Runtime.
pub struct OrtDetector {
    session: Session,
    config: DetectionConfig,
}

impl OrtDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let session = Self::create_session(&config.model_path)?;
        Ok(Self {
            session,
            config: config.clone(),
        })
    }

    fn create_session(model_path: &Path) -> Result<Session> {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(threads)?
            .commit_from_file(model_path)
            .map_err(|e| CounterError::ConfigError(format!("Failed to load model {}: {}", model_path.display(), e)))?;

        info!("Model loaded successfully: {}", model_path.display());
        Ok(session)
    }

    fn preprocess(&self, frame: &VideoFrame) -> Result<Array4<f32>> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| CounterError::InvalidFrame(format!(
                "buffer of {} bytes does not match {}x{} RGB",
                frame.data.len(),
                frame.width,
                frame.height
            )))?;

        let (w, h) = (self.config.input_width, self.config.input_height);
        let resized = image::imageops::resize(&image, w, h, FilterType::Triangle);

        let mut input = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }
        Ok(input)
    }
}

/// Decodes a `[1, 4 + classes, anchors]` output into frame-space detections.
fn postprocess(config: &DetectionConfig, shape: &[i64], data: &[f32], frame: &VideoFrame) -> Result<Vec<Detection>> {
    if shape.len() != 3 || shape[1] < 5 {
        return Err(CounterError::InvalidFrame(format!("unexpected output shape {:?}", shape)));
    }
    let num_classes = shape[1] as usize - 4;
    let anchors = shape[2] as usize;
    let scale_x = frame.width as f32 / config.input_width as f32;
    let scale_y = frame.height as f32 / config.input_height as f32;

    let mut detections = Vec::new();
    for i in 0..anchors {
        let mut best_class = 0;
        let mut best_score = 0.0f32;
        for c in 0..num_classes {
            let score = data[(4 + c) * anchors + i];
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }
        if best_score < config.confidence_threshold {
            continue;
        }

        let cx = data[i];
        let cy = data[anchors + i];
        let w = data[2 * anchors + i];
        let h = data[3 * anchors + i];

        let class_label = config
            .class_names
            .get(best_class)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", best_class));

        detections.push(Detection {
            bbox: BBox::new(
                ((cx - w / 2.0) * scale_x).max(0.0),
                ((cy - h / 2.0) * scale_y).max(0.0),
                ((cx + w / 2.0) * scale_x).min(frame.width as f32),
                ((cy + h / 2.0) * scale_y).min(frame.height as f32),
            ),
            confidence: best_score,
            class_id: best_class as u32,
            class_label,
        });
    }

    Ok(apply_nms(detections, config.nms_threshold))
}

#[async_trait]
impl Detector for OrtDetector {
    #[instrument(skip(self, frame), fields(frame = frame.sequence_num), level = "debug")]
    async fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>> {
        let start = Instant::now();
        let input = Tensor::from_array(self.preprocess(frame)?)?;
        let outputs = self.session.run(ort::inputs![input])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let detections = postprocess(&self.config, shape, data, frame)?;

        debug!(
            "Inference took {:.1}ms, {} detections",
            start.elapsed().as_secs_f32() * 1000.0,
            detections.len()
        );
        Ok(detections)
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

/// Greedy per-class non-maximum suppression, highest confidence first.
fn apply_nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for detection in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_id == detection.class_id && k.bbox.iou(&detection.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(detection);
        }
    }
    kept
}

/// Creates one ONNX session per detector.
pub struct OrtProvider {
    config: DetectionConfig,
}

impl OrtProvider {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }
}

impl DetectorProvider for OrtProvider {
    fn create(&self) -> Result<Box<dyn Detector>> {
        Ok(Box::new(OrtDetector::new(&self.config)?))
    }
}
