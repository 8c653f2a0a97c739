use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::error::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub tracker: TrackerConfig,
    pub detection: DetectionConfig,
    pub annotation: AnnotationConfig,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
    pub video: VideoConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Validate)]
#[serde(default)]
pub struct TrackerConfig {
    /// Largest centroid displacement (pixels) between frames still treated as the same object.
    #[validate(range(min = 0.0))]
    pub distance_threshold: f32,
    /// Consecutive missed frames tolerated before a track is dropped.
    pub max_disappeared: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    Onnx,
    Replay,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct DetectionConfig {
    pub backend: DetectorBackend,
    pub model_path: PathBuf,
    #[validate(length(min = 1))]
    pub target_class: String,
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub nms_threshold: f32,
    #[validate(range(min = 1))]
    pub input_width: u32,
    #[validate(range(min = 1))]
    pub input_height: u32,
    pub class_names: Vec<String>,
    /// JSON-lines detections consumed by the replay backend.
    pub replay_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct AnnotationConfig {
    pub font_path: Option<PathBuf>,
    pub count_label: String,
    pub box_color: [u8; 3],
    pub count_color: [u8; 3],
    pub frame_text_color: [u8; 3],
    #[validate(range(min = 1, max = 16))]
    pub box_thickness: u32,
    #[validate(range(min = 1.0))]
    pub count_font_size: f32,
    #[validate(range(min = 1.0))]
    pub label_font_size: f32,
    pub show_frame_number: bool,
    pub draw_trails: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    #[validate(length(min = 1))]
    pub allowed_extensions: Vec<String>,
    pub output_prefix: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct ProcessingConfig {
    #[validate(range(min = 1))]
    pub progress_interval_frames: u64,
    #[validate(range(min = 1))]
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct VideoConfig {
    /// Frame rate assumed for image-sequence inputs, which carry none of their own.
    #[validate(range(min = 0.1))]
    pub sequence_fps: f64,
    /// GStreamer encoder element used for container output.
    pub encoder: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl NodeConfig {
    /// Loads configuration from an optional file layered under `HEADCOUNT__*`
    /// environment variables, then validates it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("HEADCOUNT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: NodeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;
        self.detection.validate()?;
        self.annotation.validate()?;
        self.storage.validate()?;
        self.processing.validate()?;
        self.video.validate()?;
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "headcount-node-1".to_string(),
            tracker: TrackerConfig::default(),
            detection: DetectionConfig::default(),
            annotation: AnnotationConfig::default(),
            storage: StorageConfig::default(),
            processing: ProcessingConfig::default(),
            video: VideoConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 100.0,
            max_disappeared: 10,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            backend: DetectorBackend::Onnx,
            model_path: PathBuf::from("models/yolov8n.onnx"),
            target_class: "person".to_string(),
            confidence_threshold: 0.5,
            nms_threshold: 0.45,
            input_width: 640,
            input_height: 640,
            class_names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
            replay_path: None,
        }
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            count_label: "Unique Persons".to_string(),
            box_color: [0, 255, 0],
            count_color: [255, 0, 0],
            frame_text_color: [255, 255, 255],
            box_thickness: 2,
            count_font_size: 32.0,
            label_font_size: 20.0,
            show_frame_number: true,
            draw_trails: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            allowed_extensions: ["mp4", "avi", "mov", "mkv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            output_prefix: "processed_".to_string(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            progress_interval_frames: 30,
            max_concurrent_jobs: 2,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            sequence_fps: 30.0,
            encoder: "x264enc".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];
