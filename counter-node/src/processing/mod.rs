pub mod annotator;
pub mod pipeline;
pub mod tracker;

pub use annotator::FrameAnnotator;
pub use pipeline::{PipelineState, ProcessingResult, VideoPipeline};
pub use tracker::{BoundingBox, Centroid, CentroidTracker, TrackId};
