pub mod config;
pub mod error;
pub mod inference;
pub mod jobs;
pub mod processing;
pub mod video;

pub use config::NodeConfig;
pub use error::{CounterError, ErrorKind, Result};
pub use jobs::{JobManager, JobStats, JobStatus, ProcessingJob};
