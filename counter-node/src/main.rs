use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use headcount_node::config::DetectorBackend;
use headcount_node::inference::replay::ReplayProvider;
use headcount_node::inference::DetectorProvider;
use headcount_node::video::image_sequence::ImageSequenceBackend;
use headcount_node::video::VideoBackend;
use headcount_node::{JobManager, JobStatus, NodeConfig, ProcessingJob};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, defaults to `logging.level` from the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count unique persons in a video and write an annotated copy
    Process {
        /// Video file, or a directory of frame images
        #[arg(short, long)]
        input: PathBuf,

        /// JSON-lines detections to replay instead of running the model
        #[arg(short, long)]
        detections: Option<PathBuf>,

        /// Copy the input into the upload directory before processing
        #[arg(long)]
        upload: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = NodeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.logging.level))?;

    info!("Starting headcount node {}", config.node_id);

    match args.command {
        Command::Process {
            input,
            detections,
            upload,
        } => {
            let job = run_process(config, &input, detections.as_deref(), upload).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            if job.status != JobStatus::Completed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to install log subscriber")?;

    Ok(())
}

async fn run_process(
    config: NodeConfig,
    input: &Path,
    detections: Option<&Path>,
    upload: bool,
) -> anyhow::Result<ProcessingJob> {
    let backend = video_backend(&config, input)?;
    let detectors = detector_provider(&config, detections)?;
    let manager = JobManager::new(config, backend, detectors);

    let job_id = if upload {
        let content = tokio::fs::read(input)
            .await
            .with_context(|| format!("Failed to read {}", input.display()))?;
        let filename = input
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("{} has no file name", input.display()))?;
        manager.upload(&content, filename).await?
    } else {
        manager.create_job(input).await?
    };

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            cancel.cancel();
        })
    };

    let job = manager.process_with_cancel(job_id, cancel).await?;
    watcher.abort();
    Ok(job)
}

fn video_backend(config: &NodeConfig, input: &Path) -> anyhow::Result<Arc<dyn VideoBackend>> {
    if input.is_dir() {
        return Ok(Arc::new(ImageSequenceBackend::new(config.video.sequence_fps)));
    }

    #[cfg(feature = "gstreamer")]
    return Ok(Arc::new(headcount_node::video::gstreamer::GstBackend::new(
        config.video.encoder.clone(),
    )?));

    #[cfg(not(feature = "gstreamer"))]
    bail!(
        "{} is a video file but this build has no GStreamer support; pass a frame directory or rebuild with --features gstreamer",
        input.display()
    );
}

fn detector_provider(config: &NodeConfig, detections: Option<&Path>) -> anyhow::Result<Arc<dyn DetectorProvider>> {
    let replay_path = detections.map(Path::to_path_buf).or_else(|| match config.detection.backend {
        DetectorBackend::Replay => config.detection.replay_path.clone(),
        DetectorBackend::Onnx => None,
    });

    if let Some(path) = replay_path {
        return Ok(Arc::new(ReplayProvider::new(path)?));
    }

    match config.detection.backend {
        DetectorBackend::Replay => bail!("detection.backend is replay but no replay_path or --detections was given"),
        DetectorBackend::Onnx => onnx_provider(config),
    }
}

#[cfg(feature = "onnx")]
fn onnx_provider(config: &NodeConfig) -> anyhow::Result<Arc<dyn DetectorProvider>> {
    Ok(Arc::new(headcount_node::inference::ort_engine::OrtProvider::new(
        config.detection.clone(),
    )))
}

#[cfg(not(feature = "onnx"))]
fn onnx_provider(_config: &NodeConfig) -> anyhow::Result<Arc<dyn DetectorProvider>> {
    bail!("ONNX detection requires building with --features onnx; pass --detections to replay detections")
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, cancelling at next frame");
}
