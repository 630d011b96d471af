//! binwise-live - live camera detection with waste categories
//!
//! Opens the first available camera, runs the detection pipeline and logs what
//! it sees until Ctrl-C or until `--frames` frames have been processed.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use binwise::{
    AppConfig, CallbackSink, CaptureBackend, HistoryRecorder, PipelineController, PipelineSink,
    SqliteHistoryStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Detector backend (`stub` or `tract`).
    #[arg(long, env = "BINWISE_BACKEND")]
    backend: Option<String>,
    /// ONNX model path for the tract backend.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Stop after this many processed frames.
    #[arg(long)]
    frames: Option<u64>,
    /// Confidence threshold override.
    #[arg(long)]
    confidence: Option<f32>,
    /// Save detections to the history database.
    #[arg(long)]
    autosave: bool,
    /// Use the synthetic camera instead of real devices.
    #[arg(long)]
    stub_camera: bool,
}

enum Shutdown {
    Interrupted,
    FrameLimit,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = AppConfig::load()?;
    if let Some(backend) = args.backend {
        cfg.model.backend = backend.trim().to_ascii_lowercase();
    }
    if args.model.is_some() {
        cfg.model.path = args.model;
    }
    if let Some(confidence) = args.confidence {
        cfg.pipeline.confidence_threshold = confidence;
    }
    if args.stub_camera {
        cfg.camera.backends = vec![CaptureBackend::Stub];
    }
    cfg.history.autosave |= args.autosave;

    let registry = cfg.detector_registry()?;
    let detector = registry
        .default_backend()
        .ok_or_else(|| anyhow!("no detector backend available"))?;
    log::info!("detector backends: {}", registry.list().join(", "));
    let catalog = cfg.waste_catalog()?;

    let (tx, rx) = mpsc::channel();
    let processed = Arc::new(AtomicU64::new(0));
    let frame_limit = args.frames;
    let summary_catalog = catalog.clone();
    let limit_tx = tx.clone();
    let counter = Arc::clone(&processed);
    let callbacks = CallbackSink::new().detections(move |detections| {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if !detections.is_empty() {
            let summary: Vec<String> = summary_catalog
                .classify_all(detections)
                .iter()
                .map(|c| {
                    format!(
                        "{} {:.2} -> {}",
                        c.display_name,
                        c.detection.confidence,
                        c.category_label()
                    )
                })
                .collect();
            log::info!("frame {}: {}", n, summary.join("; "));
        }
        if frame_limit == Some(n) {
            let _ = limit_tx.send(Shutdown::FrameLimit);
        }
    });

    let sink: Box<dyn PipelineSink> = if cfg.history.autosave {
        let store = SqliteHistoryStore::open(&cfg.history.db_path)?;
        log::info!(
            "autosave every {:?} into {}",
            cfg.history.autosave_interval,
            cfg.history.db_path
        );
        Box::new(
            HistoryRecorder::new(
                Arc::new(Mutex::new(store)),
                catalog,
                cfg.history.autosave_interval,
            )
            .wrapping(Box::new(callbacks)),
        )
    } else {
        Box::new(callbacks)
    };

    let mut pipeline = PipelineController::new(cfg.pipeline.clone(), cfg.camera_discovery())
        .with_renderer(cfg.renderer()?);
    pipeline.attach_detector(detector);
    pipeline.set_sink(sink);

    ctrlc::set_handler(move || {
        let _ = tx.send(Shutdown::Interrupted);
    })
    .context("install Ctrl-C handler")?;

    pipeline.start()?;
    log::info!("binwise-live running; press Ctrl-C to stop");

    match rx.recv() {
        Ok(Shutdown::FrameLimit) => log::info!("frame limit reached"),
        Ok(Shutdown::Interrupted) | Err(_) => log::info!("shutdown signal received"),
    }
    let stopped = pipeline.stop();
    let stats = pipeline.stats();
    log::info!(
        "captured {} frames, dropped {}, processed {}, failed {}",
        stats.frames_captured,
        stats.frames_dropped,
        stats.frames_processed,
        stats.frames_failed
    );
    stopped?;
    Ok(())
}
