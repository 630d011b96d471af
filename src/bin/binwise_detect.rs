//! binwise-detect - run waste detection on a single image

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use binwise::storage::HistoryStore;
use binwise::ui::{format_duration, Ui, UiMode};
use binwise::{AppConfig, SourceKind, SqliteHistoryStore, StillImageDetector};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image to analyze.
    image: PathBuf,
    /// Write the annotated image here.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Detector backend (`stub` or `tract`).
    #[arg(long, env = "BINWISE_BACKEND")]
    backend: Option<String>,
    /// ONNX model path for the tract backend.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Confidence threshold override.
    #[arg(long)]
    confidence: Option<f32>,
    /// Do not record the result in the history database.
    #[arg(long)]
    no_save: bool,
    /// Progress output: auto, plain or pretty.
    #[arg(long, default_value = "auto")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::detect(args.ui);

    let mut cfg = AppConfig::load()?;
    if let Some(backend) = args.backend {
        cfg.model.backend = backend.trim().to_ascii_lowercase();
    }
    if args.model.is_some() {
        cfg.model.path = args.model;
    }
    let threshold = args
        .confidence
        .unwrap_or(cfg.pipeline.confidence_threshold);

    let detector = {
        let _stage = ui.stage("load detector");
        let registry = cfg.detector_registry()?;
        let backend = registry
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend available"))?;
        StillImageDetector::new(backend, cfg.model.input_width, cfg.model.input_height)?
            .with_renderer(cfg.renderer()?)
    };
    let catalog = cfg.waste_catalog()?;

    let result = {
        let mut stage = ui.stage("detect");
        let result = detector.detect_path(&args.image, threshold)?;
        stage.set_detail(format!("{} objects", result.detections.len()));
        result
    };

    println!(
        "{} ({}x{}) processed in {}",
        args.image.display(),
        result.width,
        result.height,
        format_duration(result.processing_time)
    );
    if result.detections.is_empty() {
        println!("  no objects detected");
    }
    for item in catalog.classify_all(&result.detections) {
        let bbox = item.detection.bbox;
        println!(
            "  {:<20} {:.2}  {:<18} [{:.0}, {:.0}, {:.0}, {:.0}]  {}",
            item.display_name,
            item.detection.confidence,
            item.category_label(),
            bbox.x1,
            bbox.y1,
            bbox.x2,
            bbox.y2,
            item.tips
        );
    }

    if let Some(output) = &args.output {
        let _stage = ui.stage("write annotated image");
        result
            .annotated
            .image
            .save(output)
            .with_context(|| format!("write {}", output.display()))?;
    }

    if !args.no_save {
        let _stage = ui.stage("save history");
        let mut store = SqliteHistoryStore::open(&cfg.history.db_path)?;
        let mut record = result.to_record(&catalog, SourceKind::Upload)?;
        record.result_image_path = args.output.as_ref().map(|p| p.display().to_string());
        let id = store.save_record(record)?;
        println!("saved as history record {}", id);
    }
    Ok(())
}
