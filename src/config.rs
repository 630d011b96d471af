use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::chat::{GenerateOptions, OllamaClient, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::classify::WasteCatalog;
use crate::detect::{load_class_names, BackendRegistry, StubBackend};
#[cfg(feature = "backend-tract")]
use crate::detect::DetectorBackend;
use crate::ingest::{
    CameraDiscovery, CaptureBackend, CaptureSettings, SyntheticDriver, DEFAULT_CAMERA_INDICES,
};
use crate::pipeline::PipelineConfig;
use crate::render::Renderer;
use crate::stability::StabilityConfig;

const DEFAULT_DB_PATH: &str = "binwise.db";
const DEFAULT_MODEL_BACKEND: &str = "tract";
const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 5;
const DEFAULT_RETENTION_DAYS: u32 = 30;
const DEFAULT_CHAT_TEMPERATURE: f32 = 0.3;
const DEFAULT_CHAT_MAX_TOKENS: u32 = 800;
const DEFAULT_CHAT_TIMEOUT_SECS: u64 = 30;
const SYNTHETIC_NOISE: u8 = 4;

/// Detector backends the binaries know how to build.
pub const MODEL_BACKENDS: &[&str] = &["tract", "stub"];

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    camera: Option<CameraConfigFile>,
    model: Option<ModelConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    history: Option<HistoryConfigFile>,
    chat: Option<ChatConfigFile>,
    render: Option<RenderConfigFile>,
    catalog_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    indices: Option<Vec<u32>>,
    backends: Option<Vec<String>>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    buffer_depth: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<PathBuf>,
    backend: Option<String>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    class_names: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    confidence_threshold: Option<f32>,
    display_width: Option<u32>,
    display_height: Option<u32>,
    history_capacity: Option<usize>,
    require_frames: Option<usize>,
    iou_threshold: Option<f32>,
    idle_backoff_ms: Option<u64>,
    capture_retry_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryConfigFile {
    db_path: Option<String>,
    autosave: Option<bool>,
    autosave_interval_secs: Option<u64>,
    retention_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatConfigFile {
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RenderConfigFile {
    font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub camera: CameraSettings,
    pub model: ModelSettings,
    pub pipeline: PipelineConfig,
    pub history: HistorySettings,
    pub chat: ChatSettings,
    pub font_path: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub indices: Vec<u32>,
    pub backends: Vec<CaptureBackend>,
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub path: Option<PathBuf>,
    pub backend: String,
    pub input_width: u32,
    pub input_height: u32,
    pub class_names: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HistorySettings {
    pub db_path: String,
    pub autosave: bool,
    pub autosave_interval: Duration,
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl AppConfig {
    /// Defaults, then `BINWISE_CONFIG` file, then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("BINWISE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Result<Self> {
        let camera_file = file.camera.unwrap_or_default();
        let defaults = CaptureSettings::default();
        let backends = match camera_file.backends {
            Some(names) => names
                .iter()
                .map(|name| name.parse::<CaptureBackend>())
                .collect::<Result<Vec<_>>>()?,
            None => vec![CaptureBackend::V4l2, CaptureBackend::Any],
        };
        let camera = CameraSettings {
            indices: camera_file
                .indices
                .unwrap_or_else(|| DEFAULT_CAMERA_INDICES.to_vec()),
            backends,
            capture: CaptureSettings {
                width: camera_file.width.unwrap_or(defaults.width),
                height: camera_file.height.unwrap_or(defaults.height),
                fps: camera_file.fps.unwrap_or(defaults.fps),
                buffer_depth: camera_file.buffer_depth.unwrap_or(defaults.buffer_depth),
            },
        };

        let pipeline_defaults = PipelineConfig::default();
        let model_file = file.model.unwrap_or_default();
        let model = ModelSettings {
            path: model_file.path,
            backend: model_file
                .backend
                .unwrap_or_else(|| DEFAULT_MODEL_BACKEND.to_string()),
            input_width: model_file.input_width.unwrap_or(pipeline_defaults.input_width),
            input_height: model_file.input_height.unwrap_or(pipeline_defaults.input_height),
            class_names: model_file.class_names,
        };

        let p = file.pipeline.unwrap_or_default();
        let stability_defaults = StabilityConfig::default();
        let pipeline = PipelineConfig {
            confidence_threshold: p
                .confidence_threshold
                .unwrap_or(pipeline_defaults.confidence_threshold),
            display_width: p.display_width.unwrap_or(pipeline_defaults.display_width),
            display_height: p.display_height.unwrap_or(pipeline_defaults.display_height),
            input_width: model.input_width,
            input_height: model.input_height,
            stability: StabilityConfig {
                history_capacity: p
                    .history_capacity
                    .unwrap_or(stability_defaults.history_capacity),
                require_frames: p.require_frames.unwrap_or(stability_defaults.require_frames),
                iou_threshold: p.iou_threshold.unwrap_or(stability_defaults.iou_threshold),
            },
            idle_backoff: p
                .idle_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(pipeline_defaults.idle_backoff),
            capture_retry: p
                .capture_retry_ms
                .map(Duration::from_millis)
                .unwrap_or(pipeline_defaults.capture_retry),
            stop_timeout: p
                .stop_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(pipeline_defaults.stop_timeout),
        };

        let h = file.history.unwrap_or_default();
        let history = HistorySettings {
            db_path: h.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            autosave: h.autosave.unwrap_or(false),
            autosave_interval: Duration::from_secs(
                h.autosave_interval_secs
                    .unwrap_or(DEFAULT_AUTOSAVE_INTERVAL_SECS),
            ),
            retention_days: h.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
        };

        let c = file.chat.unwrap_or_default();
        let chat = ChatSettings {
            base_url: c.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: c.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: c.temperature.unwrap_or(DEFAULT_CHAT_TEMPERATURE),
            max_tokens: c.max_tokens.unwrap_or(DEFAULT_CHAT_MAX_TOKENS),
            timeout: Duration::from_secs(c.timeout_secs.unwrap_or(DEFAULT_CHAT_TIMEOUT_SECS)),
        };

        Ok(Self {
            camera,
            model,
            pipeline,
            history,
            chat,
            font_path: file.render.and_then(|r| r.font_path),
            catalog_path: file.catalog_path,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("BINWISE_DB_PATH") {
            if !path.trim().is_empty() {
                self.history.db_path = path;
            }
        }
        if let Ok(path) = std::env::var("BINWISE_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model.path = Some(PathBuf::from(path));
            }
        }
        if let Ok(confidence) = std::env::var("BINWISE_CONFIDENCE") {
            self.pipeline.confidence_threshold = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("BINWISE_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(indices) = std::env::var("BINWISE_CAMERA_INDICES") {
            let parsed = split_csv(&indices)
                .iter()
                .map(|entry| {
                    entry.parse::<u32>().map_err(|_| {
                        anyhow!("BINWISE_CAMERA_INDICES must be a comma separated list of integers")
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            if !parsed.is_empty() {
                self.camera.indices = parsed;
            }
        }
        if let Ok(url) = std::env::var("BINWISE_OLLAMA_URL") {
            if !url.trim().is_empty() {
                self.chat.base_url = url;
            }
        }
        if let Ok(model) = std::env::var("BINWISE_OLLAMA_MODEL") {
            if !model.trim().is_empty() {
                self.chat.model = model;
            }
        }
        if let Ok(autosave) = std::env::var("BINWISE_AUTOSAVE") {
            self.history.autosave = matches!(
                autosave.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let threshold = self.pipeline.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!("confidence threshold must be within [0, 1], got {}", threshold));
        }
        if self.pipeline.display_width == 0 || self.pipeline.display_height == 0 {
            return Err(anyhow!("display dimensions must be greater than zero"));
        }
        if self.model.input_width == 0 || self.model.input_height == 0 {
            return Err(anyhow!("model input dimensions must be greater than zero"));
        }
        let stability = &self.pipeline.stability;
        if stability.history_capacity == 0 {
            return Err(anyhow!("history_capacity must be at least 1"));
        }
        if stability.require_frames == 0 {
            return Err(anyhow!("require_frames must be at least 1"));
        }
        if !(0.0..1.0).contains(&stability.iou_threshold) {
            return Err(anyhow!("iou_threshold must be within [0, 1)"));
        }
        if self.camera.indices.is_empty() {
            return Err(anyhow!("at least one camera index is required"));
        }
        if self.camera.backends.is_empty() {
            return Err(anyhow!("at least one capture backend is required"));
        }
        self.model.backend = self.model.backend.trim().to_ascii_lowercase();
        if !MODEL_BACKENDS.contains(&self.model.backend.as_str()) {
            return Err(anyhow!(
                "unknown model backend '{}' (expected one of {})",
                self.model.backend,
                MODEL_BACKENDS.join(", ")
            ));
        }
        if self.history.retention_days == 0 {
            return Err(anyhow!("retention_days must be greater than zero"));
        }
        Ok(())
    }

    /// Camera discovery with every driver compiled into this build, plus the
    /// synthetic camera when the `stub` backend is requested.
    pub fn camera_discovery(&self) -> CameraDiscovery {
        let discovery = CameraDiscovery::new(
            self.camera.indices.clone(),
            self.camera.backends.clone(),
            self.camera.capture.clone(),
        )
        .with_platform_drivers();
        if self.camera.backends.contains(&CaptureBackend::Stub) {
            let capture = &self.camera.capture;
            discovery.with_driver(Arc::new(
                SyntheticDriver::new(capture.width, capture.height)
                    .with_fps(capture.fps)
                    .with_noise(SYNTHETIC_NOISE),
            ))
        } else {
            discovery
        }
    }

    /// Configured catalog file, or the built-in table.
    pub fn waste_catalog(&self) -> Result<WasteCatalog> {
        match &self.catalog_path {
            Some(path) => WasteCatalog::load(path),
            None => Ok(WasteCatalog::builtin()),
        }
    }

    pub fn class_names(&self) -> Result<Vec<String>> {
        match &self.model.class_names {
            Some(path) => load_class_names(path),
            None => Ok(Vec::new()),
        }
    }

    /// Registry holding the stub backend and, when available, the ONNX model.
    /// The configured backend is the default.
    pub fn detector_registry(&self) -> Result<BackendRegistry> {
        let class_names = self.class_names()?;
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new(class_names.clone()));
        if self.model.backend == "tract" {
            let path = self
                .model
                .path
                .as_ref()
                .ok_or_else(|| anyhow!("model backend 'tract' needs a model path (BINWISE_MODEL_PATH)"))?;
            self.register_tract(&mut registry, path, class_names)?;
        }
        registry.set_default(&self.model.backend)?;
        Ok(registry)
    }

    #[cfg(feature = "backend-tract")]
    fn register_tract(
        &self,
        registry: &mut BackendRegistry,
        path: &Path,
        class_names: Vec<String>,
    ) -> Result<()> {
        let mut backend = crate::detect::TractBackend::new(
            path,
            self.model.input_width,
            self.model.input_height,
            class_names,
        )?;
        backend.warm_up()?;
        registry.register(backend);
        Ok(())
    }

    #[cfg(not(feature = "backend-tract"))]
    fn register_tract(
        &self,
        _registry: &mut BackendRegistry,
        path: &Path,
        _class_names: Vec<String>,
    ) -> Result<()> {
        Err(anyhow!(
            "cannot load {}: binwise was built without the backend-tract feature",
            path.display()
        ))
    }

    pub fn renderer(&self) -> Result<Renderer> {
        match &self.font_path {
            Some(path) => Renderer::with_font_file(path),
            None => Ok(Renderer::new()),
        }
    }

    pub fn chat_client(&self) -> OllamaClient {
        OllamaClient::new(&self.chat.base_url, self.chat.model.clone(), self.chat.timeout)
            .with_answer_options(GenerateOptions {
                temperature: self.chat.temperature,
                max_tokens: self.chat.max_tokens,
            })
    }
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let mut cfg = AppConfig::from_file(AppConfigFile::default())?;
        cfg.validate()?;
        assert_eq!(cfg.camera.indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(cfg.camera.backends, vec![CaptureBackend::V4l2, CaptureBackend::Any]);
        assert_eq!(cfg.history.db_path, DEFAULT_DB_PATH);
        assert_eq!(cfg.pipeline.stability.require_frames, 2);
        assert_eq!(cfg.chat.model, DEFAULT_MODEL);
        Ok(())
    }

    #[test]
    fn unknown_capture_backend_is_rejected() {
        let file = AppConfigFile {
            camera: Some(CameraConfigFile {
                backends: Some(vec!["dshow".into()]),
                ..CameraConfigFile::default()
            }),
            ..AppConfigFile::default()
        };
        assert!(AppConfig::from_file(file).is_err());
    }

    #[test]
    fn validation_catches_bad_values() -> Result<()> {
        let mut cfg = AppConfig::from_file(AppConfigFile::default())?;
        cfg.pipeline.stability.iou_threshold = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::from_file(AppConfigFile::default())?;
        cfg.model.backend = "onnxruntime".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::from_file(AppConfigFile::default())?;
        cfg.model.backend = " Stub ".into();
        cfg.validate()?;
        assert_eq!(cfg.model.backend, "stub");
        Ok(())
    }

    #[test]
    fn stub_registry_needs_no_model() -> Result<()> {
        let mut cfg = AppConfig::from_file(AppConfigFile::default())?;
        cfg.model.backend = "stub".into();
        let registry = cfg.detector_registry()?;
        assert_eq!(registry.list(), vec!["stub".to_string()]);
        assert!(registry.default_backend().is_some());

        cfg.model.backend = "tract".into();
        cfg.model.path = None;
        assert!(cfg.detector_registry().is_err());
        Ok(())
    }

    #[test]
    fn csv_split_skips_blanks() {
        assert_eq!(split_csv(" 2, ,4 ,"), vec!["2", "4"]);
    }
}
