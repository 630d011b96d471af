use thiserror::Error;

/// Failures surfaced synchronously by the live pipeline's start/stop calls.
///
/// Steady-state per-frame failures never reach this type; they are logged and
/// contained inside the capture and inference activities.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("camera unavailable after {attempts} open attempts{}", last_error_suffix(.last_error))]
    CameraUnavailable {
        attempts: usize,
        last_error: Option<String>,
    },
    #[error("no detector attached; load a model before starting")]
    ModelNotLoaded,
    #[error("pipeline already running")]
    AlreadyRunning,
    #[error("pipeline activities did not stop within {timeout_ms}ms: {}", .activities.join(", "))]
    StopTimeout {
        timeout_ms: u64,
        activities: Vec<&'static str>,
    },
    #[error("pipeline error: {0}")]
    Internal(String),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(" (last error: {err})"),
        None => String::new(),
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
