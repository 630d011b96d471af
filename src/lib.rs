//! binwise: waste-sorting vision kernel
//!
//! The core of this crate is a live camera detection pipeline that keeps a
//! display-ready, annotated view of whatever the camera sees and reports the
//! objects it recognizes.
//!
//! # Architecture
//!
//! The live pipeline runs two activities that share a single-slot frame buffer:
//!
//! 1. **Capture**: a `FrameSource` reads frames as fast as the camera delivers them.
//!    Only the newest frame is kept; older ones are overwritten, never queued.
//! 2. **Inference**: each frame is letterboxed to the detector input, run through a
//!    `DetectorBackend`, filtered for temporal stability, mapped back to display
//!    coordinates and rendered. Results go to a `PipelineSink`.
//!
//! Around the pipeline sit a waste catalog that turns detector labels into
//! disposal categories, a still-image detection path, a history store with user
//! feedback, and a client for a local LLM that answers disposal questions.
//!
//! # Module Structure
//!
//! - `geometry`, `frame`: value types shared by every stage
//! - `ingest`: camera drivers, discovery and the capture loop
//! - `preprocess`, `detect`, `stability`, `coords`, `render`: per-frame stages
//! - `pipeline`: the controller state machine and sinks
//! - `classify`, `still`, `storage`, `recorder`, `chat`: application features
//! - `config`, `ui`, `error`: ambient plumbing

pub mod chat;
pub mod classify;
pub mod config;
pub mod coords;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod pipeline;
pub mod preprocess;
pub mod recorder;
pub mod render;
pub mod stability;
pub mod still;
pub mod storage;
pub mod ui;

pub use classify::{ClassifiedDetection, WasteCatalog, WasteCategory};
pub use config::AppConfig;
pub use coords::CoordinateMapper;
pub use detect::{BackendRegistry, Detection, DetectorBackend, SharedBackend, StubBackend};
pub use error::{PipelineError, PipelineResult};
pub use frame::{Frame, FrameSlot};
pub use geometry::BoundingBox;
pub use ingest::{CameraDiscovery, CaptureBackend, CaptureSettings, FrameSource, ReleaseHandle};
pub use pipeline::{
    CallbackSink, ChannelSink, NullSink, PipelineConfig, PipelineController, PipelineEvent,
    PipelineSink, PipelineState, PipelineStats,
};
pub use preprocess::{GeometricTransform, InputTensor, Preprocessor};
pub use recorder::HistoryRecorder;
pub use render::{RenderedFrame, RenderedLabel, Renderer};
pub use stability::{DetectionHistoryWindow, StabilityConfig, StabilityFilter};
pub use still::{StillDetection, StillImageDetector};
pub use storage::{
    DetectionRecord, FeedbackRecord, FeedbackStats, HistoryStore, InMemoryHistoryStore,
    NewDetectionRecord, NewFeedback, SharedHistoryStore, SourceKind, SqliteHistoryStore,
};
