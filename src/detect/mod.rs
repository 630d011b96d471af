//! Detector boundary.
//!
//! Everything downstream of inference works on the `Detection` value type; the
//! backends in this module are the only code that sees raw model output.

mod backend;
mod backends;
mod labels;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use labels::{load_class_names, parse_class_names};
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{non_max_suppression, Detection};
