use anyhow::Result;

use crate::detect::result::Detection;
use crate::preprocess::InputTensor;

/// A loaded object detector.
///
/// Backends receive the letterboxed tensor produced by the preprocessor and
/// return boxes in detector-input coordinates. Inference is synchronous and
/// runs on the caller's thread.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class labels indexed by class id.
    fn class_names(&self) -> &[String];

    /// Run detection, keeping only detections at or above `confidence_threshold`.
    fn infer(&mut self, tensor: &InputTensor, confidence_threshold: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Label for `class_id`, falling back to `class{id}`.
    fn class_name(&self, class_id: u32) -> String {
        self.class_names()
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class{}", class_id))
    }
}
