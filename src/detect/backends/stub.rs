use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::preprocess::InputTensor;

/// Scripted backend for tests and demos. Never looks at the pixels.
///
/// Each call returns the next queued script entry, or the fixed detection list
/// once the script is exhausted. Results are filtered by the threshold like a
/// real backend would.
pub struct StubBackend {
    class_names: Vec<String>,
    fixed: Vec<Detection>,
    script: VecDeque<Vec<Detection>>,
    failures_left: u32,
    calls: u64,
}

impl StubBackend {
    pub fn new(class_names: Vec<String>) -> Self {
        Self {
            class_names,
            fixed: Vec::new(),
            script: VecDeque::new(),
            failures_left: 0,
            calls: 0,
        }
    }

    /// Return `detections` on every call.
    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.fixed = detections;
        self
    }

    /// Return these per-call results first, in order.
    pub fn with_script(mut self, script: Vec<Vec<Detection>>) -> Self {
        self.script = script.into();
        self
    }

    /// The next `count` calls fail.
    pub fn with_failures(mut self, count: u32) -> Self {
        self.failures_left = count;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn infer(&mut self, _tensor: &InputTensor, confidence_threshold: f32) -> Result<Vec<Detection>> {
        self.calls += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(anyhow!("stub inference failure"));
        }

        let detections = self.script.pop_front().unwrap_or_else(|| self.fixed.clone());
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .map(|mut d| {
                if d.class_name.is_empty() {
                    d.class_name = self.class_name(d.class_id);
                }
                d
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    fn bottle(confidence: f32) -> Detection {
        Detection::new(0, "", confidence, BoundingBox::new(0.0, 0.0, 10.0, 10.0))
    }

    #[test]
    fn script_runs_before_fixed_list() -> Result<()> {
        let mut backend = StubBackend::new(vec!["bottle".into()])
            .with_detections(vec![bottle(0.9)])
            .with_script(vec![vec![]]);
        let tensor = InputTensor::zeros(4, 4);
        assert!(backend.infer(&tensor, 0.5)?.is_empty());
        let second = backend.infer(&tensor, 0.5)?;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].class_name, "bottle");
        assert_eq!(backend.calls(), 2);
        Ok(())
    }

    #[test]
    fn threshold_and_failures_apply() -> Result<()> {
        let mut backend = StubBackend::default()
            .with_detections(vec![bottle(0.3)])
            .with_failures(1);
        let tensor = InputTensor::zeros(4, 4);
        assert!(backend.infer(&tensor, 0.5).is_err());
        assert!(backend.infer(&tensor, 0.5)?.is_empty());
        assert_eq!(backend.infer(&tensor, 0.2)?[0].class_name, "class0");
        Ok(())
    }
}
