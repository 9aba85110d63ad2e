use std::collections::VecDeque;

use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend for tests and camera-less demos.
///
/// Replays a queue of per-frame detection lists. Once the script is exhausted
/// every further frame yields no detections, unless the script was built with
/// `looping()`, in which case it starts over.
pub struct StubBackend {
    script: VecDeque<Vec<Detection>>,
    original: Vec<Vec<Detection>>,
    looping: bool,
}

impl StubBackend {
    /// A backend that never detects anything.
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(frames: Vec<Vec<Detection>>) -> Self {
        Self {
            script: frames.iter().cloned().collect(),
            original: frames,
            looping: false,
        }
    }

    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        if self.script.is_empty() && self.looping {
            self.script = self.original.iter().cloned().collect();
        }
        let detections = self.script.pop_front().unwrap_or_default();
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    fn frame() -> Frame {
        Frame::from_rgb(vec![0u8; 12], 2, 2, 1).unwrap()
    }

    fn pothole(confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(0, 0, 1, 1), confidence, "pothole")
    }

    #[test]
    fn stub_backend_replays_script_then_goes_quiet() {
        let mut backend = StubBackend::scripted(vec![vec![pothole(0.9)], vec![]]);

        assert_eq!(backend.detect(&frame(), 0.3).unwrap().len(), 1);
        assert!(backend.detect(&frame(), 0.3).unwrap().is_empty());
        assert!(backend.detect(&frame(), 0.3).unwrap().is_empty());
    }

    #[test]
    fn stub_backend_applies_confidence_threshold() {
        let mut backend = StubBackend::scripted(vec![vec![pothole(0.2), pothole(0.5)]]);
        let detections = backend.detect(&frame(), 0.3).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 0.5);
    }

    #[test]
    fn looping_stub_restarts_script() {
        let mut backend = StubBackend::scripted(vec![vec![pothole(0.9)]]).looping();
        for _ in 0..3 {
            assert_eq!(backend.detect(&frame(), 0.3).unwrap().len(), 1);
        }
    }
}
