use anyhow::{anyhow, Result};

use crate::detect::registry::SharedBackend;
use crate::detect::result::Detection;
use crate::error::PipelineError;
use crate::frame::Frame;

/// Default minimum confidence passed to the model.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;
/// Default class forwarded downstream.
pub const DEFAULT_TARGET_CLASS: &str = "pothole";

/// Boundary between the pipeline and the model.
///
/// Passes the confidence threshold to the backend and forwards only the
/// detections whose label equals `target_class`. Backend failures surface
/// as `PipelineError::DetectorFailure`; nothing is retried.
#[derive(Clone)]
pub struct DetectorAdapter {
    backend: SharedBackend,
    confidence_threshold: f32,
    target_class: String,
}

impl DetectorAdapter {
    pub fn new(
        backend: SharedBackend,
        confidence_threshold: f32,
        target_class: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            confidence_threshold,
            target_class: target_class.into(),
        }
    }

    pub fn target_class(&self) -> &str {
        &self.target_class
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Identifier of the wrapped backend, e.g. "stub" or "tract".
    pub fn backend_name(&self) -> &'static str {
        match self.backend.lock() {
            Ok(guard) => guard.name(),
            Err(poisoned) => poisoned.into_inner().name(),
        }
    }

    pub fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let detections = {
            let mut guard = self
                .backend
                .lock()
                .map_err(|_| anyhow!("detector backend lock poisoned"))?;
            guard
                .detect(frame, self.confidence_threshold)
                .map_err(|err| PipelineError::DetectorFailure(format!("{:#}", err)))?
        };
        Ok(detections
            .into_iter()
            .filter(|d| d.class_label == self.target_class)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backend::DetectorBackend;
    use crate::detect::backends::StubBackend;
    use crate::detect::result::BoundingBox;
    use std::sync::{Arc, Mutex};

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _frame: &Frame, _threshold: f32) -> Result<Vec<Detection>> {
            Err(anyhow!("model exploded"))
        }
    }

    fn frame() -> Frame {
        Frame::from_rgb(vec![0u8; 12], 2, 2, 1).unwrap()
    }

    #[test]
    fn adapter_discards_other_classes() -> Result<()> {
        let bbox = BoundingBox::new(0, 0, 1, 1);
        let backend = StubBackend::scripted(vec![vec![
            Detection::new(bbox, 0.9, "pothole"),
            Detection::new(bbox, 0.9, "crack"),
            Detection::new(bbox, 0.8, "pothole"),
        ]]);
        let adapter = DetectorAdapter::new(
            Arc::new(Mutex::new(backend)),
            DEFAULT_CONFIDENCE_THRESHOLD,
            DEFAULT_TARGET_CLASS,
        );

        let detections = adapter.detect(&frame())?;
        assert_eq!(detections.len(), 2);
        assert!(detections.iter().all(|d| d.class_label == "pothole"));
        Ok(())
    }

    #[test]
    fn backend_name_reports_the_wrapped_backend() {
        let stub = DetectorAdapter::new(Arc::new(Mutex::new(StubBackend::new())), 0.3, "pothole");
        assert_eq!(stub.backend_name(), "stub");
        let failing = DetectorAdapter::new(Arc::new(Mutex::new(FailingBackend)), 0.3, "pothole");
        assert_eq!(failing.backend_name(), "failing");
    }

    #[test]
    fn backend_error_becomes_detector_failure() {
        let adapter = DetectorAdapter::new(Arc::new(Mutex::new(FailingBackend)), 0.3, "pothole");
        let err = adapter.detect(&frame()).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::DetectorFailure(msg)) => assert!(msg.contains("model exploded")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
