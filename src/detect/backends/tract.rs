#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Default square model input, YOLO convention.
pub const DEFAULT_INPUT_SIZE: u32 = 640;

const NMS_IOU_THRESHOLD: f32 = 0.45;
const LETTERBOX_FILL: f32 = 114.0 / 255.0;

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Expects a single output shaped `[1, 4 + classes, anchors]` (or its
/// transpose) with rows `cx, cy, w, h, class scores...` in input pixels.
/// Loads a local model file; performs no network I/O.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    class_names: Vec<String>,
}

struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        if input_size == 0 {
            return Err(anyhow!("model input size must be > 0"));
        }
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            class_names,
        })
    }

    /// Letterbox-resize the frame into an NCHW float tensor.
    fn build_input(&self, frame: &Frame) -> Result<(Tensor, Letterbox)> {
        let fw = frame.width();
        let fh = frame.height();
        if fw == 0 || fh == 0 {
            return Err(anyhow!("cannot run detection on an empty frame"));
        }
        let target = self.input_size as f32;
        let scale = (target / fw as f32).min(target / fh as f32);
        let new_w = ((fw as f32 * scale).round() as u32).clamp(1, self.input_size);
        let new_h = ((fh as f32 * scale).round() as u32).clamp(1, self.input_size);
        let pad_x = (self.input_size - new_w) / 2;
        let pad_y = (self.input_size - new_h) / 2;

        let side = self.input_size as usize;
        let mut input = tract_ndarray::Array4::<f32>::from_elem((1, 3, side, side), LETTERBOX_FILL);
        let image = frame.image();
        for y in 0..new_h {
            let src_y = ((y as f32 / scale) as u32).min(fh - 1);
            for x in 0..new_w {
                let src_x = ((x as f32 / scale) as u32).min(fw - 1);
                let pixel = image.get_pixel(src_x, src_y);
                let ty = (pad_y + y) as usize;
                let tx = (pad_x + x) as usize;
                for channel in 0..3 {
                    input[[0, channel, ty, tx]] = pixel[channel] as f32 / 255.0;
                }
            }
        }

        Ok((
            input.into_tensor(),
            Letterbox {
                scale,
                pad_x: pad_x as f32,
                pad_y: pad_y as f32,
            },
        ))
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        letterbox: &Letterbox,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        // [1, features, anchors] is the usual export; accept the transpose too.
        let features_first = shape[1] < shape[2];
        let (anchors, features) = if features_first {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if features < 5 {
            return Err(anyhow!("YOLO output has {} features, need >= 5", features));
        }

        let at = |anchor: usize, feature: usize| -> f32 {
            if features_first {
                view[[0, feature, anchor]]
            } else {
                view[[0, anchor, feature]]
            }
        };

        let max_x = frame.width() as f32 - 1.0;
        let max_y = frame.height() as f32 - 1.0;
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let mut best_class = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for class in 0..features - 4 {
                let score = at(anchor, 4 + class);
                if score > best_score {
                    best_score = score;
                    best_class = class;
                }
            }
            if !best_score.is_finite() || best_score < confidence_threshold {
                continue;
            }
            let cx = at(anchor, 0);
            let cy = at(anchor, 1);
            let w = at(anchor, 2);
            let h = at(anchor, 3);
            let unmap_x = |v: f32| ((v - letterbox.pad_x) / letterbox.scale).clamp(0.0, max_x);
            let unmap_y = |v: f32| ((v - letterbox.pad_y) / letterbox.scale).clamp(0.0, max_y);
            candidates.push(Candidate {
                corners: [
                    unmap_x(cx - w / 2.0),
                    unmap_y(cy - h / 2.0),
                    unmap_x(cx + w / 2.0),
                    unmap_y(cy + h / 2.0),
                ],
                score: best_score,
                class: best_class,
            });
        }

        Ok(nms(candidates, NMS_IOU_THRESHOLD)
            .into_iter()
            .map(|c| {
                let label = self
                    .class_names
                    .get(c.class)
                    .cloned()
                    .unwrap_or_else(|| format!("class{}", c.class));
                let [x1, y1, x2, y2] = c.corners;
                Detection::new(BoundingBox::from_corners(x1, y1, x2, y2), c.score, label)
            })
            .collect())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let (input, letterbox) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, &letterbox, frame, confidence_threshold)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::<f32>::zeros((1, 3, side, side)).into_tensor();
        self.model
            .run(tvec!(input.into()))
            .context("ONNX warm-up failed")?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Candidate {
    corners: [f32; 4],
    score: f32,
    class: usize,
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if inter == 0.0 {
        return 0.0;
    }
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    inter / (area_a + area_b - inter)
}

/// Greedy per-class non-maximum suppression.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class == candidate.class && iou(&k.corners, &candidate.corners) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(corners: [f32; 4], score: f32, class: usize) -> Candidate {
        Candidate {
            corners,
            score,
            class,
        }
    }

    #[test]
    fn nms_keeps_highest_overlapping_box() {
        let kept = nms(
            vec![
                candidate([0.0, 0.0, 10.0, 10.0], 0.6, 0),
                candidate([1.0, 1.0, 10.0, 10.0], 0.9, 0),
                candidate([50.0, 50.0, 60.0, 60.0], 0.4, 0),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.4);
    }

    #[test]
    fn nms_does_not_suppress_across_classes() {
        let kept = nms(
            vec![
                candidate([0.0, 0.0, 10.0, 10.0], 0.6, 0),
                candidate([0.0, 0.0, 10.0, 10.0], 0.5, 1),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(iou(&[0.0, 0.0, 1.0, 1.0], &[2.0, 2.0, 3.0, 3.0]), 0.0);
        assert!((iou(&[0.0, 0.0, 2.0, 2.0], &[0.0, 0.0, 2.0, 2.0]) - 1.0).abs() < 1e-6);
    }
}
