//! Single-shot face detector via ONNX Runtime.
//!
//! Expects an UltraFace-style export: one NCHW RGB input and two outputs,
//! class scores `[1, N, 2]` and normalized corner boxes `[1, N, 4]`. Anchor
//! decoding happens inside the graph, so post-processing is thresholding,
//! size filtering and NMS.

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::vision::{CollaboratorError, FaceDetector};
use rollcall_core::BoundingBox;
use std::path::Path;
use thiserror::Error;

const ULTRAFACE_INPUT_WIDTH: u32 = 320;
const ULTRAFACE_INPUT_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const DEFAULT_CONFIDENCE: f32 = 0.7;
const DEFAULT_NMS_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Post-processing knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorOptions {
    /// Faces scoring at or below this are dropped.
    pub confidence: f32,
    pub nms_threshold: f32,
    /// Minimum box edge in source pixels. Smaller faces are dropped.
    pub min_face: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            min_face: 0.0,
        }
    }
}

pub struct OnnxFaceDetector {
    session: Session,
    options: DetectorOptions,
    /// (scores, boxes) output positions.
    outputs: (usize, usize),
}

impl OnnxFaceDetector {
    pub fn load(model_path: &Path, options: DetectorOptions) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "detector requires 2 outputs (scores, boxes), got {}",
                names.len()
            )));
        }
        let outputs = discover_output_indices(&names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            ?options,
            "loaded face detector"
        );

        Ok(Self {
            session,
            options,
            outputs,
        })
    }

    /// Faces in `image`, highest confidence first.
    pub fn run(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let input = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (score_idx, box_idx) = self.outputs;
        let (_, scores) = outputs[score_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[box_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode(
            scores,
            boxes,
            image.width() as f32,
            image.height() as f32,
            &self.options,
        );
        let faces = nms(candidates, self.options.nms_threshold);

        tracing::debug!(faces = faces.len(), "detection complete");
        Ok(faces)
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, CollaboratorError> {
        Ok(self.run(image)?)
    }
}

/// Scores and boxes by output name when the export names them, else positional.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let scores = names.iter().position(|n| n == "scores");
    let boxes = names.iter().position(|n| n == "boxes");
    match (scores, boxes) {
        (Some(s), Some(b)) => (s, b),
        _ => {
            tracing::info!(
                ?names,
                "detector output names not recognized, using [0]=scores, [1]=boxes"
            );
            (0, 1)
        }
    }
}

/// Stretch to the network input and normalize into an NCHW tensor.
fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let (w, h) = (ULTRAFACE_INPUT_WIDTH, ULTRAFACE_INPUT_HEIGHT);
    let rgb = image.resize_exact(w, h, FilterType::Triangle).to_rgb8();

    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel.0[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
        }
    }
    tensor
}

/// Threshold and size-filter raw priors, mapping boxes back to source pixels.
fn decode(
    scores: &[f32],
    boxes: &[f32],
    image_width: f32,
    image_height: f32,
    options: &DetectorOptions,
) -> Vec<BoundingBox> {
    let priors = (scores.len() / 2).min(boxes.len() / 4);
    let mut detections = Vec::new();

    for i in 0..priors {
        let score = scores[i * 2 + 1];
        if score <= options.confidence {
            continue;
        }

        let x1 = boxes[i * 4].clamp(0.0, 1.0) * image_width;
        let y1 = boxes[i * 4 + 1].clamp(0.0, 1.0) * image_height;
        let x2 = boxes[i * 4 + 2].clamp(0.0, 1.0) * image_width;
        let y2 = boxes[i * 4 + 3].clamp(0.0, 1.0) * image_height;

        let (width, height) = (x2 - x1, y2 - y1);
        if width <= 0.0 || height <= 0.0 || width < options.min_face || height < options.min_face {
            continue;
        }

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width,
            height,
            confidence: score,
        });
    }

    detections
}

/// Non-maximum suppression. Output is sorted by confidence, ties keep prior order.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
