//! Face embedding extraction via ONNX Runtime.
//!
//! One [`OnnxEmbedder`] per embedding family. The [`EmbedderProfile`] captures
//! everything that differs between families: crop size, color mode, tensor
//! layout, normalization, and whether the output is L2-normalized.

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::vision::{CollaboratorError, FaceEmbedder};
use rollcall_core::Embedding;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb,
    Luma,
}

impl ColorMode {
    fn channels(&self) -> usize {
        match self {
            ColorMode::Rgb => 3,
            ColorMode::Luma => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nhwc,
    Nchw,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    /// `(pixel - mean) / std` with fixed constants.
    Fixed { mean: f32, std: f32 },
    /// Per-image standardization; std is floored at `1 / sqrt(n)`.
    PerImage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedderProfile {
    pub input_size: u32,
    pub color: ColorMode,
    pub layout: TensorLayout,
    pub normalization: Normalization,
    pub l2_normalize: bool,
    pub model_version: &'static str,
}

impl EmbedderProfile {
    /// FaceNet-style general family: 160x160 RGB, prewhitened, unit-length output.
    pub fn general() -> Self {
        Self {
            input_size: 160,
            color: ColorMode::Rgb,
            layout: TensorLayout::Nhwc,
            normalization: Normalization::PerImage,
            l2_normalize: true,
            model_version: "facenet",
        }
    }

    /// Small learned CNN: 160x160 grayscale scaled to [0, 1], raw output.
    pub fn compact() -> Self {
        Self {
            input_size: 160,
            color: ColorMode::Luma,
            layout: TensorLayout::Nhwc,
            normalization: Normalization::Fixed {
                mean: 0.0,
                std: 255.0,
            },
            l2_normalize: false,
            model_version: "compact-cnn",
        }
    }

    fn shape(&self) -> (usize, usize, usize, usize) {
        let (s, c) = (self.input_size as usize, self.color.channels());
        match self.layout {
            TensorLayout::Nhwc => (1, s, s, c),
            TensorLayout::Nchw => (1, c, s, s),
        }
    }

    /// Turn a face crop into the model's input tensor.
    pub fn preprocess(&self, face: &DynamicImage) -> Array4<f32> {
        let size = self.input_size;
        let face = if face.width() == size && face.height() == size {
            face.clone()
        } else {
            face.resize_exact(size, size, FilterType::Triangle)
        };

        let pixels: Vec<f32> = match self.color {
            ColorMode::Rgb => face.to_rgb8().into_raw().into_iter().map(f32::from).collect(),
            ColorMode::Luma => face.to_luma8().into_raw().into_iter().map(f32::from).collect(),
        };

        let (mean, std) = match self.normalization {
            Normalization::Fixed { mean, std } => (mean, std),
            Normalization::PerImage => {
                let n = pixels.len() as f64;
                let mean = pixels.iter().map(|p| *p as f64).sum::<f64>() / n;
                let var = pixels
                    .iter()
                    .map(|p| (*p as f64 - mean).powi(2))
                    .sum::<f64>()
                    / n;
                (mean as f32, var.sqrt().max(1.0 / n.sqrt()) as f32)
            }
        };

        let channels = self.color.channels();
        let s = size as usize;
        let mut tensor = Array4::<f32>::zeros(self.shape());

        for (i, p) in pixels.iter().enumerate() {
            let (pixel, c) = (i / channels, i % channels);
            let (y, x) = (pixel / s, pixel % s);
            let value = (p - mean) / std;
            match self.layout {
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
            }
        }

        tensor
    }

    fn finish(&self, raw: Vec<f32>) -> Embedding {
        let values = if self.l2_normalize {
            let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                raw.iter().map(|x| x / norm).collect()
            } else {
                raw
            }
        } else {
            raw
        };

        Embedding {
            values,
            model_version: Some(self.model_version.to_string()),
        }
    }
}

pub struct OnnxEmbedder {
    session: Session,
    profile: EmbedderProfile,
}

impl OnnxEmbedder {
    pub fn load(model_path: &Path, profile: EmbedderProfile) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            version = profile.model_version,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session, profile })
    }

    pub fn profile(&self) -> &EmbedderProfile {
        &self.profile
    }

    pub fn extract(&mut self, face: &DynamicImage) -> Result<Embedding, EmbedderError> {
        let input = self.profile.preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(EmbedderError::InferenceFailed("empty embedding".into()));
        }

        Ok(self.profile.finish(raw.to_vec()))
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn input_size(&self) -> u32 {
        self.profile.input_size
    }

    fn embed(&mut self, face: &DynamicImage) -> Result<Embedding, CollaboratorError> {
        Ok(self.extract(face)?)
    }
}
