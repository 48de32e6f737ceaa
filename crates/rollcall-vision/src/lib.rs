//! rollcall-vision: ONNX Runtime face detection and embedding.
//!
//! Provides the model-backed [`FaceDetector`](rollcall_core::FaceDetector)
//! and [`FaceEmbedder`](rollcall_core::FaceEmbedder) for both embedding
//! families, plus [`load_pipelines`] to wire them from a model directory.

pub mod detector;
pub mod embedder;

pub use detector::{DetectorError, DetectorOptions, OnnxFaceDetector};
pub use embedder::{EmbedderError, EmbedderProfile, OnnxEmbedder};

use rollcall_core::{EmbeddingFamily, FamilyPipeline};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "face_detector.onnx";
pub const GENERAL_MODEL: &str = "facenet.onnx";
pub const COMPACT_MODEL: &str = "compact_cnn.onnx";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{family} detector: {source}")]
    Detector {
        family: EmbeddingFamily,
        #[source]
        source: DetectorError,
    },
    #[error("{family} embedder: {source}")]
    Embedder {
        family: EmbeddingFamily,
        #[source]
        source: EmbedderError,
    },
}

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub model_dir: PathBuf,
    pub detector_confidence: f32,
    /// Minimum face edge for the compact family, in source pixels.
    pub compact_min_face: f32,
}

impl VisionConfig {
    pub fn model_path(&self, file: &str) -> PathBuf {
        self.model_dir.join(file)
    }

    fn detector_options(&self, family: EmbeddingFamily) -> DetectorOptions {
        DetectorOptions {
            confidence: self.detector_confidence,
            min_face: match family {
                EmbeddingFamily::General => 0.0,
                EmbeddingFamily::Compact => self.compact_min_face,
            },
            ..DetectorOptions::default()
        }
    }
}

fn embedder_for(family: EmbeddingFamily) -> (&'static str, EmbedderProfile) {
    match family {
        EmbeddingFamily::General => (GENERAL_MODEL, EmbedderProfile::general()),
        EmbeddingFamily::Compact => (COMPACT_MODEL, EmbedderProfile::compact()),
    }
}

/// Missing model files, by path.
pub fn missing_models(model_dir: &Path) -> Vec<PathBuf> {
    [DETECTOR_MODEL, GENERAL_MODEL, COMPACT_MODEL]
        .iter()
        .map(|f| model_dir.join(f))
        .filter(|p| !p.exists())
        .collect()
}

/// One pipeline per family, in [`EmbeddingFamily::ALL`] order.
///
/// Each family gets its own detector session since their size filters differ.
pub fn load_pipelines(config: &VisionConfig) -> Result<Vec<FamilyPipeline>, LoadError> {
    let detector_path = config.model_path(DETECTOR_MODEL);

    EmbeddingFamily::ALL
        .iter()
        .map(|&family| {
            let detector = OnnxFaceDetector::load(&detector_path, config.detector_options(family))
                .map_err(|source| LoadError::Detector { family, source })?;

            let (file, profile) = embedder_for(family);
            let embedder = OnnxEmbedder::load(&config.model_path(file), profile)
                .map_err(|source| LoadError::Embedder { family, source })?;

            Ok(FamilyPipeline::new(family, Box::new(detector), Box::new(embedder)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VisionConfig {
        VisionConfig {
            model_dir: PathBuf::from("/nonexistent/rollcall-models"),
            detector_confidence: 0.6,
            compact_min_face: 100.0,
        }
    }

    #[test]
    fn test_detector_options_per_family() {
        let c = config();
        assert_eq!(c.detector_options(EmbeddingFamily::General).min_face, 0.0);
        let compact = c.detector_options(EmbeddingFamily::Compact);
        assert_eq!(compact.min_face, 100.0);
        assert_eq!(compact.confidence, 0.6);
    }

    #[test]
    fn test_missing_models_reported() {
        assert_eq!(missing_models(&config().model_dir).len(), 3);
    }

    #[test]
    fn test_load_pipelines_without_models() {
        match load_pipelines(&config()) {
            Err(LoadError::Detector { family, source: DetectorError::ModelNotFound(path) }) => {
                assert_eq!(family, EmbeddingFamily::General);
                assert!(path.ends_with(DETECTOR_MODEL));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("loaded models from a nonexistent directory"),
        }
    }
}
