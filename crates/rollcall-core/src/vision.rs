//! Detection and embedding collaborators.
//!
//! Models are opaque: a [`FaceDetector`] turns an image into ordered
//! bounding boxes, a [`FaceEmbedder`] turns a square face crop into a
//! vector. A [`FamilyPipeline`] pairs one of each for an embedding family.

use crate::types::{BoundingBox, Embedding, EmbeddingFamily};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use thiserror::Error;

/// Error type returned by model backends.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("empty image")]
    EmptyImage,
    #[error("invalid image: {0}")]
    InvalidImage(#[source] image::ImageError),
    #[error("{family} detector failed: {source}")]
    Detector {
        family: EmbeddingFamily,
        #[source]
        source: CollaboratorError,
    },
    #[error("{family} embedder failed: {source}")]
    Embedder {
        family: EmbeddingFamily,
        #[source]
        source: CollaboratorError,
    },
    #[error("thumbnail encoding failed: {0}")]
    Thumbnail(#[source] image::ImageError),
}

impl VisionError {
    /// Whether the caller sent something unusable, as opposed to a model failure.
    pub fn is_input_error(&self) -> bool {
        matches!(self, VisionError::EmptyImage | VisionError::InvalidImage(_))
    }
}

pub trait FaceDetector: Send {
    /// Faces in a deterministic order. Empty when none are found.
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, CollaboratorError>;
}

pub trait FaceEmbedder: Send {
    /// Edge length of the square crop this embedder consumes.
    fn input_size(&self) -> u32;

    fn embed(&mut self, face: &DynamicImage) -> Result<Embedding, CollaboratorError>;
}

/// Decode an uploaded image (any format the `image` crate can sniff).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, VisionError> {
    if bytes.is_empty() {
        return Err(VisionError::EmptyImage);
    }
    image::load_from_memory(bytes).map_err(VisionError::InvalidImage)
}

/// Crop `face` out of `image`, clamped to the image bounds, resized to `size`×`size`.
///
/// Returns `None` when the clamped region is empty.
pub fn crop_face(image: &DynamicImage, face: &BoundingBox, size: u32) -> Option<DynamicImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x0 = face.x.clamp(0.0, w).floor() as u32;
    let y0 = face.y.clamp(0.0, h).floor() as u32;
    let x1 = (face.x + face.width).clamp(0.0, w).ceil() as u32;
    let y1 = (face.y + face.height).clamp(0.0, h).ceil() as u32;

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(
        image
            .crop_imm(x0, y0, x1 - x0, y1 - y0)
            .resize_exact(size, size, FilterType::Triangle),
    )
}

/// Grayscale JPEG of a face crop.
pub fn encode_thumbnail(face: &DynamicImage) -> Result<Vec<u8>, VisionError> {
    let mut buf = Vec::new();
    face.grayscale()
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
        .map_err(VisionError::Thumbnail)?;
    Ok(buf)
}

/// A detected face together with its embedding and the crop that produced it.
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    pub crop: DynamicImage,
}

/// Detector + embedder for one embedding family.
pub struct FamilyPipeline {
    family: EmbeddingFamily,
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
}

impl FamilyPipeline {
    pub fn new(
        family: EmbeddingFamily,
        detector: Box<dyn FaceDetector>,
        embedder: Box<dyn FaceEmbedder>,
    ) -> Self {
        Self {
            family,
            detector,
            embedder,
        }
    }

    pub fn family(&self) -> EmbeddingFamily {
        self.family
    }

    pub fn detect(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, VisionError> {
        self.detector
            .detect(image)
            .map_err(|source| VisionError::Detector {
                family: self.family,
                source,
            })
    }

    fn embed_face(
        &mut self,
        image: &DynamicImage,
        bbox: BoundingBox,
    ) -> Result<Option<FaceEmbedding>, VisionError> {
        let Some(crop) = crop_face(image, &bbox, self.embedder.input_size()) else {
            tracing::warn!(family = %self.family, ?bbox, "detected face lies outside the image");
            return Ok(None);
        };

        let embedding = self
            .embedder
            .embed(&crop)
            .map_err(|source| VisionError::Embedder {
                family: self.family,
                source,
            })?;

        Ok(Some(FaceEmbedding {
            bbox,
            embedding,
            crop,
        }))
    }

    /// One embedding per detected face, in detection order. A box whose
    /// crop is empty once clamped to the image is logged and skipped, so the
    /// result can be shorter than the detector's output.
    pub fn embed_faces(&mut self, image: &DynamicImage) -> Result<Vec<FaceEmbedding>, VisionError> {
        let faces = self.detect(image)?;
        let mut out = Vec::with_capacity(faces.len());
        for bbox in faces {
            if let Some(face) = self.embed_face(image, bbox)? {
                out.push(face);
            }
        }
        Ok(out)
    }

    /// Embedding of the first detected face only. `None` when nothing is
    /// detected or the first box crops to nothing; later boxes are not tried.
    pub fn embed_first(
        &mut self,
        image: &DynamicImage,
    ) -> Result<Option<FaceEmbedding>, VisionError> {
        match self.detect(image)?.into_iter().next() {
            Some(bbox) => self.embed_face(image, bbox),
            None => Ok(None),
        }
    }
}
