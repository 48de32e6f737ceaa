//! Enrollment: probe images in, one aggregate reference per family out.

use crate::types::{DegenerateVector, Embedding, EmbeddingFamily, InvalidRollNumber, RollNumber};
use crate::vision::{encode_thumbnail, FamilyPipeline, VisionError};
use image::DynamicImage;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error(transparent)]
    InvalidRoll(#[from] InvalidRollNumber),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("no valid faces detected in the uploaded images (missing: {})", families(.missing))]
    NoFaceDetected { missing: Vec<EmbeddingFamily> },
    #[error(transparent)]
    Degenerate(#[from] DegenerateVector),
}

fn families(missing: &[EmbeddingFamily]) -> String {
    missing
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Identity fields supplied at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentProfile {
    pub roll: RollNumber,
    pub name: String,
    pub father_name: String,
    pub phone: String,
}

impl EnrollmentProfile {
    pub fn new(
        roll: &str,
        name: &str,
        father_name: &str,
        phone: &str,
    ) -> Result<Self, EnrollError> {
        let roll = RollNumber::new(roll)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollError::MissingField("name"));
        }
        Ok(Self {
            roll,
            name: name.to_string(),
            father_name: father_name.trim().to_string(),
            phone: phone.trim().to_string(),
        })
    }
}

/// What one probe image yielded: at most one vector per family.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeExtraction {
    pub embeddings: BTreeMap<EmbeddingFamily, Embedding>,
    pub thumbnail: Option<Vec<u8>>,
}

/// Runs every family pipeline over every probe image.
pub struct EnrollmentBuilder<'a> {
    pipelines: &'a mut [FamilyPipeline],
}

impl<'a> EnrollmentBuilder<'a> {
    pub fn new(pipelines: &'a mut [FamilyPipeline]) -> Self {
        Self { pipelines }
    }

    /// One extraction per probe, in probe order.
    ///
    /// A probe with no face in some family contributes nothing to it; every
    /// probe is still attempted. Only the first compact-family crop is
    /// encoded as a thumbnail.
    pub fn extract(
        &mut self,
        probes: &[DynamicImage],
    ) -> Result<Vec<ProbeExtraction>, VisionError> {
        let mut out = Vec::with_capacity(probes.len());
        let mut have_thumbnail = false;

        for (i, probe) in probes.iter().enumerate() {
            let mut extraction = ProbeExtraction::default();

            for pipeline in self.pipelines.iter_mut() {
                let family = pipeline.family();
                match pipeline.embed_first(probe)? {
                    Some(face) => {
                        if family == EmbeddingFamily::Compact && !have_thumbnail {
                            extraction.thumbnail = Some(encode_thumbnail(&face.crop)?);
                            have_thumbnail = true;
                        }
                        extraction.embeddings.insert(family, face.embedding);
                    }
                    None => {
                        tracing::warn!(
                            probe = i,
                            family = %family,
                            "no face detected in probe image"
                        );
                    }
                }
            }

            out.push(extraction);
        }

        Ok(out)
    }
}

/// Aggregate references ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSet {
    pub embeddings: BTreeMap<EmbeddingFamily, Embedding>,
    pub thumbnail: Option<Vec<u8>>,
    /// Number of probe vectors averaged into each family's reference.
    pub contributions: BTreeMap<EmbeddingFamily, usize>,
}

/// Element-wise mean per family over every probe that yielded a vector.
///
/// Every family in `required` must receive at least one vector. A mean with
/// zero norm is rejected as degenerate.
pub fn aggregate(
    extractions: &[ProbeExtraction],
    required: &[EmbeddingFamily],
) -> Result<ReferenceSet, EnrollError> {
    let mut embeddings = BTreeMap::new();
    let mut contributions = BTreeMap::new();
    let mut missing = Vec::new();

    for &family in required {
        let vectors: Vec<Embedding> = extractions
            .iter()
            .filter_map(|e| e.embeddings.get(&family).cloned())
            .collect();

        match Embedding::mean(&vectors)? {
            Some(mean) if mean.values.iter().all(|v| *v == 0.0) => {
                return Err(DegenerateVector::ZeroNorm.into());
            }
            Some(mean) => {
                contributions.insert(family, vectors.len());
                embeddings.insert(family, mean);
            }
            None => missing.push(family),
        }
    }

    if !missing.is_empty() {
        return Err(EnrollError::NoFaceDetected { missing });
    }

    let thumbnail = extractions.iter().find_map(|e| e.thumbnail.clone());

    Ok(ReferenceSet {
        embeddings,
        thumbnail,
        contributions,
    })
}
