use rollcall_core::vision::decode_image;
use rollcall_core::{
    Embedding, EmbeddingFamily, EnrollmentBuilder, FamilyPipeline, ProbeExtraction, VisionError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error("no {0} pipeline loaded")]
    MissingPipeline(EmbeddingFamily),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    /// Every face in the image, general family.
    Identify {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<Embedding>, EngineError>>,
    },
    EmbedFirst {
        family: EmbeddingFamily,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Embedding>, EngineError>>,
    },
    Extract {
        images: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<Vec<ProbeExtraction>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// General-family embeddings for every detected face, in detection order.
    pub async fn identify(&self, image: Vec<u8>) -> Result<Vec<Embedding>, EngineError> {
        self.request(|reply| EngineRequest::Identify { image, reply })
            .await
    }

    /// Embedding of the first face `family`'s detector finds, if any.
    pub async fn embed_first(
        &self,
        family: EmbeddingFamily,
        image: Vec<u8>,
    ) -> Result<Option<Embedding>, EngineError> {
        self.request(|reply| EngineRequest::EmbedFirst {
            family,
            image,
            reply,
        })
        .await
    }

    /// Per-probe extractions across every family, for enrollment.
    pub async fn extract(&self, images: Vec<Vec<u8>>) -> Result<Vec<ProbeExtraction>, EngineError> {
        self.request(|reply| EngineRequest::Extract { images, reply })
            .await
    }
}

/// Spawn the engine on a dedicated OS thread that owns every model session.
pub fn spawn_engine(mut pipelines: Vec<FamilyPipeline>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(pipelines = pipelines.len(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Identify { image, reply } => {
                        let _ = reply.send(run_identify(&mut pipelines, &image));
                    }
                    EngineRequest::EmbedFirst {
                        family,
                        image,
                        reply,
                    } => {
                        let _ = reply.send(run_embed_first(&mut pipelines, family, &image));
                    }
                    EngineRequest::Extract { images, reply } => {
                        let _ = reply.send(run_extract(&mut pipelines, &images));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn pipeline_for(
    pipelines: &mut [FamilyPipeline],
    family: EmbeddingFamily,
) -> Result<&mut FamilyPipeline, EngineError> {
    pipelines
        .iter_mut()
        .find(|p| p.family() == family)
        .ok_or(EngineError::MissingPipeline(family))
}

fn run_identify(
    pipelines: &mut [FamilyPipeline],
    image: &[u8],
) -> Result<Vec<Embedding>, EngineError> {
    let image = decode_image(image)?;
    let faces = pipeline_for(pipelines, EmbeddingFamily::General)?.embed_faces(&image)?;
    tracing::debug!(faces = faces.len(), "identify: faces embedded");
    Ok(faces.into_iter().map(|f| f.embedding).collect())
}

fn run_embed_first(
    pipelines: &mut [FamilyPipeline],
    family: EmbeddingFamily,
    image: &[u8],
) -> Result<Option<Embedding>, EngineError> {
    let image = decode_image(image)?;
    let face = pipeline_for(pipelines, family)?.embed_first(&image)?;
    Ok(face.map(|f| f.embedding))
}

fn run_extract(
    pipelines: &mut [FamilyPipeline],
    images: &[Vec<u8>],
) -> Result<Vec<ProbeExtraction>, EngineError> {
    let probes = images
        .iter()
        .map(|bytes| decode_image(bytes))
        .collect::<Result<Vec<_>, _>>()?;
    let extractions = EnrollmentBuilder::new(pipelines).extract(&probes)?;
    tracing::debug!(probes = extractions.len(), "enroll: probes extracted");
    Ok(extractions)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Model-free pipelines for daemon tests.

    use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
    use rollcall_core::vision::CollaboratorError;
    use rollcall_core::{
        BoundingBox, Embedding, EmbeddingFamily, FaceDetector, FaceEmbedder, FamilyPipeline,
    };
    use std::io::Cursor;

    /// Reports the left and right halves of a lit image as two faces.
    struct HalvesDetector;

    impl FaceDetector for HalvesDetector {
        fn detect(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, CollaboratorError> {
            if !image.pixels().any(|(_, _, p)| p.0[..3].iter().any(|c| *c > 0)) {
                return Ok(Vec::new());
            }
            let (w, h) = (image.width() as f32, image.height() as f32);
            Ok(vec![
                BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: w / 2.0,
                    height: h,
                    confidence: 0.9,
                },
                BoundingBox {
                    x: w / 2.0,
                    y: 0.0,
                    width: w / 2.0,
                    height: h,
                    confidence: 0.8,
                },
            ])
        }
    }

    /// Mean color of the crop.
    struct ColorEmbedder;

    impl FaceEmbedder for ColorEmbedder {
        fn input_size(&self) -> u32 {
            4
        }

        fn embed(&mut self, face: &DynamicImage) -> Result<Embedding, CollaboratorError> {
            let rgb = face.to_rgb8();
            let n = (rgb.width() * rgb.height()) as f32;
            let mut sums = [0.0f32; 3];
            for p in rgb.pixels() {
                for (s, c) in sums.iter_mut().zip(p.0.iter()) {
                    *s += *c as f32 / 255.0;
                }
            }
            Ok(Embedding::new(sums.iter().map(|s| s / n).collect()))
        }
    }

    pub fn pipelines() -> Vec<FamilyPipeline> {
        EmbeddingFamily::ALL
            .iter()
            .map(|&family| {
                FamilyPipeline::new(family, Box::new(HalvesDetector), Box::new(ColorEmbedder))
            })
            .collect()
    }

    /// PNG whose left half is `left` and right half is `right`.
    pub fn png(left: [u8; 3], right: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_fn(16, 8, |x, _| if x < 8 { Rgb(left) } else { Rgb(right) });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }
}
