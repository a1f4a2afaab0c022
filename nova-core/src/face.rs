//! Face detection with the SeetaFace cascade from `rustface`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::GrayImage;
use rustface::{Detector, ImageData};
use tracing::debug;

use crate::capability::{FaceBox, FaceDetector};

const MIN_FACE_SIZE: u32 = 32;
const SCORE_THRESHOLD: f64 = 2.0;
const PYRAMID_SCALE: f32 = 0.8;
const SLIDE_STEP: u32 = 4;

pub struct SeetaFaceDetector {
    model_path: String,
}

impl SeetaFaceDetector {
    /// Validates the model file by building one detector from it.
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = model_path.as_ref().to_path_buf();
        let model_path = path
            .to_str()
            .with_context(|| format!("face model path is not UTF-8: {}", path.display()))?
            .to_string();
        let detector = Self { model_path };
        detector.build()?;
        Ok(detector)
    }

    // Detectors are not `Send`, so one is built per call.
    fn build(&self) -> Result<Box<dyn Detector>> {
        let mut detector = rustface::create_detector(&self.model_path)
            .map_err(|e| anyhow!("failed to load face model {}: {e}", self.model_path))?;
        detector.set_min_face_size(MIN_FACE_SIZE);
        detector.set_score_thresh(SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(PYRAMID_SCALE);
        detector.set_slide_window_step(SLIDE_STEP, SLIDE_STEP);
        Ok(detector)
    }
}

impl FaceDetector for SeetaFaceDetector {
    fn detect_faces(&self, image: &GrayImage) -> Result<Vec<FaceBox>> {
        let mut detector = self.build()?;
        let (width, height) = image.dimensions();
        let faces = detector.detect(&ImageData::new(image.as_raw(), width, height));
        debug!(faces = faces.len(), "face detection done");
        Ok(faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                let x = bbox.x().max(0) as u32;
                let y = bbox.y().max(0) as u32;
                FaceBox {
                    x,
                    y,
                    width: bbox.width().min(width.saturating_sub(x)),
                    height: bbox.height().min(height.saturating_sub(y)),
                }
            })
            .filter(|face| face.width > 0 && face.height > 0)
            .collect())
    }
}
