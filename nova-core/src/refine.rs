//! ADetailer-style face refinement: detect faces, mask them with ellipses,
//! and repaint only the masked area with a partial-strength inpainting pass.

use std::sync::Arc;

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, Luma};
use tracing::debug;

use crate::capability::{FaceBox, FaceDetector, InpaintParams, Inpainter};
use crate::NoiseSource;

/// Bounding boxes grow by this fraction of their larger side.
pub const FACE_PADDING: f64 = 0.35;
pub const MIN_FACE_PADDING: u32 = 4;
/// Partial repaint: keeps the overall structure of the face.
pub const REFINE_STRENGTH: f64 = 0.45;
pub const REFINE_MAX_STEPS: usize = 20;

/// Union of the ellipses inscribed in each padded face box, 255 inside.
pub fn face_mask(width: u32, height: u32, faces: &[FaceBox]) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for face in faces {
        let pad = ((FACE_PADDING * face.width.max(face.height) as f64) as u32).max(MIN_FACE_PADDING);
        let x1 = face.x.saturating_sub(pad);
        let y1 = face.y.saturating_sub(pad);
        let x2 = (face.x + face.width + pad).min(width);
        let y2 = (face.y + face.height + pad).min(height);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let (cx, cy) = (((x1 + x2) / 2) as f64, ((y1 + y2) / 2) as f64);
        let (rx, ry) = (((x2 - x1) / 2) as f64, ((y2 - y1) / 2) as f64);
        for y in y1..y2 {
            for x in x1..x2 {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                if dx * dx / (rx * rx + 1.0) + dy * dy / (ry * ry + 1.0) <= 1.0 {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
    }
    mask
}

/// Face detector plus the inpainting pipeline that repaints what it finds.
#[derive(Clone)]
pub struct FaceRefiner {
    detector: Arc<dyn FaceDetector>,
    inpainter: Arc<dyn Inpainter>,
}

impl FaceRefiner {
    pub fn new(detector: Arc<dyn FaceDetector>, inpainter: Arc<dyn Inpainter>) -> Self {
        Self {
            detector,
            inpainter,
        }
    }

    /// Refines the faces of one image.
    ///
    /// Without detections the input comes back untouched. Detector and
    /// inpainting errors are returned, never mistaken for "no faces".
    pub fn refine(
        &self,
        image: DynamicImage,
        prompt: &str,
        negative_prompt: &str,
        steps: usize,
        guidance_scale: f64,
        seed: Option<i64>,
    ) -> Result<DynamicImage> {
        let gray = image.to_luma8();
        let faces = self
            .detector
            .detect_faces(&gray)
            .context("face detection failed")?;
        if faces.is_empty() {
            debug!("no faces detected, skipping refinement");
            return Ok(image);
        }

        let mask = face_mask(image.width(), image.height(), &faces);
        if mask.pixels().all(|p| p.0[0] == 0) {
            return Ok(image);
        }
        debug!(faces = faces.len(), "refining faces");

        let params = InpaintParams {
            prompt,
            negative_prompt,
            steps: steps.min(REFINE_MAX_STEPS),
            guidance_scale,
            strength: REFINE_STRENGTH,
        };
        // Offset so the repaint is reproducible without replaying the base noise.
        let mut noise = NoiseSource::for_seed(seed.map(|s| s.wrapping_add(1)));
        self.inpainter
            .inpaint(&image, &mask, &params, &mut noise)
            .context("face inpainting failed")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::bail;
    use image::{Rgb, RgbImage};

    use super::*;

    struct FixedDetector(Vec<FaceBox>);

    impl FaceDetector for FixedDetector {
        fn detect_faces(&self, _image: &GrayImage) -> Result<Vec<FaceBox>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    impl FaceDetector for BrokenDetector {
        fn detect_faces(&self, _image: &GrayImage) -> Result<Vec<FaceBox>> {
            bail!("cascade not loaded")
        }
    }

    /// Paints masked pixels white and records what it was asked to do.
    #[derive(Default)]
    struct RecordingInpainter {
        calls: Mutex<Vec<(usize, f64, Option<u64>)>>,
    }

    impl Inpainter for RecordingInpainter {
        fn inpaint(
            &self,
            image: &DynamicImage,
            mask: &GrayImage,
            params: &InpaintParams<'_>,
            noise: &mut NoiseSource,
        ) -> Result<DynamicImage> {
            self.calls
                .lock()
                .unwrap()
                .push((params.steps, params.strength, noise.seed()));
            let mut out = image.to_rgb8();
            for (x, y, m) in mask.enumerate_pixels() {
                if m.0[0] > 0 {
                    out.put_pixel(x, y, Rgb([255, 255, 255]));
                }
            }
            Ok(DynamicImage::ImageRgb8(out))
        }
    }

    fn face() -> FaceBox {
        FaceBox {
            x: 40,
            y: 40,
            width: 20,
            height: 20,
        }
    }

    fn image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(128, 96, Rgb([10, 20, 30])))
    }

    #[test]
    fn mask_covers_padded_ellipse() {
        let mask = face_mask(128, 96, &[face()]);
        // pad = 7, box spans 33..67
        assert_eq!(mask.get_pixel(50, 50).0[0], 255);
        assert_eq!(mask.get_pixel(34, 50).0[0], 255);
        assert_eq!(mask.get_pixel(50, 34).0[0], 255);
        // corners of the box are outside the ellipse
        assert_eq!(mask.get_pixel(34, 34).0[0], 0);
        assert_eq!(mask.get_pixel(20, 50).0[0], 0);
    }

    #[test]
    fn small_faces_get_minimum_padding() {
        let tiny = FaceBox {
            x: 10,
            y: 10,
            width: 2,
            height: 2,
        };
        let mask = face_mask(64, 64, &[tiny]);
        assert_eq!(mask.get_pixel(7, 11).0[0], 255);
    }

    #[test]
    fn mask_is_clamped_to_image() {
        let edge = FaceBox {
            x: 0,
            y: 0,
            width: 30,
            height: 30,
        };
        let mask = face_mask(32, 32, &[edge]);
        assert_eq!(mask.dimensions(), (32, 32));
        assert_eq!(mask.get_pixel(15, 15).0[0], 255);
    }

    #[test]
    fn no_faces_returns_input_unchanged() -> Result<()> {
        let inpainter = Arc::new(RecordingInpainter::default());
        let refiner = FaceRefiner::new(Arc::new(FixedDetector(vec![])), inpainter.clone());
        let input = image();
        let out = refiner.refine(input.clone(), "p", "n", 30, 5.0, Some(7))?;
        assert_eq!(out.as_bytes(), input.as_bytes());
        assert!(inpainter.calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn detected_faces_are_repainted_with_capped_steps_and_offset_seed() -> Result<()> {
        let inpainter = Arc::new(RecordingInpainter::default());
        let refiner = FaceRefiner::new(Arc::new(FixedDetector(vec![face()])), inpainter.clone());
        let out = refiner.refine(image(), "p", "n", 30, 5.0, Some(42))?;
        assert_eq!(out.to_rgb8().get_pixel(50, 50), &Rgb([255, 255, 255]));
        assert_eq!(out.to_rgb8().get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert_eq!(*inpainter.calls.lock().unwrap(), vec![(20, 0.45, Some(43))]);
        Ok(())
    }

    #[test]
    fn unseeded_refinement_stays_unseeded() -> Result<()> {
        let inpainter = Arc::new(RecordingInpainter::default());
        let refiner = FaceRefiner::new(Arc::new(FixedDetector(vec![face()])), inpainter.clone());
        refiner.refine(image(), "p", "n", 12, 5.0, None)?;
        assert_eq!(*inpainter.calls.lock().unwrap(), vec![(12, 0.45, None)]);
        Ok(())
    }

    #[test]
    fn detector_failure_is_an_error() {
        let refiner = FaceRefiner::new(
            Arc::new(BrokenDetector),
            Arc::new(RecordingInpainter::default()),
        );
        let err = refiner.refine(image(), "p", "n", 30, 5.0, None).unwrap_err();
        assert!(format!("{err:#}").contains("cascade not loaded"));
    }
}
