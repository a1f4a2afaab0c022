use std::sync::Arc;

use anyhow::{ensure, Result};
use candle_core::Tensor;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use tracing::debug;

use super::sampler::{build_scheduler, VAE_SCALE};
use super::SdxlModel;
use crate::capability::{InpaintParams, Inpainter};
use crate::encoding::LongPromptEncoder;
use crate::{image_to_tensor, NoiseSource};

/// Masked img2img on the base SDXL weights.
///
/// The source is encoded, noised to `strength` of the schedule and denoised
/// again. After every step the unmasked latents are reset to the source noised
/// to the same level, and the decoded result is composited over the source
/// pixels with the mask as alpha.
///
/// On CUDA and Metal the request seed also seeds the VAE posterior sample, so
/// seeded refinements are reproducible. candle cannot seed its CPU rng, which
/// makes refined images on CPU differ between runs even with a fixed seed.
pub struct SdxlInpainter {
    model: Arc<SdxlModel>,
    text: LongPromptEncoder,
}

impl SdxlInpainter {
    pub fn new(model: Arc<SdxlModel>, text: LongPromptEncoder) -> Self {
        Self { model, text }
    }

    /// `[1, 1, h / 8, w / 8]` mask in `[0, 1]`.
    fn latent_mask(&self, mask: &GrayImage, width: u32, height: u32) -> Result<Tensor> {
        let small = imageops::resize(mask, width / 8, height / 8, FilterType::Triangle);
        let data: Vec<f32> = small.pixels().map(|p| f32::from(p.0[0]) / 255.0).collect();
        let mask = Tensor::from_vec(data, (1, 1, (height / 8) as usize, (width / 8) as usize), &self.model.device)?;
        Ok(mask.to_dtype(self.model.dtype)?)
    }
}

/// Index of the first denoising step. A positive strength always repaints at
/// least the last step, however few steps the schedule has.
fn first_step(total: usize, strength: f64) -> usize {
    let noised = (total as f64 * strength) as usize;
    let noised = if strength > 0.0 { noised.max(1) } else { noised };
    total - noised.min(total)
}

fn blend(mask: &Tensor, inside: &Tensor, outside: &Tensor) -> candle_core::Result<Tensor> {
    let inv_mask = (Tensor::ones_like(mask)? - mask)?;
    mask.broadcast_mul(inside)? + inv_mask.broadcast_mul(outside)?
}

fn composite(source: &RgbImage, repainted: &RgbImage, mask: &GrayImage) -> RgbImage {
    RgbImage::from_fn(source.width(), source.height(), |x, y| {
        let alpha = f32::from(mask.get_pixel(x, y).0[0]) / 255.0;
        let (src, new) = (source.get_pixel(x, y).0, repainted.get_pixel(x, y).0);
        Rgb(std::array::from_fn(|c| {
            (f32::from(new[c]) * alpha + f32::from(src[c]) * (1.0 - alpha)).round() as u8
        }))
    })
}

impl Inpainter for SdxlInpainter {
    fn inpaint(
        &self,
        image: &DynamicImage,
        mask: &GrayImage,
        params: &InpaintParams<'_>,
        noise: &mut NoiseSource,
    ) -> Result<DynamicImage> {
        let (width, height) = (image.width(), image.height());
        ensure!(
            width % 8 == 0 && height % 8 == 0,
            "inpainting needs dimensions divisible by 8, got {width}x{height}"
        );
        ensure!(mask.dimensions() == (width, height), "mask size does not match the image");
        let model = &self.model;

        let mut scheduler = build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let total = timesteps.len();
        let start = first_step(total, params.strength);
        if start >= total {
            return Ok(image.clone());
        }

        let prompts = self
            .text
            .encode(params.prompt, params.negative_prompt, None)?;
        let text_embeddings = model.text_embeddings(&prompts.negative, &prompts.positive)?;

        // The VAE posterior is sampled on the device rng.
        if let Some(seed) = noise.seed().filter(|_| !model.device.is_cpu()) {
            model.device.set_seed(seed)?;
        }
        let source = image_to_tensor(image, &model.device, model.dtype)?;
        let original = (model.vae.encode(&source)?.sample()? * VAE_SCALE)?;
        let latent_mask = self.latent_mask(mask, width, height)?;
        let fresh = noise
            .normal(original.dims(), &model.device)?
            .to_dtype(model.dtype)?;

        debug!(steps = total - start, strength = params.strength, "inpainting");
        let mut latents = scheduler.add_noise(&original, fresh.clone(), timesteps[start])?;
        for index in start..total {
            let timestep = timesteps[index];
            let noise_pred = model.guided_noise(
                scheduler.as_ref(),
                &latents,
                timestep,
                &text_embeddings,
                params.guidance_scale,
                0.0,
            )?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            if let Some(&next) = timesteps.get(index + 1) {
                let noised = scheduler.add_noise(&original, fresh.clone(), next)?;
                latents = blend(&latent_mask, &latents, &noised)?;
            }
        }
        let latents = blend(&latent_mask, &latents, &original)?;

        let decoded = model
            .decode(&latents)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("decoder returned no image"))?;
        let out = composite(&image.to_rgb8(), &decoded.to_rgb8(), mask);
        Ok(DynamicImage::ImageRgb8(out))
    }
}
