use std::sync::Arc;

use anyhow::{ensure, Result};
use candle_core::{DType, IndexOp, Tensor};
use candle_transformers::models::stable_diffusion::ddim::DDIMSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::{Scheduler, SchedulerConfig};
use image::DynamicImage;
use tracing::debug;

use super::SdxlModel;
use crate::capability::{Conditioning, ImageSampler, SamplingParams};
use crate::{tensor_to_image, NoiseSource};

/// Latent scaling factor of the SDXL VAE.
pub(crate) const VAE_SCALE: f64 = 0.13025;
pub(crate) const LATENT_CHANNELS: usize = 4;

pub(crate) fn build_scheduler(steps: usize) -> Result<Box<dyn Scheduler>> {
    Ok(DDIMSchedulerConfig::default().build(steps)?)
}

/// Scales the guided prediction so its per-sample std matches the text branch,
/// then mixes by `rescale`. Removes the overexposure of high CFG scales.
pub(crate) fn rescale_noise_cfg(guided: &Tensor, text: &Tensor, rescale: f64) -> candle_core::Result<Tensor> {
    let dtype = guided.dtype();
    let guided = guided.to_dtype(DType::F32)?;
    let text = text.to_dtype(DType::F32)?;
    let batch = guided.dim(0)?;
    let std = |t: &Tensor| -> candle_core::Result<Tensor> {
        t.flatten_from(1)?
            .var_keepdim(1)?
            .sqrt()?
            .reshape((batch, 1, 1, 1))
    };
    let ratio = std(&text)?.broadcast_div(&std(&guided)?)?;
    let rescaled = guided.broadcast_mul(&ratio)?;
    let mixed = ((rescaled * rescale)? + (guided * (1.0 - rescale))?)?;
    mixed.to_dtype(dtype)
}

impl SdxlModel {
    /// One classifier-free-guided noise prediction for `latents`.
    ///
    /// `text_embeddings` holds the negative batch first, then the positive one.
    pub(crate) fn guided_noise(
        &self,
        scheduler: &dyn Scheduler,
        latents: &Tensor,
        timestep: usize,
        text_embeddings: &Tensor,
        guidance_scale: f64,
        guidance_rescale: f64,
    ) -> Result<Tensor> {
        let input = Tensor::cat(&[latents, latents], 0)?;
        let input = scheduler.scale_model_input(input, timestep)?;
        let noise_pred = self.unet.forward(&input, timestep as f64, text_embeddings)?;
        let chunks = noise_pred.chunk(2, 0)?;
        let (uncond, text) = (&chunks[0], &chunks[1]);
        let guided = (uncond + ((text - uncond)? * guidance_scale)?)?;
        if guidance_rescale > 0.0 {
            Ok(rescale_noise_cfg(&guided, text, guidance_rescale)?)
        } else {
            Ok(guided)
        }
    }

    /// Text conditioning in the unet's dtype, negative batch first.
    pub(crate) fn text_embeddings(&self, negative: &Tensor, positive: &Tensor) -> Result<Tensor> {
        Ok(Tensor::cat(&[negative, positive], 0)?.to_dtype(self.dtype)?)
    }

    pub(crate) fn decode(&self, latents: &Tensor) -> Result<Vec<DynamicImage>> {
        let batch = latents.dim(0)?;
        let mut images = Vec::with_capacity(batch);
        for slot in 0..batch {
            let latent = latents.i(slot..slot + 1)?;
            let decoded = self.vae.decode(&(latent / VAE_SCALE)?)?;
            let pixels = ((decoded / 2.)? + 0.5)?
                .to_dtype(DType::F32)?
                .clamp(0f32, 1f32)?;
            let pixels = (pixels * 255.)?.to_dtype(DType::U8)?;
            images.push(tensor_to_image(&pixels.i(0)?)?);
        }
        Ok(images)
    }
}

/// Text-to-image sampling with CFG and optional guidance rescale.
pub struct SdxlSampler {
    model: Arc<SdxlModel>,
}

impl SdxlSampler {
    pub fn new(model: Arc<SdxlModel>) -> Self {
        Self { model }
    }
}

impl ImageSampler for SdxlSampler {
    fn sample(
        &self,
        conditioning: &Conditioning,
        params: &SamplingParams,
        noise: &mut NoiseSource,
    ) -> Result<Vec<DynamicImage>> {
        let (width, height) = (params.width as usize, params.height as usize);
        ensure!(
            width % 8 == 0 && height % 8 == 0,
            "width and height must be multiples of 8, got {width}x{height}"
        );
        let model = &self.model;
        let batch = conditioning.batch_size()?;
        let text_embeddings =
            model.text_embeddings(&conditioning.negative_embeds, &conditioning.prompt_embeds)?;

        let mut scheduler = build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latents = noise.normal((batch, LATENT_CHANNELS, height / 8, width / 8), &model.device)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(model.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            debug!("step {}/{}", index + 1, timesteps.len());
            let noise_pred = model.guided_noise(
                scheduler.as_ref(),
                &latents,
                timestep,
                &text_embeddings,
                params.guidance_scale,
                params.guidance_rescale,
            )?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }
        model.decode(&latents)
    }
}
