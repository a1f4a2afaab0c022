//! Candle SDXL backend: CLIP text towers, UNet/VAE sampling and masked
//! img2img for face refinement.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_transformers::models::stable_diffusion::clip;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use hf_hub::api::tokio::Api;
use tracing::{info, warn};

mod inpaint;
mod sampler;
mod text;

pub use inpaint::SdxlInpainter;
pub use sampler::SdxlSampler;
pub use text::{ClipEncoder, HfTokenizer};

use crate::capability::{EncoderPair, TextTokenizer};
use crate::encoding::{LongPromptEncoder, WeightedPromptEncoder};
use crate::face::SeetaFaceDetector;
use crate::refine::FaceRefiner;
use crate::{select_best_device, LoadSettings, Loader, Pipelines};

const CLIP_L_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const CLIP_G_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
/// Hidden and projection width of the second text tower.
const CLIP_G_WIDTH: usize = 1280;

/// UNet and VAE shared by the sampler and the inpainter.
pub struct SdxlModel {
    pub(crate) unet: UNet2DConditionModel,
    pub(crate) vae: AutoEncoderKL,
    pub(crate) device: Device,
    pub(crate) dtype: DType,
}

pub struct SdxlLoader;

async fn load_tokenizer(api: &Api, repo: &str) -> Result<HfTokenizer> {
    let file = api
        .model(repo.to_string())
        .get("tokenizer.json")
        .await
        .with_context(|| format!("failed to get tokenizer from {repo}"))?;
    HfTokenizer::from_file(file)
}

impl Loader for SdxlLoader {
    async fn load(api: Api, settings: LoadSettings) -> Result<Pipelines> {
        let started = Instant::now();
        let device = select_best_device(settings.device_map).context("failed to set up device")?;
        let dtype = if device.is_cuda() { DType::F16 } else { DType::F32 };
        info!(model = %settings.model_id, ?dtype, "loading SDXL pipeline");

        let repo = api.model(settings.model_id.clone());

        // --- Text towers and tokenizers ---
        let tokenizer_l = Arc::new(load_tokenizer(&api, CLIP_L_TOKENIZER_REPO).await?);
        let tokenizer_g = Arc::new(load_tokenizer(&api, CLIP_G_TOKENIZER_REPO).await?);
        let clip_l_file = repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get first text encoder")?;
        let clip_g_file = repo
            .get("text_encoder_2/model.safetensors")
            .await
            .context("failed to get second text encoder")?;
        let clip_l = ClipEncoder::load(
            clip_l_file,
            &clip::Config::sdxl(),
            None,
            tokenizer_l.end_id(),
            &device,
            dtype,
        )
        .context("failed to load first text encoder")?;
        let clip_g = ClipEncoder::load(
            clip_g_file,
            &clip::Config::sdxl2(),
            Some((CLIP_G_WIDTH, CLIP_G_WIDTH)),
            tokenizer_g.end_id(),
            &device,
            dtype,
        )
        .context("failed to load second text encoder")?;
        let first = EncoderPair::new(tokenizer_l, Arc::new(clip_l));
        let second = EncoderPair::new(tokenizer_g, Arc::new(clip_g));
        info!("text encoders loaded");

        // --- UNet and VAE ---
        let sd_config = StableDiffusionConfig::sdxl(None, None, None);
        let unet_file = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get unet weights")?;
        let unet = sd_config
            .build_unet(unet_file, &device, 4, settings.use_flash_attn, dtype)
            .context("failed to load unet")?;
        let vae_file = match &settings.vae_id {
            Some(vae_id) => api
                .model(vae_id.clone())
                .get("diffusion_pytorch_model.safetensors")
                .await
                .with_context(|| format!("failed to get VAE from {vae_id}"))?,
            None => repo
                .get("vae/diffusion_pytorch_model.safetensors")
                .await
                .context("failed to get VAE weights")?,
        };
        let vae = sd_config
            .build_vae(vae_file, &device, dtype)
            .context("failed to load VAE")?;
        info!("unet and VAE loaded");

        let model = Arc::new(SdxlModel {
            unet,
            vae,
            device,
            dtype,
        });
        let long_prompt_encoder = LongPromptEncoder::new(first.clone(), second.clone());

        let face_refiner = match (settings.face_refinement, &settings.face_model) {
            (false, _) => None,
            (true, None) => {
                warn!("face refinement enabled but no face model configured, disabling it");
                None
            }
            (true, Some(path)) => {
                let detector = SeetaFaceDetector::load(path).context("failed to load face detector")?;
                let inpainter = SdxlInpainter::new(model.clone(), long_prompt_encoder.clone());
                info!(model = %path.display(), "face refinement ready");
                Some(FaceRefiner::new(Arc::new(detector), Arc::new(inpainter)))
            }
        };

        info!("pipeline loaded in {:.2}s", started.elapsed().as_secs_f64());
        Ok(Pipelines {
            primary_encoder: Arc::new(WeightedPromptEncoder::new(first, second)),
            long_prompt_encoder,
            standard: Arc::new(SdxlSampler::new(model)),
            // No perturbed-attention variant of the candle UNet.
            attention_guided: None,
            face_refiner,
        })
    }
}
