use std::future::Future;
use std::path::PathBuf;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::presets::{DEFAULT_MODEL_ID, DEFAULT_VAE_ID};
use crate::{DeviceMap, Pipelines};

/// Where and how to load the generation models.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSettings {
    /// Hub repository in diffusers layout.
    pub model_id: String,
    /// Hub repository holding a replacement VAE, if any.
    pub vae_id: Option<String>,
    pub device_map: DeviceMap,
    pub use_flash_attn: bool,
    /// SeetaFace detector model file. Refinement is disabled without one.
    pub face_model: Option<PathBuf>,
    pub face_refinement: bool,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            vae_id: Some(DEFAULT_VAE_ID.to_string()),
            device_map: DeviceMap::default(),
            use_flash_attn: false,
            face_model: None,
            face_refinement: true,
        }
    }
}

pub trait Loader {
    fn load(api: Api, settings: LoadSettings) -> impl Future<Output = Result<Pipelines>>
    where
        Self: Sized;
}
