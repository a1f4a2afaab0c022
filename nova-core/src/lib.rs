#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod capability;
pub mod device_map;
pub mod encoding;
mod error;
pub mod face;
pub mod loader;
mod noise;
pub mod presets;
mod prompt;
pub mod refine;
mod request;
mod runtime;
pub mod sdxl;
pub mod timing;
mod util;

pub use device_map::*;
pub use error::GenerationError;
pub use loader::*;
pub use noise::NoiseSource;
pub use prompt::PromptPair;
pub use request::{GenerationRequest, Preprompt, RANDOM_SEED};
pub use runtime::{warm_up, GenerationOutput, GuidancePath, ModelRuntime, Pipelines, Timings};
pub use sdxl::SdxlLoader;
pub use util::*;
