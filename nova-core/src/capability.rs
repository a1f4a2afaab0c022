//! Interfaces of the numeric collaborators the runtime drives.
//!
//! Tokenizers, text encoders, samplers, the face detector and the inpainter
//! are opaque to the orchestration code. The candle SDXL backend in
//! [`crate::sdxl`] and the SeetaFace detector in [`crate::face`] implement them
//! for production; tests swap in lightweight fakes.

use std::sync::Arc;

use anyhow::Result;
use candle_core::Tensor;
use image::{DynamicImage, GrayImage};

use crate::NoiseSource;

pub trait TextTokenizer: Send + Sync {
    /// Token ids for `text` without truncation. Boundary ids may be included.
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    fn start_id(&self) -> u32;

    fn end_id(&self) -> u32;
}

/// Output of one text encoder for one chunk.
pub struct EncoderOutput {
    /// Second-to-last hidden layer, `[1, seq, hidden]`.
    pub hidden_states: Tensor,
    /// Pooled (projected end-token) embedding `[1, proj]`, for encoders that have one.
    pub pooled: Option<Tensor>,
}

pub trait TextEncoder: Send + Sync {
    fn encode(&self, ids: &[u32]) -> Result<EncoderOutput>;
}

/// A tokenizer and the text encoder that consumes its ids.
#[derive(Clone)]
pub struct EncoderPair {
    pub tokenizer: Arc<dyn TextTokenizer>,
    pub encoder: Arc<dyn TextEncoder>,
}

impl EncoderPair {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>, encoder: Arc<dyn TextEncoder>) -> Self {
        Self { tokenizer, encoder }
    }
}

/// Embedding of a single text.
pub struct PromptEmbedding {
    /// `[1, seq, hidden]`
    pub embeds: Tensor,
    /// `[1, proj]`
    pub pooled: Tensor,
}

/// Encoder for one text at a time, tried before the long-prompt chunker.
pub trait PromptEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<PromptEmbedding>;
}

/// Batched text conditioning handed to a sampler.
#[derive(Clone)]
pub struct Conditioning {
    pub prompt_embeds: Tensor,
    pub negative_embeds: Tensor,
    pub pooled_prompt: Tensor,
    pub pooled_negative: Tensor,
}

impl Conditioning {
    pub fn batch_size(&self) -> candle_core::Result<usize> {
        self.prompt_embeds.dim(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub width: u32,
    pub height: u32,
    pub steps: usize,
    pub guidance_scale: f64,
    /// Already clamped to be non-negative.
    pub guidance_rescale: f64,
    pub clip_skip: Option<usize>,
    /// Present only when perturbed-attention guidance is active.
    pub pag_scale: Option<f64>,
}

pub trait ImageSampler: Send + Sync {
    /// Produces one decoded image per batch slot of `conditioning`, in order.
    fn sample(
        &self,
        conditioning: &Conditioning,
        params: &SamplingParams,
        noise: &mut NoiseSource,
    ) -> Result<Vec<DynamicImage>>;
}

/// Axis-aligned face bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub trait FaceDetector: Send + Sync {
    fn detect_faces(&self, image: &GrayImage) -> Result<Vec<FaceBox>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct InpaintParams<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub steps: usize,
    pub guidance_scale: f64,
    /// Fraction of the noise schedule that is re-run, in `(0, 1]`.
    pub strength: f64,
}

pub trait Inpainter: Send + Sync {
    /// Repaints the white pixels of `mask`, keeping the rest of `image`.
    fn inpaint(
        &self,
        image: &DynamicImage,
        mask: &GrayImage,
        params: &InpaintParams<'_>,
        noise: &mut NoiseSource,
    ) -> Result<DynamicImage>;
}
