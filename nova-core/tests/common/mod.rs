#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use nova_core::capability::{
    Conditioning, EncoderOutput, EncoderPair, FaceBox, FaceDetector, ImageSampler, InpaintParams,
    Inpainter, SamplingParams, TextEncoder, TextTokenizer,
};
use nova_core::encoding::{LongPromptEncoder, WeightedPromptEncoder};
use nova_core::refine::FaceRefiner;
use nova_core::timing::TimingLog;
use nova_core::{ModelRuntime, NoiseSource, Pipelines};

pub const START: u32 = 49406;
pub const END: u32 = 49407;
pub const COLD_START: Duration = Duration::from_millis(1500);

/// One id per word, derived from its bytes. NUL characters are rejected.
pub struct WordTokenizer;

impl TextTokenizer for WordTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        if text.contains('\u{0}') {
            bail!("tokenizer rejected input");
        }
        let mut ids = vec![START];
        ids.extend(
            text.split_whitespace()
                .map(|word| word.bytes().map(u32::from).sum::<u32>() % 1000 + 1),
        );
        ids.push(END);
        Ok(ids)
    }

    fn start_id(&self) -> u32 {
        START
    }

    fn end_id(&self) -> u32 {
        END
    }
}

/// Splits like CLIP's BPE at the coarse level: every run of alphanumerics is
/// one token and every punctuation mark is a token of its own.
pub struct PunctuationTokenizer;

impl TextTokenizer for PunctuationTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![START];
        let mut word = 0u32;
        let mut in_word = false;
        for ch in text.chars() {
            if ch.is_alphanumeric() {
                word = (word + ch as u32) % 1000;
                in_word = true;
                continue;
            }
            if in_word {
                ids.push(word + 1);
                word = 0;
                in_word = false;
            }
            if !ch.is_whitespace() {
                ids.push(ch as u32 % 1000 + 1);
            }
        }
        if in_word {
            ids.push(word + 1);
        }
        ids.push(END);
        Ok(ids)
    }

    fn start_id(&self) -> u32 {
        START
    }

    fn end_id(&self) -> u32 {
        END
    }
}

/// Hidden state of token `t` is `[t / 1000; hidden]`.
pub struct EchoEncoder {
    pub hidden: usize,
    pub pooled: bool,
}

impl TextEncoder for EchoEncoder {
    fn encode(&self, ids: &[u32]) -> Result<EncoderOutput> {
        let data: Vec<f32> = ids
            .iter()
            .flat_map(|&id| std::iter::repeat(id as f32 / 1000.0).take(self.hidden))
            .collect();
        let hidden_states = Tensor::from_vec(data, (1, ids.len(), self.hidden), &Device::Cpu)?;
        let pooled = if self.pooled {
            Some(hidden_states.get_on_dim(1, 1)?)
        } else {
            None
        };
        Ok(EncoderOutput {
            hidden_states,
            pooled,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleCall {
    pub batch: usize,
    pub sequence: usize,
    pub params: SamplingParams,
}

/// Paints each slot with pixels drawn from the noise source, shifted by the
/// mean of the prompt embedding.
#[derive(Default)]
pub struct NoiseSampler {
    pub calls: Mutex<Vec<SampleCall>>,
}

impl ImageSampler for NoiseSampler {
    fn sample(
        &self,
        conditioning: &Conditioning,
        params: &SamplingParams,
        noise: &mut NoiseSource,
    ) -> Result<Vec<DynamicImage>> {
        let batch = conditioning.batch_size()?;
        self.calls.lock().unwrap().push(SampleCall {
            batch,
            sequence: conditioning.prompt_embeds.dim(1)?,
            params: params.clone(),
        });
        let shift = conditioning.prompt_embeds.mean_all()?.to_scalar::<f32>()? * 10.0;
        let images = (0..batch)
            .map(|_| {
                let image = RgbImage::from_fn(params.width, params.height, |_, _| {
                    let mut channel = || (128.0 + shift + noise.next_normal() * 40.0).clamp(0.0, 255.0) as u8;
                    Rgb([channel(), channel(), channel()])
                });
                DynamicImage::ImageRgb8(image)
            })
            .collect();
        Ok(images)
    }
}

pub struct FailingSampler;

impl ImageSampler for FailingSampler {
    fn sample(&self, _: &Conditioning, _: &SamplingParams, _: &mut NoiseSource) -> Result<Vec<DynamicImage>> {
        bail!("CUDA out of memory")
    }
}

pub struct FixedDetector(pub Vec<FaceBox>);

impl FaceDetector for FixedDetector {
    fn detect_faces(&self, _image: &GrayImage) -> Result<Vec<FaceBox>> {
        Ok(self.0.clone())
    }
}

/// Paints masked pixels white.
#[derive(Default)]
pub struct WhiteInpainter {
    pub seeds: Mutex<Vec<Option<u64>>>,
}

impl Inpainter for WhiteInpainter {
    fn inpaint(
        &self,
        image: &DynamicImage,
        mask: &GrayImage,
        _params: &InpaintParams<'_>,
        noise: &mut NoiseSource,
    ) -> Result<DynamicImage> {
        self.seeds.lock().unwrap().push(noise.seed());
        let mut out = image.to_rgb8();
        for (x, y, m) in mask.enumerate_pixels() {
            if m.0[0] > 0 {
                out.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        Ok(DynamicImage::ImageRgb8(out))
    }
}

pub struct FailingInpainter;

impl Inpainter for FailingInpainter {
    fn inpaint(
        &self,
        _: &DynamicImage,
        _: &GrayImage,
        _: &InpaintParams<'_>,
        _: &mut NoiseSource,
    ) -> Result<DynamicImage> {
        bail!("inpainting pipeline crashed")
    }
}

pub fn encoder_pairs() -> (EncoderPair, EncoderPair) {
    encoder_pairs_with(Arc::new(WordTokenizer))
}

pub fn encoder_pairs_with(tokenizer: Arc<dyn TextTokenizer>) -> (EncoderPair, EncoderPair) {
    (
        EncoderPair::new(tokenizer.clone(), Arc::new(EchoEncoder { hidden: 4, pooled: false })),
        EncoderPair::new(tokenizer, Arc::new(EchoEncoder { hidden: 6, pooled: true })),
    )
}

pub fn pipelines(standard: Arc<dyn ImageSampler>) -> Pipelines {
    pipelines_with(Arc::new(WordTokenizer), standard)
}

pub fn pipelines_with(tokenizer: Arc<dyn TextTokenizer>, standard: Arc<dyn ImageSampler>) -> Pipelines {
    let (first, second) = encoder_pairs_with(tokenizer);
    Pipelines {
        primary_encoder: Arc::new(WeightedPromptEncoder::new(first.clone(), second.clone())),
        long_prompt_encoder: LongPromptEncoder::new(first, second),
        standard,
        attention_guided: None,
        face_refiner: None,
    }
}

pub fn refiner(faces: Vec<FaceBox>, inpainter: Arc<dyn Inpainter>) -> FaceRefiner {
    FaceRefiner::new(Arc::new(FixedDetector(faces)), inpainter)
}

pub fn runtime(pipelines: Pipelines, log: Option<TimingLog>) -> ModelRuntime {
    ModelRuntime::new(pipelines, COLD_START, log)
}

/// `n` distinct words, well past one CLIP window for n > 75.
pub fn long_prompt(n: usize) -> String {
    (0..n).map(|i| format!("tag{i}")).collect::<Vec<_>>().join(" ")
}
