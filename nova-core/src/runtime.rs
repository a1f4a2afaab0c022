use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capability::{ImageSampler, PromptEncoder, SamplingParams};
use crate::encoding::{encode_prompts, EncodingPath, LongPromptEncoder};
use crate::refine::FaceRefiner;
use crate::timing::{TimingLog, TimingRecord, NO_DATA_REPORT};
use crate::{best_effort, encode_png, GenerationError, GenerationRequest, NoiseSource, PromptPair};

/// Loaded model handles. Built once by a [`crate::Loader`], immutable after.
#[derive(Clone)]
pub struct Pipelines {
    /// Weighted fast-path encoder, always tried first.
    pub primary_encoder: Arc<dyn PromptEncoder>,
    pub long_prompt_encoder: LongPromptEncoder,
    pub standard: Arc<dyn ImageSampler>,
    /// Perturbed-attention guidance variant of `standard`.
    pub attention_guided: Option<Arc<dyn ImageSampler>>,
    /// Present when face refinement is enabled and its models loaded.
    pub face_refiner: Option<FaceRefiner>,
}

/// Which sampler variant a request runs through.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuidancePath {
    Standard,
    PerturbedAttention { scale: f64 },
}

impl GuidancePath {
    pub fn select(pag_scale: f64) -> Self {
        if pag_scale > 0.0 {
            Self::PerturbedAttention { scale: pag_scale }
        } else {
            Self::Standard
        }
    }
}

impl Pipelines {
    pub fn supports_attention_guidance(&self) -> bool {
        self.attention_guided.is_some()
    }

    fn sampler_for(&self, path: GuidancePath) -> &dyn ImageSampler {
        match (path, &self.attention_guided) {
            (GuidancePath::PerturbedAttention { .. }, Some(sampler)) => sampler.as_ref(),
            (GuidancePath::PerturbedAttention { .. }, None) => {
                debug!("no attention-guided sampler loaded, using the standard one");
                self.standard.as_ref()
            }
            (GuidancePath::Standard, _) => self.standard.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Timings {
    pub inference_seconds: f64,
    pub cold_start_seconds: f64,
    pub request_number: u64,
}

impl Timings {
    /// Seconds rounded to two decimals, as reported to clients.
    pub fn rounded(self) -> Self {
        let round = |s: f64| (s * 100.0).round() / 100.0;
        Self {
            inference_seconds: round(self.inference_seconds),
            cold_start_seconds: round(self.cold_start_seconds),
            request_number: self.request_number,
        }
    }
}

pub struct GenerationOutput {
    /// PNG-encoded images, in batch order.
    pub images: Vec<Vec<u8>>,
    pub timings: Timings,
    pub encoding: EncodingPath,
}

#[derive(Debug, Default)]
struct Counters {
    request_count: u64,
    inference_times: Vec<f64>,
}

/// Process-wide generation state: loaded pipelines plus request counters.
///
/// Created once after warm-up and shared by the serving loop. One generation
/// runs at a time; the counters lock is held for the whole request, which
/// also serializes timing-log appends.
pub struct ModelRuntime {
    pipelines: Pipelines,
    cold_start: Duration,
    timing_log: Option<TimingLog>,
    counters: Mutex<Counters>,
}

impl ModelRuntime {
    pub fn new(pipelines: Pipelines, cold_start: Duration, timing_log: Option<TimingLog>) -> Self {
        if !pipelines.supports_attention_guidance() {
            warn!("no attention-guided sampler loaded, pag_scale requests will use the standard sampler");
        }
        Self {
            pipelines,
            cold_start,
            timing_log,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    pub fn cold_start(&self) -> Duration {
        self.cold_start
    }

    pub fn request_count(&self) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .request_count
    }

    /// Inference seconds of every completed request, in order.
    pub fn inference_times(&self) -> Vec<f64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inference_times
            .clone()
    }

    /// Runs one request end to end and returns PNG blobs plus timings.
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        request.validate()?;
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let started = Instant::now();
        let is_first = counters.request_count == 0;

        let (images, encoding) = self.run(request)?;

        let inference_seconds = started.elapsed().as_secs_f64();
        let cold_start_seconds = if is_first {
            self.cold_start.as_secs_f64()
        } else {
            0.0
        };
        counters.inference_times.push(inference_seconds);
        counters.request_count += 1;
        let timings = Timings {
            inference_seconds,
            cold_start_seconds,
            request_number: counters.request_count,
        };

        if let Some(log) = &self.timing_log {
            let record = TimingRecord {
                timestamp: Utc::now(),
                request: timings.request_number,
                cold_start_seconds,
                inference_seconds,
            };
            best_effort("timing log append", || log.append(&record));
        }
        info!(
            request = timings.request_number,
            images = images.len(),
            inference_s = format!("{inference_seconds:.2}"),
            ?encoding,
            "generation complete"
        );

        Ok(GenerationOutput {
            images,
            timings,
            encoding,
        })
    }

    fn run(&self, request: &GenerationRequest) -> Result<(Vec<Vec<u8>>, EncodingPath), GenerationError> {
        let pipelines = &self.pipelines;
        let prompts = PromptPair::assemble(request);

        let encoded = encode_prompts(
            pipelines.primary_encoder.as_ref(),
            &pipelines.long_prompt_encoder,
            &prompts,
            request.clip_skip,
        )
        .map_err(GenerationError::Encoding)?
        .reconcile_lengths()?;
        let encoding = encoded.path;
        let conditioning = encoded.expand_batch(request.num_outputs)?;

        let seed = request.effective_seed();
        let mut noise = NoiseSource::for_seed(seed);
        let guidance = GuidancePath::select(request.pag_scale);
        let params = SamplingParams {
            width: request.width,
            height: request.height,
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            guidance_rescale: request.effective_guidance_rescale(),
            clip_skip: request.clip_skip,
            pag_scale: match guidance {
                GuidancePath::PerturbedAttention { scale } => Some(scale),
                GuidancePath::Standard => None,
            },
        };
        debug!(?guidance, ?encoding, seed, "sampling");

        let mut images = pipelines
            .sampler_for(guidance)
            .sample(&conditioning, &params, &mut noise)
            .map_err(GenerationError::Sampling)?;
        if images.len() != request.num_outputs {
            return Err(GenerationError::Sampling(anyhow::anyhow!(
                "sampler returned {} images for a batch of {}",
                images.len(),
                request.num_outputs
            )));
        }

        if request.face_refinement {
            if let Some(refiner) = &pipelines.face_refiner {
                images = images
                    .into_iter()
                    .map(|image| {
                        refiner.refine(
                            image,
                            prompts.positive(),
                            prompts.negative(),
                            request.steps,
                            request.guidance_scale,
                            seed,
                        )
                    })
                    .collect::<anyhow::Result<Vec<_>>>()
                    .map_err(GenerationError::Refinement)?;
            }
        }

        let pngs = images
            .iter()
            .map(encode_png)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((pngs, encoding))
    }

    /// Summary of the durable timing log.
    pub fn timing_report(&self) -> String {
        match &self.timing_log {
            Some(log) => log.summarize(),
            None => NO_DATA_REPORT.to_string(),
        }
    }
}

/// Short throwaway generation so kernels are compiled before the first
/// request. Failures are logged and ignored.
pub fn warm_up(pipelines: &Pipelines) {
    let started = Instant::now();
    info!("warming up pipelines");
    let run = || -> anyhow::Result<()> {
        let prompts = PromptPair::new("warmup test", "bad quality");
        let encoded = encode_prompts(
            pipelines.primary_encoder.as_ref(),
            &pipelines.long_prompt_encoder,
            &prompts,
            None,
        )?
        .reconcile_lengths()?;
        let params = SamplingParams {
            width: 512,
            height: 512,
            steps: 2,
            guidance_scale: 5.0,
            guidance_rescale: 0.0,
            clip_skip: None,
            pag_scale: Some(1.5),
        };
        let sampler = pipelines.sampler_for(GuidancePath::select(1.5));
        sampler.sample(&encoded.expand_batch(1)?, &params, &mut NoiseSource::seeded(0))?;
        Ok(())
    };
    if best_effort("warm-up", run).is_some() {
        info!("warm-up done in {:.2}s", started.elapsed().as_secs_f64());
    } else {
        warn!("continuing without warm-up");
    }
}
