use axum::{
    http::{header::CONTENT_TYPE, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use nova_core::{
    presets::{
        DEFAULT_CLIP_SKIP, DEFAULT_GUIDANCE, DEFAULT_GUIDANCE_RESCALE, DEFAULT_HEIGHT,
        DEFAULT_PAG_SCALE, DEFAULT_STEPS, DEFAULT_WIDTH,
    },
    GenerationError, GenerationOutput, GenerationRequest, Preprompt, Timings, RANDOM_SEED,
};
use serde::{Deserialize, Serialize};

/// Body of `POST /predict`, named after the Replicate model inputs.
///
/// Inputs the runtime does not implement (`scheduler`, extra detailer
/// models) are accepted and ignored.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PredictInput {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    #[serde(default = "default_guidance_rescale")]
    pub guidance_rescale: f64,
    #[serde(default = "default_pag_scale")]
    pub pag_scale: f64,
    #[serde(default = "default_clip_skip")]
    pub clip_skip: Option<usize>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub prepend_preprompt: Preprompt,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seed")]
    pub seed: Option<i64>,
    #[serde(default = "default_face_yolov9c")]
    pub face_yolov9c: bool,
}

fn default_cfg_scale() -> f64 {
    DEFAULT_GUIDANCE
}

fn default_guidance_rescale() -> f64 {
    DEFAULT_GUIDANCE_RESCALE
}

fn default_pag_scale() -> f64 {
    DEFAULT_PAG_SCALE
}

fn default_clip_skip() -> Option<usize> {
    Some(DEFAULT_CLIP_SKIP)
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_steps() -> usize {
    DEFAULT_STEPS
}

fn default_batch_size() -> usize {
    1
}

fn default_seed() -> Option<i64> {
    Some(RANDOM_SEED)
}

fn default_face_yolov9c() -> bool {
    true
}

impl PredictInput {
    pub fn into_request(self) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            prepend_preprompt: self.prepend_preprompt,
            steps: self.steps,
            guidance_scale: self.cfg_scale,
            guidance_rescale: self.guidance_rescale,
            clip_skip: self.clip_skip,
            pag_scale: self.pag_scale,
            width: self.width,
            height: self.height,
            seed: self.seed.filter(|&seed| seed != RANDOM_SEED),
            num_outputs: self.batch_size,
            face_refinement: self.face_yolov9c,
        }
    }
}

#[derive(Serialize)]
pub struct PredictResponse {
    pub images: Vec<String>,
    pub timings: Timings,
}

/// Seconds keep a decimal point even when whole (`41.0`).
fn timing_headers(timings: &Timings) -> [(HeaderName, String); 3] {
    [
        (
            HeaderName::from_static("x-inference-seconds"),
            format!("{:?}", timings.inference_seconds),
        ),
        (
            HeaderName::from_static("x-cold-start-seconds"),
            format!("{:?}", timings.cold_start_seconds),
        ),
        (
            HeaderName::from_static("x-request-number"),
            timings.request_number.to_string(),
        ),
    ]
}

/// One image goes out as a raw PNG body, several as base64 JSON.
pub fn output_response(output: GenerationOutput) -> Response {
    let timings = output.timings.rounded();
    let headers = timing_headers(&timings);
    let mut images = output.images;
    if images.len() == 1 {
        let png = images.remove(0);
        return (headers, [(CONTENT_TYPE, "image/png")], png).into_response();
    }
    let body = PredictResponse {
        images: images.iter().map(|png| BASE64_STANDARD.encode(png)).collect(),
        timings,
    };
    (headers, Json(body)).into_response()
}

pub fn error_response(err: &GenerationError) -> Response {
    let status = if err.is_client_error() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, format!("Error: {err}")).into_response()
}
