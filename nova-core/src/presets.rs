//! Generation defaults and the fixed prompt fragments of the Illustrious
//! checkpoint recipe (nova-anime-ilxl v5.5).

pub const DEFAULT_STEPS: usize = 30;
/// CFG scale; 4 to 6 works best for Illustrious checkpoints.
pub const DEFAULT_GUIDANCE: f64 = 5.0;
/// 0.0 is plain CFG. 1.0 cancels CFG and blurs the output.
pub const DEFAULT_GUIDANCE_RESCALE: f64 = 0.0;
pub const DEFAULT_CLIP_SKIP: usize = 2;
pub const DEFAULT_PAG_SCALE: f64 = 1.5;
pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 1024;

pub const MAX_OUTPUTS: usize = 4;
pub const MAX_STEPS: usize = 100;
pub const MAX_DIMENSION: u32 = 4096;

/// CLIP position limit, including the two boundary tokens.
pub const CLIP_MAX_LENGTH: usize = 77;
pub const CONTENT_TOKENS_PER_CHUNK: usize = CLIP_MAX_LENGTH - 2;

pub const PREPROMPT: &str = "masterpiece, best quality, amazing quality, very aesthetic, \
high resolution, ultra-detailed, absurdres, newest, scenery, ";

pub const POST_PROMPT: &str = "BREAK, depth of field, volumetric lighting";

pub const PRE_NEGATIVE: &str = "modern, recent, old, oldest, cartoon, graphic, text, painting, crayon, \
graphite, abstract, glitch, deformed, mutated, ugly, disfigured, long body, \
lowres, bad anatomy, bad hands, missing fingers, extra digits, fewer digits, \
cropped, very displeasing, (worst quality, bad quality:1.2), sketch, \
jpeg artifacts, signature, watermark, username, simple background, \
conjoined, bad ai-generated, ";

/// Negative prompt used when the request brings none and the preprompt is off.
pub const DEFAULT_NEGATIVE: &str = "modern, recent, old, oldest, cartoon, graphic, text, painting, crayon, \
graphite, abstract, glitch, deformed, mutated, ugly, disfigured, long body, \
lowres, bad anatomy, bad hands, missing fingers, extra digits, fewer digits, \
cropped, very displeasing, (worst quality, bad quality:1.2), sketch, \
jpeg artifacts, signature, watermark, username, simple background, \
conjoined, bad ai-generated";

pub const DEFAULT_MODEL_ID: &str = "John6666/nova-anime-xl-il-v80-sdxl";
/// fp16-safe SDXL VAE; the stock one overflows in half precision.
pub const DEFAULT_VAE_ID: &str = "madebyollin/sdxl-vae-fp16-fix";
pub const DEFAULT_TIMING_LOG: &str = "/cache/nova_anime_timing_report.txt";
