use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use hf_hub::api::tokio::Api;
use nova_core::{
    presets::{DEFAULT_MODEL_ID, DEFAULT_TIMING_LOG, DEFAULT_VAE_ID},
    timing::TimingLog,
    warm_up, DeviceMap, GenerationRequest, LoadSettings, Loader, ModelRuntime, Preprompt,
    SdxlLoader,
};
use serde_json::json;
use tokio::{self, net::TcpListener};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod schema;

use schema::{error_response, output_response, PredictInput};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Nova Anime image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    /// SDXL checkpoint on the Hugging Face hub, diffusers layout
    #[arg(long, global = true, env = "NOVA_MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Replacement VAE repository; empty to use the checkpoint's own
    #[arg(long, global = true, env = "NOVA_VAE_ID", default_value = DEFAULT_VAE_ID)]
    vae: String,

    /// Append-only timing log
    #[arg(long, global = true, env = "NOVA_TIMING_LOG", default_value = DEFAULT_TIMING_LOG)]
    timing_log: PathBuf,

    /// SeetaFace detector model; face refinement is off without it
    #[arg(long, global = true, env = "NOVA_FACE_MODEL")]
    face_model: Option<PathBuf>,

    /// Skip loading the face refinement pipeline
    #[arg(long, global = true)]
    no_face_refinement: bool,

    /// Use flash attention in the unet
    #[arg(long, global = true)]
    flash_attn: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Serve {
        /// Host address to bind the server to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind the server to
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Generate one image locally and save it
    Generate(GenerateArgs),
    /// Print the timing report without loading any model
    Report,
}

#[derive(clap::Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,

    #[arg(long)]
    negative_prompt: Option<String>,

    /// Do not wrap the prompt with the quality preprompt
    #[arg(long)]
    no_preprompt: bool,

    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    cfg_scale: Option<f64>,

    #[arg(long)]
    guidance_rescale: Option<f64>,

    #[arg(long)]
    clip_skip: Option<usize>,

    #[arg(long)]
    seed: Option<i64>,

    #[arg(long, default_value = "outputs")]
    output_dir: PathBuf,

    /// Print the timing report afterwards
    #[arg(long)]
    show_report: bool,
}

impl GenerateArgs {
    fn request(&self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.prompt.clone());
        request.negative_prompt = self.negative_prompt.clone();
        request.prepend_preprompt = Preprompt::Enabled(!self.no_preprompt);
        request.steps = self.steps.unwrap_or(request.steps);
        request.guidance_scale = self.cfg_scale.unwrap_or(request.guidance_scale);
        request.guidance_rescale = self.guidance_rescale.unwrap_or(request.guidance_rescale);
        request.clip_skip = self.clip_skip.or(request.clip_skip);
        request.seed = self.seed;
        request
    }
}

impl Args {
    fn load_settings(&self) -> LoadSettings {
        LoadSettings {
            model_id: self.model.clone(),
            vae_id: Some(self.vae.clone()).filter(|vae| !vae.is_empty()),
            device_map: DeviceMap::from_cpu_flag(self.cpu),
            use_flash_attn: self.flash_attn,
            face_model: self.face_model.clone(),
            face_refinement: !self.no_face_refinement,
        }
    }
}

/// Loads and warms the pipelines; the elapsed time is the cold start.
async fn load_runtime(args: &Args) -> Result<ModelRuntime> {
    let started = Instant::now();
    let pipelines = SdxlLoader::load(Api::new()?, args.load_settings()).await?;
    warm_up(&pipelines);
    let cold_start = started.elapsed();
    info!("runtime ready, cold start {:.2}s", cold_start.as_secs_f64());
    Ok(ModelRuntime::new(
        pipelines,
        cold_start,
        Some(TimingLog::new(&args.timing_log)),
    ))
}

// Application state containing the loaded runtime.
#[derive(Clone)]
struct AppState(Arc<ModelRuntime>);

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<PredictInput>,
) -> Response {
    let request = input.into_request();
    let runtime = state.0.clone();
    match tokio::task::spawn_blocking(move || runtime.generate(&request)).await {
        Ok(Ok(output)) => output_response(output),
        Ok(Err(e)) => {
            error!("Error generating image: {e}");
            error_response(&e)
        }
        Err(e) => {
            error!("generation task panicked: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response()
        }
    }
}

async fn timing_report_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.0.timing_report(),
    )
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn router(runtime: Arc<ModelRuntime>) -> Router {
    Router::new()
        .route("/predict", post(predict_handler))
        .route("/timing-report", get(timing_report_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(AppState(runtime)))
}

async fn serve(args: &Args, host: &str, port: u16) -> Result<()> {
    let runtime = Arc::new(load_runtime(args).await?);
    let app = router(runtime);

    // --- Start the server ---
    let bind_address = format!("{host}:{port}");
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn generate_local(args: &Args, generate: &GenerateArgs) -> Result<()> {
    let request = generate.request();
    let total = Instant::now();
    let runtime = load_runtime(args).await?;
    let output = tokio::task::spawn_blocking(move || {
        let output = runtime.generate(&request);
        (runtime, output)
    })
    .await?;
    let (runtime, output) = output;
    let output = output?;

    let output_dir = &generate.output_dir;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    for (index, png) in output.images.iter().enumerate() {
        let path = if output.images.len() == 1 {
            output_dir.join(format!("output_{stamp}.png"))
        } else {
            output_dir.join(format!("output_{stamp}_{index}.png"))
        };
        fs::write(&path, png).with_context(|| format!("failed to write {}", path.display()))?;
        println!("Saved {}", path.display());
    }

    let timings = output.timings.rounded();
    println!(
        "Timings: cold_start={}s inference={}s total_client={:.2}s request#{}",
        timings.cold_start_seconds,
        timings.inference_seconds,
        total.elapsed().as_secs_f64(),
        timings.request_number
    );
    if generate.show_report {
        println!("{}", runtime.timing_report());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    match &args.command {
        None => serve(&args, "127.0.0.1", 8000).await,
        Some(Command::Serve { host, port }) => serve(&args, host, *port).await,
        Some(Command::Generate(generate)) => generate_local(&args, generate).await,
        Some(Command::Report) => {
            print!("{}", TimingLog::new(&args.timing_log).summarize());
            Ok(())
        }
    }
}
