use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use hf_hub::api::tokio::Api;
use limn_core::{
    DeviceMap, Error, GeneratedImage, GenerationOptions, ModelDefinition, TextToImageModel,
    WarmupStatus,
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};
use tokio::{self, net::TcpListener};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Limn image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Local directory holding the exported ONNX model. When omitted the
    /// model is fetched from the hub.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Hub model to fetch when no local directory is given
    #[arg(long, default_value = "SimianLuo/LCM_Dreamshaper_v7")]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Deserialize)]
struct GenerationRequest {
    prompt: String,
    /// Number of images to generate; 0 and 1 both mean a single image.
    #[serde(default)]
    count: usize,
    #[serde(flatten)]
    options: GenerationOptions,
}

#[derive(Serialize)]
struct ImagePayload {
    image: String,
    seed: u64,
    steps: usize,
    width: usize,
    height: usize,
    elapsed_ms: u64,
}

#[derive(Serialize)]
struct GenerationResponse {
    images: Vec<ImagePayload>,
}

impl From<GeneratedImage> for ImagePayload {
    fn from(img: GeneratedImage) -> Self {
        Self {
            image: BASE64_STANDARD.encode(&img.image_data),
            seed: img.seed,
            steps: img.steps,
            width: img.width,
            height: img.height,
            elapsed_ms: img.elapsed.as_millis() as u64,
        }
    }
}

// Application state containing the preloaded model.
#[derive(Clone)]
struct AppState {
    model: TextToImageModel,
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerationRequest>,
) -> impl IntoResponse {
    match generate_images(req, &state).await {
        Ok(images) => Json(GenerationResponse { images }).into_response(),
        Err(e) => {
            error!("error generating image: {e:?}");
            let status = match e.downcast_ref::<Error>() {
                Some(Error::InvalidOptions(_)) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, format!("Error: {e}")).into_response()
        }
    }
}

/// Uses the preloaded model from `state` to generate one or more images.
async fn generate_images(req: GenerationRequest, state: &AppState) -> Result<Vec<ImagePayload>> {
    let images = if req.count <= 1 {
        vec![state.model.generate(&req.prompt, &req.options).await?]
    } else {
        state
            .model
            .generate_batch(&req.prompt, req.count, &req.options)
            .await?
    };
    Ok(images.into_iter().map(ImagePayload::from).collect())
}

/// Pulls the component files from the hub and returns the snapshot root.
async fn fetch_model(model_id: &str) -> Result<PathBuf> {
    info!(model = model_id, "fetching model from the hub");
    let api = Api::new()?;
    let repo = api.model(model_id.to_string());
    let tokenizer = repo.get("tokenizer/tokenizer.json").await?;
    for file in [
        "text_encoder/model.onnx",
        "unet/model.onnx",
        "vae_decoder/model.onnx",
    ] {
        repo.get(file).await?;
    }
    // Optional; the engine falls back to the built-in LCM schedule.
    if repo.get("scheduler/scheduler_config.json").await.is_err() {
        warn!("no scheduler config in {model_id}, using built-in schedule");
    }
    let root = tokenizer
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| anyhow::anyhow!("unexpected cache layout for {model_id}"))?;
    Ok(root.to_path_buf())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let model_dir = match args.model_dir {
        Some(dir) => dir,
        None => fetch_model(&args.model).await?,
    };
    let model = TextToImageModel::load(
        &model_dir,
        ModelDefinition::lcm_dreamshaper_v7(),
        device_map,
    )
    .await?;

    match model.warm_up().await {
        WarmupStatus::Completed { elapsed } => {
            info!(elapsed_ms = elapsed.as_millis() as u64, "warm-up finished")
        }
        WarmupStatus::Failed { reason } => warn!(%reason, "warm-up failed"),
    }

    // Build application state and wrap in Arc.
    let shared_state = Arc::new(AppState { model });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(shared_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
