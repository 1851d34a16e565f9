use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use candle_core::{DType, Device};
use clap::{Parser, Subcommand};
use var_core::{
    engine::{start_engine, EngineConfig, EngineHandle, GenerationRequest},
    loader::{self, DEFAULT_CLIP_REPO, DEFAULT_MODEL_REPO},
    pipeline::DEFAULT_MAX_BATCH_SIZE,
    GenerationConfig,
};

use var_server::api::{self, AppState, LoadState};
use var_server::config::{ServerConfig, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_SHUTDOWN_TIMEOUT};
use var_server::logging;
use var_server::shutdown::shutdown_signal;

#[derive(Parser)]
#[command(name = "var-server", about = "VAR text-to-image generation server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Generate one image from a prompt (CLI mode)
    Generate(GenerateArgs),
    /// Inspect or edit the persistent config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Hub repository with the VAR and VQVAE checkpoints
    #[arg(long)]
    model_repo: Option<String>,

    /// Hub repository with the CLIP text encoder
    #[arg(long)]
    clip_repo: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Maximum prompts per batch request
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Generations running at once
    #[arg(long)]
    num_workers: Option<usize>,

    /// Requests allowed to wait for a worker before 503
    #[arg(long)]
    max_queue_depth: Option<usize>,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Comma-separated allowed CORS origins ("*" for all)
    #[arg(long)]
    allowed_origins: Option<String>,

    /// Comma-separated allowed CORS methods
    #[arg(long)]
    allowed_methods: Option<String>,

    /// Comma-separated allowed CORS headers ("*" for all)
    #[arg(long)]
    allowed_headers: Option<String>,

    /// Weight data type: auto, f32, f16, bf16
    #[arg(long)]
    dtype: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Run on CPU even when an accelerator is available
    #[arg(long)]
    cpu: bool,
}

impl ServeArgs {
    fn as_config(&self) -> ServerConfig {
        ServerConfig {
            model_repo: self.model_repo.clone(),
            clip_repo: self.clip_repo.clone(),
            port: self.port,
            host: self.host.clone(),
            max_batch_size: self.max_batch_size,
            num_workers: self.num_workers,
            max_queue_depth: self.max_queue_depth,
            shutdown_timeout: self.shutdown_timeout,
            allowed_origins: self.allowed_origins.clone(),
            allowed_methods: self.allowed_methods.clone(),
            allowed_headers: self.allowed_headers.clone(),
            dtype: self.dtype.clone(),
            log_level: self.log_level.clone(),
            cpu: self.cpu.then_some(true),
        }
    }
}

#[derive(clap::Args)]
struct GenerateArgs {
    /// Text prompt
    #[arg(long)]
    prompt: String,

    /// Output PNG path
    #[arg(long, default_value = "generated_image.png")]
    output: PathBuf,

    /// Classifier-free guidance scale
    #[arg(long, default_value_t = 1.5)]
    cfg_scale: f32,

    /// Top-k filter (0 disables)
    #[arg(long, default_value_t = 900)]
    top_k: usize,

    /// Nucleus filter (0 disables)
    #[arg(long, default_value_t = 0.96)]
    top_p: f32,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    model_repo: Option<String>,

    #[arg(long)]
    clip_repo: Option<String>,

    /// Weight data type: auto, f32, f16, bf16
    #[arg(long)]
    dtype: Option<String>,

    /// Run on CPU even when an accelerator is available
    #[arg(long)]
    cpu: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current config file
    Show,
    /// Set one key and save
    Set { key: String, value: String },
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            let mut cfg = ServerConfig::load();
            if let Some(path) = ServerConfig::default_path() {
                if path.exists() {
                    eprintln!("Loaded config from: {}", path.display());
                }
            }
            // CLI takes precedence
            cfg.merge(&args.as_config());
            run_server(cfg).await
        }
        Command::Generate(args) => run_generate(args, ServerConfig::load()).await,
        Command::Config { action } => run_config(action),
    }
}

fn parse_dtype(name: &str, device: &Device) -> anyhow::Result<DType> {
    match name {
        "auto" if device.is_cpu() => Ok(DType::F32),
        "auto" => Ok(DType::BF16),
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "fp16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => anyhow::bail!("unsupported dtype '{other}' (expected auto, f32, f16, bf16)"),
    }
}

fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

async fn run_server(cfg: ServerConfig) -> anyhow::Result<()> {
    logging::init(cfg.log_level.as_deref().unwrap_or("info"))?;

    let host = cfg.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = cfg.port.unwrap_or(DEFAULT_PORT);
    let shutdown_timeout = Duration::from_secs(
        cfg.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
    );
    let max_batch_size = cfg.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE);
    let model_repo = cfg
        .model_repo
        .clone()
        .unwrap_or_else(|| DEFAULT_MODEL_REPO.to_string());
    let clip_repo = cfg
        .clip_repo
        .clone()
        .unwrap_or_else(|| DEFAULT_CLIP_REPO.to_string());

    let device = loader::select_device(cfg.cpu.unwrap_or(false))?;
    let dtype = parse_dtype(cfg.dtype.as_deref().unwrap_or("auto"), &device)?;
    let defaults = EngineConfig::default();
    let engine = start_engine(EngineConfig {
        num_workers: cfg.num_workers.unwrap_or(defaults.num_workers),
        max_queue_depth: cfg.max_queue_depth.unwrap_or(defaults.max_queue_depth),
    });

    let load = Arc::new(LoadState::default());
    let accepting = Arc::new(AtomicBool::new(true));
    let state = AppState::new(
        engine.clone(),
        load.clone(),
        device_label(&device).to_string(),
        max_batch_size,
        accepting.clone(),
    );

    let defaults = api::CorsConfig::default();
    let cors_config = api::CorsConfig {
        allowed_origins: cfg.allowed_origins.unwrap_or(defaults.allowed_origins),
        allowed_methods: cfg.allowed_methods.unwrap_or(defaults.allowed_methods),
        allowed_headers: cfg.allowed_headers.unwrap_or(defaults.allowed_headers),
    };
    let app = api::create_router_with_cors(state, api::build_cors_layer(&cors_config));

    // Bind before loading so the health endpoints answer during the download.
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, device = device_label(&device), ?dtype, "Serving on http://{addr}");

    tokio::spawn(load_in_background(
        engine.clone(),
        load,
        model_repo,
        clip_repo,
        dtype,
        device,
        max_batch_size,
    ));

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(accepting).await;
            let _ = signalled_tx.send(());
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        () = async {
            if signalled_rx.await.is_ok() {
                tracing::info!(
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Stopped accepting requests, waiting for in-flight requests to complete"
                );
                tokio::time::sleep(shutdown_timeout).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            tracing::warn!(
                timeout_secs = shutdown_timeout.as_secs(),
                "In-flight requests did not finish in time, forcing exit"
            );
        }
    }

    match tokio::time::timeout(Duration::from_secs(5), engine.shutdown()).await {
        Ok(Ok(())) => tracing::info!("Engine shut down cleanly"),
        Ok(Err(e)) => tracing::error!("Engine shutdown returned an error: {e}"),
        Err(_) => tracing::warn!("Engine shutdown timed out"),
    }

    tracing::info!(stats = ?engine.stats(), "Shutdown complete");
    Ok(())
}

async fn load_in_background(
    engine: EngineHandle,
    load: Arc<LoadState>,
    model_repo: String,
    clip_repo: String,
    dtype: DType,
    device: Device,
    max_batch_size: usize,
) {
    tracing::info!(model_repo, clip_repo, "Loading models");
    let loaded = tokio::task::spawn_blocking(move || {
        let files = loader::fetch_model(&model_repo, &clip_repo)?;
        let pipeline = loader::load_pipeline(&files, dtype, &device, |component| {
            load.mark_loaded(component)
        })?;
        anyhow::Ok(pipeline.with_max_batch_size(max_batch_size))
    })
    .await;

    match loaded {
        Ok(Ok(pipeline)) => match engine.install(Arc::new(pipeline)).await {
            Ok(()) => tracing::info!("Models loaded, ready to serve"),
            Err(e) => tracing::error!("Failed to install pipeline: {e}"),
        },
        Ok(Err(e)) => tracing::error!("Model loading failed: {e:#}"),
        Err(e) => tracing::error!("Model loading task panicked: {e}"),
    }
}

async fn run_generate(args: GenerateArgs, file_config: ServerConfig) -> anyhow::Result<()> {
    let config = GenerationConfig {
        cfg_scale: args.cfg_scale,
        top_k: args.top_k,
        top_p: args.top_p,
        seed: args.seed,
    };
    let model_repo = args
        .model_repo
        .or(file_config.model_repo)
        .unwrap_or_else(|| DEFAULT_MODEL_REPO.to_string());
    let clip_repo = args
        .clip_repo
        .or(file_config.clip_repo)
        .unwrap_or_else(|| DEFAULT_CLIP_REPO.to_string());
    let device = loader::select_device(args.cpu || file_config.cpu.unwrap_or(false))?;
    let dtype = parse_dtype(
        args.dtype
            .or(file_config.dtype)
            .as_deref()
            .unwrap_or("auto"),
        &device,
    )?;

    eprintln!("Loading models: {model_repo} + {clip_repo}");
    let prompt = args.prompt;
    let images = tokio::task::spawn_blocking(move || {
        let files = loader::fetch_model(&model_repo, &clip_repo)?;
        eprintln!(
            "Building pipeline ({} layers, {} scales, {:?} on {})...",
            files.config.depth,
            files.config.patch_nums.len(),
            dtype,
            device_label(&device)
        );
        let pipeline = loader::load_pipeline(&files, dtype, &device, |_| {})?;
        eprintln!("Generating: \"{prompt}\"");
        let request = GenerationRequest::single(prompt, config);
        anyhow::Ok(pipeline.generate_images(&request, &AtomicBool::new(false))?)
    })
    .await??;

    let image = images
        .first()
        .ok_or_else(|| anyhow::anyhow!("pipeline produced no image"))?;
    std::fs::write(&args.output, var_core::image::encode_png(image)?)?;
    println!("{}", args.output.display());
    Ok(())
}

fn run_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", ServerConfig::load().to_toml()?);
        }
        ConfigAction::Set { key, value } => {
            let mut cfg = ServerConfig::load();
            cfg.set(&key, &value)?;
            let path = cfg.save()?;
            eprintln!("Set {key} = {value} in {}", path.display());
        }
        ConfigAction::Path => match ServerConfig::default_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("no config directory available on this platform"),
        },
    }
    Ok(())
}
