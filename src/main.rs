//! ocr-bench - Side-by-side OCR engine harness
//!
//! Runs Tesseract and PaddleOCR on the same image, writes one annotated
//! overlay per engine and prints initialization and recognition timings.

mod config;
mod harness;
mod overlay;
mod storage;
mod vision;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::AppConfig;
use crate::harness::HarnessController;
use crate::vision::{EngineAdapter, OcrAdapter, OcrBackend, PaddleAdapter, TesseractAdapter};

/// ocr-bench - compare OCR engines on one image
#[derive(Parser, Debug)]
#[command(name = "ocr-bench")]
#[command(about = "Time Tesseract and PaddleOCR on an image and draw what they found")]
struct Args {
    /// Image to recognize
    #[arg(required_unless_present = "write_config")]
    image: Option<PathBuf>,

    /// Engines to run
    #[arg(short, long, value_enum, default_value_t = EngineChoice::Both)]
    engine: EngineChoice,

    /// Directory overlay PNGs are written to (overrides config)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print each engine's native result as JSON
    #[arg(long)]
    raw: bool,

    /// Write the effective configuration to the config file and exit if no image is given
    #[arg(long)]
    write_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineChoice {
    Both,
    Tesseract,
    Paddle,
}

impl EngineChoice {
    fn backends(self) -> &'static [OcrBackend] {
        match self {
            EngineChoice::Both => &OcrBackend::ALL,
            EngineChoice::Tesseract => &[OcrBackend::Tesseract],
            EngineChoice::Paddle => &[OcrBackend::Paddle],
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => storage::get_config_dir()?.join("config.toml"),
    };
    let (config, loaded) = load_or_default_config(&config_path, args.config.is_some(), args.write_config)?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if loaded {
        info!("Loaded configuration from {:?}", config_path);
    } else {
        info!("Using default configuration");
    }

    if args.write_config {
        config::save_config(&config, &config_path)
            .with_context(|| format!("Failed to write {:?}", config_path))?;
        println!("Wrote configuration to {}", config_path.display());
    }

    let Some(image) = args.image.clone() else {
        return Ok(());
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(&args, &image, config))
}

/// Load `path` if it exists. An explicitly requested file must exist and parse,
/// unless it is about to be created with `--write-config`.
fn load_or_default_config(path: &Path, explicit: bool, create: bool) -> Result<(AppConfig, bool)> {
    let exists = path.exists();
    if exists || (explicit && !create) {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?;
        return Ok((config, true));
    }
    Ok((AppConfig::default(), false))
}

fn build_adapter(backend: OcrBackend, config: &AppConfig) -> Result<EngineAdapter> {
    let adapter = match backend {
        OcrBackend::Tesseract => TesseractAdapter::cli(config.tesseract.clone()).into(),
        OcrBackend::Paddle => {
            let models_dir = match &config.paddle.models_dir {
                Some(dir) => dir.clone(),
                None => storage::get_models_dir()?,
            };
            PaddleAdapter::onnx(config.paddle.clone(), models_dir).into()
        }
    };
    Ok(adapter)
}

async fn run(args: &Args, image: &Path, config: AppConfig) -> Result<()> {
    let out_dir = args
        .out_dir
        .clone()
        .unwrap_or_else(|| config.general.output_dir.clone());

    let mut harness = HarnessController::new(&config);
    for &backend in args.engine.backends() {
        let adapter = build_adapter(backend, &config)?;
        harness.add_adapter(Arc::new(adapter));
    }

    let source = harness
        .select_file(image)
        .await
        .with_context(|| format!("Failed to open {}", image.display()))?;

    for (id, outcome) in harness.initialize_all().await {
        if let Err(e) = outcome {
            let name = harness.adapter(id).map(|a| a.name().to_string()).unwrap_or_default();
            eprintln!("{} unavailable: {}", name, e);
        }
    }

    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("Failed to create {:?}", out_dir))?;
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    let mut succeeded = 0;
    for (id, outcome) in harness.run_all().await {
        let Some(adapter) = harness.adapter(id) else {
            continue;
        };
        let engine = adapter.name().to_lowercase();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{}", e);
                eprintln!("{} failed: {}", adapter.name(), e);
                continue;
            }
        };
        succeeded += 1;

        println!(
            "{}: {} regions in {}",
            adapter.name(),
            outcome.result.annotations.len(),
            outcome.image
        );
        for annotation in &outcome.result.annotations {
            match annotation.confidence() {
                Some(confidence) => println!("  {:>5.1}  {}", confidence, annotation.text()),
                None => println!("      -  {}", annotation.text()),
            }
        }
        if args.raw {
            println!("{}", serde_json::to_string_pretty(&outcome.result.raw)?);
        }

        if let Some(surface) = harness.surface(id) {
            let path = out_dir.join(format!("{stem}.{engine}.png"));
            surface.lock().save(&path)?;
            println!("  overlay: {}", path.display());
        }
        if let Some(diagnostics) = harness.diagnostics(id) {
            let surface = diagnostics.lock();
            if surface.is_empty() {
                warn!("{} drew no diagnostics", adapter.name());
            } else {
                let path = out_dir.join(format!("{stem}.{engine}.diagnostics.png"));
                surface.save(&path)?;
                println!("  diagnostics: {}", path.display());
            }
        }
    }

    println!();
    for row in harness.timings() {
        println!("{}", row);
    }

    harness.dispose_all();

    if succeeded == 0 {
        anyhow::bail!("No engine recognized {}", source.name());
    }
    Ok(())
}
