//! staged-whisper CLI - greedy speech-to-text over staged model artifacts

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use staged_whisper::{ModelConfig, VERSION};

/// staged-whisper - Whisper-style transcription over compiled stages
#[derive(Parser, Debug)]
#[command(name = "staged-whisper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use CPU even when a GPU is available
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transcribe an audio file
    Transcribe {
        /// Path to input audio (WAV)
        audio: PathBuf,

        /// Path to model config file
        #[arg(short, long, default_value = "whisper-tiny/config.yaml")]
        config: PathBuf,

        /// Maximum tokens to generate (overrides the config)
        #[arg(long)]
        max_length: Option<usize>,

        /// Print per-stage timing after decoding
        #[arg(long)]
        profile: bool,
    },

    /// Show model information
    Info {
        /// Path to model config file
        #[arg(short, long, default_value = "whisper-tiny/config.yaml")]
        config: PathBuf,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

#[cfg_attr(not(feature = "onnx"), allow(dead_code))]
fn create_progress_bar(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(msg.to_string());
    Ok(pb)
}

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        Ok(Device::cuda_if_available(0)?)
    }
}

#[cfg(feature = "onnx")]
fn transcribe(
    audio: PathBuf,
    config: PathBuf,
    max_length: Option<usize>,
    profile: bool,
    device: Device,
) -> Result<()> {
    use staged_whisper::runtime::OnnxStages;
    use staged_whisper::{StageTimings, Transcriber, WhisperTokenizer};

    let pb = create_progress_bar("Loading model...")?;
    let cfg = ModelConfig::load(&config).context("Failed to load config")?;
    let stages = OnnxStages::load(&cfg)?;
    let tokenizer = WhisperTokenizer::load(&cfg.artifacts.tokenizer)?;
    let mut transcriber = Transcriber::new(&cfg, Some(tokenizer), stages.as_stage_set(), &device)?;
    if let Some(max_length) = max_length {
        transcriber = transcriber.with_max_length(max_length);
    }
    pb.finish_with_message("Model loaded!");

    let pb = create_progress_bar("Transcribing...")?;
    let mut timings = StageTimings::new();
    let result = if profile {
        transcriber.transcribe(&audio, Some(&mut timings))?
    } else {
        transcriber.transcribe(&audio, None)?
    };
    pb.finish_and_clear();

    info!(
        "Generated {} tokens ({:?}), RTF {:.3}",
        result.tokens.len() - 1,
        result.stop_reason,
        result.real_time_factor()
    );
    result.timings.log_summary();
    if profile {
        timings.log_summary();
    }
    println!("{}", result.text.unwrap_or_default());
    Ok(())
}

#[cfg(not(feature = "onnx"))]
fn transcribe(
    _audio: PathBuf,
    _config: PathBuf,
    _max_length: Option<usize>,
    _profile: bool,
    _device: Device,
) -> Result<()> {
    anyhow::bail!("staged-whisper was built without a stage runtime; rebuild with --features onnx")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    info!("staged-whisper v{}", VERSION);

    match cli.command {
        Commands::Transcribe {
            audio,
            config,
            max_length,
            profile,
        } => {
            let device = select_device(cli.cpu)?;
            transcribe(audio, config, max_length, profile, device)
        }

        Commands::Info { config } => {
            info!("Loading config from {:?}", config);

            if config.exists() {
                let cfg = ModelConfig::load(&config).context("Failed to load config")?;
                let decoder = cfg.decoder_config(cfg.decoding.eos_token.unwrap_or_default(), cfg.dtype()?);
                println!("{:#?}", cfg);
                println!("Encoder input:  {:?}", decoder.feature_shape());
                println!("Encoder output: {:?}", decoder.hidden_shape());
                println!("Cache slots:    {}", 4 * decoder.cache.num_layers);
            } else {
                eprintln!("Config file not found: {:?}", config);
            }

            Ok(())
        }
    }
}
