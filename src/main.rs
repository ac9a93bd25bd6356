use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use handscript::{
    api::{self, AppState},
    config::ServiceConfig,
    evaluation, HandwritingOcr,
};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Handwriting recognition service
#[derive(Parser, Debug)]
#[command(name = "handscript", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, env = "HANDSCRIPT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory that relative model paths resolve against
    #[arg(long, env = "HANDSCRIPT_MODELS_DIR", global = true)]
    models_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "HANDSCRIPT_BIND")]
        bind: Option<SocketAddr>,
    },
    /// Transcribe image files and print the result
    Recognize {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Score `ground_truth<TAB>prediction` lines
    Evaluate { pairs: PathBuf },
}

fn load_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(models_dir) = &cli.models_dir {
        config.inference.models_dir = models_dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Serve { bind } => {
            let mut config = load_config(&cli)?;
            if let Some(bind) = bind {
                config.server.bind = *bind;
            }
            let ocr = HandwritingOcr::from_config(&config).context("Failed to build pipeline")?;
            let store = config.storage.open().context("Failed to open storage")?;
            api::serve(AppState::new(Arc::new(ocr), store), &config.server).await?;
        }
        Command::Recognize { images } => {
            let config = load_config(&cli)?;
            let ocr = HandwritingOcr::from_config(&config).context("Failed to build pipeline")?;
            for path in images {
                let image = image::open(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
                let start = Instant::now();
                let transcription = ocr.recognize(&image).await?;
                log::debug!("{:?}", start.elapsed());
                println!(
                    "{}\t{:.4}\t{}",
                    path.display(),
                    transcription.confidence,
                    transcription.text
                );
            }
        }
        Command::Evaluate { pairs } => {
            let report = evaluation::evaluate_file(pairs)
                .with_context(|| format!("Failed to read {}", pairs.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
