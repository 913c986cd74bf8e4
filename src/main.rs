//! copilot-speaker: speaks code-assistant suggestions through the system TTS engine.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use copilot_speaker::api;
use copilot_speaker::config::{Config, ConfigStore};
use copilot_speaker::service::SpeakerService;
use copilot_speaker::source::HttpSuggestionFeed;
use copilot_speaker::speech::{CommandBackend, SystemEngine};

#[derive(Parser, Debug)]
#[command(name = "copilot-speaker", about = "Speak code-assistant suggestions aloud")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Speak this text once and exit
    #[arg(long)]
    say: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy HTTP internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,hyper=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("copilot-speaker starting");

    let config = Config::load(args.config.as_deref());
    info!("Voice config: {:?}", config.app.voice);

    let engine = SystemEngine::from_name(&config.speech.backend).unwrap_or_else(|| {
        warn!("Unknown speech backend '{}', using espeak-ng", config.speech.backend);
        SystemEngine::EspeakNg
    });

    let store = ConfigStore::new(config.app.clone())?;
    let service = Arc::new(SpeakerService::new(
        store,
        Arc::new(CommandBackend::new(engine)),
        Arc::new(HttpSuggestionFeed::new()),
    ));

    if let Some(text) = args.say {
        let result = service.speak_text(&text).await?;
        info!("Spoke in {:.0}ms", result.elapsed_ms);
        return Ok(());
    }

    if let Err(e) = service.initialize().await {
        warn!("{e}");
        info!("Continuing without suggestions; manual speech still available");
    }
    if let Err(e) = service.start() {
        warn!("Suggestion listening not started: {e}");
    }

    if config.api.enabled {
        api::start_api(service.clone(), config.api.port).await;
    }

    info!("Service ready (Ctrl-C to quit)");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    service.stop().await;

    Ok(())
}
