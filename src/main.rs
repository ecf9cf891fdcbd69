use anyhow::{Context, Result};
use boxwatch::{storage::open_store, Config, Engine, EngineEvent};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "boxwatch", version, about = "BF-2300 box polling and alarm engine")]
struct Args {
    /// YAML configuration file
    #[arg(default_value = "boxwatch.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Print every engine event as a JSON line on stdout
    #[arg(long)]
    print_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    boxwatch::init_logging();
    let args = Args::parse();

    info!("BOXWATCH v{} starting", boxwatch::VERSION);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let total_boxes = config.boxes().count();
    let invalid: Vec<String> = config
        .boxes()
        .filter_map(|(_, bx)| bx.validate().err().map(|e| e.to_string()))
        .collect();
    info!("Loaded {} sites, {} boxes", config.sites.len(), total_boxes);
    for reason in &invalid {
        warn!("{}", reason);
    }

    if args.check {
        println!(
            "{}: {} sites, {} boxes ({} disabled)",
            args.config.display(),
            config.sites.len(),
            total_boxes,
            invalid.len()
        );
        return Ok(());
    }

    let store = open_store(&config.storage)
        .await
        .context("opening alarm store")?;
    let engine = Engine::new(config, store).context("building engine")?;

    if args.print_events {
        let mut events = engine.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(missed)) => warn!("Event printer lagged, {} events missed", missed),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    engine.start().await;

    if let Err(e) = signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    engine.stop().await;
    let open = engine.open_alarms().await.map(|a| a.len()).unwrap_or(0);
    info!("Engine stopped normally, {} alarms still open", open);
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Cannot serialize {} event: {}", event.name(), e),
    }
}
