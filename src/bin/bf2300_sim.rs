// src/bin/bf2300_sim.rs
use anyhow::{bail, Context, Result};
use boxwatch::simulator::{BoxSimulator, SimMode};
use clap::{Parser, ValueEnum};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "bf2300_sim")]
#[command(about = "Simulate a BF-2300 remote I/O box", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// Initial input level, e.g. `--pin 7=1` (repeatable)
    #[arg(short, long = "pin", value_parser = parse_pin)]
    pins: Vec<(u8, bool)>,

    /// Toggle one random input among the first `inputs` every N seconds
    #[arg(long)]
    flap_secs: Option<u64>,

    /// Number of inputs eligible for flapping
    #[arg(long, default_value = "12")]
    inputs: u8,

    #[arg(long, value_enum, default_value = "normal")]
    mode: Mode,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Normal,
    Mute,
    UnknownFirst,
    Corrupt,
}

impl From<Mode> for SimMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Normal => SimMode::Normal,
            Mode::Mute => SimMode::Mute,
            Mode::UnknownFirst => SimMode::UnknownCommandFirst,
            Mode::Corrupt => SimMode::CorruptChecksum,
        }
    }
}

fn parse_pin(s: &str) -> std::result::Result<(u8, bool), String> {
    let (pin, level) = s
        .split_once('=')
        .ok_or_else(|| format!("expected PIN=LEVEL, got '{}'", s))?;
    let pin: u8 = pin.trim().parse().map_err(|e| format!("bad pin '{}': {}", pin, e))?;
    let level = match level.trim() {
        "1" | "high" | "true" => true,
        "0" | "low" | "false" => false,
        other => return Err(format!("bad level '{}'", other)),
    };
    Ok((pin, level))
}

#[tokio::main]
async fn main() -> Result<()> {
    boxwatch::init_logging();
    let cli = Cli::parse();
    if cli.inputs == 0 || cli.inputs > 32 {
        bail!("--inputs must be within 1..=32");
    }

    let sim = BoxSimulator::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    sim.set_mode(cli.mode.into());
    for (pin, level) in &cli.pins {
        sim.set_input(*pin, *level)?;
    }
    info!("Simulated box on {} ({} preset pins)", sim.local_addr(), cli.pins.len());

    match cli.flap_secs {
        Some(secs) => {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        let pin = rand::thread_rng().gen_range(1..=cli.inputs);
                        let level = !sim.input(pin).unwrap_or(false);
                        sim.set_input(pin, level)?;
                        info!(pin, level, "flapped input");
                    }
                }
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Served {} requests", sim.requests());
    sim.shutdown().await;
    Ok(())
}
