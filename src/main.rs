use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufReader};
use timeinstate::cli::{Cli, OutputFormat};
use timeinstate::config::TopologyConfig;
use timeinstate::replay;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn read_events(args: &Cli) -> Result<Vec<replay::Event>> {
    if args.events_from_stdin() {
        return replay::parse_events(io::stdin().lock()).context("Failed to parse events from stdin");
    }
    let file = File::open(&args.events)
        .with_context(|| format!("Failed to open event log {}", args.events.display()))?;
    replay::parse_events(BufReader::new(file))
        .with_context(|| format!("Failed to parse event log {}", args.events.display()))
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let topology = TopologyConfig::from_path(&args.topology)?;
    let engine = topology
        .build_engine()
        .context("Failed to apply topology")?;

    let events = read_events(&args)?;
    let stats = replay::replay(&engine, events);
    tracing::info!(
        switches = stats.switches,
        freq_changes = stats.freq_changes,
        attributed_ns = stats.attributed_ns,
        dropped = stats.dropped,
        "events replayed"
    );

    let mut snapshot = engine.snapshot();
    if let Some(uid) = args.uid {
        snapshot.retain_uid(uid);
    }

    match args.format {
        OutputFormat::Text => print!("{snapshot}"),
        OutputFormat::Json => println!("{}", snapshot.to_json()?),
    }

    Ok(())
}
