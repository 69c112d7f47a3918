//! Agora - multi-agent consensus trading loop
//!
//! Reads market slices, runs them through the agent panel, consensus,
//! regime dispatch and risk gate, and persists state after every cycle.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use agora::broker::build_gateway;
use agora::config::{Config, DebatePolicy, Mode};
use agora::core::advisory::{AdvisoryClient, ChatCompletionsClient};
use agora::data::{open_store, spawn_feed, FeedSource};
use agora::engine::TradingEngine;

const SEP: &str = "===========================================================";

/// Slice channel depth between the feed task and the engine
const CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "agora", version, about = "Multi-agent consensus trading loop")]
struct Cli {
    /// Path to the TOML configuration
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides system.mode from the config
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// JSON-lines slice file; stdin when omitted
    #[arg(long)]
    replay: Option<PathBuf>,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c, running until the feed ends");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load {}: {:#}. Exiting.", cli.config.display(), e);
        std::process::exit(1);
    });

    let level = cfg.system.log_level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mode = cli.mode.unwrap_or(cfg.system.mode);
    if mode == Mode::Backtest && cli.replay.is_none() {
        bail!("backtest mode needs --replay <file>");
    }

    info!("{}", SEP);
    info!("  {} - multi-agent consensus trading", cfg.system.name);
    info!(
        "  Mode: {} | Agents: {} | Debate: {:?}",
        mode.as_str(),
        cfg.agents.len(),
        cfg.consensus.debate
    );
    info!("{}", SEP);

    let needs_advisory =
        cfg.agents.iter().any(|a| a.advisory) || cfg.consensus.debate == DebatePolicy::Advisory;
    let advisory: Option<Arc<dyn AdvisoryClient>> = if needs_advisory {
        let client = ChatCompletionsClient::from_config(&cfg.advisory).context("advisory client")?;
        Some(Arc::new(client))
    } else {
        None
    };

    let gateway = build_gateway(mode, &cfg.execution)?;
    let store = open_store(&cfg.state)?;
    let mut engine = TradingEngine::from_config(&cfg, gateway.clone(), store, advisory)?;
    engine.resume()?;
    info!(gateway = gateway.name(), status = %engine.risk().status(), "engine ready");

    let source = match cli.replay {
        Some(path) => FeedSource::Replay(path),
        None => FeedSource::Stdin,
    };
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let feed = spawn_feed(source, tx).await?;

    let summary = engine.run(rx, shutdown_signal()).await?;

    // A stdin read can block forever once the engine has stopped
    feed.abort();
    match feed.await {
        Ok(stats) => info!(
            forwarded = stats.forwarded,
            malformed = stats.malformed,
            out_of_order = stats.out_of_order,
            "feed finished"
        ),
        Err(e) if e.is_cancelled() => info!("feed stopped"),
        Err(e) => warn!(error = %e, "feed task failed"),
    }

    info!("{}", SEP);
    info!("  Cycles: {}", summary.cycles);
    for (outcome, count) in &summary.outcomes {
        info!("  {:<15} {}", outcome, count);
    }
    info!("{}", SEP);
    Ok(())
}
