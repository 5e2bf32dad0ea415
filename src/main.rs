use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use depthsync::engine::aggregator::DepthView;
use depthsync::market_data::normaliser::Normaliser;
use depthsync::{telemetry, BookStatus, DepthFeed, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "depthsync", about = "Keep a live order book in sync and print its depth")]
struct Args {
    /// Symbol to follow, e.g. BTCUSDT
    #[arg(short, long, default_value = "BTCUSDT")]
    symbol: String,

    /// Optional TOML config file; DEPTHSYNC_* env vars override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info,depthsync=info")]
    log: String,

    /// Print each view as one JSON line instead of a table
    #[arg(long)]
    json_view: bool,

    /// Serve Prometheus metrics on this port (needs the metrics-exporter feature)
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env
    let args = Args::parse();
    telemetry::init_tracing(&args.log);
    if let Some(port) = args.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let config = SyncConfig::load(args.config.as_deref())?;
    let normaliser = Normaliser::from_venue(&config.venue);
    let feed = DepthFeed::binance(config).context("failed to build depth feed")?;
    let sub = feed.subscribe(&args.symbol)?;
    info!(symbol = %sub.symbol(), "following depth");

    let mut views = sub.views();
    let mut status = sub.status();
    let mut walls = sub.walls();
    let mut exit_code = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                if let Some(view) = view {
                    print_view(&view, &normaliser, args.json_view)?;
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if let Some(code) = report_status(&current) {
                    exit_code = code;
                    break;
                }
            }
            Ok(wall) = walls.recv() => {
                info!(
                    side = ?wall.side,
                    price = %normaliser.format_price(wall.price),
                    share_bps = wall.share_bps,
                    "wall"
                );
            }
        }
    }

    sub.unsubscribe();
    feed.shutdown();
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

// Returns an exit code once the subscription can no longer recover.
fn report_status(status: &BookStatus) -> Option<i32> {
    match status {
        BookStatus::Syncing => info!("syncing book"),
        BookStatus::Live => info!("book live"),
        BookStatus::Degraded(reason) => warn!(%reason, "book degraded, still retrying"),
        BookStatus::Unavailable(reason) => {
            tracing::error!(%reason, "book unavailable");
            return Some(2);
        }
    }
    None
}

fn print_view(view: &DepthView, norm: &Normaliser, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(view)?);
        return Ok(());
    }

    println!(
        "\n=== {} | update {} | grouping {} | spread {} ===",
        view.symbol,
        view.last_update_id,
        norm.format_price(view.grouping),
        view.spread.map(|s| norm.format_price(s)).unwrap_or_else(|| "n/a".into()),
    );
    for ask in view.asks.iter().rev() {
        println!(
            "  ASK {:>16} {:>18} {:>18}{}",
            norm.format_price(ask.price),
            norm.format_size(ask.size),
            norm.format_size(ask.cumulative),
            if ask.is_wall { "  <- wall" } else { "" }
        );
    }
    println!("  {}", "-".repeat(56));
    for bid in &view.bids {
        println!(
            "  BID {:>16} {:>18} {:>18}{}",
            norm.format_price(bid.price),
            norm.format_size(bid.size),
            norm.format_size(bid.cumulative),
            if bid.is_wall { "  <- wall" } else { "" }
        );
    }
    Ok(())
}
