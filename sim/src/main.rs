//! Albor RLC AM Simulator
//!
//! Runs a transmitting and a receiving RLC AM peer against each other over
//! an emulated radio link and reports what got through.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use interfaces::TraceWriter;

mod config;
mod scenario;

use config::SimConfig;
use scenario::Simulation;

/// Albor RLC AM link simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to scenario file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seed of the link impairments and the generated traffic
    #[arg(short, long, default_value = "1")]
    seed: u64,

    /// Give up after this many simulated milliseconds
    #[arg(short, long, default_value = "60000")]
    duration_ms: u64,

    /// Write a JSON-lines record of every PDU to this file
    #[arg(short, long)]
    trace: Option<String>,

    /// Do not pace the simulation to wall-clock time
    #[arg(long)]
    fast: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor RLC AM simulator");
    info!("Loading scenario from {}", args.config);
    let cfg = SimConfig::from_toml_file(&args.config)?;

    let mut sim = Simulation::new(&cfg, args.seed)?;
    if let Some(path) = &args.trace {
        info!("Tracing PDUs to {}", path);
        sim.set_trace(TraceWriter::create(path)?);
    }

    let running = Arc::new(RwLock::new(true));

    let mut sim_handle = {
        let running = running.clone();
        let fast = args.fast;
        let duration_ms = args.duration_ms;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while *running.read().await {
                if fast {
                    tokio::task::yield_now().await;
                } else {
                    interval.tick().await;
                }

                if sim.step()? {
                    info!("All SDUs delivered after {} ms", sim.now());
                    break;
                }
                if sim.now() >= duration_ms {
                    warn!("Stopping after {} ms without full delivery", duration_ms);
                    break;
                }
            }
            sim.finish()
        })
    };

    let report = tokio::select! {
        res = &mut sim_handle => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            *running.write().await = false;
            sim_handle.await??
        }
    };

    info!(
        "Delivered {}/{} SDUs in {} ms (in order: {})",
        report.sdus_delivered, report.sdus_offered, report.elapsed_ms, report.in_order
    );
    info!(
        "Retransmitted PDUs: {}, max retx events: {}",
        report.tx_metrics.num_retx_pdus, report.max_retx_events
    );
    info!(
        "Downlink: sent {} dropped {} duplicated {} reordered {}",
        report.downlink.sent,
        report.downlink.dropped,
        report.downlink.duplicated,
        report.downlink.reordered
    );
    info!(
        "Uplink: sent {} dropped {} duplicated {} reordered {}",
        report.uplink.sent, report.uplink.dropped, report.uplink.duplicated, report.uplink.reordered
    );
    info!("Report: {}", serde_json::to_string(&report)?);

    info!("Simulator shutdown complete");
    Ok(())
}
