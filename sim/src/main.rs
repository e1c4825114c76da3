//! Cellular Protocol Stack Simulator
//!
//! Drives one simulated UE through registration, connection, data transfer
//! and teardown against in-process gNB and AMF peers.

mod config;
mod scenario;

use anyhow::Result;
use clap::Parser;
use common::logging::TracingSink;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::SimConfig;
use scenario::ScenarioReport;

/// Cellular protocol stack simulator (LTE/5G NR)
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "stack_sim.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Seed for the channel and network random generators
    #[arg(long)]
    seed: Option<u64>,

    /// Channel SNR in dB
    #[arg(long)]
    snr_db: Option<f32>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config is read before logging is up; a missing file is reported after init
    let config_present = args.config.exists();
    let mut config = if config_present {
        SimConfig::from_toml_file(&args.config)?
    } else {
        SimConfig::default()
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_line_number(true)
        .init();

    info!("Starting cellular protocol stack simulation");
    if config_present {
        info!("Configuration file: {}", args.config.display());
    } else {
        warn!(
            "Configuration file {} not found, using defaults",
            args.config.display()
        );
    }

    if let Some(seed) = args.seed {
        config.channel.seed = seed;
    }
    if let Some(snr_db) = args.snr_db {
        config.channel.snr_db = snr_db;
    }
    info!("Channel configuration:");
    info!("  MCS: {}", config.channel.mcs);
    info!("  PRBs: {}", config.channel.num_prbs);
    info!("  SNR: {:.1} dB", config.channel.snr_db);
    info!("  Seed: {}", config.channel.seed);

    // The simulated device is single-threaded; keep all of it on one blocking task
    let handle = tokio::task::spawn_blocking(move || scenario::run(&config, Arc::new(TracingSink)));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
        joined = handle => {
            match joined? {
                Ok(report) => print_report(&report, args.json),
                Err(e) => {
                    error!("Simulation failed: {:#}", e);
                    Err(e)
                }
            }
        }
    }
}

fn print_report(report: &ScenarioReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    info!("Simulation report:");
    info!("  SUPI: {}", report.supi);
    info!("  TMSI: {}", report.tmsi.as_deref().unwrap_or("-"));
    info!("  IP address: {}", report.ip_address.as_deref().unwrap_or("-"));
    info!("  RNTI: {}", report.rnti.as_deref().unwrap_or("-"));
    for (from, to) in &report.rrc_transitions {
        info!("  RRC {} -> {}", from, to);
    }
    info!("  Throughput: {:.2} Mbps", report.throughput_mbps);
    info!(
        "  Packets: sent={} delivered={} lost={}",
        report.packets_sent, report.packets_delivered, report.packets_lost
    );
    info!(
        "  HARQ: retx={} failures={} CRC errors={}",
        report.ue_stack.mac.harq_retransmissions,
        report.ue_stack.mac.harq_failures,
        report.crc_failures
    );
    info!(
        "  RLC: retx={} dropped={}",
        report.ue_stack.rlc.retransmissions, report.ue_stack.rlc.dropped
    );
    info!(
        "  Signalling: RRC {} UL / {} DL, NAS {} UL / {} DL",
        report.rrc_link.uplink_frames,
        report.rrc_link.downlink_frames,
        report.nas_link.uplink_frames,
        report.nas_link.downlink_frames
    );
    info!(
        "  Final state: {} / {}",
        report.final_rrc_state, report.final_registration_state
    );
    Ok(())
}
