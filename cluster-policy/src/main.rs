/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info, warn};

use cluster_policy::config::{EngineConfig, Strategy};
use cluster_policy::sim::{Scenario, Simulation};

// ── CLI argument definition ───────────────────────────────────────────────────

/// Replays a cluster scenario through the placement and power policy engine.
///
/// Example:
///   cluster-policy --scenario demos/mixed_cluster.yaml \
///                  --config demos/engine.yaml \
///                  --strategy energy_aware_bin_pack
#[derive(Debug, Parser)]
#[command(
    name = "cluster-policy",
    about = "Cluster placement and power-management policy engine",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML scenario (machines and task arrivals).
    #[arg(short = 's', long = "scenario")]
    scenario: PathBuf,

    /// Path to the YAML engine configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Strategy name; overrides the one in the configuration file.
    #[arg(long = "strategy")]
    strategy: Option<String>,
}

fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!(
        scenario = %cli.scenario.display(),
        config   = ?cli.config,
        strategy = ?cli.strategy,
        "Configuration"
    );

    // ── Engine configuration ──────────────────────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => match EngineConfig::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load engine configuration: {:#}", e);
                process::exit(1);
            }
        },
        None => {
            warn!("No engine configuration file provided, using defaults");
            EngineConfig::default()
        }
    };

    if let Some(name) = &cli.strategy {
        match name.parse::<Strategy>() {
            Ok(strategy) => config.strategy = strategy,
            Err(e) => {
                error!("{}", e);
                process::exit(2);
            }
        }
    }

    // ── Scenario ──────────────────────────────────────────────────────────────
    let scenario = match Scenario::load_from_file(&cli.scenario) {
        Ok(scenario) => scenario,
        Err(e) => {
            error!("Failed to load scenario: {:#}", e);
            process::exit(1);
        }
    };

    let simulation = match Simulation::new(&scenario, config) {
        Ok(sim) => sim,
        Err(e) => {
            error!("Failed to set up simulation: {:#}", e);
            process::exit(1);
        }
    };

    let summary = simulation.run();
    println!("{summary}");
}
