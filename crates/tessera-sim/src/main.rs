//! Tessera replication simulator.
//!
//! Runs a multi-master cluster inside one process, drives a random
//! transaction workload against it while requests are lost on the way to
//! unreliable nodes, then repairs every node and checks that the replicas
//! converged.
//!
//! # Quick Start
//!
//! ```bash
//! # Five nodes, 200 transactions, one node in three loses requests
//! tessera-sim run --nodes 5 --transactions 200 --drop-rate 0.3
//!
//! # Print the default configuration
//! tessera-sim config
//! ```

mod simulation;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tessera_config::TesseraConfig;

use crate::simulation::{Simulation, SimulationOptions};

/// Tessera replication simulator.
#[derive(Parser)]
#[command(name = "tessera-sim")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload and check that the replicas converge.
    Run {
        /// Number of nodes in the cluster.
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Transactions to submit, spread over every node.
        #[arg(short, long, default_value = "100")]
        transactions: usize,

        /// Seed for the workload and fault schedule.
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Probability that a node loses its requests for one transaction.
        #[arg(long, default_value = "0.1")]
        drop_rate: f64,

        /// Number of clusters records are spread over.
        #[arg(long, default_value = "4")]
        clusters: u32,

        /// Configuration file; defaults to the built-in test configuration.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration as TOML.
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            nodes,
            transactions,
            seed,
            drop_rate,
            clusters,
            config,
            json,
        } => {
            anyhow::ensure!(nodes > 0, "--nodes must be positive");
            anyhow::ensure!(clusters > 0, "--clusters must be positive");
            anyhow::ensure!((0.0..=1.0).contains(&drop_rate), "--drop-rate must be within 0..=1");

            let base = match config {
                Some(path) => TesseraConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => TesseraConfig::testing(),
            };
            let options = SimulationOptions {
                nodes,
                transactions,
                seed,
                drop_rate,
                clusters,
            };
            let report = Simulation::start(base, &options)?.run(&options)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
            anyhow::ensure!(report.converged, "replicas did not converge");
        }
        Commands::Config => {
            print!("{}", TesseraConfig::default().to_toml_string()?);
        }
    }
    Ok(())
}
