//! # capdispatch CLI Entry Point
//!
//! Runs synthetic load against a capacity-aware dispatcher and reports how
//! requests were admitted, rejected and completed.
//!
//! ## Usage
//!
//! ```bash
//! # Three nodes, 200 requests arriving every 5ms
//! capdispatch simulate -n a:4 -n b:4 -n c:8 --requests 200 --arrival-interval-ms 5
//!
//! # Nodes from a configuration file, plus one extra node
//! capdispatch simulate --config dispatcher.json -n spare:2
//!
//! # Validate a configuration file
//! capdispatch check-config dispatcher.json
//! ```
//!
//! ## Node Format
//!
//! Nodes given on the command line use `id:capacity`, e.g. `node-a:10`.
//! Logs go to stderr so the JSON report on stdout can be piped to `jq`.

use anyhow::{Context, Result};
use argh::FromArgs;
use capdispatch_cli::simulation::{Simulation, SimulationConfig};
use capdispatch_core::{DispatcherConfig, NodeConfig, TracingEventSink};
use capdispatch_metrics::DispatchMetricsCollector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(FromArgs)]
/// capdispatch - capacity-aware request dispatcher
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Simulate(SimulateArgs),
    CheckConfig(CheckConfigArgs),
}

/// Arguments for a simulation run.
///
/// The node set is the union of the configuration file (if any) and every
/// `-n` flag, in that order. Order matters: ties in load go to the node
/// listed first.
#[derive(FromArgs)]
#[argh(subcommand, name = "simulate")]
/// drive a dispatcher with synthetic load
struct SimulateArgs {
    /// node to dispatch to, as id:capacity (repeatable)
    #[argh(option, short = 'n', long = "node")]
    nodes: Vec<NodeConfig>,

    /// path to a JSON dispatcher configuration
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// number of requests to generate
    #[argh(option, default = "100")]
    requests: u64,

    /// milliseconds between request arrivals
    #[argh(option, long = "arrival-interval-ms", default = "10")]
    arrival_interval_ms: u64,

    /// shortest synthetic processing time in milliseconds
    #[argh(option, long = "min-processing-ms", default = "50")]
    min_processing_ms: u64,

    /// longest synthetic processing time in milliseconds
    #[argh(option, long = "max-processing-ms", default = "500")]
    max_processing_ms: u64,

    /// probability in [0, 1] that a request's work fails
    #[argh(option, long = "failure-rate", default = "0.0")]
    failure_rate: f64,

    /// seed for processing times and failures
    #[argh(option, default = "42")]
    seed: u64,

    /// load fraction above which a high-load event is emitted
    ///
    /// Overrides the value from the configuration file.
    #[argh(option, long = "high-load-threshold")]
    high_load_threshold: Option<f64>,

    /// per-request work timeout in milliseconds
    ///
    /// Overrides the value from the configuration file.
    #[argh(option, long = "work-timeout-ms")]
    work_timeout_ms: Option<u64>,
}

impl SimulateArgs {
    /// Merges the configuration file with the command-line overrides.
    fn dispatcher_config(&self) -> Result<DispatcherConfig> {
        let mut config = match &self.config {
            Some(path) => DispatcherConfig::from_path(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => DispatcherConfig::default(),
        };

        config.nodes.extend(self.nodes.iter().cloned());
        if let Some(threshold) = self.high_load_threshold {
            config.high_load_threshold = threshold;
        }
        if let Some(timeout_ms) = self.work_timeout_ms {
            config.work_timeout_ms = Some(timeout_ms);
        }

        config.validate()?;
        Ok(config)
    }

    fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            requests: self.requests,
            arrival_interval: Duration::from_millis(self.arrival_interval_ms),
            min_processing: Duration::from_millis(self.min_processing_ms),
            max_processing: Duration::from_millis(self.max_processing_ms),
            failure_rate: self.failure_rate,
            seed: self.seed,
        }
    }
}

#[derive(FromArgs)]
#[argh(subcommand, name = "check-config")]
/// validate a dispatcher configuration file
struct CheckConfigArgs {
    /// path to the JSON configuration
    #[argh(positional)]
    path: PathBuf,
}

async fn simulate(args: SimulateArgs) -> Result<()> {
    let dispatcher_config = args.dispatcher_config()?;
    let simulation_config = args.simulation_config();
    simulation_config
        .validate()
        .map_err(anyhow::Error::msg)?;

    let collector = Arc::new(DispatchMetricsCollector::new());
    let dispatcher = dispatcher_config
        .build()?
        .with_event_sink(Arc::new(TracingEventSink))
        .with_event_sink(collector.clone());

    let report = Simulation::new(Arc::new(dispatcher), simulation_config)
        .run()
        .await
        .map_err(anyhow::Error::msg)?;

    let output = serde_json::json!({
        "report": report,
        "metrics": collector.snapshot_json()?,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn check_config(args: CheckConfigArgs) -> Result<()> {
    let config = DispatcherConfig::from_path(&args.path)
        .with_context(|| format!("invalid configuration {}", args.path.display()))?;

    println!(
        "{}: {} node(s), total capacity {}",
        args.path.display(),
        config.nodes.len(),
        config.total_capacity()
    );
    for node in &config.nodes {
        println!("  {} capacity={}", node.id, node.capacity);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate(args) => simulate(args).await,
        Commands::CheckConfig(args) => check_config(args),
    }
}
