//! RepGraph Simulator CLI
//!
//! Run deterministic replication scenarios against the relevance graph.

use clap::Parser;
use repgraph_core::GraphConfig;
use repgraph_sim::{ScenarioId, ScenarioResult, ScenarioRunner, SimConfig, SimError, SimWorld};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// RepGraph deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "repgraph-sim")]
#[command(about = "Run deterministic replication scenarios for RepGraph", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of player connections
    #[arg(short, long, default_value = "8")]
    connections: usize,

    /// Number of props spawned at startup
    #[arg(short, long, default_value = "400")]
    entities: usize,

    /// Ticks per scenario
    #[arg(short, long, default_value = "150")]
    ticks: u64,

    /// Scenario to run (crowd, streaming, status_flood, rewind, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Graph config as JSON (defaults to the simulator's class settings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the routing report of the configured graph
    #[arg(long)]
    report: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn load_config(path: &Path) -> Result<GraphConfig, SimError> {
    let json = std::fs::read_to_string(path).map_err(|source| SimError::ConfigIo {
        path: path.display().to_string(),
        source,
    })?;
    Ok(GraphConfig::from_json(&json)?)
}

/// Populated world for the routing report.
fn report_world(seed: u64, args: &Args, graph: &GraphConfig) -> Result<SimWorld, SimError> {
    let mut world = SimWorld::new(SimConfig {
        seed,
        num_connections: args.connections,
        num_entities: args.entities,
        graph: graph.clone(),
        ..SimConfig::default()
    })?;
    world.populate();
    Ok(world)
}

/// RUST_LOG directives win over `--verbose`.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(if verbose { "debug" } else { "info" }),
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(args.verbose, rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("RepGraph Simulator v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let graph_config = match &args.config {
        Some(path) => load_config(path).unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }),
        None => repgraph_sim::sim_graph_config(),
    };

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!("Available scenarios: crowd, streaming, status_flood, rewind, all");
            std::process::exit(1);
        })]
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let report = if args.report {
        match report_world(base_seed, &args, &graph_config) {
            Ok(world) => Some(world.graph().routing_report()),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };
    if let (Some(report), false) = (&report, args.json) {
        println!("{}", report);
    }

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    // Run simulations
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let runner = ScenarioRunner::new(seed, args.connections)
            .with_entities(args.entities)
            .with_ticks(args.ticks)
            .with_graph_config(graph_config.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "time_secs": r.final_time_secs,
                    "entities": r.final_entity_count,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                })
            }).collect::<Vec<_>>(),
            "report": report,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            // List failed seeds
            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
