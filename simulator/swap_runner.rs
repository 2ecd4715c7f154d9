// Swap Runner - Load and execute swap experiment YAML files
//
// Usage:
//   cargo run --release --bin swap_runner scenarios/baseline.yaml
//   cargo run --release --bin swap_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --release --bin swap_runner scenarios/baseline.yaml --seed 1234

mod csv_output;

use log::{error, info, LevelFilter};
use peerswap::{Experiment, ExperimentResult, SwapSimConfig};
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed SEED]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/baseline.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/latency.yaml --seed 7", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);

    // Optional seed override
    let seed: Option<u64> = if args.len() >= 4 && args[2] == "--seed" {
        Some(args[3].parse().unwrap_or_else(|e| {
            eprintln!("Invalid seed {}: {}", args[3], e);
            std::process::exit(1);
        }))
    } else {
        None
    };

    let scenarios = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        find_scenarios(path)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    let configs: Vec<(PathBuf, SwapSimConfig)> = scenarios
        .into_iter()
        .map(|scenario| {
            let mut config = SwapSimConfig::load(&scenario).unwrap_or_else(|e| {
                eprintln!("Failed to load {}: {}", scenario.display(), e);
                std::process::exit(1);
            });
            if let Some(seed) = seed {
                config.seed = seed;
            }
            (scenario, config)
        })
        .collect();

    // one logger for the whole process, leveled by the first scenario
    let level = configs
        .first()
        .map(|(_, config)| config.log_level.as_str())
        .unwrap_or("info");
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("Failed to initialise logger: {}", e);
    }

    let total = configs.len();
    for (i, (scenario, config)) in configs.into_iter().enumerate() {
        if total > 1 {
            println!("\n{}/{} Running: {}\n", i + 1, total, scenario.display());
        }
        if !run_scenario(&scenario, config) {
            std::process::exit(1);
        }
    }
}

fn find_scenarios(dir: &Path) -> Vec<PathBuf> {
    let mut scenarios = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if ext == Some("yaml") || ext == Some("yml") {
                scenarios.push(path);
            }
        }
    }
    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }
    scenarios
}

fn run_scenario(path: &Path, config: SwapSimConfig) -> bool {
    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  Swap experiment: {:<37}║", config.run_label());
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Scenario: {}", path.display());

    let experiment = match Experiment::new(config) {
        Ok(experiment) => experiment,
        Err(e) => {
            error!("setup of {} failed: {}", path.display(), e);
            return false;
        }
    };
    print_configuration(experiment.config());

    let started = Instant::now();
    let result = match experiment.run() {
        Ok(result) => result,
        Err(e) => {
            error!("experiment {} failed: {}", path.display(), e);
            return false;
        }
    };
    let elapsed = started.elapsed();

    print_summary(&result, elapsed.as_secs_f64());

    match csv_output::write_experiment(experiment.config(), &result) {
        Ok(dir) => {
            info!("tables written to {}", dir.display());
            true
        }
        Err(e) => {
            error!("failed to write tables: {}", e);
            false
        }
    }
}

fn print_configuration(config: &SwapSimConfig) {
    println!("Configuration:");
    println!("  Nodes: {}  k: {}  Edges: {}", config.nodes, config.k, config.edges());
    println!("  Poisson rate per edge: {}", config.effective_poisson_rate());
    println!("  Time per run: {}s", config.time_per_run);
    match &config.latencies_file {
        Some(file) => println!("  Latencies: trace {}", file.display()),
        None => println!("  Max network latency: {}s", config.max_network_latency),
    }
    println!("  Runs: {}  Seed: {}", config.runs, config.seed);
    println!("\nStarting experiment...\n");
}

fn print_summary(result: &ExperimentResult, wall_secs: f64) {
    println!("\n═══ Results ═══");
    println!("  Runs: {} ({} retried)", result.runs, result.retries);
    println!("  Swaps: {} ({:.1} per run)", result.swaps, result.mean_swaps_per_run());
    println!(
        "  Failed swaps: {} ({:.1}% of attempts)",
        result.failed_swaps,
        result.failure_ratio() * 100.0
    );
    println!("  Events processed: {}", result.events_processed);
    println!("  Total locked time: {:.3}s", result.total_locked_time());
    println!("  Distinct neighborhoods: {}", result.nbh_frequencies.len());
    println!("  Wall time: {:.2}s", wall_secs);
    println!("\n✓ Experiment complete!\n");
}
