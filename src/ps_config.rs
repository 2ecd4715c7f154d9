//! Configuration for swap simulations and experiments

use crate::ps_error::{SetupError, SimError, SimResult};
use crate::ps_interface::SimTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Parameters of one experiment: how each run is driven and how many runs
/// are sampled. Every field has a default, so a scenario file only lists
/// what it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwapSimConfig {
    // ===== Graph =====
    /// Number of peers
    pub nodes: usize,

    /// Degree of every peer
    pub k: usize,

    /// Edge list to use instead of a generated graph
    pub topology_file: Option<PathBuf>,

    // ===== Activation =====
    /// Rate of each edge's Poisson clock (activations per second)
    pub poisson_rate: f64,

    /// Aggregate swap attempts per second; overrides `poisson_rate` with
    /// `swaps_per_sec / edges` when set
    pub swaps_per_sec: Option<f64>,

    /// Simulated seconds per run
    pub time_per_run: SimTime,

    // ===== Latency =====
    /// Upper bound of synthetic delays in seconds, 0 disables them
    pub max_network_latency: SimTime,

    /// Ping trace; takes precedence over `max_network_latency`
    pub latencies_file: Option<PathBuf>,

    // ===== Randomness =====
    /// Seed for topology generation and per-run seeds
    pub seed: u64,

    /// Seed for the latency table / site assignment. When unset every run
    /// draws its own from the run seed.
    pub latency_seed: Option<u64>,

    // ===== Experiment =====
    /// Number of independent runs
    pub runs: usize,

    /// Sample every peer's neighborhood instead of peer 0 only
    pub track_all_nodes: bool,

    /// Verify graph invariants whenever the system is quiescent
    pub check_invariants: bool,

    /// Let in-flight swaps finish after the horizon before sampling
    pub settle_after_horizon: bool,

    /// Attempts to rerun a run that hit a consistency violation
    pub max_run_retries: usize,

    /// Worker threads, defaults to all cores
    pub threads: Option<usize>,

    /// Log progress every N completed runs (0 = never)
    pub progress_interval: usize,

    // ===== Output =====
    pub output_dir: PathBuf,

    pub log_level: String,
}

impl Default for SwapSimConfig {
    fn default() -> Self {
        Self {
            nodes: 100,
            k: 4,
            topology_file: None,
            poisson_rate: 1.0,
            swaps_per_sec: None,
            time_per_run: 60.0,
            max_network_latency: 0.0,
            latencies_file: None,
            seed: 42,
            latency_seed: None,
            runs: 100,
            track_all_nodes: false,
            check_invariants: true,
            settle_after_horizon: false,
            max_run_retries: 3,
            threads: None,
            progress_interval: 10_000,
            output_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
        }
    }
}

impl SwapSimConfig {
    pub fn from_yaml(content: &str) -> Result<Self, SetupError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let content = std::fs::read_to_string(path).map_err(|e| SetupError::io(path, e))?;
        Self::from_yaml(&content)
    }

    pub fn edges(&self) -> usize {
        self.nodes * self.k / 2
    }

    /// Per-edge activation rate after applying `swaps_per_sec`
    pub fn effective_poisson_rate(&self) -> f64 {
        match self.swaps_per_sec {
            Some(per_sec) if self.edges() > 0 => per_sec / self.edges() as f64,
            _ => self.poisson_rate,
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        let invalid = |msg: String| Err(SimError::InvalidConfig(msg));

        if self.nodes == 0 || self.k == 0 {
            return invalid(format!("nodes ({}) and k ({}) must be positive", self.nodes, self.k));
        }
        if self.topology_file.is_none() {
            if self.k >= self.nodes {
                return invalid(format!(
                    "k ({}) must be smaller than nodes ({})",
                    self.k, self.nodes
                ));
            }
            if (self.nodes * self.k) % 2 != 0 {
                return invalid(format!("nodes * k ({}) must be even", self.nodes * self.k));
            }
        }
        let rate = self.effective_poisson_rate();
        if !(rate > 0.0 && rate.is_finite()) {
            return invalid(format!("poisson rate must be positive, got {}", rate));
        }
        if !(self.time_per_run > 0.0) {
            return invalid(format!("time per run must be positive, got {}", self.time_per_run));
        }
        if !(self.max_network_latency >= 0.0) {
            return invalid(format!(
                "max network latency must be non-negative, got {}",
                self.max_network_latency
            ));
        }
        if self.runs == 0 {
            return invalid("runs must be positive".to_string());
        }
        Ok(())
    }

    /// Directory name used for experiment output
    pub fn run_label(&self) -> String {
        format!(
            "n_{}_k_{}_t_{}_s_{}",
            self.nodes, self.k, self.time_per_run, self.seed
        )
    }
}
