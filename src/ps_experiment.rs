//! Multi-run experiments.
//!
//! An experiment samples the final neighborhood of the tracked peers over
//! many independent runs that all start from the same topology. Runs are
//! spread over a rayon pool; each one owns its simulation and only reads the
//! shared topology and latency trace.

use crate::ps_config::SwapSimConfig;
use crate::ps_error::{SetupError, SimError, SimResult};
use crate::ps_interface::{PeerId, SimTime};
use crate::ps_latency::LatencyTrace;
use crate::ps_simulation::{RunSummary, Simulation};
use crate::ps_topology::Topology;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Result of one accepted run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_index: usize,
    pub seed: u64,
    /// Attempts discarded because of a consistency violation
    pub retries: usize,
    pub summary: RunSummary,
    pub neighborhoods: Vec<(PeerId, Vec<PeerId>)>,
    pub locked_times: Vec<SimTime>,
}

/// Aggregate over all runs of an experiment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentResult {
    pub runs: usize,
    pub retries: usize,
    /// How often each peer appeared in a tracked neighborhood
    pub nb_frequencies: Vec<u64>,
    /// How often each exact neighborhood tuple was observed
    pub nbh_frequencies: BTreeMap<Vec<PeerId>, u64>,
    pub swaps: u64,
    pub failed_swaps: u64,
    pub events_processed: u64,
    pub locked_time_per_peer: Vec<SimTime>,
}

impl ExperimentResult {
    fn new(nodes: usize) -> Self {
        Self {
            nb_frequencies: vec![0; nodes],
            locked_time_per_peer: vec![0.0; nodes],
            ..Self::default()
        }
    }

    fn absorb(&mut self, outcome: &RunOutcome) {
        self.runs += 1;
        self.retries += outcome.retries;
        self.swaps += outcome.summary.swaps;
        self.failed_swaps += outcome.summary.failed_swaps;
        self.events_processed += outcome.summary.events_processed;

        for (_, neighbors) in &outcome.neighborhoods {
            for &nb in neighbors {
                if let Some(freq) = self.nb_frequencies.get_mut(nb as usize) {
                    *freq += 1;
                }
            }
            *self.nbh_frequencies.entry(neighbors.clone()).or_insert(0) += 1;
        }
        for (total, locked) in self.locked_time_per_peer.iter_mut().zip(&outcome.locked_times) {
            *total += locked;
        }
    }

    pub fn total_locked_time(&self) -> SimTime {
        self.locked_time_per_peer.iter().sum()
    }

    pub fn mean_swaps_per_run(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.swaps as f64 / self.runs as f64
        }
    }

    /// Fraction of attempted swaps that aborted
    pub fn failure_ratio(&self) -> f64 {
        let attempts = self.swaps + self.failed_swaps;
        if attempts == 0 {
            0.0
        } else {
            self.failed_swaps as f64 / attempts as f64
        }
    }
}

/// Seed of run `run_index`, attempt `retry`. Mixed with the splitmix64
/// finalizer so neighboring indices get unrelated streams.
pub fn derive_run_seed(base: u64, run_index: usize, retry: usize) -> u64 {
    let mut z = base
        ^ (run_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (retry as u64).wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

pub struct Experiment {
    config: SwapSimConfig,
    topology: Topology,
    trace: Option<Arc<LatencyTrace>>,
}

impl Experiment {
    /// Load or generate the topology and load the latency trace, if any.
    ///
    /// A topology file decides `nodes` and `k`; the configured values are
    /// replaced by what the file contains.
    pub fn new(mut config: SwapSimConfig) -> Result<Self, SetupError> {
        config.validate()?;

        let topology = match &config.topology_file {
            Some(path) => {
                let topology = Topology::load(path)?;
                if topology.nodes() != config.nodes || topology.degree() != config.k {
                    info!(
                        "topology {} has {} nodes of degree {}, overriding configured {}/{}",
                        path.display(),
                        topology.nodes(),
                        topology.degree(),
                        config.nodes,
                        config.k
                    );
                    config.nodes = topology.nodes();
                    config.k = topology.degree();
                }
                topology
            }
            None => {
                let mut rng = StdRng::seed_from_u64(config.seed);
                Topology::random_regular(config.nodes, config.k, &mut rng)?
            }
        };

        let trace = match &config.latencies_file {
            Some(path) => Some(Arc::new(LatencyTrace::load(path)?)),
            None => None,
        };

        Ok(Self::with_topology(config, topology, trace))
    }

    pub fn with_topology(
        config: SwapSimConfig,
        topology: Topology,
        trace: Option<Arc<LatencyTrace>>,
    ) -> Self {
        Self {
            config,
            topology,
            trace,
        }
    }

    pub fn config(&self) -> &SwapSimConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Execute all runs and aggregate them in run order.
    pub fn run(&self) -> SimResult<ExperimentResult> {
        info!(
            "experiment {}: {} runs, rate {:.6} per edge, latency {}",
            self.config.run_label(),
            self.config.runs,
            self.config.effective_poisson_rate(),
            match (&self.trace, self.config.max_network_latency) {
                (Some(trace), _) => format!("trace with {} sites", trace.sites()),
                (None, max) if max > 0.0 => format!("uniform below {}s", max),
                _ => "none".to_string(),
            }
        );

        let completed = AtomicUsize::new(0);
        let run_all = || {
            (0..self.config.runs)
                .into_par_iter()
                .map(|run_index| {
                    let outcome = self.run_one(run_index)?;
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    let interval = self.config.progress_interval;
                    if interval > 0 && done % interval == 0 {
                        info!("{}/{} runs completed", done, self.config.runs);
                    }
                    Ok(outcome)
                })
                .collect::<SimResult<Vec<RunOutcome>>>()
        };

        let outcomes = match self.config.threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| SimError::InvalidConfig(format!("thread pool: {}", e)))?
                .install(run_all)?,
            None => run_all()?,
        };

        let mut result = ExperimentResult::new(self.topology.nodes());
        for outcome in &outcomes {
            result.absorb(outcome);
        }
        info!(
            "experiment {} done: {} swaps, {} failed, {} retried runs",
            self.config.run_label(),
            result.swaps,
            result.failed_swaps,
            result.retries
        );
        Ok(result)
    }

    /// One run, retried with a fresh seed when it trips a consistency check
    pub fn run_one(&self, run_index: usize) -> SimResult<RunOutcome> {
        let mut retry = 0;
        loop {
            let seed = derive_run_seed(self.config.seed, run_index, retry);
            match self.attempt(run_index, seed) {
                Ok(mut outcome) => {
                    outcome.retries = retry;
                    return Ok(outcome);
                }
                Err(err)
                    if err.is_consistency_violation() && retry < self.config.max_run_retries =>
                {
                    warn!("run {} with seed {} discarded: {}", run_index, seed, err);
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt(&self, run_index: usize, seed: u64) -> SimResult<RunOutcome> {
        let mut sim =
            Simulation::from_config(&self.config, &self.topology, self.trace.clone(), seed)?;
        let mut summary = sim.run()?;
        if self.config.settle_after_horizon {
            summary = sim.settle()?;
        }

        Ok(RunOutcome {
            run_index,
            seed,
            retries: 0,
            summary,
            neighborhoods: sim.tracked_neighborhoods(self.config.track_all_nodes),
            locked_times: sim.locked_times(),
        })
    }
}
