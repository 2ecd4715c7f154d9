// CSV tables written after an experiment

use peerswap::{ExperimentResult, PeerId, SwapSimConfig};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const ALGORITHM: &str = "swiftpeer";

/// Write all tables into `output_dir/<run label>` and return that directory
pub fn write_experiment(config: &SwapSimConfig, result: &ExperimentResult) -> io::Result<PathBuf> {
    let dir = config.output_dir.join(config.run_label());
    fs::create_dir_all(&dir)?;

    write_frequencies(&dir.join("frequencies.csv"), config, result)?;
    write_nbh_frequencies(&dir.join("nbh_frequencies.csv"), config, result)?;
    write_swap_summary(&dir.join("swap_summary.csv"), config, result)?;
    Ok(dir)
}

fn write_frequencies(
    path: &Path,
    config: &SwapSimConfig,
    result: &ExperimentResult,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "algorithm,nodes,k,time_per_run,seed,node,freq")?;
    for (node, freq) in result.nb_frequencies.iter().enumerate() {
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            ALGORITHM, config.nodes, config.k, config.time_per_run, config.seed, node, freq
        )?;
    }
    out.flush()
}

fn write_nbh_frequencies(
    path: &Path,
    config: &SwapSimConfig,
    result: &ExperimentResult,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "algorithm,nodes,k,time_per_run,seed,nbh,freq")?;
    for (nbh, freq) in &result.nbh_frequencies {
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            ALGORITHM,
            config.nodes,
            config.k,
            config.time_per_run,
            config.seed,
            join_neighborhood(nbh),
            freq
        )?;
    }
    out.flush()
}

fn write_swap_summary(
    path: &Path,
    config: &SwapSimConfig,
    result: &ExperimentResult,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "nodes,k,poisson_rate,max_network_latency,swaps,failed_swaps")?;
    writeln!(
        out,
        "{},{},{},{},{},{}",
        config.nodes,
        config.k,
        config.effective_poisson_rate(),
        config.max_network_latency,
        result.swaps,
        result.failed_swaps
    )?;
    out.flush()
}

fn join_neighborhood(nbh: &[PeerId]) -> String {
    nbh.iter()
        .map(|nb| nb.to_string())
        .collect::<Vec<_>>()
        .join("-")
}
