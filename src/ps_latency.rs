//! Network delay between peers.
//!
//! Delays are fixed for the lifetime of a simulation, so two messages sent
//! between the same ordered pair of peers always arrive in send order.

use crate::ps_error::{SetupError, SimError, SimResult};
use crate::ps_interface::{PeerId, SimTime};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;

/// Site-to-site delays read from a ping trace, in seconds
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyTrace {
    rows: Vec<Vec<SimTime>>,
}

impl LatencyTrace {
    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let content = std::fs::read_to_string(path).map_err(|e| SetupError::io(path, e))?;
        Self::parse(&content, path)
    }

    /// One line per site, comma separated round-trip times in milliseconds.
    /// Values are converted to seconds and negative values clamp to zero.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, SetupError> {
        let mut rows = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row = line
                .split(',')
                .map(|value| {
                    value.trim().parse::<f64>().map_err(|e| {
                        SetupError::malformed(origin, line_no + 1, format!("{:?}: {}", value, e))
                    })
                })
                .map(|ms| ms.map(|ms| (ms / 1000.0).max(0.0)))
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(SetupError::malformed(origin, 0, "latency trace is empty"));
        }
        let sites = rows.len();
        if let Some(line) = rows.iter().position(|row| row.len() != sites) {
            return Err(SetupError::malformed(
                origin,
                line + 1,
                format!("expected {} values, found {}", sites, rows[line].len()),
            ));
        }
        Ok(Self { rows })
    }

    pub fn sites(&self) -> usize {
        self.rows.len()
    }

    pub fn between(&self, from_site: usize, to_site: usize) -> SimTime {
        self.rows[from_site][to_site]
    }
}

#[derive(Debug, Clone)]
pub enum LatencyModel {
    /// Every message is delivered instantly
    Zero,
    /// Uniform draws in [0, max), one per ordered pair, row-major
    Synthetic { peers: usize, table: Vec<SimTime> },
    /// Peers mapped onto trace sites by a random permutation
    Trace {
        trace: Arc<LatencyTrace>,
        sites: Vec<usize>,
    },
}

impl LatencyModel {
    pub fn synthetic<R: Rng>(peers: usize, max_latency: SimTime, rng: &mut R) -> SimResult<Self> {
        if !(max_latency >= 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "max latency must be non-negative, got {}",
                max_latency
            )));
        }
        if max_latency == 0.0 {
            return Ok(LatencyModel::Zero);
        }

        let mut table = vec![0.0; peers * peers];
        for from in 0..peers {
            for to in 0..peers {
                if from != to {
                    table[from * peers + to] = rng.gen_range(0.0..max_latency);
                }
            }
        }
        Ok(LatencyModel::Synthetic { peers, table })
    }

    pub fn from_trace<R: Rng>(
        trace: Arc<LatencyTrace>,
        peers: usize,
        rng: &mut R,
    ) -> SimResult<Self> {
        if trace.sites() == 0 {
            return Err(SimError::InvalidConfig("latency trace has no sites".into()));
        }
        let mut permutation: Vec<usize> = (0..peers).collect();
        permutation.shuffle(rng);
        let sites = permutation.iter().map(|p| p % trace.sites()).collect();
        Ok(LatencyModel::Trace { trace, sites })
    }

    pub fn latency(&self, from: PeerId, to: PeerId) -> SimTime {
        match self {
            LatencyModel::Zero => 0.0,
            LatencyModel::Synthetic { peers, table } => {
                table[from as usize * peers + to as usize]
            }
            LatencyModel::Trace { trace, sites } => {
                trace.between(sites[from as usize], sites[to as usize])
            }
        }
    }

    pub fn site_of(&self, peer: PeerId) -> Option<usize> {
        match self {
            LatencyModel::Trace { sites, .. } => sites.get(peer as usize).copied(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;

    #[test]
    fn test_synthetic_is_table_driven() {
        let mut rng = StdRng::seed_from_u64(7);
        let model = LatencyModel::synthetic(10, 0.05, &mut rng).unwrap();

        for from in 0..10 {
            assert_eq!(model.latency(from, from), 0.0);
            for to in 0..10 {
                let delay = model.latency(from, to);
                assert!((0.0..0.05).contains(&delay));
                assert_eq!(delay, model.latency(from, to));
            }
        }
    }

    #[test]
    fn test_synthetic_same_seed_same_table() {
        let a = LatencyModel::synthetic(6, 0.1, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = LatencyModel::synthetic(6, 0.1, &mut StdRng::seed_from_u64(3)).unwrap();
        for from in 0..6 {
            for to in 0..6 {
                assert_eq!(a.latency(from, to), b.latency(from, to));
            }
        }
    }

    #[test]
    fn test_zero_max_latency() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = LatencyModel::synthetic(4, 0.0, &mut rng).unwrap();
        assert!(matches!(model, LatencyModel::Zero));
        assert_eq!(model.latency(0, 3), 0.0);
        assert!(LatencyModel::synthetic(4, -1.0, &mut rng).is_err());
    }

    #[test]
    fn test_trace_parse_converts_and_clamps() {
        let trace = LatencyTrace::parse("0,20,40\n20,0,-3\n40,10,0\n", Path::new("mem")).unwrap();
        assert_eq!(trace.sites(), 3);
        assert_eq!(trace.between(0, 1), 0.02);
        assert_eq!(trace.between(1, 2), 0.0);
        assert_eq!(trace.between(2, 1), 0.01);
    }

    #[test]
    fn test_trace_parse_rejects_bad_rows() {
        let err = LatencyTrace::parse("0,1\n1\n", Path::new("mem")).unwrap_err();
        assert!(err.to_string().contains("mem:2"));

        let err = LatencyTrace::parse("0,x\n1,0\n", Path::new("mem")).unwrap_err();
        assert!(matches!(err, SetupError::Malformed { line: 1, .. }));

        assert!(LatencyTrace::parse("\n\n", Path::new("mem")).is_err());
    }

    #[test]
    fn test_trace_model_uses_site_assignment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0,100").unwrap();
        writeln!(file, "100,0").unwrap();
        let trace = Arc::new(LatencyTrace::load(file.path()).unwrap());

        let mut rng = StdRng::seed_from_u64(11);
        let model = LatencyModel::from_trace(trace, 5, &mut rng).unwrap();
        for from in 0..5 {
            for to in 0..5 {
                let same_site = model.site_of(from) == model.site_of(to);
                let expected = if same_site { 0.0 } else { 0.1 };
                assert_eq!(model.latency(from, to), expected);
            }
        }
    }

    #[test]
    fn test_missing_trace_file() {
        let err = LatencyTrace::load(Path::new("/nonexistent/latencies.txt")).unwrap_err();
        assert!(matches!(err, SetupError::Io { .. }));
    }
}
