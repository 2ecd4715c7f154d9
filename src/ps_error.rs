use crate::ps_clocks::RegistryError;
use crate::ps_interface::{PeerId, SimTime};
use thiserror::Error;

/// Errors that abort a single simulation run.
///
/// Protocol-level failures (refused locks, stale neighbors) are never
/// reported here, they are part of the modelled behaviour.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// An event was scheduled before the current simulated time.
    #[error("cannot schedule event at {time} in the past (current time {now})")]
    OrderingViolation { time: SimTime, now: SimTime },

    /// Peer or registry state contradicts the protocol invariants.
    #[error("consistency violation at peer {peer}: {detail}")]
    Inconsistent { peer: PeerId, detail: String },

    /// Clock registry out of step with the graph.
    #[error("clock registry violation: {0}")]
    Registry(#[from] RegistryError),

    /// Parameters that cannot drive a simulation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SimError {
    pub fn inconsistent(peer: PeerId, detail: impl Into<String>) -> Self {
        SimError::Inconsistent {
            peer,
            detail: detail.into(),
        }
    }

    /// Bugs in the protocol implementation, as opposed to bad input.
    /// An experiment may discard such a run and try again.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            SimError::OrderingViolation { .. }
                | SimError::Inconsistent { .. }
                | SimError::Registry(_)
        )
    }
}

pub type SimResult<T> = Result<T, SimError>;

/// Errors raised while preparing an experiment, before any run starts.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario: {0}")]
    Scenario(#[from] serde_yaml::Error),

    #[error("{path}:{line}: {detail}")]
    Malformed {
        path: String,
        line: usize,
        detail: String,
    },

    #[error(transparent)]
    Sim(#[from] SimError),
}

impl SetupError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        SetupError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn malformed(path: &std::path::Path, line: usize, detail: impl Into<String>) -> Self {
        SetupError::Malformed {
            path: path.display().to_string(),
            line,
            detail: detail.into(),
        }
    }
}
