//! # peerswap - Peer Swapping Overlay Simulator
//!
//! A discrete-event simulator for a decentralized peer-swapping protocol on
//! a k-regular overlay graph. Every edge carries a Poisson clock; when it
//! fires, the two endpoints lock their other neighbors, exchange neighbor
//! sets and have the third parties rewire, so the graph keeps its degree
//! while it mixes.
//!
//! ## Core Components
//!
//! - **Simulation**: single-run driver owning peers, clocks, event queue and latency table
//! - **Protocol handlers**: lock / swap / replace / unlock state machine (`ps_protocol`)
//! - **ClockRegistry**: edge to clock bijection that follows edges as they move
//! - **LatencyModel**: zero, synthetic uniform, or trace-driven message delays
//! - **Experiment**: many independent runs in parallel with neighborhood statistics
//!
//! ## Usage
//!
//! ```no_run
//! use peerswap::{Experiment, SwapSimConfig};
//!
//! let config = SwapSimConfig {
//!     nodes: 64,
//!     k: 4,
//!     runs: 10,
//!     ..SwapSimConfig::default()
//! };
//! let result = Experiment::new(config).unwrap().run().unwrap();
//! println!("{} swaps, {} failed", result.swaps, result.failed_swaps);
//! ```
//!
//! The `swap_runner` binary in `simulator/` runs experiments described by
//! YAML scenario files and writes the frequency tables as CSV.

// Core types and protocol
pub mod ps_interface;
pub mod ps_error;
pub mod ps_peer;
mod ps_protocol;

// Simulation machinery
pub mod ps_event_queue;
pub mod ps_clocks;
pub mod ps_latency;
pub mod ps_topology;
pub mod ps_simulation;

// Experiments
pub mod ps_config;
pub mod ps_experiment;

// Re-export commonly used types
pub use ps_config::SwapSimConfig;
pub use ps_error::{SetupError, SimError, SimResult};
pub use ps_experiment::{Experiment, ExperimentResult, RunOutcome};
pub use ps_interface::{ClockId, Edge, LockOutcome, Message, PeerId, SimTime, SwapKey};
pub use ps_simulation::{RunParams, RunSummary, Simulation};
pub use ps_topology::Topology;
