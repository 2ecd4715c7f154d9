//! Discrete-event driver for one swap simulation run.
//!
//! A run owns all of its state: peers, clock registry, event queue, latency
//! table and RNG. Nothing is shared between runs except the read-only
//! topology they start from, so runs can execute on any thread.

use crate::ps_clocks::ClockRegistry;
use crate::ps_config::SwapSimConfig;
use crate::ps_error::{SimError, SimResult};
use crate::ps_event_queue::{Event, EventQueue};
use crate::ps_interface::{ClockId, Edge, Message, PeerId, SimTime};
use crate::ps_latency::{LatencyModel, LatencyTrace};
use crate::ps_peer::Peer;
use crate::ps_topology::Topology;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Parameters that drive a single run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunParams {
    /// Degree every peer must keep
    pub degree: usize,
    /// Rate of each edge's activation clock
    pub poisson_rate: f64,
    /// Exclusive end of the run in simulated seconds
    pub horizon: SimTime,
    /// Verify all graph invariants whenever the system is quiescent
    pub check_invariants: bool,
}

impl RunParams {
    pub fn from_config(config: &SwapSimConfig) -> Self {
        Self {
            degree: config.k,
            poisson_rate: config.effective_poisson_rate(),
            horizon: config.time_per_run,
            check_invariants: config.check_invariants,
        }
    }
}

/// Counters reported after a run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    /// Committed swaps (each is recorded by both endpoints)
    pub swaps: u64,
    /// Failed swap attempts, normalized the same way
    pub failed_swaps: u64,
    pub swap_records: u64,
    pub failed_swap_records: u64,
    pub events_processed: u64,
    /// Invariant checks executed, full and partial
    pub invariant_checks: u64,
    pub end_time: SimTime,
    /// No peer locked and no message in flight when the run stopped
    pub quiescent: bool,
}

pub struct Simulation {
    pub(crate) params: RunParams,
    pub(crate) peers: Vec<Peer>,
    pub(crate) clocks: ClockRegistry,
    pub(crate) queue: EventQueue,
    pub(crate) latency: LatencyModel,
    rng: StdRng,
    inter_arrival: Exp<f64>,
    started: bool,

    pub(crate) next_attempt: u64,
    pub(crate) swap_records: u64,
    pub(crate) failed_swap_records: u64,
    events_processed: u64,
    invariant_checks: u64,
}

impl Simulation {
    pub fn new(
        topology: &Topology,
        params: RunParams,
        latency: LatencyModel,
        rng: StdRng,
    ) -> SimResult<Self> {
        if topology.degree() != params.degree {
            return Err(SimError::InvalidConfig(format!(
                "topology has degree {}, run expects {}",
                topology.degree(),
                params.degree
            )));
        }
        if !(params.poisson_rate > 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "poisson rate must be positive, got {}",
                params.poisson_rate
            )));
        }
        let inter_arrival = Exp::new(params.poisson_rate).map_err(|e| {
            SimError::InvalidConfig(format!("poisson rate {}: {}", params.poisson_rate, e))
        })?;
        if !(params.horizon > 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "horizon must be positive, got {}",
                params.horizon
            )));
        }

        let peers = topology
            .adjacency()
            .into_iter()
            .enumerate()
            .map(|(index, neighbors)| Peer::new(index as PeerId, neighbors))
            .collect();
        let clocks = ClockRegistry::from_edges(topology.edges().iter().copied())?;

        Ok(Self {
            params,
            peers,
            clocks,
            queue: EventQueue::new(),
            latency,
            rng,
            inter_arrival,
            started: false,
            next_attempt: 0,
            swap_records: 0,
            failed_swap_records: 0,
            events_processed: 0,
            invariant_checks: 0,
        })
    }

    /// Build a run from an experiment configuration. The latency table or
    /// site assignment uses its own RNG, seeded from `latency_seed` when set.
    pub fn from_config(
        config: &SwapSimConfig,
        topology: &Topology,
        trace: Option<Arc<LatencyTrace>>,
        run_seed: u64,
    ) -> SimResult<Self> {
        let mut rng = StdRng::seed_from_u64(run_seed);
        let latency_seed = config.latency_seed.unwrap_or_else(|| rng.gen());
        let mut latency_rng = StdRng::seed_from_u64(latency_seed);

        let latency = match trace {
            Some(trace) => LatencyModel::from_trace(trace, topology.nodes(), &mut latency_rng)?,
            None => LatencyModel::synthetic(
                topology.nodes(),
                config.max_network_latency,
                &mut latency_rng,
            )?,
        };
        Self::new(topology, RunParams::from_config(config), latency, rng)
    }

    // ========================================================================
    // Driving the run
    // ========================================================================

    /// Schedule the first activation of every edge clock
    pub fn start(&mut self) -> SimResult<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        let clocks: Vec<ClockId> = self.clocks.clocks().map(|(clock, _)| clock).collect();
        for clock in clocks {
            self.schedule_next_activation(clock)?;
        }
        Ok(())
    }

    /// Run until the horizon and report the counters.
    pub fn run(&mut self) -> SimResult<RunSummary> {
        self.start()?;
        self.process_until(self.params.horizon)?;

        debug!(
            "run finished at {:.3}: {} swaps, {} failed, {} events",
            self.now(),
            self.swap_records / 2,
            self.failed_swap_records / 2,
            self.events_processed
        );
        if self.params.check_invariants {
            self.check_invariants_now()?;
        }
        Ok(self.summary())
    }

    /// Process events strictly before `horizon`.
    pub fn process_until(&mut self, horizon: SimTime) -> SimResult<()> {
        while let Some(event) = self.queue.pop_before(horizon) {
            self.dispatch(event)?;
        }
        Ok(())
    }

    /// Stop every clock and deliver the messages still in flight, so each
    /// pending swap either commits or aborts.
    pub fn settle(&mut self) -> SimResult<RunSummary> {
        let discarded = self.queue.discard_clock_fires();
        debug!(
            "settling at {:.3}: {} clocks stopped, {} messages in flight",
            self.now(),
            discarded,
            self.queue.protocol_pending()
        );
        while let Some(event) = self.queue.pop() {
            self.dispatch(event)?;
        }
        if self.params.check_invariants {
            self.invariant_checks += 1;
            self.check_consistency()?;
        }
        Ok(self.summary())
    }

    /// Queue an event directly, bypassing the clocks
    pub fn inject(&mut self, time: SimTime, message: Message) -> SimResult<u64> {
        self.started = true;
        self.queue.schedule(time, message)
    }

    fn dispatch(&mut self, event: Event) -> SimResult<()> {
        self.events_processed += 1;
        match event.message {
            Message::ClockFire { clock } => {
                if self.params.check_invariants {
                    self.check_invariants_now()?;
                }
                self.handle_clock_fire(clock)
            }
            Message::LockRequest { from, to, swap } => self.handle_lock_request(from, to, swap),
            Message::LockResponse {
                from,
                to,
                swap,
                outcome,
            } => self.handle_lock_response(from, to, swap, outcome),
            Message::Swap {
                from,
                to,
                swap,
                neighbors,
            } => self.handle_swap(from, to, swap, neighbors),
            Message::SwapFail { from, to, swap } => self.handle_swap_fail(from, to, swap),
            Message::Replace {
                from,
                to,
                swap,
                replacement,
            } => self.handle_replace(from, to, swap, replacement),
            Message::Unlock { from, to, swap } => self.handle_unlock(from, to, swap),
        }
    }

    /// Full check when quiescent, otherwise the part that holds mid-swap
    fn check_invariants_now(&mut self) -> SimResult<()> {
        self.invariant_checks += 1;
        if self.is_quiescent() {
            self.check_consistency()
        } else {
            self.check_unlocked_consistency()
        }
    }

    pub(crate) fn schedule_next_activation(&mut self, clock: ClockId) -> SimResult<()> {
        let delay = self.inter_arrival.sample(&mut self.rng);
        self.queue
            .schedule_after(delay, Message::ClockFire { clock })?;
        Ok(())
    }

    /// Deliver a peer message after the modelled delay between its endpoints
    pub(crate) fn send(&mut self, message: Message) -> SimResult<()> {
        let delay = match message.endpoints() {
            Some((from, to)) => self.latency.latency(from, to),
            None => 0.0,
        };
        self.queue.schedule_after(delay, message)?;
        Ok(())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn now(&self) -> SimTime {
        self.queue.now()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer(&self, peer: PeerId) -> &Peer {
        &self.peers[peer as usize]
    }

    pub fn clocks(&self) -> &ClockRegistry {
        &self.clocks
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            swaps: self.swap_records / 2,
            failed_swaps: self.failed_swap_records / 2,
            swap_records: self.swap_records,
            failed_swap_records: self.failed_swap_records,
            events_processed: self.events_processed,
            invariant_checks: self.invariant_checks,
            end_time: self.now(),
            quiescent: self.is_quiescent(),
        }
    }

    /// No peer holds a lock and no protocol message is queued
    pub fn is_quiescent(&self) -> bool {
        self.queue.protocol_pending() == 0 && self.peers.iter().all(|p| !p.is_locked())
    }

    /// Sorted neighbor tuples of peer 0, or of every peer
    pub fn tracked_neighborhoods(&self, track_all_nodes: bool) -> Vec<(PeerId, Vec<PeerId>)> {
        let tracked = if track_all_nodes {
            &self.peers[..]
        } else {
            &self.peers[..1.min(self.peers.len())]
        };
        tracked
            .iter()
            .map(|peer| (peer.index, peer.sorted_neighbors()))
            .collect()
    }

    /// Cumulative locked time per peer, up to the current time
    pub fn locked_times(&self) -> Vec<SimTime> {
        let now = self.now();
        self.peers.iter().map(|peer| peer.locked_time(now)).collect()
    }

    /// Current edge set as seen from the neighbor sets
    pub fn edge_set(&self) -> BTreeSet<Edge> {
        self.peers
            .iter()
            .flat_map(|peer| {
                peer.neighbors
                    .iter()
                    .map(move |nb| Edge::new(peer.index, *nb))
            })
            .collect()
    }

    /// Verify k-regularity, symmetric adjacency and the clock bijection.
    /// Only meaningful while quiescent.
    pub fn check_consistency(&self) -> SimResult<()> {
        let nodes = self.peers.len();
        for peer in &self.peers {
            if peer.neighbors.len() != self.params.degree {
                return Err(SimError::inconsistent(
                    peer.index,
                    format!(
                        "has {} neighbors {:?}, expected {}",
                        peer.neighbors.len(),
                        peer.neighbors,
                        self.params.degree
                    ),
                ));
            }
            for &nb in &peer.neighbors {
                if nb == peer.index || nb as usize >= nodes {
                    return Err(SimError::inconsistent(
                        peer.index,
                        format!("invalid neighbor {}", nb),
                    ));
                }
                if !self.peers[nb as usize].neighbors.contains(&peer.index) {
                    return Err(SimError::inconsistent(
                        peer.index,
                        format!("neighbor {} does not list {} back", nb, peer.index),
                    ));
                }
            }
        }

        Ok(self.clocks.verify(&self.edge_set())?)
    }

    /// Invariants that hold while swaps are in flight. A peer only changes
    /// its neighbors while locked, so every unlocked peer has degree k and
    /// agrees with its unlocked neighbors, and every clock between two
    /// unlocked peers sits on a real edge.
    pub fn check_unlocked_consistency(&self) -> SimResult<()> {
        for peer in self.peers.iter().filter(|p| !p.is_locked()) {
            if peer.neighbors.len() != self.params.degree {
                return Err(SimError::inconsistent(
                    peer.index,
                    format!(
                        "unlocked with {} neighbors {:?}, expected {}",
                        peer.neighbors.len(),
                        peer.neighbors,
                        self.params.degree
                    ),
                ));
            }
            for &nb in &peer.neighbors {
                let other = self.peers.get(nb as usize).ok_or_else(|| {
                    SimError::inconsistent(peer.index, format!("invalid neighbor {}", nb))
                })?;
                if !other.is_locked() && !other.neighbors.contains(&peer.index) {
                    return Err(SimError::inconsistent(
                        peer.index,
                        format!("unlocked neighbor {} does not list {} back", nb, peer.index),
                    ));
                }
            }
        }

        for (clock, edge) in self.clocks.clocks() {
            let [a, b] = edge.endpoints();
            let (pa, pb) = (self.peer(a), self.peer(b));
            if !pa.is_locked() && !pb.is_locked() && !pa.neighbors.contains(&b) {
                return Err(SimError::inconsistent(
                    a,
                    format!("clock {} on {} between unlocked non-neighbors", clock, edge),
                ));
            }
        }
        Ok(())
    }
}
