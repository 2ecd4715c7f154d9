use crate::ps_interface::{PeerId, SimTime, SwapKey};
use std::collections::BTreeSet;

/// Per-vertex state of the swap protocol.
///
/// Neighbor sets are ordered so that fan-out, and therefore event sequence
/// numbers, never depend on hashing.
#[derive(Debug, Clone)]
pub struct Peer {
    pub index: PeerId,
    pub neighbors: BTreeSet<PeerId>,

    // ===== Lock =====
    /// Swap this peer is reserved for, as endpoint or as third party
    pub locked_for_swap: Option<SwapKey>,
    pub locked_since: Option<SimTime>,
    pub total_locked_time: SimTime,

    // ===== Swap in progress (endpoints only) =====
    pub ongoing_swap: Option<SwapKey>,
    pub ready_for_swap: bool,
    pub peer_ready_for_swap: bool,
    /// Neighbors the partner hands over in its Swap message
    pub pending_neighbor_snapshot: Option<BTreeSet<PeerId>>,
    /// Neighbors adjacent to both endpoints, no Replace needed
    pub adjacent_exempt: BTreeSet<PeerId>,
    pub lock_requests_sent: Vec<PeerId>,
    pub lock_responses_received: u32,

    /// Number of times this peer committed a swap
    pub swaps_completed: u64,
}

impl Peer {
    pub fn new(index: PeerId, neighbors: BTreeSet<PeerId>) -> Self {
        Self {
            index,
            neighbors,
            locked_for_swap: None,
            locked_since: None,
            total_locked_time: 0.0,
            ongoing_swap: None,
            ready_for_swap: false,
            peer_ready_for_swap: false,
            pending_neighbor_snapshot: None,
            adjacent_exempt: BTreeSet::new(),
            lock_requests_sent: Vec::new(),
            lock_responses_received: 0,
            swaps_completed: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_for_swap.is_some()
    }

    pub fn is_locked_for(&self, swap: &SwapKey) -> bool {
        self.locked_for_swap.as_ref() == Some(swap)
    }

    pub fn is_swapping(&self, swap: &SwapKey) -> bool {
        self.ongoing_swap.as_ref() == Some(swap)
    }

    pub fn lock(&mut self, swap: SwapKey, now: SimTime) {
        self.locked_for_swap = Some(swap);
        self.locked_since = Some(now);
    }

    pub fn unlock(&mut self, now: SimTime) {
        if let Some(since) = self.locked_since.take() {
            self.total_locked_time += now - since;
        }
        self.locked_for_swap = None;
    }

    /// Total locked time, counting a lock that is still held up to `now`
    pub fn locked_time(&self, now: SimTime) -> SimTime {
        match self.locked_since {
            Some(since) => self.total_locked_time + (now - since),
            None => self.total_locked_time,
        }
    }

    /// Enter a swap on `swap` as one of its endpoints
    pub fn begin_swap(&mut self, swap: SwapKey, now: SimTime) {
        self.reset_from_swap();
        self.lock(swap, now);
        self.ongoing_swap = Some(swap);
    }

    pub fn reset_from_swap(&mut self) {
        self.ongoing_swap = None;
        self.ready_for_swap = false;
        self.peer_ready_for_swap = false;
        self.pending_neighbor_snapshot = None;
        self.adjacent_exempt.clear();
        self.lock_requests_sent.clear();
        self.lock_responses_received = 0;
    }

    /// The other endpoint of the ongoing swap
    pub fn swap_partner(&self) -> Option<PeerId> {
        self.ongoing_swap.map(|swap| swap.edge.other(self.index))
    }

    pub fn all_lock_responses_received(&self) -> bool {
        self.lock_responses_received as usize == self.lock_requests_sent.len()
    }

    /// Neighbors excluding the endpoints of `swap`
    pub fn other_neighbors(&self, swap: &SwapKey) -> BTreeSet<PeerId> {
        self.neighbors
            .iter()
            .copied()
            .filter(|nb| !swap.edge.contains(*nb))
            .collect()
    }

    /// Sorted neighbor tuple, used for neighborhood sampling
    pub fn sorted_neighbors(&self) -> Vec<PeerId> {
        self.neighbors.iter().copied().collect()
    }
}
