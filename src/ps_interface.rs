use std::collections::BTreeSet;
use std::fmt;

// vertex index in the overlay graph, 0..N-1
pub type PeerId = u32;
pub type ClockId = u32;

// simulated seconds
pub type SimTime = f64;

// ============================================================================
// Edges and swap identity
// ============================================================================

/// Undirected edge, always stored with the smaller endpoint first
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    low: PeerId,
    high: PeerId,
}

impl Edge {
    pub fn new(a: PeerId, b: PeerId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn low(&self) -> PeerId {
        self.low
    }

    pub fn high(&self) -> PeerId {
        self.high
    }

    pub fn endpoints(&self) -> [PeerId; 2] {
        [self.low, self.high]
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.low == peer || self.high == peer
    }

    /// The endpoint that is not `peer`. Callers must pass one of the endpoints.
    pub fn other(&self, peer: PeerId) -> PeerId {
        if peer == self.low {
            self.high
        } else {
            self.low
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.low, self.high)
    }
}

/// Identity of one swap attempt.
///
/// The same edge can be attempted many times during a run, so the edge alone
/// does not distinguish a late message of an aborted attempt from the current
/// one. `attempt` is unique per simulation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SwapKey {
    pub edge: Edge,
    pub attempt: u64,
}

impl fmt::Display for SwapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.edge, self.attempt)
    }
}

// ============================================================================
// Protocol messages
// ============================================================================

/// Answer of a neighbor to a lock request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// Neighbor is now locked for the swap
    Granted,
    /// Neighbor is stale or busy; the swap must abort
    Refused,
    /// Neighbor is adjacent to both endpoints, the swap leaves it untouched
    Adjacent,
}

impl LockOutcome {
    /// Granted and Adjacent both count as an acknowledgement
    pub fn is_ack(&self) -> bool {
        !matches!(self, LockOutcome::Refused)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Activation of the Poisson clock bound to an edge
    ClockFire { clock: ClockId },
    LockRequest {
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
    },
    LockResponse {
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
        outcome: LockOutcome,
    },
    /// Sender is ready; carries the neighbors the receiver will adopt
    Swap {
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
        neighbors: BTreeSet<PeerId>,
    },
    /// Sender aborted, the partner must roll back too
    SwapFail {
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
    },
    /// Receiver substitutes `from` with `replacement` in its neighbor set
    Replace {
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
        replacement: PeerId,
    },
    Unlock {
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClockFire { .. } => "clock_fire",
            Message::LockRequest { .. } => "lock_request",
            Message::LockResponse { .. } => "lock_response",
            Message::Swap { .. } => "swap",
            Message::SwapFail { .. } => "swap_fail",
            Message::Replace { .. } => "replace",
            Message::Unlock { .. } => "unlock",
        }
    }

    /// Everything except clock activations travels between peers
    pub fn is_protocol(&self) -> bool {
        !matches!(self, Message::ClockFire { .. })
    }

    /// Sender and receiver of a peer-to-peer message
    pub fn endpoints(&self) -> Option<(PeerId, PeerId)> {
        match self {
            Message::ClockFire { .. } => None,
            Message::LockRequest { from, to, .. }
            | Message::LockResponse { from, to, .. }
            | Message::Swap { from, to, .. }
            | Message::SwapFail { from, to, .. }
            | Message::Replace { from, to, .. }
            | Message::Unlock { from, to, .. } => Some((*from, *to)),
        }
    }
}
