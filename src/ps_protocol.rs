//! Swap protocol handlers.
//!
//! An edge activation locks both endpoints, which then lock all of their
//! other neighbors. Once both sides hold every lock they exchange neighbor
//! snapshots, adopt each other's neighbors and tell the affected third
//! parties to rewire. Any refused lock rolls the whole attempt back.
//!
//! Aborts are explicit messages. Messages of an aborted attempt may still be
//! in flight; they are recognised by their [`SwapKey`] and ignored.

use crate::ps_error::{SimError, SimResult};
use crate::ps_interface::{ClockId, Edge, LockOutcome, Message, PeerId, SwapKey};
use crate::ps_clocks::RegistryError;
use crate::ps_peer::Peer;
use crate::ps_simulation::Simulation;
use log::{debug, trace};
use std::collections::BTreeSet;

impl Simulation {
    fn peer_mut(&mut self, peer: PeerId) -> &mut Peer {
        &mut self.peers[peer as usize]
    }

    pub(crate) fn handle_clock_fire(&mut self, clock: ClockId) -> SimResult<()> {
        let edge = self
            .clocks
            .edge_of(clock)
            .ok_or(RegistryError::UnknownClock(clock))?;
        let [a, b] = edge.endpoints();

        if self.peer(a).is_locked() || self.peer(b).is_locked() {
            trace!("{:.4} clock {} on {}: endpoint busy", self.now(), clock, edge);
            // one record per endpoint
            self.failed_swap_records += 2;
            return self.schedule_next_activation(clock);
        }

        // free endpoints never have a Replace pending, so the registry edge must be real
        if !self.peer(a).neighbors.contains(&b) || !self.peer(b).neighbors.contains(&a) {
            return Err(SimError::inconsistent(
                a,
                format!("clock {} maps to {} but the endpoints are not adjacent", clock, edge),
            ));
        }

        self.next_attempt += 1;
        let swap = SwapKey {
            edge,
            attempt: self.next_attempt,
        };
        trace!("{:.4} clock {} starts swap {}", self.now(), clock, swap);
        for endpoint in [a, b] {
            self.begin_swap(endpoint, swap)?;
        }
        self.schedule_next_activation(clock)
    }

    fn begin_swap(&mut self, me: PeerId, swap: SwapKey) -> SimResult<()> {
        let now = self.now();
        let peer = self.peer_mut(me);
        peer.begin_swap(swap, now);
        let targets: Vec<PeerId> = peer.other_neighbors(&swap).into_iter().collect();
        peer.lock_requests_sent = targets.clone();

        for to in targets.iter().copied() {
            self.send(Message::LockRequest { from: me, to, swap })?;
        }
        if targets.is_empty() {
            self.become_ready(me, swap)?;
        }
        Ok(())
    }

    pub(crate) fn handle_lock_request(
        &mut self,
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
    ) -> SimResult<()> {
        let now = self.now();
        let target = swap.edge.other(from);
        let me = self.peer_mut(to);

        // A locked peer may still be waiting for a Replace, so its neighbor
        // set cannot justify an Adjacent answer. Contention is checked first.
        let outcome = if !me.neighbors.contains(&from) {
            LockOutcome::Refused
        } else if me.is_locked() && !me.is_locked_for(&swap) {
            LockOutcome::Refused
        } else if me.neighbors.contains(&target) {
            LockOutcome::Adjacent
        } else {
            me.lock(swap, now);
            LockOutcome::Granted
        };

        trace!("{:.4} {} -> {} lock {}: {:?}", now, from, to, swap, outcome);
        self.send(Message::LockResponse {
            from: to,
            to: from,
            swap,
            outcome,
        })
    }

    pub(crate) fn handle_lock_response(
        &mut self,
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
        outcome: LockOutcome,
    ) -> SimResult<()> {
        let me = self.peer_mut(to);
        if !me.is_swapping(&swap) {
            // answer to an attempt that was already rolled back
            return Ok(());
        }
        if !me.lock_requests_sent.contains(&from) {
            return Err(SimError::inconsistent(
                to,
                format!("lock response from {} which was never asked for {}", from, swap),
            ));
        }

        if !outcome.is_ack() {
            debug!("swap {} aborted: {} refused the lock of {}", swap, from, to);
            return self.abort_swap(to, swap, true);
        }

        if outcome == LockOutcome::Adjacent {
            me.adjacent_exempt.insert(from);
        }
        me.lock_responses_received += 1;
        if me.lock_responses_received as usize > me.lock_requests_sent.len() {
            return Err(SimError::inconsistent(
                to,
                format!("more lock responses than requests for {}", swap),
            ));
        }
        if me.all_lock_responses_received() {
            self.become_ready(to, swap)?;
        }
        Ok(())
    }

    /// All locks acquired: hand our other neighbors to the partner
    fn become_ready(&mut self, me: PeerId, swap: SwapKey) -> SimResult<()> {
        let peer = self.peer_mut(me);
        peer.ready_for_swap = true;
        let neighbors = peer.other_neighbors(&swap);
        let partner_ready = peer.peer_ready_for_swap;

        self.send(Message::Swap {
            from: me,
            to: swap.edge.other(me),
            swap,
            neighbors,
        })?;
        if partner_ready {
            self.do_swap(me, swap)?;
        }
        Ok(())
    }

    pub(crate) fn handle_swap(
        &mut self,
        _from: PeerId,
        to: PeerId,
        swap: SwapKey,
        neighbors: BTreeSet<PeerId>,
    ) -> SimResult<()> {
        let me = self.peer_mut(to);
        if !me.is_swapping(&swap) {
            return Ok(());
        }
        me.peer_ready_for_swap = true;
        me.pending_neighbor_snapshot = Some(neighbors);
        if me.ready_for_swap {
            self.do_swap(to, swap)?;
        }
        Ok(())
    }

    /// Commit: adopt the partner's neighbors and rewire the third parties
    fn do_swap(&mut self, me: PeerId, swap: SwapKey) -> SimResult<()> {
        let now = self.now();
        let degree = self.params.degree;
        let partner = swap.edge.other(me);
        let peer = self.peer_mut(me);

        let mut adopted = peer.pending_neighbor_snapshot.take().ok_or_else(|| {
            SimError::inconsistent(me, format!("commit of {} without partner snapshot", swap))
        })?;
        let notify: Vec<PeerId> = peer
            .neighbors
            .iter()
            .copied()
            .filter(|nb| !swap.edge.contains(*nb) && !peer.adjacent_exempt.contains(nb))
            .collect();

        adopted.insert(partner);
        if adopted.len() != degree || adopted.contains(&me) {
            return Err(SimError::inconsistent(
                me,
                format!("swap {} would leave neighbors {:?}", swap, adopted),
            ));
        }

        peer.neighbors = adopted;
        peer.unlock(now);
        peer.reset_from_swap();
        peer.swaps_completed += 1;
        self.swap_records += 1;
        debug!("{:.4} peer {} committed swap {}", now, me, swap);

        for to in notify {
            self.send(Message::Replace {
                from: me,
                to,
                swap,
                replacement: partner,
            })?;
        }
        Ok(())
    }

    pub(crate) fn handle_replace(
        &mut self,
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
        replacement: PeerId,
    ) -> SimResult<()> {
        let now = self.now();
        let me = self.peer_mut(to);

        if me.neighbors.contains(&from) && me.neighbors.contains(&replacement) {
            // adjacency already matches the post-swap graph
            if me.is_locked_for(&swap) {
                me.unlock(now);
            }
            return Ok(());
        }
        if !me.is_locked_for(&swap) {
            return Err(SimError::inconsistent(
                to,
                format!(
                    "replace from {} for {} but locked for {:?}",
                    from, swap, me.locked_for_swap
                ),
            ));
        }
        if !me.neighbors.contains(&from) {
            return Err(SimError::inconsistent(
                to,
                format!("replace from {} which is not a neighbor", from),
            ));
        }

        self.clocks
            .migrate(Edge::new(from, to), Edge::new(to, replacement))?;

        let me = self.peer_mut(to);
        me.neighbors.remove(&from);
        me.neighbors.insert(replacement);
        me.unlock(now);
        trace!("{:.4} peer {} replaced {} by {}", now, to, from, replacement);
        Ok(())
    }

    pub(crate) fn handle_swap_fail(
        &mut self,
        from: PeerId,
        to: PeerId,
        swap: SwapKey,
    ) -> SimResult<()> {
        if !self.peer(to).is_swapping(&swap) {
            // we aborted on our own already
            return Ok(());
        }
        debug!("swap {} aborted by partner {}", swap, from);
        self.abort_swap(to, swap, false)
    }

    pub(crate) fn handle_unlock(
        &mut self,
        _from: PeerId,
        to: PeerId,
        swap: SwapKey,
    ) -> SimResult<()> {
        let now = self.now();
        let me = self.peer_mut(to);
        if me.is_locked_for(&swap) && me.ongoing_swap.is_none() {
            me.unlock(now);
        }
        Ok(())
    }

    /// Roll back our side of `swap`: release everyone we asked
    fn abort_swap(&mut self, me: PeerId, swap: SwapKey, notify_partner: bool) -> SimResult<()> {
        let now = self.now();
        let peer = self.peer_mut(me);
        let asked = std::mem::take(&mut peer.lock_requests_sent);
        peer.unlock(now);
        peer.reset_from_swap();
        self.failed_swap_records += 1;

        for to in asked {
            self.send(Message::Unlock { from: me, to, swap })?;
        }
        if notify_partner {
            self.send(Message::SwapFail {
                from: me,
                to: swap.edge.other(me),
                swap,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ps_clocks::RegistryError;
    use crate::ps_error::SimError;
    use crate::ps_interface::{Edge, LockOutcome, Message, PeerId, SwapKey};
    use crate::ps_latency::LatencyModel;
    use crate::ps_simulation::{RunParams, Simulation};
    use crate::ps_topology::tests::cube;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    // Cube neighbors: 0:{1,2,4} 1:{0,3,5} 2:{0,3,6} 3:{1,2,7}
    //                 4:{0,5,6} 5:{1,4,7} 6:{2,4,7} 7:{3,5,6}

    fn quiet_cube() -> Simulation {
        // activations so rare that only injected clock fires matter
        let params = RunParams {
            degree: 3,
            poisson_rate: 1e-9,
            horizon: 100.0,
            check_invariants: true,
        };
        Simulation::new(&cube(), params, LatencyModel::Zero, StdRng::seed_from_u64(0)).unwrap()
    }

    fn clock(sim: &Simulation, a: PeerId, b: PeerId) -> u32 {
        sim.clocks().clock_of(&Edge::new(a, b)).unwrap()
    }

    fn key(a: PeerId, b: PeerId, attempt: u64) -> SwapKey {
        SwapKey {
            edge: Edge::new(a, b),
            attempt,
        }
    }

    #[test]
    fn test_single_swap_exchanges_neighbors() {
        let mut sim = quiet_cube();
        let c = clock(&sim, 0, 1);
        sim.inject(1.0, Message::ClockFire { clock: c }).unwrap();
        sim.process_until(2.0).unwrap();

        // 0 takes 1's others {3,5}, 1 takes 0's others {2,4}
        assert_eq!(sim.peer(0).neighbors, BTreeSet::from([1, 3, 5]));
        assert_eq!(sim.peer(1).neighbors, BTreeSet::from([0, 2, 4]));
        assert_eq!(sim.peer(2).neighbors, BTreeSet::from([1, 3, 6]));
        assert_eq!(sim.peer(5).neighbors, BTreeSet::from([0, 4, 7]));
        assert_eq!(sim.summary().swaps, 1);
        assert!(sim.is_quiescent());
        sim.check_consistency().unwrap();

        // clocks moved with the edges
        assert_eq!(sim.clocks().clock_of(&Edge::new(0, 2)), None);
        assert!(sim.clocks().clock_of(&Edge::new(1, 2)).is_some());
        assert!(sim.clocks().clock_of(&Edge::new(0, 3)).is_some());
    }

    #[test]
    fn test_simultaneous_fires_sharing_a_peer() {
        let mut sim = quiet_cube();
        let first = clock(&sim, 0, 1);
        let second = clock(&sim, 0, 2);
        sim.inject(1.0, Message::ClockFire { clock: first }).unwrap();
        sim.inject(1.0, Message::ClockFire { clock: second }).unwrap();
        sim.process_until(2.0).unwrap();

        let summary = sim.summary();
        assert_eq!(summary.swaps, 1);
        assert_eq!(summary.failed_swaps, 1);
        assert!(sim.is_quiescent());
        sim.check_consistency().unwrap();
    }

    #[test]
    fn test_common_neighbor_sits_out() {
        // triangle-free cube has no common neighbors, so build a swap by hand
        // on a graph where 0 and 1 share neighbor 2
        use crate::ps_topology::Topology;
        let edges = vec![
            Edge::new(0, 1),
            Edge::new(0, 2),
            Edge::new(1, 2),
            Edge::new(0, 3),
            Edge::new(1, 4),
            Edge::new(2, 5),
            Edge::new(3, 4),
            Edge::new(3, 5),
            Edge::new(4, 5),
        ];
        let topology = Topology::from_edges(6, 3, edges).unwrap();
        let params = RunParams {
            degree: 3,
            poisson_rate: 1e-9,
            horizon: 100.0,
            check_invariants: true,
        };
        let mut sim =
            Simulation::new(&topology, params, LatencyModel::Zero, StdRng::seed_from_u64(0))
                .unwrap();
        let c = sim.clocks().clock_of(&Edge::new(0, 1)).unwrap();
        sim.inject(1.0, Message::ClockFire { clock: c }).unwrap();
        sim.process_until(2.0).unwrap();

        assert_eq!(sim.summary().swaps, 1);
        assert_eq!(sim.peer(0).neighbors, BTreeSet::from([1, 2, 4]));
        assert_eq!(sim.peer(1).neighbors, BTreeSet::from([0, 2, 3]));
        // 2 was never locked and kept both endpoints
        assert_eq!(sim.peer(2).neighbors, BTreeSet::from([0, 1, 5]));
        assert_eq!(sim.peer(2).total_locked_time, 0.0);
        sim.check_consistency().unwrap();
    }

    #[test]
    fn test_lock_request_outcomes() {
        let mut sim = quiet_cube();
        let swap = key(0, 1, 1);

        // 2 is a neighbor of 0 but not of 1: granted
        sim.handle_lock_request(0, 2, swap).unwrap();
        assert!(sim.peer(2).is_locked_for(&swap));

        // 7 is not a neighbor of 0: stale, refused
        sim.handle_lock_request(0, 7, swap).unwrap();
        assert!(!sim.peer(7).is_locked());

        // 3 is adjacent to 1 and 2; a request from 1 on edge (1, 2) is a no-op
        sim.handle_lock_request(1, 3, key(1, 2, 2)).unwrap();
        assert!(!sim.peer(3).is_locked());

        // 2 is already locked for (0, 1)
        sim.handle_lock_request(3, 2, key(3, 7, 3)).unwrap();
        assert!(sim.peer(2).is_locked_for(&swap));

        let mut outcomes = Vec::new();
        while let Some(event) = sim.queue.pop() {
            if let Message::LockResponse { from, outcome, .. } = event.message {
                outcomes.push((from, outcome));
            }
        }
        assert_eq!(
            outcomes,
            vec![
                (2, LockOutcome::Granted),
                (7, LockOutcome::Refused),
                (3, LockOutcome::Adjacent),
                (2, LockOutcome::Refused),
            ]
        );
    }

    #[test]
    fn test_locked_peer_does_not_claim_adjacency() {
        let mut sim = quiet_cube();
        // 3 is adjacent to both 1 and 2 but busy with another swap
        sim.peers[3].lock(key(3, 7, 1), 0.0);
        sim.handle_lock_request(1, 3, key(1, 2, 2)).unwrap();
        let event = sim.queue.pop().unwrap();
        assert!(matches!(
            event.message,
            Message::LockResponse {
                outcome: LockOutcome::Refused,
                ..
            }
        ));
    }

    #[test]
    fn test_refusal_rolls_back_both_sides() {
        let mut sim = quiet_cube();
        // 3 is busy, so 1's request to it fails and the (0, 1) swap aborts
        sim.peers[3].lock(key(3, 7, 99), 0.0);
        sim.peers[7].lock(key(3, 7, 99), 0.0);
        let c = clock(&sim, 0, 1);
        sim.inject(1.0, Message::ClockFire { clock: c }).unwrap();
        sim.process_until(2.0).unwrap();

        let summary = sim.summary();
        assert_eq!(summary.swaps, 0);
        assert_eq!(summary.failed_swaps, 1);
        assert_eq!(summary.failed_swap_records, 2);
        for peer in [0, 1, 2, 4, 5] {
            assert!(!sim.peer(peer).is_locked(), "peer {} still locked", peer);
            assert!(sim.peer(peer).ongoing_swap.is_none());
        }
        // the unrelated lock is untouched
        assert!(sim.peer(3).is_locked_for(&key(3, 7, 99)));
        assert_eq!(sim.peer(0).neighbors, BTreeSet::from([1, 2, 4]));
    }

    #[test]
    fn test_single_edge_graph_swaps_without_locks() {
        use crate::ps_topology::Topology;
        let topology = Topology::from_edges(2, 1, vec![Edge::new(0, 1)]).unwrap();
        let params = RunParams {
            degree: 1,
            poisson_rate: 1e-9,
            horizon: 10.0,
            check_invariants: true,
        };
        let mut sim =
            Simulation::new(&topology, params, LatencyModel::Zero, StdRng::seed_from_u64(0))
                .unwrap();
        sim.inject(1.0, Message::ClockFire { clock: 0 }).unwrap();
        sim.process_until(2.0).unwrap();

        let summary = sim.summary();
        assert_eq!(summary.swaps, 1);
        assert_eq!(summary.failed_swaps, 0);
        assert!(summary.quiescent);
        assert_eq!(sim.peer(0).neighbors, BTreeSet::from([1]));
        assert_eq!(sim.peer(1).neighbors, BTreeSet::from([0]));
        assert!(sim.peers().iter().all(|p| p.lock_requests_sent.is_empty()));
        sim.check_consistency().unwrap();
    }

    #[test]
    fn test_ready_partner_rolls_back_on_late_refusal() {
        // 10ms everywhere, except the 1 <-> 3 link which is slow
        let peers = 8;
        let mut table = vec![0.01; peers * peers];
        for p in 0..peers {
            table[p * peers + p] = 0.0;
        }
        table[peers + 3] = 0.3;
        table[3 * peers + 1] = 0.3;
        let params = RunParams {
            degree: 3,
            poisson_rate: 1e-9,
            horizon: 100.0,
            check_invariants: true,
        };
        let latency = LatencyModel::Synthetic { peers, table };
        let mut sim =
            Simulation::new(&cube(), params, latency, StdRng::seed_from_u64(0)).unwrap();

        // 3 is busy, so the (0, 1) swap will be refused on 1's slow side
        let busy = key(3, 7, 99);
        sim.peers[3].lock(busy, 0.0);
        sim.peers[7].lock(busy, 0.0);
        let c = clock(&sim, 0, 1);
        sim.inject(1.0, Message::ClockFire { clock: c }).unwrap();

        // 0 has all its locks and its Swap reached 1 long before the refusal
        sim.process_until(1.5).unwrap();
        assert!(sim.peer(0).ready_for_swap);
        assert!(sim.peer(1).peer_ready_for_swap);
        assert!(!sim.peer(1).ready_for_swap);
        assert!(sim.peer(2).is_locked() && sim.peer(4).is_locked());

        sim.process_until(3.0).unwrap();
        let summary = sim.summary();
        assert_eq!(summary.swaps, 0);
        assert_eq!(summary.failed_swap_records, 2);
        for peer in [0, 1, 2, 4, 5] {
            assert!(!sim.peer(peer).is_locked(), "peer {} still locked", peer);
            assert!(sim.peer(peer).ongoing_swap.is_none());
            assert!(sim.peer(peer).pending_neighbor_snapshot.is_none());
        }
        assert_eq!(sim.peer(0).neighbors, BTreeSet::from([1, 2, 4]));
        assert_eq!(sim.peer(1).neighbors, BTreeSet::from([0, 3, 5]));
        assert_eq!(sim.queue.protocol_pending(), 0);
    }

    #[test]
    fn test_stale_messages_are_ignored() {
        let mut sim = quiet_cube();
        let stale = key(0, 1, 1);
        let current = key(0, 1, 2);
        sim.peers[0].begin_swap(current, 0.0);
        sim.peers[0].lock_requests_sent = vec![2, 4];

        sim.handle_lock_response(2, 0, stale, LockOutcome::Refused).unwrap();
        sim.handle_lock_response(2, 0, stale, LockOutcome::Granted).unwrap();
        sim.handle_swap(1, 0, stale, BTreeSet::from([3, 5])).unwrap();
        sim.handle_swap_fail(1, 0, stale).unwrap();

        let peer = sim.peer(0);
        assert!(peer.is_swapping(&current));
        assert_eq!(peer.lock_responses_received, 0);
        assert!(!peer.peer_ready_for_swap);
        assert_eq!(sim.summary().failed_swap_records, 0);
    }

    #[test]
    fn test_unlock_only_releases_matching_lock() {
        let mut sim = quiet_cube();
        sim.peers[2].lock(key(0, 2, 5), 0.0);
        sim.handle_unlock(0, 2, key(0, 1, 4)).unwrap();
        assert!(sim.peer(2).is_locked());
        sim.handle_unlock(0, 2, key(0, 2, 5)).unwrap();
        assert!(!sim.peer(2).is_locked());
    }

    #[test]
    fn test_replace_noop_keeps_neighbor_set() {
        let mut sim = quiet_cube();
        // 3 already has both 1 and 2
        let before = sim.peer(3).neighbors.clone();
        let swap = key(1, 2, 1);
        sim.peers[3].lock(swap, 0.0);
        sim.handle_replace(1, 3, swap, 2).unwrap();
        assert_eq!(sim.peer(3).neighbors, before);
        assert!(!sim.peer(3).is_locked());
        assert_eq!(sim.clocks().clock_of(&Edge::new(1, 3)), Some(clock(&sim, 1, 3)));
    }

    #[test]
    fn test_replace_without_lock_is_a_violation() {
        let mut sim = quiet_cube();
        let err = sim.handle_replace(0, 2, key(0, 1, 1), 1).unwrap_err();
        assert!(matches!(err, SimError::Inconsistent { peer: 2, .. }));
        assert!(err.is_consistency_violation());

        sim.peers[2].lock(key(0, 5, 3), 0.0);
        assert!(sim.handle_replace(0, 2, key(0, 1, 1), 1).is_err());
    }

    #[test]
    fn test_unknown_clock_is_a_violation() {
        let mut sim = quiet_cube();
        sim.inject(1.0, Message::ClockFire { clock: 500 }).unwrap();
        assert_eq!(
            sim.process_until(2.0),
            Err(SimError::Registry(RegistryError::UnknownClock(500)))
        );
    }

    #[test]
    fn test_consistency_check_catches_broken_symmetry() {
        let mut sim = quiet_cube();
        sim.peers[0].neighbors.remove(&4);
        sim.peers[0].neighbors.insert(7);
        assert!(matches!(
            sim.check_consistency(),
            Err(SimError::Inconsistent { peer: 0, .. })
        ));
    }

    #[test]
    fn test_scheduling_in_the_past_fails_the_run() {
        let mut sim = quiet_cube();
        sim.inject(5.0, Message::ClockFire { clock: 0 }).unwrap();
        sim.process_until(6.0).unwrap();
        assert!(matches!(
            sim.inject(4.0, Message::ClockFire { clock: 0 }),
            Err(SimError::OrderingViolation { .. })
        ));
    }
}
