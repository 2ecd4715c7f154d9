//! Edge <-> clock registry.
//!
//! Every live edge owns exactly one Poisson clock. When a Replace moves an
//! edge, its clock id moves with it, so the clock keeps firing at the same
//! rate instead of being restarted.

use crate::ps_interface::{ClockId, Edge};
use hashbrown::HashMap;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("edge {0} has no clock")]
    MissingEdge(Edge),
    #[error("edge {0} already has clock {1}")]
    DuplicateEdge(Edge, ClockId),
    #[error("clock {0} is unknown")]
    UnknownClock(ClockId),
    #[error("clock {clock} maps to {edge} but {edge} maps to {back:?}")]
    Mismatch {
        clock: ClockId,
        edge: Edge,
        back: Option<ClockId>,
    },
    #[error("registry covers {registered} edges, graph has {expected}")]
    Coverage { registered: usize, expected: usize },
    #[error("graph edge {0} has no clock")]
    Uncovered(Edge),
}

impl RegistryError {
    /// Edge the error is about, if any
    pub fn edge(&self) -> Option<Edge> {
        match self {
            RegistryError::MissingEdge(edge)
            | RegistryError::DuplicateEdge(edge, _)
            | RegistryError::Uncovered(edge)
            | RegistryError::Mismatch { edge, .. } => Some(*edge),
            RegistryError::UnknownClock(_) | RegistryError::Coverage { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClockRegistry {
    // indexed by clock id, ids are never reused or removed
    clock_to_edge: Vec<Edge>,
    edge_to_clock: HashMap<Edge, ClockId>,
}

impl ClockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign clocks 0..n to `edges` in iteration order
    pub fn from_edges<I: IntoIterator<Item = Edge>>(edges: I) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for edge in edges {
            registry.insert(edge)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, edge: Edge) -> Result<ClockId, RegistryError> {
        if let Some(&clock) = self.edge_to_clock.get(&edge) {
            return Err(RegistryError::DuplicateEdge(edge, clock));
        }
        let clock = self.clock_to_edge.len() as ClockId;
        self.clock_to_edge.push(edge);
        self.edge_to_clock.insert(edge, clock);
        Ok(clock)
    }

    pub fn len(&self) -> usize {
        self.clock_to_edge.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clock_to_edge.is_empty()
    }

    pub fn edge_of(&self, clock: ClockId) -> Option<Edge> {
        self.clock_to_edge.get(clock as usize).copied()
    }

    pub fn clock_of(&self, edge: &Edge) -> Option<ClockId> {
        self.edge_to_clock.get(edge).copied()
    }

    pub fn clocks(&self) -> impl Iterator<Item = (ClockId, Edge)> + '_ {
        self.clock_to_edge
            .iter()
            .enumerate()
            .map(|(clock, edge)| (clock as ClockId, *edge))
    }

    /// Move the clock of `from` onto `to`. Either both maps change or neither.
    pub fn migrate(&mut self, from: Edge, to: Edge) -> Result<ClockId, RegistryError> {
        let clock = self
            .clock_of(&from)
            .ok_or(RegistryError::MissingEdge(from))?;
        if let Some(existing) = self.clock_of(&to) {
            return Err(RegistryError::DuplicateEdge(to, existing));
        }

        self.edge_to_clock.remove(&from);
        self.edge_to_clock.insert(to, clock);
        self.clock_to_edge[clock as usize] = to;
        Ok(clock)
    }

    /// Check that both maps are mutual inverses covering exactly `edges`.
    pub fn verify(&self, edges: &BTreeSet<Edge>) -> Result<(), RegistryError> {
        for (clock, edge) in self.clocks() {
            let back = self.clock_of(&edge);
            if back != Some(clock) {
                return Err(RegistryError::Mismatch { clock, edge, back });
            }
        }
        if self.edge_to_clock.len() != self.clock_to_edge.len() || self.len() != edges.len() {
            return Err(RegistryError::Coverage {
                registered: self.edge_to_clock.len(),
                expected: edges.len(),
            });
        }
        if let Some(edge) = edges.iter().find(|e| !self.edge_to_clock.contains_key(*e)) {
            return Err(RegistryError::Uncovered(*edge));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> ClockRegistry {
        ClockRegistry::from_edges([Edge::new(0, 1), Edge::new(1, 2), Edge::new(0, 2)]).unwrap()
    }

    #[test]
    fn test_ids_follow_insertion_order() {
        let registry = triangle();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.edge_of(1), Some(Edge::new(1, 2)));
        assert_eq!(registry.clock_of(&Edge::new(2, 0)), Some(2));
        assert_eq!(registry.edge_of(7), None);
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let mut registry = triangle();
        assert_eq!(
            registry.insert(Edge::new(1, 0)),
            Err(RegistryError::DuplicateEdge(Edge::new(0, 1), 0))
        );
    }

    #[test]
    fn test_migrate_keeps_clock_id() {
        let mut registry = triangle();
        let clock = registry.migrate(Edge::new(0, 1), Edge::new(1, 3)).unwrap();
        assert_eq!(clock, 0);
        assert_eq!(registry.edge_of(0), Some(Edge::new(1, 3)));
        assert_eq!(registry.clock_of(&Edge::new(0, 1)), None);
        assert_eq!(registry.clock_of(&Edge::new(3, 1)), Some(0));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_failed_migrate_changes_nothing() {
        let mut registry = triangle();
        assert_eq!(
            registry.migrate(Edge::new(0, 1), Edge::new(1, 2)),
            Err(RegistryError::DuplicateEdge(Edge::new(1, 2), 1))
        );
        assert_eq!(
            registry.migrate(Edge::new(4, 5), Edge::new(4, 6)),
            Err(RegistryError::MissingEdge(Edge::new(4, 5)))
        );
        assert_eq!(registry.edge_of(0), Some(Edge::new(0, 1)));
        assert_eq!(registry.clock_of(&Edge::new(0, 1)), Some(0));
    }

    #[test]
    fn test_verify_against_edge_set() {
        let mut registry = triangle();
        let mut edges: BTreeSet<Edge> =
            [Edge::new(0, 1), Edge::new(1, 2), Edge::new(0, 2)].into_iter().collect();
        assert!(registry.verify(&edges).is_ok());

        registry.migrate(Edge::new(0, 2), Edge::new(2, 3)).unwrap();
        assert_eq!(
            registry.verify(&edges),
            Err(RegistryError::Uncovered(Edge::new(0, 2)))
        );

        edges.remove(&Edge::new(0, 2));
        edges.insert(Edge::new(2, 3));
        assert!(registry.verify(&edges).is_ok());

        edges.insert(Edge::new(5, 6));
        assert!(matches!(
            registry.verify(&edges),
            Err(RegistryError::Coverage { .. })
        ));
    }
}
