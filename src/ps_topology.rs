//! Initial k-regular overlay graph.

use crate::ps_error::{SetupError, SimError, SimResult};
use crate::ps_interface::{Edge, PeerId};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

// restarts before giving up on the stub pairing
const MAX_GENERATION_ATTEMPTS: usize = 100;

/// Simple undirected graph where every vertex has the same degree
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    nodes: usize,
    degree: usize,
    edges: Vec<Edge>,
}

impl Topology {
    pub fn from_edges(nodes: usize, degree: usize, edges: Vec<Edge>) -> SimResult<Self> {
        let mut seen = BTreeSet::new();
        let mut degrees = vec![0usize; nodes];
        for edge in &edges {
            if edge.high() as usize >= nodes {
                return Err(SimError::InvalidConfig(format!(
                    "edge {} outside of 0..{}",
                    edge, nodes
                )));
            }
            if edge.low() == edge.high() {
                return Err(SimError::InvalidConfig(format!("self loop {}", edge)));
            }
            if !seen.insert(*edge) {
                return Err(SimError::InvalidConfig(format!("duplicate edge {}", edge)));
            }
            degrees[edge.low() as usize] += 1;
            degrees[edge.high() as usize] += 1;
        }
        if let Some(vertex) = degrees.iter().position(|d| *d != degree) {
            return Err(SimError::InvalidConfig(format!(
                "vertex {} has degree {}, expected {}",
                vertex, degrees[vertex], degree
            )));
        }

        Ok(Self {
            nodes,
            degree,
            edges,
        })
    }

    /// Read an edge list: one `u v` or `u,v` pair per line, `#` starts a comment.
    /// Vertex count and degree are inferred from the edges.
    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let content = std::fs::read_to_string(path).map_err(|e| SetupError::io(path, e))?;

        let mut edges = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|p| !p.is_empty())
                .collect();
            let [u, v] = parts.as_slice() else {
                return Err(SetupError::malformed(path, line_no + 1, "expected two vertex ids"));
            };
            let parse = |s: &str| {
                s.parse::<PeerId>().map_err(|e| {
                    SetupError::malformed(path, line_no + 1, format!("{:?}: {}", s, e))
                })
            };
            edges.push(Edge::new(parse(*u)?, parse(*v)?));
        }

        let nodes = edges
            .iter()
            .map(|e| e.high() as usize + 1)
            .max()
            .ok_or_else(|| SetupError::malformed(path, 0, "topology has no edges"))?;
        let degree = edges.iter().filter(|e| e.contains(0)).count();
        Ok(Self::from_edges(nodes, degree, edges)?)
    }

    /// Random k-regular graph built by repeatedly pairing free stubs and
    /// keeping every pair that forms a new simple edge.
    pub fn random_regular<R: Rng>(nodes: usize, degree: usize, rng: &mut R) -> SimResult<Self> {
        if degree >= nodes || (nodes * degree) % 2 != 0 {
            return Err(SimError::InvalidConfig(format!(
                "no simple {}-regular graph on {} vertices",
                degree, nodes
            )));
        }
        if degree == 0 {
            return Self::from_edges(nodes, 0, Vec::new());
        }

        for _ in 0..MAX_GENERATION_ATTEMPTS {
            if let Some(edges) = try_pairing(nodes, degree, rng) {
                return Self::from_edges(nodes, degree, edges.into_iter().collect());
            }
        }
        Err(SimError::InvalidConfig(format!(
            "failed to generate a {}-regular graph on {} vertices",
            degree, nodes
        )))
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn adjacency(&self) -> Vec<BTreeSet<PeerId>> {
        let mut adjacency = vec![BTreeSet::new(); self.nodes];
        for edge in &self.edges {
            adjacency[edge.low() as usize].insert(edge.high());
            adjacency[edge.high() as usize].insert(edge.low());
        }
        adjacency
    }
}

fn try_pairing<R: Rng>(nodes: usize, degree: usize, rng: &mut R) -> Option<BTreeSet<Edge>> {
    let mut edges = BTreeSet::new();
    let mut stubs: Vec<PeerId> = (0..nodes as PeerId)
        .flat_map(|v| std::iter::repeat(v).take(degree))
        .collect();

    while !stubs.is_empty() {
        let mut leftover: BTreeMap<PeerId, usize> = BTreeMap::new();
        stubs.shuffle(rng);
        for pair in stubs.chunks(2) {
            let (a, b) = (pair[0], pair[1]);
            let edge = Edge::new(a, b);
            if a != b && !edges.contains(&edge) {
                edges.insert(edge);
            } else {
                *leftover.entry(a).or_default() += 1;
                *leftover.entry(b).or_default() += 1;
            }
        }

        if !can_still_pair(&edges, &leftover) {
            return None;
        }
        stubs = leftover
            .iter()
            .flat_map(|(v, count)| std::iter::repeat(*v).take(*count))
            .collect();
    }
    Some(edges)
}

// at least one pair of leftover vertices that is not yet connected
fn can_still_pair(edges: &BTreeSet<Edge>, leftover: &BTreeMap<PeerId, usize>) -> bool {
    if leftover.is_empty() {
        return true;
    }
    let vertices: Vec<PeerId> = leftover.keys().copied().collect();
    vertices.iter().enumerate().any(|(i, a)| {
        vertices[i + 1..]
            .iter()
            .any(|b| !edges.contains(&Edge::new(*a, *b)))
    })
}
