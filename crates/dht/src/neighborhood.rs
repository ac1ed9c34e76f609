use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use crate::{bprotocol::Node, id20::Id20};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    Fresh,
    Queried,
    Responded,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: Id20,
    pub addr: SocketAddr,
    pub state: CandidateState,
}

/// The closest peers to one target found so far, at most `k` of them, sorted
/// by distance.
///
/// The kept set only depends on which peers were inserted and which failed,
/// not on the order that happened in.
#[derive(Debug)]
pub struct Neighborhood {
    target: Id20,
    k: usize,
    entries: Vec<Candidate>,
    // Survives truncation, so a peer is never queried twice.
    contacted: HashMap<Id20, CandidateState>,
    failed: HashSet<Id20>,
}

impl Neighborhood {
    pub fn new(target: Id20, k: usize) -> Self {
        Self {
            target,
            k,
            entries: Vec::with_capacity(k + 1),
            contacted: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    pub fn target(&self) -> Id20 {
        self.target
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Candidate] {
        &self.entries
    }

    /// Returns true if the peer is (still) part of the neighborhood.
    pub fn insert(&mut self, id: Id20, addr: SocketAddr) -> bool {
        if self.failed.contains(&id) {
            return false;
        }
        let distance = self.target.distance(&id);
        let pos = match self
            .entries
            .binary_search_by_key(&distance, |c| self.target.distance(&c.id))
        {
            Ok(_) => return true,
            Err(pos) => pos,
        };
        if pos >= self.k {
            return false;
        }
        let state = self
            .contacted
            .get(&id)
            .copied()
            .unwrap_or(CandidateState::Fresh);
        self.entries.insert(pos, Candidate { id, addr, state });
        self.entries.truncate(self.k);
        true
    }

    fn set_state(&mut self, id: &Id20, state: CandidateState) {
        self.contacted.insert(*id, state);
        if let Some(c) = self.entries.iter_mut().find(|c| &c.id == id) {
            c.state = state;
        }
    }

    pub fn mark_queried(&mut self, id: &Id20) {
        self.set_state(id, CandidateState::Queried)
    }

    pub fn mark_responded(&mut self, id: &Id20) {
        self.set_state(id, CandidateState::Responded)
    }

    /// Drops a peer that didn't answer and keeps it out for good.
    pub fn mark_failed(&mut self, id: &Id20) {
        self.failed.insert(*id);
        self.entries.retain(|c| &c.id != id);
    }

    /// Up to `n` closest peers that were never queried.
    pub fn next_unqueried(&self, n: usize) -> Vec<Node<SocketAddr>> {
        self.entries
            .iter()
            .filter(|c| c.state == CandidateState::Fresh)
            .take(n)
            .map(|c| Node {
                id: c.id,
                addr: c.addr,
            })
            .collect()
    }

    pub fn best_distance(&self) -> Option<Id20> {
        self.entries.first().map(|c| self.target.distance(&c.id))
    }

    pub fn responded(&self) -> impl Iterator<Item = &Candidate> {
        self.entries
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
    }
}
