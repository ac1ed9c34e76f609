use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use serde::Serialize;
use tracing::trace;

use crate::{bprotocol::Node, id20::Id20, neighborhood::Neighborhood};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SearchKind {
    /// Sends "get" and stops as soon as someone serves the target.
    Lookup,
    /// Sends "find_node"; the responders are then sent "announce".
    Announce,
    /// Sends "find_node" to populate the routing table.
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchState {
    Init,
    Querying,
    Converged,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(IpAddr),
    NotFound,
    TimedOut,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SearchStep {
    /// Peers to query now, possibly none.
    Continue(Vec<Node<SocketAddr>>),
    Done(SearchOutcome),
}

/// One iterative lookup of a target.
///
/// Peers are queried in rounds of `alpha`. A round ends once every peer
/// queried in it answered or failed. If the round brought no peer closer than
/// the best known before it, every remaining unqueried neighbor is queried in
/// one last round; the search converges when a round ends with nothing left to
/// query.
#[derive(Debug)]
pub struct Search {
    kind: SearchKind,
    state: SearchState,
    neighborhood: Neighborhood,
    alpha: usize,
    deadline: Instant,
    round: HashSet<Id20>,
    best_before_round: Option<Id20>,
    rounds: usize,
    outcome: Option<SearchOutcome>,
}

impl Search {
    pub fn new(kind: SearchKind, target: Id20, k: usize, alpha: usize, deadline: Instant) -> Self {
        Self {
            kind,
            state: SearchState::Init,
            neighborhood: Neighborhood::new(target, k),
            alpha: alpha.max(1),
            deadline,
            round: HashSet::new(),
            best_before_round: None,
            rounds: 0,
            outcome: None,
        }
    }

    pub fn kind(&self) -> SearchKind {
        self.kind
    }

    pub fn target(&self) -> Id20 {
        self.neighborhood.target()
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn neighborhood(&self) -> &Neighborhood {
        &self.neighborhood
    }

    pub fn outcome(&self) -> Option<SearchOutcome> {
        self.outcome
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    /// Seeds the neighborhood with the `alpha` closest known peers and
    /// queries them.
    pub fn start(&mut self, known: impl IntoIterator<Item = Node<SocketAddr>>) -> SearchStep {
        if self.state != SearchState::Init {
            return self.current();
        }
        for node in known.into_iter().take(self.alpha) {
            self.neighborhood.insert(node.id, node.addr);
        }
        self.state = SearchState::Querying;
        self.next_round(true)
    }

    pub fn on_response(
        &mut self,
        from: &Id20,
        nodes: impl IntoIterator<Item = Node<SocketAddr>>,
        answer: Option<IpAddr>,
    ) -> SearchStep {
        if self.is_done() {
            return self.current();
        }
        self.neighborhood.mark_responded(from);
        if let (SearchKind::Lookup, Some(addr)) = (self.kind, answer) {
            return self.finish(SearchState::Converged, SearchOutcome::Found(addr));
        }
        for node in nodes {
            if node.id != *from {
                self.neighborhood.insert(node.id, node.addr);
            }
        }
        self.on_settled(from)
    }

    pub fn on_failure(&mut self, from: &Id20) -> SearchStep {
        if self.is_done() {
            return self.current();
        }
        self.neighborhood.mark_failed(from);
        self.on_settled(from)
    }

    /// Checks the deadline.
    pub fn poll(&mut self, now: Instant) -> SearchStep {
        if !self.is_done() && now >= self.deadline {
            return self.finish(SearchState::TimedOut, SearchOutcome::TimedOut);
        }
        self.current()
    }

    fn current(&self) -> SearchStep {
        match self.outcome {
            Some(outcome) => SearchStep::Done(outcome),
            None => SearchStep::Continue(Vec::new()),
        }
    }

    fn finish(&mut self, state: SearchState, outcome: SearchOutcome) -> SearchStep {
        trace!(
            kind = ?self.kind,
            id = ?self.target(),
            rounds = self.rounds,
            ?outcome,
            "search finished"
        );
        self.state = state;
        self.outcome = Some(outcome);
        self.round.clear();
        SearchStep::Done(outcome)
    }

    fn on_settled(&mut self, from: &Id20) -> SearchStep {
        if !self.round.remove(from) || !self.round.is_empty() {
            return SearchStep::Continue(Vec::new());
        }
        let improved = match (self.best_before_round, self.neighborhood.best_distance()) {
            (None, Some(_)) => true,
            (Some(before), Some(now)) => now < before,
            (_, None) => false,
        };
        self.next_round(improved)
    }

    fn next_round(&mut self, improved: bool) -> SearchStep {
        let n = if improved { self.alpha } else { usize::MAX };
        let queries = self.neighborhood.next_unqueried(n);
        if queries.is_empty() {
            return self.finish(SearchState::Converged, SearchOutcome::NotFound);
        }
        self.rounds += 1;
        self.best_before_round = self.neighborhood.best_distance();
        for q in queries.iter() {
            self.neighborhood.mark_queried(&q.id);
            self.round.insert(q.id);
        }
        SearchStep::Continue(queries)
    }
}
