use std::collections::HashSet;

use palaver_core::NodeId;

/// Role in the leader-election protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Leader-election bookkeeping, Raft-style but liveness only: the cluster
/// agrees on which node recomputes the ring, nothing is replicated.
///
/// Pure state machine; the timer loop and the wire live in [`crate::Cluster`].
/// Every transition keeps the term monotonically non-decreasing.
#[derive(Debug)]
pub struct FailoverState {
    me: NodeId,
    /// Number of configured nodes, this one included. Majority is computed
    /// against configuration, not against whoever happens to be up.
    configured: usize,
    term: u64,
    /// Highest term this node has granted a vote in.
    voted_in: u64,
    role: Role,
    leader: Option<NodeId>,
    votes: HashSet<NodeId>,
    missed: u32,
}

impl FailoverState {
    pub fn new(me: NodeId, configured: usize) -> Self {
        Self {
            me,
            configured: configured.max(1),
            term: 0,
            voted_in: 0,
            role: Role::Follower,
            leader: None,
            votes: HashSet::new(),
            missed: 0,
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn majority(&self) -> usize {
        self.configured / 2 + 1
    }

    /// Follower timer tick. Returns true once enough consecutive
    /// heartbeats have been missed that an election should start.
    pub fn heartbeat_missed(&mut self, max_missed: u32) -> bool {
        if self.role != Role::Follower {
            return false;
        }
        self.missed += 1;
        self.missed >= max_missed
    }

    /// A heartbeat from a claimed leader. Accepted when its term is at
    /// least ours; acceptance resets the missed counter and demotes a
    /// stale candidate or leader.
    pub fn observe_heartbeat(&mut self, term: u64, leader: &NodeId) -> bool {
        if term < self.term {
            return false;
        }
        if term > self.term || self.leader.as_ref() != Some(leader) || self.role != Role::Follower {
            tracing::info!(%leader, term, "accepting leader");
        }
        self.term = term;
        self.role = Role::Follower;
        self.leader = Some(leader.clone());
        self.votes.clear();
        self.missed = 0;
        true
    }

    /// A vote request from a candidate. Granted only for a term newer
    /// than any this node has seen or voted in; one vote per term.
    pub fn grant_vote(&mut self, term: u64, candidate: &NodeId) -> bool {
        if term <= self.term || term <= self.voted_in {
            return false;
        }
        self.term = term;
        self.voted_in = term;
        self.role = Role::Follower;
        self.leader = None;
        self.votes.clear();
        self.missed = 0;
        tracing::info!(%candidate, term, "vote granted");
        true
    }

    /// Give up on the current leader and stand for election. Returns the
    /// new term; the caller broadcasts the vote request.
    pub fn start_election(&mut self) -> u64 {
        self.term += 1;
        self.voted_in = self.term;
        self.role = Role::Candidate;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.me.clone());
        self.missed = 0;
        tracing::info!(term = self.term, "starting election");
        self.term
    }

    /// A ballot came back. Returns true when this ballot completes a
    /// strict majority and the node becomes leader.
    pub fn record_ballot(&mut self, term: u64, from: &NodeId, granted: bool) -> bool {
        if self.role != Role::Candidate || term != self.term || !granted {
            return false;
        }
        self.votes.insert(from.clone());
        if self.votes.len() >= self.majority() {
            self.role = Role::Leader;
            self.leader = Some(self.me.clone());
            tracing::info!(term = self.term, votes = self.votes.len(), "won election");
            true
        } else {
            false
        }
    }

    /// The election window elapsed without a majority; abandon the term
    /// and wait for someone else's heartbeat or the next timeout.
    pub fn election_timed_out(&mut self) {
        if self.role == Role::Candidate {
            tracing::info!(term = self.term, "election timed out");
            self.role = Role::Follower;
            self.votes.clear();
            self.missed = 0;
        }
    }

    /// A peer went unreachable. Clears the leader slot if it was the
    /// leader so the missed-heartbeat timer takes over promptly.
    pub fn node_down(&mut self, node: &NodeId) {
        if self.leader.as_ref() == Some(node) {
            self.leader = None;
        }
    }
}
