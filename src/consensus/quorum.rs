use std::collections::HashSet;
use std::net::SocketAddr;

use super::proposal::ProposalNumber;

/// Smallest majority of `members`.
pub fn majority(members: usize) -> usize {
    members / 2 + 1
}

/// The fixed acceptor set. Quorums are majorities of this configured
/// membership, never of whichever peers happen to be reachable.
#[derive(Debug, Clone)]
pub struct Membership {
    local: SocketAddr,
    members: Vec<SocketAddr>,
}

impl Membership {
    /// The local address always belongs to the membership.
    pub fn new(local: SocketAddr, members: impl IntoIterator<Item = SocketAddr>) -> Self {
        let mut all: Vec<SocketAddr> = Vec::new();
        for addr in std::iter::once(local).chain(members) {
            if !all.contains(&addr) {
                all.push(addr);
            }
        }
        all.sort();
        Self {
            local,
            members: all,
        }
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn members(&self) -> &[SocketAddr] {
        &self.members
    }

    pub fn peers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.members.iter().copied().filter(move |addr| *addr != self.local)
    }

    pub fn is_local(&self, addr: &SocketAddr) -> bool {
        *addr == self.local
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn quorum(&self) -> usize {
        majority(self.members.len())
    }

    pub fn tracker(&self) -> QuorumTracker {
        QuorumTracker::new(self.members.len())
    }
}

/// Counts grants and rejections of one phase of one round.
#[derive(Debug)]
pub struct QuorumTracker {
    members: usize,
    needed: usize,
    granted: HashSet<SocketAddr>,
    rejected: HashSet<SocketAddr>,
    highest_rejection: Option<ProposalNumber>,
}

impl QuorumTracker {
    pub fn new(members: usize) -> Self {
        Self {
            members,
            needed: majority(members),
            granted: HashSet::new(),
            rejected: HashSet::new(),
            highest_rejection: None,
        }
    }

    /// Returns true once a majority has granted. Repeats are not counted twice.
    pub fn grant(&mut self, from: SocketAddr) -> bool {
        if !self.rejected.contains(&from) {
            self.granted.insert(from);
        }
        self.is_reached()
    }

    pub fn reject(&mut self, from: SocketAddr, highest: ProposalNumber) {
        if !self.granted.contains(&from) {
            self.rejected.insert(from);
        }
        if self.highest_rejection.is_none_or(|seen| highest > seen) {
            self.highest_rejection = Some(highest);
        }
    }

    pub fn is_reached(&self) -> bool {
        self.granted.len() >= self.needed
    }

    /// Enough rejections that a majority can no longer be reached.
    pub fn is_lost(&self) -> bool {
        self.rejected.len() > self.members - self.needed
    }

    pub fn granted(&self) -> usize {
        self.granted.len()
    }

    pub fn needed(&self) -> usize {
        self.needed
    }

    pub fn highest_rejection(&self) -> Option<ProposalNumber> {
        self.highest_rejection
    }
}
