use std::collections::BTreeMap;

use super::contact::Contact;
use super::node_id::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    InFlight,
    Responded,
    Failed,
}

/// Shortlist of an iterative lookup, keyed by distance to the target.
///
/// Pure bookkeeping; the caller does the networking. The closest distance
/// ever seen only moves towards the target.
pub struct LookupState {
    target: NodeId,
    local: NodeId,
    shortlist: BTreeMap<NodeId, (Contact, Status)>,
    closest: Option<NodeId>,
    improved: bool,
}

impl LookupState {
    pub fn new(target: NodeId, local: NodeId, seeds: Vec<Contact>) -> Self {
        let mut state = Self {
            target,
            local,
            shortlist: BTreeMap::new(),
            closest: None,
            improved: false,
        };
        state.insert(seeds);
        state.improved = false;
        state
    }

    fn insert(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            if contact.node_id == self.local {
                continue;
            }
            let distance = contact.node_id.distance(&self.target);
            if self.closest.is_none_or(|closest| distance < closest) {
                self.closest = Some(distance);
                self.improved = true;
            }
            self.shortlist
                .entry(distance)
                .or_insert((contact, Status::Pending));
        }
    }

    fn set_status(&mut self, node_id: &NodeId, status: Status) {
        let distance = node_id.distance(&self.target);
        if let Some(entry) = self.shortlist.get_mut(&distance) {
            entry.1 = status;
        }
    }

    /// Up to `alpha` closest contacts not queried yet; marks them in flight.
    pub fn next_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let mut batch = Vec::new();
        for (contact, status) in self.shortlist.values_mut() {
            if batch.len() == alpha {
                break;
            }
            if *status == Status::Pending {
                *status = Status::InFlight;
                batch.push(contact.clone());
            }
        }
        batch
    }

    /// Record a response from `from` carrying `contacts`.
    pub fn absorb(&mut self, from: &NodeId, contacts: Vec<Contact>) {
        self.set_status(from, Status::Responded);
        self.insert(contacts);
    }

    pub fn mark_failed(&mut self, node_id: &NodeId) {
        self.set_status(node_id, Status::Failed);
    }

    /// Ends a round. Returns whether it discovered a closer node.
    pub fn finish_round(&mut self) -> bool {
        std::mem::take(&mut self.improved)
    }

    /// Contacts among the `count` closest live ones that were never queried.
    pub fn unqueried_within(&self, count: usize) -> usize {
        self.shortlist
            .values()
            .filter(|(_, status)| *status != Status::Failed)
            .take(count)
            .filter(|(_, status)| *status == Status::Pending)
            .count()
    }

    pub fn closest_distance(&self) -> Option<NodeId> {
        self.closest
    }

    pub fn responded(&self) -> usize {
        self.shortlist
            .values()
            .filter(|(_, status)| *status == Status::Responded)
            .count()
    }

    /// Non-failed contacts by ascending distance to the target.
    pub fn into_results(self, count: usize) -> Vec<Contact> {
        self.shortlist
            .into_values()
            .filter(|(_, status)| *status != Status::Failed)
            .map(|(contact, _)| contact)
            .take(count)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ID_LEN;
    use std::net::SocketAddr;

    fn id(first: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = first;
        NodeId::new(bytes)
    }

    fn contact(first: u8) -> Contact {
        let addr: SocketAddr = format!("127.0.0.1:{}", 7000 + first as u16).parse().unwrap();
        Contact::new(id(first), addr)
    }

    #[test]
    fn test_batches_closest_first() {
        let target = id(0x00);
        let mut state = LookupState::new(
            target,
            id(0xFF),
            vec![contact(0x40), contact(0x10), contact(0x80), contact(0x20)],
        );

        let batch: Vec<NodeId> = state.next_batch(2).iter().map(|c| c.node_id).collect();
        assert_eq!(batch, vec![id(0x10), id(0x20)]);

        let batch: Vec<NodeId> = state.next_batch(5).iter().map(|c| c.node_id).collect();
        assert_eq!(batch, vec![id(0x40), id(0x80)]);
        assert!(state.next_batch(3).is_empty());
    }

    #[test]
    fn test_closest_distance_is_monotonic() {
        let target = id(0x00);
        let mut state = LookupState::new(target, id(0xFF), vec![contact(0x40)]);
        let mut previous = state.closest_distance();

        let rounds = vec![
            vec![contact(0x80), contact(0x20)],
            vec![contact(0x60)],
            vec![contact(0x08), contact(0x30)],
        ];
        for contacts in rounds {
            for queried in state.next_batch(3) {
                state.absorb(&queried.node_id, contacts.clone());
            }
            let current = state.closest_distance();
            assert!(current <= previous);
            previous = current;
        }
        assert_eq!(state.closest_distance(), Some(id(0x08)));
    }

    #[test]
    fn test_round_without_progress_stops() {
        let target = id(0x00);
        let mut state = LookupState::new(target, id(0xFF), vec![contact(0x10)]);
        assert!(!state.finish_round());

        let queried = state.next_batch(3);
        state.absorb(&queried[0].node_id, vec![contact(0x08)]);
        assert!(state.finish_round());

        let queried = state.next_batch(3);
        state.absorb(&queried[0].node_id, vec![contact(0x40)]);
        assert!(!state.finish_round());
    }

    #[test]
    fn test_unqueried_counts_only_the_closest() {
        let target = id(0x00);
        let mut state = LookupState::new(
            target,
            id(0xFF),
            vec![contact(0x10), contact(0x20), contact(0x40)],
        );
        assert_eq!(state.unqueried_within(2), 2);

        let queried = state.next_batch(1);
        state.mark_failed(&queried[0].node_id);
        assert_eq!(state.unqueried_within(2), 2);

        state.next_batch(2);
        assert_eq!(state.unqueried_within(3), 0);
    }

    #[test]
    fn test_results_skip_failed_and_local() {
        let target = id(0x00);
        let local = id(0x01);
        let mut state = LookupState::new(
            target,
            local,
            vec![contact(0x01), contact(0x10), contact(0x20)],
        );

        for queried in state.next_batch(3) {
            if queried.node_id == id(0x10) {
                state.mark_failed(&queried.node_id);
            } else {
                state.absorb(&queried.node_id, vec![]);
            }
        }

        assert_eq!(state.responded(), 1);
        let results: Vec<NodeId> = state.into_results(10).iter().map(|c| c.node_id).collect();
        assert_eq!(results, vec![id(0x20)]);
    }
}
