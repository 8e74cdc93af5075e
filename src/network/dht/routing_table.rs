use log::{debug, trace};
use std::collections::VecDeque;

use super::contact::Contact;
use super::node_id::{ID_BITS, NodeId};

/// Result of offering a contact to the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Refreshed,
    /// The bucket is full. The caller should ping `oldest` and call
    /// [`RoutingTable::replace`] if it does not answer.
    BucketFull { oldest: Contact, candidate: Contact },
    Ignored,
}

/// Up to `capacity` contacts, least-recently-seen at the front.
#[derive(Clone)]
struct KBucket {
    contacts: VecDeque<Contact>,
}

impl KBucket {
    fn new() -> Self {
        Self {
            contacts: VecDeque::new(),
        }
    }

    fn position(&self, node_id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.node_id == node_id)
    }

    fn insert(&mut self, contact: Contact, capacity: usize) -> InsertOutcome {
        if let Some(pos) = self.position(&contact.node_id) {
            if let Some(mut existing) = self.contacts.remove(pos) {
                existing.addr = contact.addr;
                self.contacts.push_back(existing);
            }
            return InsertOutcome::Refreshed;
        }

        if self.contacts.len() < capacity {
            self.contacts.push_back(contact);
            return InsertOutcome::Inserted;
        }

        match self.contacts.front() {
            Some(oldest) => InsertOutcome::BucketFull {
                oldest: oldest.clone(),
                candidate: contact,
            },
            None => InsertOutcome::Ignored,
        }
    }

    fn touch(&mut self, node_id: &NodeId) -> bool {
        match self.position(node_id).and_then(|pos| self.contacts.remove(pos)) {
            Some(contact) => {
                self.contacts.push_back(contact);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, node_id: &NodeId) -> Option<Contact> {
        self.position(node_id)
            .and_then(|pos| self.contacts.remove(pos))
    }
}

/// Kademlia routing table: one k-bucket per bit of XOR distance.
pub struct RoutingTable {
    local_id: NodeId,
    bucket_size: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, bucket_size: usize) -> Self {
        Self {
            local_id,
            bucket_size: bucket_size.max(1),
            buckets: vec![KBucket::new(); ID_BITS],
        }
    }

    pub fn add_contact(&mut self, contact: Contact) -> InsertOutcome {
        let Some(bucket_idx) = self.local_id.bucket_index(&contact.node_id) else {
            return InsertOutcome::Ignored;
        };

        let outcome = self.buckets[bucket_idx].insert(contact, self.bucket_size);
        trace!("bucket {} insert: {:?}", bucket_idx, outcome);
        outcome
    }

    /// Mark a contact as just seen. Returns false if it is unknown.
    pub fn touch(&mut self, node_id: &NodeId) -> bool {
        match self.local_id.bucket_index(node_id) {
            Some(bucket_idx) => self.buckets[bucket_idx].touch(node_id),
            None => false,
        }
    }

    /// Evict `stale` in favour of `candidate`, which must share its bucket.
    pub fn replace(&mut self, stale: &NodeId, candidate: Contact) -> bool {
        let (Some(stale_idx), Some(candidate_idx)) = (
            self.local_id.bucket_index(stale),
            self.local_id.bucket_index(&candidate.node_id),
        ) else {
            return false;
        };
        if stale_idx != candidate_idx {
            return false;
        }

        let bucket = &mut self.buckets[stale_idx];
        if bucket.remove(stale).is_none() {
            return false;
        }
        debug!("evicted {} from bucket {} for {}", stale, stale_idx, candidate.node_id);
        bucket.insert(candidate, self.bucket_size);
        true
    }

    pub fn remove_contact(&mut self, node_id: &NodeId) -> bool {
        match self.local_id.bucket_index(node_id) {
            Some(bucket_idx) => self.buckets[bucket_idx].remove(node_id).is_some(),
            None => false,
        }
    }

    /// Up to `count` contacts ordered by ascending XOR distance to `target`.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all_contacts = self.all_contacts();
        all_contacts.sort_by_key(|c| c.node_id.distance(target));
        all_contacts.truncate(count);
        all_contacts
    }

    /// The least-recently-seen contact of every non-empty bucket.
    pub fn oldest_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.contacts.front().cloned())
            .collect()
    }

    pub fn contact_count(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    /// Number of non-empty buckets; bounds the rounds a lookup can improve.
    pub fn depth(&self) -> usize {
        self.buckets.iter().filter(|b| !b.contacts.is_empty()).count()
    }

    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.contacts.iter().cloned())
            .collect()
    }
}
