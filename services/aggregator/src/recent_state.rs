//! Bounded recent-state cache
//!
//! Remembers, per transaction, the contribution its latest observed event
//! made to the aggregates. An UPDATE consults it to retract the prior
//! contribution before adding the new one. Capacity is bounded; the oldest
//! recorded transaction is evicted first.

use std::collections::{HashMap, VecDeque};

use types::aggregate::RecentEntries;
use types::event::SequenceToken;
use types::ids::TransactionId;

pub use types::aggregate::PriorContribution;

pub struct RecentStateCache {
    capacity: usize,
    entries: HashMap<TransactionId, (PriorContribution, u64)>,
    // Insertion order as (id, stamp); stale stamps are skipped on eviction.
    order: VecDeque<(TransactionId, u64)>,
    next_stamp: u64,
    evictions: u64,
}

impl RecentStateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_stamp: 0,
            evictions: 0,
        }
    }

    pub fn get(&self, transaction_id: &TransactionId) -> Option<&PriorContribution> {
        self.entries.get(transaction_id).map(|(prior, _)| prior)
    }

    /// Whether an event with `token` is newer than what the cache holds for
    /// the transaction. Unknown transactions are always newer.
    pub fn is_newer(&self, transaction_id: &TransactionId, token: SequenceToken) -> bool {
        self.get(transaction_id)
            .map_or(true, |prior| token > prior.sequence_token)
    }

    /// Record the current contribution of a transaction.
    pub fn record(&mut self, transaction_id: TransactionId, prior: PriorContribution) {
        if self.capacity == 0 {
            return;
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.order.push_back((transaction_id.clone(), stamp));
        self.entries.insert(transaction_id, (prior, stamp));

        while self.entries.len() > self.capacity {
            let Some((oldest, stamp)) = self.order.pop_front() else {
                break;
            };
            if matches!(self.entries.get(&oldest), Some((_, s)) if *s == stamp) {
                self.entries.remove(&oldest);
                self.evictions += 1;
            }
        }
        self.compact();
    }

    /// Forget a transaction (after a DELETE).
    pub fn evict(&mut self, transaction_id: &TransactionId) -> Option<PriorContribution> {
        let removed = self.entries.remove(transaction_id).map(|(prior, _)| prior);
        self.compact();
        removed
    }

    /// Live entries, oldest first. Restoring them into an empty cache of the
    /// same capacity reproduces this cache's lookups and eviction order.
    pub fn entries(&self) -> RecentEntries {
        self.order
            .iter()
            .filter_map(|(id, stamp)| match self.entries.get(id) {
                Some((prior, s)) if s == stamp => Some((id.clone(), prior.clone())),
                _ => None,
            })
            .collect()
    }

    /// Replace the contents with `entries`, oldest first.
    pub fn restore(&mut self, entries: RecentEntries) {
        self.entries.clear();
        self.order.clear();
        for (id, prior) in entries {
            self.record(id, prior);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped because the cache was full.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    // Re-recording or evicting a transaction leaves its old stamp in
    // `order`; drop those once they dominate the queue.
    fn compact(&mut self) {
        if self.order.len() > 2 * self.entries.len().max(16) {
            let entries = &self.entries;
            self.order
                .retain(|(id, stamp)| matches!(entries.get(id), Some((_, s)) if s == stamp));
        }
    }
}
