//! Delta resolver
//!
//! Maps an accepted change event to the signed deltas it contributes:
//!
//! | operation | count | amount |
//! |-----------|-------|--------|
//! | INSERT    | +1    | +amount |
//! | DELETE    | -1    | -amount |
//! | UPDATE    | 0     | new - prior (when the prior row is known) |
//!
//! The success/failure counters carry the same sign as the count, keyed by
//! the row's status. An UPDATE whose prior row is not in the recent-state
//! cache cannot be netted; it degrades to a zero delta that only advances
//! the row token, and is reported as a reconciliation gap.

use tracing::{debug, warn};
use types::aggregate::{AggregateDelta, AggregateKey, BucketWidth, RecentEntries};
use types::event::{ChangeEvent, Operation};

use crate::recent_state::{PriorContribution, RecentStateCache};

/// Count multiplier of an operation.
pub fn multiplier(operation: Operation) -> i64 {
    match operation {
        Operation::INSERT => 1,
        Operation::DELETE => -1,
        Operation::UPDATE => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// INSERT or DELETE: a single signed contribution
    Contribution,
    /// UPDATE with known prior: retraction plus addition
    Compensated,
    /// UPDATE without prior: amount and status left untouched
    ReconciliationGap,
    /// Event not newer than the cached state of its transaction
    StaleRedelivery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub kind: ResolutionKind,
    pub deltas: Vec<AggregateDelta>,
}

pub struct DeltaResolver {
    bucket_width: BucketWidth,
    cache: RecentStateCache,
    reconciliation_gaps: u64,
}

impl DeltaResolver {
    pub fn new(bucket_width: BucketWidth, recent_state_capacity: usize) -> Self {
        Self {
            bucket_width,
            cache: RecentStateCache::new(recent_state_capacity),
            reconciliation_gaps: 0,
        }
    }

    pub fn key_for(&self, event: &ChangeEvent) -> AggregateKey {
        AggregateKey::new(
            event.merchant_id.clone(),
            self.bucket_width.align(event.event_timestamp),
        )
    }

    /// Resolve one event into keyed deltas and update the cache.
    pub fn resolve(&mut self, event: &ChangeEvent) -> Resolution {
        let key = self.key_for(event);
        let token = event.sequence_token;
        let txn = event.transaction_id.clone();
        let stale = !self.cache.is_newer(&event.transaction_id, token);

        let resolution = match event.operation {
            Operation::INSERT | Operation::DELETE => {
                let delta = AggregateDelta::contribution(
                    key,
                    token,
                    txn,
                    multiplier(event.operation),
                    event.transaction_amount,
                    event.status,
                );
                Resolution {
                    kind: if stale {
                        ResolutionKind::StaleRedelivery
                    } else {
                        ResolutionKind::Contribution
                    },
                    deltas: vec![delta],
                }
            }
            Operation::UPDATE if stale => {
                // The cache already reflects a newer event of this
                // transaction; its deltas have been produced.
                debug!(
                    transaction_id = %event.transaction_id,
                    sequence_token = %token,
                    "Stale UPDATE re-delivery, no delta"
                );
                Resolution {
                    kind: ResolutionKind::StaleRedelivery,
                    deltas: Vec::new(),
                }
            }
            Operation::UPDATE => match self.cache.get(&event.transaction_id) {
                Some(prior) => Resolution {
                    kind: ResolutionKind::Compensated,
                    deltas: compensating_pair(prior, event, key),
                },
                None => {
                    self.reconciliation_gaps += 1;
                    warn!(
                        transaction_id = %event.transaction_id,
                        merchant_id = %event.merchant_id,
                        sequence_token = %token,
                        "UPDATE without known prior state, amount and status not reconciled"
                    );
                    Resolution {
                        kind: ResolutionKind::ReconciliationGap,
                        deltas: vec![AggregateDelta::zero(key, token, txn)],
                    }
                }
            },
        };

        if !stale {
            self.remember(event);
        }
        resolution
    }

    /// Update the cache from an event that is already covered by the
    /// checkpoint, without producing deltas.
    pub fn observe(&mut self, event: &ChangeEvent) {
        if self.cache.is_newer(&event.transaction_id, event.sequence_token) {
            self.remember(event);
        }
    }

    /// UPDATEs degraded so far.
    pub fn reconciliation_gaps(&self) -> u64 {
        self.reconciliation_gaps
    }

    pub fn cache(&self) -> &RecentStateCache {
        &self.cache
    }

    /// Replace the cache with entries recorded by an earlier run.
    pub fn restore(&mut self, entries: RecentEntries) {
        self.cache.restore(entries);
    }

    fn remember(&mut self, event: &ChangeEvent) {
        match event.operation {
            Operation::INSERT | Operation::UPDATE => {
                let key = self.key_for(event);
                self.cache.record(
                    event.transaction_id.clone(),
                    PriorContribution {
                        key,
                        amount: event.transaction_amount,
                        status: event.status,
                        sequence_token: event.sequence_token,
                    },
                );
            }
            Operation::DELETE => {
                self.cache.evict(&event.transaction_id);
            }
        }
    }
}

/// Retract `prior` and add the event's row, coalesced per key.
fn compensating_pair(
    prior: &PriorContribution,
    event: &ChangeEvent,
    key: AggregateKey,
) -> Vec<AggregateDelta> {
    let token = event.sequence_token;
    let retract = AggregateDelta::contribution(
        prior.key.clone(),
        token,
        event.transaction_id.clone(),
        -1,
        prior.amount,
        prior.status,
    );
    let add = AggregateDelta::contribution(
        key,
        token,
        event.transaction_id.clone(),
        1,
        event.transaction_amount,
        event.status,
    );

    if retract.key == add.key {
        // Same row: one net delta so the shared token is applied once.
        let mut net = retract;
        net.absorb(&add);
        if net.is_noop() {
            debug!(transaction_id = %event.transaction_id, "UPDATE with unchanged aggregate fields");
        }
        vec![net]
    } else {
        vec![retract, add]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use types::event::{SequenceToken, TransactionStatus};
    use types::ids::{MerchantId, TransactionId};

    fn event(
        txn: &str,
        op: Operation,
        offset: u64,
        merchant: &str,
        amount: i64,
        status: TransactionStatus,
        minute: u32,
    ) -> ChangeEvent {
        ChangeEvent::new(
            TransactionId::new(txn),
            op,
            SequenceToken::new(1, offset),
            MerchantId::new(merchant),
            Decimal::from(amount),
            status,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap(),
        )
    }

    fn resolver() -> DeltaResolver {
        DeltaResolver::new(BucketWidth::HOUR, 1_000)
    }

    use TransactionStatus::{FAILURE, SUCCESS};

    #[test]
    fn test_multipliers() {
        assert_eq!(multiplier(Operation::INSERT), 1);
        assert_eq!(multiplier(Operation::DELETE), -1);
        assert_eq!(multiplier(Operation::UPDATE), 0);
    }

    #[test]
    fn test_insert_and_delete_contributions() {
        let mut r = resolver();
        let ins = r.resolve(&event("t1", Operation::INSERT, 1, "m1", 100, SUCCESS, 0));
        assert_eq!(ins.kind, ResolutionKind::Contribution);
        assert_eq!(ins.deltas.len(), 1);
        assert_eq!(ins.deltas[0].count, 1);
        assert_eq!(ins.deltas[0].amount, Decimal::from(100));
        assert_eq!(ins.deltas[0].success, 1);

        let del = r.resolve(&event("t1", Operation::DELETE, 2, "m1", 100, SUCCESS, 0));
        assert_eq!(del.deltas[0].count, -1);
        assert_eq!(del.deltas[0].amount, Decimal::from(-100));
        assert_eq!(del.deltas[0].success, -1);
        assert!(r.cache().get(&TransactionId::new("t1")).is_none());
    }

    #[test]
    fn test_update_with_prior_nets_amount() {
        let mut r = resolver();
        r.resolve(&event("t1", Operation::INSERT, 1, "m1", 50, SUCCESS, 5));
        let upd = r.resolve(&event("t1", Operation::UPDATE, 2, "m1", 65, SUCCESS, 5));

        assert_eq!(upd.kind, ResolutionKind::Compensated);
        assert_eq!(upd.deltas.len(), 1);
        let net = &upd.deltas[0];
        assert_eq!(net.count, 0);
        assert_eq!(net.amount, Decimal::from(15));
        assert_eq!((net.success, net.failure), (0, 0));
        assert_eq!(net.sequence_token, SequenceToken::new(1, 2));
    }

    #[test]
    fn test_status_only_update() {
        let mut r = resolver();
        r.resolve(&event("t1", Operation::INSERT, 1, "m1", 50, SUCCESS, 5));
        let upd = r.resolve(&event("t1", Operation::UPDATE, 2, "m1", 50, FAILURE, 5));
        let net = &upd.deltas[0];
        assert_eq!(net.count, 0);
        assert_eq!(net.amount, Decimal::ZERO);
        assert_eq!((net.success, net.failure), (-1, 1));
    }

    #[test]
    fn test_update_across_buckets_emits_pair() {
        let mut r = resolver();
        r.resolve(&event("t1", Operation::INSERT, 1, "m1", 50, SUCCESS, 59));
        let mut moved = event("t1", Operation::UPDATE, 2, "m1", 50, SUCCESS, 0);
        moved.event_timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();

        let upd = r.resolve(&moved);
        assert_eq!(upd.deltas.len(), 2);
        assert_eq!(upd.deltas[0].count, -1);
        assert_eq!(upd.deltas[0].key.time_bucket.start_secs() % 3600, 0);
        assert_eq!(upd.deltas[1].count, 1);
        assert_ne!(upd.deltas[0].key, upd.deltas[1].key);
    }

    #[test]
    fn test_update_without_prior_is_reconciliation_gap() {
        let mut r = resolver();
        let upd = r.resolve(&event("t9", Operation::UPDATE, 3, "m1", 70, SUCCESS, 0));
        assert_eq!(upd.kind, ResolutionKind::ReconciliationGap);
        assert_eq!(upd.deltas.len(), 1);
        assert!(upd.deltas[0].is_noop());
        assert_eq!(r.reconciliation_gaps(), 1);

        // The degraded UPDATE still seeds the cache for the next one
        let next = r.resolve(&event("t9", Operation::UPDATE, 4, "m1", 80, SUCCESS, 0));
        assert_eq!(next.kind, ResolutionKind::Compensated);
        assert_eq!(next.deltas[0].amount, Decimal::from(10));
    }

    #[test]
    fn test_stale_update_produces_nothing_and_keeps_cache() {
        let mut r = resolver();
        r.resolve(&event("t1", Operation::INSERT, 1, "m1", 50, SUCCESS, 0));
        r.resolve(&event("t1", Operation::UPDATE, 3, "m1", 65, SUCCESS, 0));
        let stale = r.resolve(&event("t1", Operation::UPDATE, 2, "m1", 99, SUCCESS, 0));

        assert_eq!(stale.kind, ResolutionKind::StaleRedelivery);
        assert!(stale.deltas.is_empty());
        assert_eq!(
            r.cache().get(&TransactionId::new("t1")).map(|p| p.amount),
            Some(Decimal::from(65))
        );
    }

    #[test]
    fn test_stale_insert_still_emits_gated_delta() {
        let mut r = resolver();
        r.resolve(&event("t1", Operation::INSERT, 1, "m1", 50, SUCCESS, 0));
        let again = r.resolve(&event("t1", Operation::INSERT, 1, "m1", 50, SUCCESS, 0));
        assert_eq!(again.kind, ResolutionKind::StaleRedelivery);
        assert_eq!(again.deltas.len(), 1);
        assert_eq!(again.deltas[0].sequence_token, SequenceToken::new(1, 1));
    }

    #[test]
    fn test_observe_warms_cache_without_deltas() {
        let mut r = resolver();
        r.observe(&event("t1", Operation::INSERT, 1, "m1", 50, SUCCESS, 0));
        let upd = r.resolve(&event("t1", Operation::UPDATE, 2, "m1", 40, SUCCESS, 0));
        assert_eq!(upd.kind, ResolutionKind::Compensated);
        assert_eq!(upd.deltas[0].amount, Decimal::from(-10));
    }

    #[test]
    fn test_restored_cache_nets_update() {
        let mut first = resolver();
        first.resolve(&event("t1", Operation::INSERT, 1, "m1", 50, SUCCESS, 0));

        let mut second = resolver();
        second.restore(first.cache().entries());
        let upd = second.resolve(&event("t1", Operation::UPDATE, 2, "m1", 80, SUCCESS, 0));
        assert_eq!(upd.kind, ResolutionKind::Compensated);
        assert_eq!(upd.deltas[0].amount, Decimal::from(30));
        assert_eq!(second.reconciliation_gaps(), 0);
    }
}
