/// IntroSet lookup bookkeeping
///
/// Tracks in-flight hidden-service address lookups by transaction id and
/// enforces the per-address retry cooldown.

use super::address::Address;
use std::collections::HashMap;
use veilnet_common::config::service::INTROSET_LOOKUP_RETRY_COOLDOWN;
use veilnet_common::Timestamp;

/// One in-flight hidden-service address lookup
#[derive(Debug, Clone)]
pub struct IntroSetLookup {
    pub txid: u64,
    pub target: Address,

    /// Which replication path carries this request
    pub relay_order: u8,

    pub started_at: Timestamp,
}

#[derive(Debug, Default)]
pub struct LookupTracker {
    pending: HashMap<u64, IntroSetLookup>,
    last_lookup: HashMap<Address, Timestamp>,
    next_txid: u64,
}

impl LookupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a new lookup for `target` must wait out the cooldown
    pub fn in_cooldown(&self, target: &Address, now: Timestamp) -> bool {
        match self.last_lookup.get(target) {
            Some(last) => now.since(*last) < INTROSET_LOOKUP_RETRY_COOLDOWN,
            None => false,
        }
    }

    /// Register a lookup, or None while the target is in cooldown
    pub fn begin(&mut self, target: Address, relay_order: u8, now: Timestamp) -> Option<u64> {
        if self.in_cooldown(&target, now) {
            return None;
        }
        self.next_txid += 1;
        let txid = self.next_txid;
        self.pending.insert(
            txid,
            IntroSetLookup {
                txid,
                target,
                relay_order,
                started_at: now,
            },
        );
        self.last_lookup.insert(target, now);
        Some(txid)
    }

    /// Take a completed lookup out of the pending table
    pub fn complete(&mut self, txid: u64) -> Option<IntroSetLookup> {
        self.pending.remove(&txid)
    }

    pub fn pending_for(&self, target: &Address) -> usize {
        self.pending.values().filter(|l| l.target == *target).count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop lookups older than `timeout`, returning them for failure
    /// accounting
    pub fn expire(&mut self, now: Timestamp, timeout: std::time::Duration) -> Vec<IntroSetLookup> {
        let expired: Vec<u64> = self
            .pending
            .values()
            .filter(|l| now.since(l.started_at) >= timeout)
            .map(|l| l.txid)
            .collect();
        expired
            .into_iter()
            .filter_map(|txid| self.pending.remove(&txid))
            .collect()
    }

    pub fn clear(&mut self) -> Vec<IntroSetLookup> {
        self.pending.drain().map(|(_, l)| l).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use std::time::Duration;

    fn addr() -> Address {
        Address::from_public_key(&Identity::generate().public_key())
    }

    #[test]
    fn test_cooldown_blocks_repeat_lookups() {
        let mut tracker = LookupTracker::new();
        let target = addr();
        let now = Timestamp::from_millis(10_000);

        let txid = tracker.begin(target, 0, now).unwrap();
        assert!(tracker.begin(target, 1, now.add(Duration::from_secs(1))).is_none());

        // completing does not lift the cooldown early
        tracker.complete(txid).unwrap();
        assert!(tracker.in_cooldown(&target, now.add(Duration::from_secs(2))));

        let after = now.add(INTROSET_LOOKUP_RETRY_COOLDOWN);
        assert!(tracker.begin(target, 0, after).is_some());
    }

    #[test]
    fn test_expire_returns_stale_lookups() {
        let mut tracker = LookupTracker::new();
        let target = addr();
        let now = Timestamp::from_millis(10_000);

        tracker.begin(target, 0, now).unwrap();
        let expired = tracker.expire(now.add(Duration::from_secs(11)), Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].target, target);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_txids_are_unique() {
        let mut tracker = LookupTracker::new();
        let now = Timestamp::from_millis(10_000);
        let a = tracker.begin(addr(), 0, now).unwrap();
        let b = tracker.begin(addr(), 0, now).unwrap();
        assert_ne!(a, b);
    }
}
