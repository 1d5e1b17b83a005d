//! Request throttling with peer-granted leases.
//!
//! A LEASE frame grants a number of requests valid for a time window. A new
//! grant replaces whatever budget was left; it never accumulates. Once the
//! window elapses the remaining permits are treated as revoked.

use crate::error::RSocketError;
use crate::signal::StreamKey;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// What to do with a request issued while no budget is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePolicy {
    /// Park the request until the next grant, up to `max_pending` requests.
    Queue { max_pending: usize },
    /// Fail the request immediately with `REJECTED`.
    Reject,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        LeasePolicy::Queue { max_pending: 256 }
    }
}

/// Outcome of asking the lease manager for a permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    Granted,
    Queued,
    Rejected(RSocketError),
}

/// Tracks the budget granted by the peer for locally-initiated requests.
#[derive(Debug)]
pub struct LeaseManager {
    policy: LeasePolicy,
    allowed_requests: u32,
    expires_at: Option<Instant>,
    pending: VecDeque<StreamKey>,
}

impl LeaseManager {
    /// Creates a manager with no budget. Nothing may be sent until the peer
    /// grants a lease.
    pub fn new(policy: LeasePolicy) -> Self {
        Self {
            policy,
            allowed_requests: 0,
            expires_at: None,
            pending: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    /// Returns the number of requests that may still be initiated at `now`.
    pub fn available_requests(&self, now: Instant) -> u32 {
        match self.expires_at {
            Some(expires_at) if now < expires_at => self.allowed_requests,
            _ => 0,
        }
    }

    /// Consumes `n` permits. Returns false, leaving the budget untouched, if
    /// fewer than `n` are available.
    pub fn consume(&mut self, n: u32, now: Instant) -> bool {
        if self.available_requests(now) < n {
            return false;
        }
        self.allowed_requests -= n;
        true
    }

    /// Installs a new grant and returns the queued requests it admits, in
    /// the order they were issued. Each returned key has already consumed
    /// its permit.
    pub fn on_lease(&mut self, allowed_requests: u32, ttl_ms: u32, now: Instant) -> Vec<StreamKey> {
        self.allowed_requests = allowed_requests;
        self.expires_at = Some(now + Duration::from_millis(u64::from(ttl_ms)));
        debug!(
            allowed_requests,
            ttl_ms,
            pending = self.pending.len(),
            "lease granted"
        );

        let mut admitted = Vec::new();
        while self.allowed_requests > 0 && now < self.expires_at.unwrap_or(now) {
            match self.pending.pop_front() {
                Some(key) => {
                    self.allowed_requests -= 1;
                    admitted.push(key);
                }
                None => break,
            }
        }
        admitted
    }

    /// Asks for one permit on behalf of `key`.
    pub fn request(&mut self, key: StreamKey, now: Instant) -> LeaseDecision {
        if self.pending.is_empty() && self.consume(1, now) {
            return LeaseDecision::Granted;
        }
        match self.policy {
            LeasePolicy::Reject => {
                LeaseDecision::Rejected(RSocketError::rejected("lease exhausted"))
            }
            LeasePolicy::Queue { max_pending } if self.pending.len() >= max_pending => {
                LeaseDecision::Rejected(RSocketError::rejected("too many requests awaiting lease"))
            }
            LeasePolicy::Queue { .. } => {
                self.pending.push_back(key);
                LeaseDecision::Queued
            }
        }
    }

    /// Withdraws a queued request. No permit is consumed and nothing needs
    /// to be sent. Returns true if `key` was queued.
    pub fn cancel_request(&mut self, key: StreamKey) -> bool {
        match self.pending.iter().position(|k| *k == key) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Removes and returns every queued request.
    pub fn drain_pending(&mut self) -> Vec<StreamKey> {
        self.pending.drain(..).collect()
    }
}

/// Budget this side has granted to the peer for inbound requests.
#[derive(Debug, Default)]
pub(crate) struct IssuedLease {
    remaining: u32,
    expires_at: Option<Instant>,
}

impl IssuedLease {
    pub(crate) fn grant(&mut self, request_count: u32, ttl_ms: u32, now: Instant) {
        self.remaining = request_count;
        self.expires_at = Some(now + Duration::from_millis(u64::from(ttl_ms)));
    }

    /// Consumes one inbound permit, if any is left.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) if now < expires_at && self.remaining > 0 => {
                self.remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(n: u64) -> StreamKey {
        StreamKey::from_raw(n)
    }

    #[test]
    fn test_no_budget_before_first_lease() {
        let now = Instant::now();
        let mut lease = LeaseManager::new(LeasePolicy::Reject);
        assert_eq!(lease.available_requests(now), 0);
        assert!(matches!(
            lease.request(key(1), now),
            LeaseDecision::Rejected(RSocketError {
                code: rsocket_protocol::ErrorCode::Rejected,
                ..
            })
        ));
    }

    #[test]
    fn test_grant_replaces_remaining_budget() {
        let now = Instant::now();
        let mut lease = LeaseManager::new(LeasePolicy::Reject);
        lease.on_lease(5, 60_000, now);
        assert!(lease.consume(2, now));
        assert_eq!(lease.available_requests(now), 3);

        lease.on_lease(2, 60_000, now);
        assert_eq!(lease.available_requests(now), 2);
    }

    #[test]
    fn test_consume_never_goes_negative() {
        let now = Instant::now();
        let mut lease = LeaseManager::new(LeasePolicy::Reject);
        lease.on_lease(1, 60_000, now);
        assert!(!lease.consume(2, now));
        assert_eq!(lease.available_requests(now), 1);
        assert!(lease.consume(1, now));
        assert!(!lease.consume(1, now));
        assert_eq!(lease.available_requests(now), 0);
    }

    #[test]
    fn test_expired_lease_revokes_permits() {
        let now = Instant::now();
        let mut lease = LeaseManager::new(LeasePolicy::Reject);
        lease.on_lease(10, 100, now);
        let later = now + Duration::from_millis(100);
        assert_eq!(lease.available_requests(later), 0);
        assert!(matches!(lease.request(key(1), later), LeaseDecision::Rejected(_)));
    }

    #[test]
    fn test_queued_requests_admitted_in_order() {
        let now = Instant::now();
        let mut lease = LeaseManager::new(LeasePolicy::Queue { max_pending: 8 });
        assert_eq!(lease.request(key(1), now), LeaseDecision::Queued);
        assert_eq!(lease.request(key(2), now), LeaseDecision::Queued);
        assert_eq!(lease.request(key(3), now), LeaseDecision::Queued);

        let admitted = lease.on_lease(2, 60_000, now);
        assert_eq!(admitted, vec![key(1), key(2)]);
        assert_eq!(lease.pending_len(), 1);
        assert_eq!(lease.available_requests(now), 0);

        // Budget left over after the queue drains stays available
        let admitted = lease.on_lease(3, 60_000, now);
        assert_eq!(admitted, vec![key(3)]);
        assert_eq!(lease.available_requests(now), 2);
    }

    #[test]
    fn test_queue_preserves_fifo_when_budget_arrives() {
        let now = Instant::now();
        let mut lease = LeaseManager::new(LeasePolicy::Queue { max_pending: 8 });
        assert_eq!(lease.request(key(1), now), LeaseDecision::Queued);
        lease.on_lease(0, 60_000, now);
        // A newcomer may not overtake the queued request
        assert_eq!(lease.request(key(2), now), LeaseDecision::Queued);
        assert_eq!(lease.on_lease(1, 60_000, now), vec![key(1)]);
    }

    #[test]
    fn test_queue_is_bounded() {
        let now = Instant::now();
        let mut lease = LeaseManager::new(LeasePolicy::Queue { max_pending: 1 });
        assert_eq!(lease.request(key(1), now), LeaseDecision::Queued);
        assert!(matches!(lease.request(key(2), now), LeaseDecision::Rejected(_)));
    }

    #[test]
    fn test_cancel_queued_request() {
        let now = Instant::now();
        let mut lease = LeaseManager::new(LeasePolicy::default());
        lease.request(key(1), now);
        lease.request(key(2), now);

        assert!(lease.cancel_request(key(1)));
        assert!(!lease.cancel_request(key(1)));
        assert_eq!(lease.on_lease(5, 60_000, now), vec![key(2)]);
        assert_eq!(lease.available_requests(now), 4);
    }

    #[test]
    fn test_issued_lease() {
        let now = Instant::now();
        let mut issued = IssuedLease::default();
        assert!(!issued.try_acquire(now));

        issued.grant(1, 1_000, now);
        assert!(issued.try_acquire(now));
        assert!(!issued.try_acquire(now));

        issued.grant(5, 1_000, now);
        assert!(!issued.try_acquire(now + Duration::from_secs(2)));
    }

    proptest! {
        #[test]
        fn prop_budget_bounded_by_latest_grant(
            ops in proptest::collection::vec((0u32..20, any::<bool>()), 1..64)
        ) {
            let now = Instant::now();
            let mut lease = LeaseManager::new(LeasePolicy::Reject);
            let mut last_grant = 0u32;
            for (n, is_grant) in ops {
                if is_grant {
                    lease.on_lease(n, 60_000, now);
                    last_grant = n;
                    prop_assert_eq!(lease.available_requests(now), n);
                } else {
                    let before = lease.available_requests(now);
                    let ok = lease.consume(n, now);
                    let after = lease.available_requests(now);
                    prop_assert_eq!(ok, n <= before);
                    prop_assert_eq!(after, if ok { before - n } else { before });
                }
                prop_assert!(lease.available_requests(now) <= last_grant);
            }
        }
    }
}
