use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::cache::{CacheKey, CachedAnswer};

/// What a pending query eventually resolves to: an answer to deliver, or
/// `None` for a timeout/upstream failure (surfaced as SERVFAIL).
pub(crate) type PendingOutcome = Option<Arc<CachedAnswer>>;

type Slot = Option<PendingOutcome>;

/// The result of asking to forward a question upstream.
pub(crate) enum PendingSlot {
    /// No identical question is in flight: the caller owns the upstream
    /// exchange and must call [`PendingTable::complete`] when done.
    Leader,
    /// An identical question is already in flight: await the shared outcome.
    Follower(watch::Receiver<Slot>),
    /// The in-flight cap was hit; backpressure, no upstream request.
    Saturated,
}

struct PendingQuery {
    tx: watch::Sender<Slot>,
    issued: Instant,
}

/// Correlates in-flight upstream queries with every requester waiting on
/// them. At most one upstream request is outstanding per question key;
/// duplicates coalesce onto the same watch channel.
pub(crate) struct PendingTable {
    inner: Mutex<HashMap<CacheKey, PendingQuery>>,
    max_in_flight: usize,
}

impl PendingTable {
    pub(crate) fn new(max_in_flight: usize) -> Self {
        PendingTable {
            inner: Mutex::new(HashMap::new()),
            max_in_flight,
        }
    }

    pub(crate) fn join(&self, key: &CacheKey, now: Instant) -> PendingSlot {
        let mut pending = self.inner.lock().expect("pending lock poisoned");
        if let Some(query) = pending.get(key) {
            return PendingSlot::Follower(query.tx.subscribe());
        }
        if pending.len() >= self.max_in_flight {
            return PendingSlot::Saturated;
        }
        let (tx, _rx) = watch::channel(None);
        pending.insert(key.clone(), PendingQuery { tx, issued: now });
        PendingSlot::Leader
    }

    /// Resolves a pending query, waking every coalesced follower with an
    /// identical outcome.
    pub(crate) fn complete(&self, key: &CacheKey, outcome: PendingOutcome) {
        let mut pending = self.inner.lock().expect("pending lock poisoned");
        if let Some(query) = pending.remove(key) {
            let _ = query.tx.send(Some(outcome));
        }
    }

    /// Times out queries whose leader never completed (e.g. its task was
    /// cancelled at shutdown of a listener). Their followers receive the
    /// timeout outcome. Returns the number of queries timed out.
    pub(crate) fn sweep(&self, now: Instant, deadline: Duration) -> usize {
        let mut pending = self.inner.lock().expect("pending lock poisoned");
        let expired: Vec<CacheKey> = pending
            .iter()
            .filter(|(_, query)| now.saturating_duration_since(query.issued) > deadline)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(query) = pending.remove(key) {
                let _ = query.tx.send(Some(None));
            }
        }
        expired.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("pending lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pine_dns_lib::{RecordType, ResponseCode};

    fn key(qname: &str) -> CacheKey {
        CacheKey {
            qname: qname.to_string(),
            qtype: RecordType::A.into(),
            qclass: pine_dns_lib::IN_CLASS,
        }
    }

    fn stub_answer(now: Instant) -> Arc<CachedAnswer> {
        Arc::new(CachedAnswer {
            rcode: ResponseCode::NoError,
            answers: Vec::new(),
            authorities: Vec::new(),
            flags: crate::cache::CacheFlags::empty(),
            stored_at: now,
            expires_at: now + Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn second_join_becomes_a_follower() {
        let table = PendingTable::new(16);
        let now = Instant::now();

        assert!(matches!(table.join(&key("a.com"), now), PendingSlot::Leader));
        let PendingSlot::Follower(mut rx) = table.join(&key("a.com"), now) else {
            panic!("expected a follower slot");
        };
        assert_eq!(table.len(), 1);

        let answer = stub_answer(now);
        table.complete(&key("a.com"), Some(answer.clone()));

        let slot = rx.wait_for(|slot| slot.is_some()).await.unwrap();
        assert!(slot.as_ref().unwrap().is_some());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn distinct_questions_do_not_coalesce() {
        let table = PendingTable::new(16);
        let now = Instant::now();

        assert!(matches!(table.join(&key("a.com"), now), PendingSlot::Leader));
        assert!(matches!(table.join(&key("b.com"), now), PendingSlot::Leader));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn saturation_applies_backpressure() {
        let table = PendingTable::new(1);
        let now = Instant::now();

        assert!(matches!(table.join(&key("a.com"), now), PendingSlot::Leader));
        assert!(matches!(table.join(&key("b.com"), now), PendingSlot::Saturated));
        // An identical question still coalesces over the cap
        assert!(matches!(table.join(&key("a.com"), now), PendingSlot::Follower(_)));
    }

    #[tokio::test]
    async fn sweep_times_out_abandoned_queries() {
        let table = PendingTable::new(16);
        let now = Instant::now();

        assert!(matches!(table.join(&key("a.com"), now), PendingSlot::Leader));
        let PendingSlot::Follower(mut rx) = table.join(&key("a.com"), now) else {
            panic!("expected a follower slot");
        };

        let deadline = Duration::from_secs(6);
        assert_eq!(table.sweep(now + Duration::from_secs(5), deadline), 0);
        assert_eq!(table.sweep(now + Duration::from_secs(7), deadline), 1);
        assert_eq!(table.len(), 0);

        let slot = rx.wait_for(|slot| slot.is_some()).await.unwrap();
        assert!(slot.as_ref().unwrap().is_none(), "timeout surfaces as no answer");
    }
}
