use std::time::{Duration, Instant};

use bitflags::bitflags;
use pine_dns_lib::{DnsMessage, RecordType, ResourceRecord, ResponseCode};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u8 {
        /// A validated "no such name/no data" answer
        const NEGATIVE = 1;
    }
}

/// The answer set stored for one cache key, also used as the payload
/// delivered to every requester coalesced onto a pending query.
///
/// Expiry is absolute; the TTLs handed back to a requester are always
/// reduced by the time the entry has already spent in the cache.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub rcode: ResponseCode,
    pub answers: Vec<ResourceRecord<'static>>,
    pub authorities: Vec<ResourceRecord<'static>>,
    pub flags: CacheFlags,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CachedAnswer {
    /// Builds an answer from a validated upstream reply (or a persisted
    /// cache frame, which uses the same wire shape).
    ///
    /// Positive answers live for the smallest answer TTL. Negative answers
    /// (NXDOMAIN, or NOERROR with no data) live for the authority TTL,
    /// raised to the configured floor. Other response codes get a zero
    /// lifetime: they are delivered but never cached.
    pub fn from_reply(reply: &DnsMessage<'static>, now: Instant, negative_ttl_floor: u32) -> Self {
        let answers: Vec<_> = reply
            .answers
            .iter()
            .filter(|rr| keep_record(rr))
            .cloned()
            .collect();
        let authorities: Vec<_> = reply
            .authorities
            .iter()
            .filter(|rr| keep_record(rr))
            .cloned()
            .collect();

        let rcode = reply.header.response_code;
        let negative = matches!(rcode, ResponseCode::NxDomain)
            || (matches!(rcode, ResponseCode::NoError) && answers.is_empty());

        let ttl = match rcode {
            ResponseCode::NoError if !negative => {
                answers.iter().map(|rr| rr.ttl).min().unwrap_or(0)
            }
            ResponseCode::NoError | ResponseCode::NxDomain => authorities
                .iter()
                .map(|rr| rr.ttl)
                .min()
                .unwrap_or(0)
                .max(negative_ttl_floor),
            _ => 0,
        };

        let mut flags = CacheFlags::empty();
        flags.set(CacheFlags::NEGATIVE, negative);

        CachedAnswer {
            rcode,
            answers,
            authorities,
            flags,
            stored_at: now,
            expires_at: now + Duration::from_secs(ttl as u64),
        }
    }

    pub fn is_cacheable(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    /// Remaining lifetime, never the original TTL.
    pub fn remaining_ttl(&self, now: Instant) -> u32 {
        self.expires_at
            .saturating_duration_since(now)
            .as_secs()
            .min(u32::MAX as u64) as u32
    }

    pub fn answers_at(&self, now: Instant) -> Vec<ResourceRecord<'static>> {
        self.records_at(&self.answers, now)
    }

    pub fn authorities_at(&self, now: Instant) -> Vec<ResourceRecord<'static>> {
        self.records_at(&self.authorities, now)
    }

    fn records_at(
        &self,
        records: &[ResourceRecord<'static>],
        now: Instant,
    ) -> Vec<ResourceRecord<'static>> {
        let elapsed = now.saturating_duration_since(self.stored_at).as_secs() as u32;
        records
            .iter()
            .map(|rr| {
                let mut rr = rr.clone();
                rr.ttl = rr.ttl.saturating_sub(elapsed);
                rr
            })
            .collect()
    }
}

/// OPT pseudo-records belong to a single exchange and are never cached.
fn keep_record(rr: &ResourceRecord<'_>) -> bool {
    rr.rtype() != RecordType::OPT
}
