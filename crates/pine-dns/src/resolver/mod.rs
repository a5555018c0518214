mod pending;
mod upstream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use pending::{PendingOutcome, PendingSlot, PendingTable};
use pine_dns_lib::{
    Decode as _, DnsMessage, Encode as _, Header, Opcode, Question, RecordData, ResourceRecord,
    ResponseCode, WireBuf,
};
use tokio::time::timeout;
pub use upstream::{RoundRobin, UpstreamError, UpstreamPolicy};

use crate::cache::{Cache, CacheKey, CachedAnswer};
use crate::connection::{AsyncUdpSocket, Connection};
use crate::overrides::OverrideTable;
use crate::{ServerConfig, DEFAULT_EDNS_BUF_CAPACITY, MAX_STANDARD_DNS_MSG_SIZE};

/// Extra time a coalesced follower waits beyond the leader's own deadline
/// before giving up on the shared outcome.
const FOLLOWER_GRACE: Duration = Duration::from_millis(500);

/// The engine context: override rules, cache, pending-query table and the
/// upstream policy, owned together and shared across every worker task.
pub struct Resolver {
    overrides: OverrideTable,
    cache: Cache,
    pending: PendingTable,
    policy: Box<dyn UpstreamPolicy>,
    override_ttl: u32,
    upstream_timeout: Duration,
    negative_ttl_floor: u32,
}

impl Resolver {
    pub fn new(config: &ServerConfig) -> Self {
        Resolver::with_policy(config, Box::new(RoundRobin::new(config.upstreams.clone())))
    }

    pub fn with_policy(config: &ServerConfig, policy: Box<dyn UpstreamPolicy>) -> Self {
        Resolver {
            overrides: OverrideTable::new(&config.overrides),
            cache: Cache::with_capacity(config.cache_capacity),
            pending: PendingTable::new(config.max_in_flight),
            policy,
            override_ttl: config.override_ttl,
            upstream_timeout: config.upstream_timeout,
            negative_ttl_floor: config.negative_ttl_floor,
        }
    }

    /// The cache, exposed for diagnostics and persistence. Reads go through
    /// the cache's own lock; there is no separate admin subsystem.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// One maintenance cycle: cache expiry sweep, pending-query timeout
    /// sweep, upstream liveness report. Driven by the server on a fixed
    /// cadence.
    pub fn run_maintenance(&self, now: Instant) -> (usize, usize) {
        let evicted = self.cache.sweep(now);
        // Twice the upstream deadline so a live leader always gets to
        // complete its own exchange first
        let timed_out = self.pending.sweep(now, self.upstream_timeout * 2);
        self.policy.healthcheck();
        (evicted, timed_out)
    }

    /// Resolves one raw inbound message and writes the response back to the
    /// requester's connection.
    ///
    /// A message whose header can't be parsed at all (or that claims to be
    /// a response) is dropped without an answer; a parseable header with a
    /// malformed body gets a FORMERR response.
    pub async fn resolve_query<U: AsyncUdpSocket>(
        self: Arc<Self>,
        connection: &mut Connection<U>,
        raw: Vec<u8>,
    ) -> anyhow::Result<()> {
        let Ok(header) = Header::decode(&mut WireBuf::new(&raw)) else {
            tracing::trace!("dropping a message with an unparseable header");
            return Ok(());
        };
        if header.is_response {
            tracing::trace!(id = header.id, "dropping an unsolicited response");
            return Ok(());
        }

        let parsed = DnsMessage::decode(&mut WireBuf::new(&raw));

        let requester_payload_size = parsed
            .as_ref()
            .ok()
            .and_then(|query| query.advertised_payload_size());

        let mut response = response_scaffold(&header, parsed.as_ref().ok());

        let answered_from: &str = 'answer: {
            let Ok(query) = parsed.as_ref() else {
                response.header.response_code = ResponseCode::FormatError;
                break 'answer "formerr";
            };

            if query.header.opcode != Opcode::Query {
                response.header.response_code = ResponseCode::NotImplemented;
                break 'answer "notimpl";
            }

            if query.header.question_count != 1 || query.questions.len() != 1 {
                response.header.response_code = ResponseCode::FormatError;
                break 'answer "formerr";
            }

            let question = &query.questions[0];

            if let Some(records) = self.overrides.lookup(&question.qname, question.qtype) {
                response.header.authoritative = true;
                for data in records {
                    let rr = ResourceRecord::new(
                        question.qname.clone(),
                        data,
                        self.override_ttl,
                        Some(question.qclass),
                    );
                    response.answers.push(rr);
                    response.header.answer_count += 1;
                }
                break 'answer "override";
            }

            let key = CacheKey::for_question(question);
            let now = Instant::now();

            if let Some(entry) = self.cache.get(&key, now) {
                tracing::debug!(
                    qname = ?question.qname,
                    qtype = ?question.qtype,
                    remaining_ttl = entry.remaining_ttl(now),
                    "cache hit"
                );
                fill_from_answer(&mut response, &entry, now);
                break 'answer "cache";
            }
            tracing::debug!(qname = ?question.qname, qtype = ?question.qtype, "cache miss");

            if !query.header.recursion_desired {
                // Nothing local matched and the requester forbade recursion
                break 'answer "norecursion";
            }

            let question = question.clone().into_owned();
            match self.forward(&key, &question).await {
                Some(answer) => {
                    fill_from_answer(&mut response, &answer, Instant::now());
                    "upstream"
                }
                None => {
                    response.header.response_code = ResponseCode::ServerFailure;
                    "servfail"
                }
            }
        };

        // Echo the original question section when possible
        if response.questions.is_empty() {
            if let Ok(query) = parsed.as_ref() {
                response.questions.extend(query.questions.iter().cloned());
                response.header.question_count = query.questions.len() as u16;
            }
        }

        tracing::trace!(id = header.id, source = answered_from, "sending a response");

        // Datagram responses are capped by the requester's advertised
        // buffer; stream transports frame their own length
        let max_size = (!connection.is_stream()).then(|| {
            requester_payload_size
                .unwrap_or(MAX_STANDARD_DNS_MSG_SIZE)
                .max(MAX_STANDARD_DNS_MSG_SIZE)
        });

        let mut encoded = WireBuf::new_empty(Some(DEFAULT_EDNS_BUF_CAPACITY));
        response
            .encode(&mut encoded, max_size)
            .context("error while encoding the response")?;

        if let Err(e) = connection.send_message(&encoded).await {
            // Per-requester and thus recoverable
            tracing::debug!("error while sending a DNS response: {:#}", e);
        }

        Ok(())
    }

    /// Forwards a question upstream, coalescing with an identical in-flight
    /// query when one exists. Returns `None` on timeout, failure, or
    /// backpressure; the caller responds with SERVFAIL.
    async fn forward(&self, key: &CacheKey, question: &Question<'static>) -> PendingOutcome {
        match self.pending.join(key, Instant::now()) {
            PendingSlot::Saturated => {
                tracing::warn!(qname = ?question.qname, "pending query cap hit, refusing to forward");
                None
            }
            PendingSlot::Follower(mut rx) => {
                tracing::debug!(qname = ?question.qname, "coalescing onto an in-flight query");
                match timeout(
                    self.upstream_timeout + FOLLOWER_GRACE,
                    rx.wait_for(|slot| slot.is_some()),
                )
                .await
                {
                    Ok(Ok(slot)) => slot.as_ref().and_then(|outcome| outcome.clone()),
                    // Leader vanished or never completed in time
                    _ => None,
                }
            }
            PendingSlot::Leader => {
                let now = Instant::now();
                // A completed leader may have filled the cache between our
                // lookup and the join
                if let Some(entry) = self.cache.get(key, now) {
                    let outcome = Some(Arc::new(entry));
                    self.pending.complete(key, outcome.clone());
                    return outcome;
                }

                let upstream = self.policy.select();
                let outcome = match upstream::forward_to_upstream(
                    question,
                    upstream,
                    self.upstream_timeout,
                )
                .await
                {
                    Ok(reply) => {
                        self.policy.report(upstream, true);
                        let answer = CachedAnswer::from_reply(&reply, now, self.negative_ttl_floor);
                        if answer.is_cacheable(now) {
                            self.cache.put(key.clone(), answer.clone());
                        }
                        Some(Arc::new(answer))
                    }
                    Err(e) => {
                        self.policy.report(upstream, false);
                        tracing::debug!(
                            %upstream,
                            qname = ?question.qname,
                            "upstream exchange failed: {:#}",
                            e
                        );
                        None
                    }
                };
                self.pending.complete(key, outcome.clone());
                outcome
            }
        }
    }
}

/// An empty response carrying over the id and flags the requester expects.
fn response_scaffold(header: &Header, query: Option<&DnsMessage<'static>>) -> DnsMessage<'static> {
    let mut response = DnsMessage::new();
    response.header.id = header.id;
    response.header.is_response = true;
    response.header.recursion_desired = header.recursion_desired;
    response.header.recursion_available = true;

    // Requesters that advertised EDNS get an OPT record back
    if query.is_some_and(|query| query.edns.is_some()) {
        response.additionals.push(ResourceRecord::new(
            "",
            RecordData::OPT { options: None },
            0,
            Some(DEFAULT_EDNS_BUF_CAPACITY as u16),
        ));
        response.header.additional_count += 1;
        response.edns = Some(0);
    }

    response
}

fn fill_from_answer(response: &mut DnsMessage<'static>, answer: &CachedAnswer, now: Instant) {
    response.header.response_code = answer.rcode;
    for rr in answer.answers_at(now) {
        response.answers.push(rr);
        response.header.answer_count += 1;
    }
    for rr in answer.authorities_at(now) {
        response.authorities.push(rr);
        response.header.authority_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pine_dns_lib::RecordType;

    #[test]
    fn scaffold_echoes_id_and_recursion_desired() {
        let mut header = Header::new();
        header.id = 4242;
        header.recursion_desired = true;

        let response = response_scaffold(&header, None);
        assert_eq!(response.header.id, 4242);
        assert!(response.header.is_response);
        assert!(response.header.recursion_desired);
        assert!(response.header.recursion_available);
        assert!(response.edns.is_none());
    }

    #[test]
    fn scaffold_answers_edns_with_edns() {
        let mut query = DnsMessage::new();
        query.header.id = 1;
        query.additionals.push(ResourceRecord::new(
            "",
            RecordData::OPT { options: None },
            0,
            Some(1232),
        ));
        query.header.additional_count = 1;
        query.edns = Some(0);

        let response = response_scaffold(&query.header, Some(&query));
        assert_eq!(response.edns, Some(0));
        assert_eq!(response.additionals.len(), 1);
        assert_eq!(response.additionals[0].rtype(), RecordType::OPT);
    }
}
