use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use pine_dns_lib::{
    Decode as _, DnsMessage, Encode as _, Header, Question, WireBuf,
};
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::connection::Connection;
use crate::DEFAULT_EDNS_BUF_CAPACITY;

/// Failures of one upstream exchange. All of them surface to waiting
/// requesters as a SERVFAIL response and feed the selection policy's
/// health accounting.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream did not reply within {0:?}")]
    Timeout(Duration),
    #[error("upstream unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    #[error("upstream reply failed validation: {0}")]
    InvalidReply(&'static str),
}

/// Picks which configured upstream a question is forwarded to. The
/// per-question request/reply/timeout contract is fixed by the resolver;
/// selection order and health scoring live behind this seam.
pub trait UpstreamPolicy: Send + Sync {
    fn select(&self) -> SocketAddr;

    /// Outcome feedback for health scoring. The default keeps no state.
    fn report(&self, _upstream: SocketAddr, _healthy: bool) {}

    /// Periodic liveness report hook, driven by the maintenance cycle.
    fn healthcheck(&self) {}
}

/// Cycles through the configured upstreams in order.
pub struct RoundRobin {
    upstreams: Vec<SocketAddr>,
    next: AtomicUsize,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl RoundRobin {
    /// `upstreams` must be non-empty; the configuration layer validates this.
    pub fn new(upstreams: Vec<SocketAddr>) -> Self {
        debug_assert!(!upstreams.is_empty());
        RoundRobin {
            upstreams,
            next: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

impl UpstreamPolicy for RoundRobin {
    fn select(&self) -> SocketAddr {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        self.upstreams[idx % self.upstreams.len()]
    }

    fn report(&self, upstream: SocketAddr, healthy: bool) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        if !healthy {
            self.failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%upstream, "upstream exchange failed");
        }
    }

    fn healthcheck(&self) {
        tracing::trace!(
            sent = self.sent.load(Ordering::Relaxed),
            failed = self.failed.load(Ordering::Relaxed),
            "upstream liveness"
        );
    }
}

/// Forwards a question to `upstream` and returns the validated reply.
///
/// The exchange starts over UDP with a fresh transaction id and falls back
/// to TCP when the reply comes back truncated. The whole exchange is
/// bounded by `deadline`.
pub(super) async fn forward_to_upstream(
    question: &Question<'static>,
    upstream: SocketAddr,
    deadline: Duration,
) -> Result<DnsMessage<'static>, UpstreamError> {
    let id = fastrand::u16(..);

    let mut query = DnsMessage::new();
    query.header.id = id;
    query.header.recursion_desired = true;
    query.questions.push(question.clone());
    query.header.question_count = 1;

    let mut buf = WireBuf::new_empty(Some(DEFAULT_EDNS_BUF_CAPACITY));
    query
        .encode(&mut buf, None)
        .map_err(|_| UpstreamError::InvalidReply("question failed to encode"))?;

    let reply = timeout(deadline, exchange(&buf, upstream))
        .await
        .map_err(|_| UpstreamError::Timeout(deadline))??;

    validate_reply(&reply, id, question)?;
    Ok(reply)
}

async fn exchange(encoded: &WireBuf<'_>, upstream: SocketAddr) -> Result<DnsMessage<'static>, UpstreamError> {
    let mut recv: Vec<u8> = Vec::new();

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(UpstreamError::Unreachable)?;
    socket
        .connect(upstream)
        .await
        .map_err(UpstreamError::Unreachable)?;

    let mut connection: Connection<UdpSocket> = Connection::Udp(socket, None);
    connection
        .send_message(encoded)
        .await
        .map_err(transport_to_upstream)?;
    let len = connection
        .read(&mut recv)
        .await
        .map_err(transport_to_upstream)?;

    let reply = DnsMessage::decode(&mut WireBuf::new(&recv[..len]))
        .map_err(|_| UpstreamError::InvalidReply("reply failed to decode"))?;
    if !reply.header.truncated {
        return Ok(reply);
    }

    // Truncated over UDP: retry the exchange over TCP, which carries the
    // same message behind a length prefix
    let stream = TcpStream::connect(upstream)
        .await
        .map_err(UpstreamError::Unreachable)?;
    let mut connection: Connection<UdpSocket> = Connection::Tcp(stream);
    connection
        .send_message(encoded)
        .await
        .map_err(transport_to_upstream)?;
    let len = connection
        .read(&mut recv)
        .await
        .map_err(transport_to_upstream)?;

    DnsMessage::decode(&mut WireBuf::new(&recv[..len]))
        .map_err(|_| UpstreamError::InvalidReply("reply failed to decode"))
}

fn transport_to_upstream(error: crate::TransportError) -> UpstreamError {
    match error {
        crate::TransportError::Io(error) => UpstreamError::Unreachable(error),
        crate::TransportError::ConnectionClosed => UpstreamError::Unreachable(
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"),
        ),
        crate::TransportError::FrameTooLarge(_) => {
            UpstreamError::InvalidReply("reply frame exceeds the size cap")
        }
    }
}

/// An off-path attacker who can't see the query has to guess both the
/// transaction id and the question to get a forgery accepted.
fn validate_reply(
    reply: &DnsMessage<'static>,
    id: u16,
    question: &Question<'static>,
) -> Result<(), UpstreamError> {
    validate_reply_header(&reply.header, id)?;
    let echoed = reply
        .questions
        .first()
        .ok_or(UpstreamError::InvalidReply("reply echoes no question"))?;
    if !echoed.qname.eq_ignore_ascii_case(&question.qname)
        || echoed.qtype != question.qtype
        || echoed.qclass != question.qclass
    {
        return Err(UpstreamError::InvalidReply("reply answers a different question"));
    }
    Ok(())
}

fn validate_reply_header(header: &Header, id: u16) -> Result<(), UpstreamError> {
    if header.id != id {
        return Err(UpstreamError::InvalidReply("reply id mismatch"));
    }
    if !header.is_response {
        return Err(UpstreamError::InvalidReply("reply is not a response"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pine_dns_lib::RecordType;

    fn question(qname: &str) -> Question<'static> {
        Question::new(qname, RecordType::A, None).into_owned()
    }

    fn reply_for(id: u16, question: &Question<'static>) -> DnsMessage<'static> {
        let mut reply = DnsMessage::new();
        reply.header.id = id;
        reply.header.is_response = true;
        reply.questions.push(question.clone());
        reply.header.question_count = 1;
        reply
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let first: SocketAddr = "10.0.0.1:53".parse().unwrap();
        let second: SocketAddr = "10.0.0.2:53".parse().unwrap();
        let policy = RoundRobin::new(vec![first, second]);

        assert_eq!(policy.select(), first);
        assert_eq!(policy.select(), second);
        assert_eq!(policy.select(), first);
    }

    #[test]
    fn valid_reply_passes() {
        let question = question("a.com");
        let reply = reply_for(77, &question);
        assert!(validate_reply(&reply, 77, &question).is_ok());
    }

    #[test]
    fn reply_name_comparison_ignores_case() {
        let question = question("a.com");
        let mut reply = reply_for(77, &question);
        reply.questions[0].qname = "A.COM".to_string().into();
        assert!(validate_reply(&reply, 77, &question).is_ok());
    }

    #[test]
    fn forged_id_is_rejected() {
        let question = question("a.com");
        let reply = reply_for(78, &question);
        assert!(matches!(
            validate_reply(&reply, 77, &question),
            Err(UpstreamError::InvalidReply("reply id mismatch"))
        ));
    }

    #[test]
    fn reply_for_a_different_question_is_rejected() {
        let asked = question("a.com");
        let reply = reply_for(77, &question("b.com"));
        assert!(matches!(
            validate_reply(&reply, 77, &asked),
            Err(UpstreamError::InvalidReply("reply answers a different question"))
        ));
    }

    #[test]
    fn reply_without_the_response_bit_is_rejected() {
        let question = question("a.com");
        let mut reply = reply_for(77, &question);
        reply.header.is_response = false;
        assert!(validate_reply(&reply, 77, &question).is_err());
    }
}
