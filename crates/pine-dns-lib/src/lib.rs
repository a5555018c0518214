#[cfg(test)]
pub(crate) mod test_utils;

mod buf;
mod error;
mod header;
mod question;
mod resource_record;
mod utils;

pub use buf::{LabelCache, WireBuf};
use cfg_if::cfg_if;
pub use error::{DecodeError, EncodeError};
pub use header::{Header, Opcode, ResponseCode};
pub use question::{Question, RecordType};
#[cfg(feature = "edns")]
pub use resource_record::EdnsData;
pub use resource_record::{RecordData, ResourceRecord};

/// The Internet class
pub const IN_CLASS: u16 = 1;
/// Encoded size of a message header
pub const HEADER_LEN: usize = 12;

/// Smallest possible encoded question: root name, QTYPE, QCLASS
const MIN_QUESTION_LEN: usize = 5;
/// Smallest possible encoded record: root name, TYPE, CLASS, TTL, RDLENGTH
const MIN_RECORD_LEN: usize = 11;

pub trait Decode: Sized {
    fn decode(buf: &mut WireBuf<'_>) -> Result<Self, DecodeError>;
}

pub trait Encode {
    /// Encodes `self` at the end of `buf`, compressing names against
    /// `label_cache` when one is supplied.
    ///
    /// Returns the number of bytes written. Questions and records return 0
    /// without writing anything when they don't fit into `max_size`.
    fn encode_with_cache(
        &self,
        buf: &mut WireBuf<'_>,
        label_cache: Option<&mut LabelCache>,
        max_size: Option<usize>,
    ) -> Result<usize, EncodeError>;

    fn encode(&self, buf: &mut WireBuf<'_>, max_size: Option<usize>) -> Result<usize, EncodeError> {
        self.encode_with_cache(buf, None, max_size)
    }
}

pub(crate) trait EncodedSize {
    /// Upper bound on the encoded size given the current label cache.
    fn encoded_size(&self, label_cache: Option<&LabelCache>) -> usize;
}

#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct DnsMessage<'a> {
    pub header: Header,
    #[cfg(feature = "edns")]
    /// Idx of the OPT record in `additionals`, if present
    pub edns: Option<usize>,
    pub questions: Vec<Question<'a>>,
    pub answers: Vec<ResourceRecord<'a>>,
    pub authorities: Vec<ResourceRecord<'a>>,
    pub additionals: Vec<ResourceRecord<'a>>,
}

impl<'a> DnsMessage<'a> {
    pub fn new() -> Self {
        DnsMessage::default()
    }

    /// The UDP payload size advertised by the sender's OPT record, if any.
    #[cfg(feature = "edns")]
    pub fn advertised_payload_size(&self) -> Option<usize> {
        self.edns
            .and_then(|idx| self.additionals.get(idx))
            .and_then(ResourceRecord::edns_data)
            .map(|data| data.udp_payload_size)
    }

    /// Whether the additional record at `idx` is the message's OPT record.
    #[allow(unused_variables)]
    fn is_opt_index(&self, idx: usize) -> bool {
        cfg_if! {
            if #[cfg(feature = "edns")] {
                return self.edns == Some(idx);
            } else {
                return false;
            }
        }
    }
}

/// Capacity hint for a section: the declared count is attacker-controlled,
/// so it is clamped by what the remaining bytes could possibly hold.
fn section_capacity(declared: u16, remaining: usize, min_entry_len: usize) -> usize {
    (declared as usize).min(remaining / min_entry_len + 1)
}

impl Decode for DnsMessage<'static> {
    fn decode(buf: &mut WireBuf<'_>) -> Result<Self, DecodeError> {
        let header = Header::decode(buf)?;

        let mut questions = Vec::with_capacity(section_capacity(
            header.question_count,
            buf.remaining(),
            MIN_QUESTION_LEN,
        ));
        for _ in 0..header.question_count {
            questions.push(Question::decode(buf)?);
        }

        let rr_capacity = |count: u16, buf: &WireBuf<'_>| {
            section_capacity(count, buf.remaining(), MIN_RECORD_LEN)
        };

        let mut answers = Vec::with_capacity(rr_capacity(header.answer_count, buf));
        for _ in 0..header.answer_count {
            answers.push(ResourceRecord::decode(buf)?);
        }

        let mut authorities = Vec::with_capacity(rr_capacity(header.authority_count, buf));
        for _ in 0..header.authority_count {
            authorities.push(ResourceRecord::decode(buf)?);
        }

        #[cfg(feature = "edns")]
        let mut edns = None;
        let mut additionals = Vec::with_capacity(rr_capacity(header.additional_count, buf));
        for _ in 0..header.additional_count {
            let additional = ResourceRecord::decode(buf)?;
            #[cfg(feature = "edns")]
            if additional.rtype() == RecordType::OPT {
                if edns.replace(additionals.len()).is_some() {
                    return Err(DecodeError::MalformedRecord("multiple OPT records"));
                }
            }
            additionals.push(additional);
        }

        Ok(DnsMessage {
            header,
            #[cfg(feature = "edns")]
            edns,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

fn encode_rr_section(
    records: &[ResourceRecord<'_>],
    buf: &mut WireBuf<'_>,
    label_cache: &mut Option<&mut LabelCache>,
    max_size: Option<usize>,
    used: &mut usize,
    count: &mut u16,
    truncated: &mut bool,
) -> Result<(), EncodeError> {
    for record in records {
        let budget = max_size.map(|max_size| max_size.saturating_sub(*used));
        let written = record.encode_with_cache(buf, label_cache.as_deref_mut(), budget)?;
        if written == 0 {
            *truncated = true;
            *count -= 1;
        } else {
            *used += written;
        }
    }
    Ok(())
}

impl<'a> Encode for DnsMessage<'a> {
    fn encode_with_cache(
        &self,
        buf: &mut WireBuf<'_>,
        mut label_cache: Option<&mut LabelCache>,
        max_size: Option<usize>,
    ) -> Result<usize, EncodeError> {
        if max_size.is_some_and(|max_size| max_size < HEADER_LEN) {
            return Err(EncodeError::SizeLimitTooSmall(max_size.unwrap_or(0)));
        }

        let mut used = HEADER_LEN;

        #[cfg(feature = "edns")]
        // The OPT record is reserved for upfront: it always makes it into
        // the message, no matter how many other records get dropped
        if let Some(opt_rr) = self.edns.and_then(|idx| self.additionals.get(idx)) {
            let opt_size = opt_rr.encoded_size(None);
            if max_size.is_some_and(|max_size| used + opt_size > max_size) {
                return Err(EncodeError::SizeLimitTooSmall(max_size.unwrap_or(0)));
            }
            used += opt_size;
        }

        // The header is re-written at the end if truncation changed any counts
        let mut header = self.header.clone();
        let header_pos = buf.len();
        self.header.encode_with_cache(buf, None, None)?;

        let mut truncated = false;
        for question in &self.questions {
            let budget = max_size.map(|max_size| max_size.saturating_sub(used));
            let written = question.encode_with_cache(buf, label_cache.as_deref_mut(), budget)?;
            if written == 0 {
                truncated = true;
                header.question_count -= 1;
            } else {
                used += written;
            }
        }

        encode_rr_section(
            &self.answers,
            buf,
            &mut label_cache,
            max_size,
            &mut used,
            &mut header.answer_count,
            &mut truncated,
        )?;
        encode_rr_section(
            &self.authorities,
            buf,
            &mut label_cache,
            max_size,
            &mut used,
            &mut header.authority_count,
            &mut truncated,
        )?;

        for (idx, additional) in self.additionals.iter().enumerate() {
            // The OPT record was already accounted for, so it always fits
            let is_opt = self.is_opt_index(idx);
            let budget = if is_opt {
                None
            } else {
                max_size.map(|max_size| max_size.saturating_sub(used))
            };
            let written = additional.encode_with_cache(buf, label_cache.as_deref_mut(), budget)?;
            if written == 0 {
                truncated = true;
                header.additional_count -= 1;
            } else if !is_opt {
                used += written;
            }
        }

        if truncated {
            header.truncated = true;
            buf.set_u16(header_pos + 2, header.flags());
            buf.set_u16(header_pos + 4, header.question_count);
            buf.set_u16(header_pos + 6, header.answer_count);
            buf.set_u16(header_pos + 8, header.authority_count);
            buf.set_u16(header_pos + 10, header.additional_count);
        }

        Ok(buf.len() - header_pos)
    }

    fn encode(&self, buf: &mut WireBuf<'_>, max_size: Option<usize>) -> Result<usize, EncodeError> {
        let mut label_cache = LabelCache::new();
        self.encode_with_cache(buf, Some(&mut label_cache), max_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use test_utils::{arb_question, arb_resource_record};

    prop_compose! {
        fn arb_header_with_counts(
            question_count: u16,
            answer_count: u16,
            authority_count: u16,
            additional_count: u16
        )(
            id: u16,
            is_response: bool,
            opcode: Opcode,
            authoritative: bool,
            truncated: bool,
            recursion_desired: bool,
            recursion_available: bool,
            z: [bool; 3],
            response_code: ResponseCode
        ) -> Header {
            Header {
                id,
                is_response,
                opcode,
                authoritative,
                truncated,
                recursion_desired,
                recursion_available,
                z,
                response_code,
                question_count,
                answer_count,
                authority_count,
                additional_count,
            }
        }
    }

    pub(crate) fn arb_dns_message() -> impl Strategy<Value = DnsMessage<'static>> {
        (0..3u16, 0..3u16, 0..3u16, 0..3u16)
            .prop_flat_map(|(questions_len, answers_len, authorities_len, additionals_len)| {
                let additionals = vec(arb_resource_record(), additionals_len as usize);
                #[cfg(feature = "edns")]
                let additionals = additionals.prop_filter("message with multiple OPT records", |vec| {
                    vec.iter().filter(|rr| rr.rtype() == RecordType::OPT).count() <= 1
                });
                (
                    arb_header_with_counts(questions_len, answers_len, authorities_len, additionals_len),
                    vec(arb_question(), questions_len as usize),
                    vec(arb_resource_record(), answers_len as usize),
                    vec(arb_resource_record(), authorities_len as usize),
                    additionals,
                )
                    .prop_map(|(header, questions, answers, authorities, additionals)| {
                        #[cfg(feature = "edns")]
                        let edns = additionals.iter().position(|rr| rr.rtype() == RecordType::OPT);
                        DnsMessage {
                            header,
                            #[cfg(feature = "edns")]
                            edns,
                            questions,
                            answers,
                            authorities,
                            additionals,
                        }
                    })
            })
            .boxed()
    }

    #[test]
    fn lying_counts_do_not_allocate_or_read_past_the_buffer() {
        let mut message = DnsMessage::new();
        message.header.answer_count = u16::MAX;
        let mut buf = WireBuf::new_empty(None);
        message.header.encode(&mut buf, None).unwrap();

        let result = DnsMessage::decode(&mut WireBuf::new(&buf));
        assert!(matches!(result, Err(DecodeError::Truncated(_))));
    }

    #[test]
    fn truncation_drops_answers_and_sets_the_bit() {
        let mut message = DnsMessage::new();
        message.header.is_response = true;
        message.questions.push(Question::new("example.com", RecordType::A, None));
        message.header.question_count = 1;
        for i in 0..20 {
            message.answers.push(ResourceRecord::new(
                "example.com",
                RecordData::A {
                    address: std::net::Ipv4Addr::new(10, 0, 0, i),
                },
                60,
                None,
            ));
            message.header.answer_count += 1;
        }

        let mut full = WireBuf::new_empty(None);
        let full_size = message.encode(&mut full, None).unwrap();
        assert!(full_size > 100);

        let mut truncated = WireBuf::new_empty(None);
        message.encode(&mut truncated, Some(100)).unwrap();
        assert!(truncated.len() <= 100);

        let decoded = DnsMessage::decode(&mut WireBuf::new(&truncated)).unwrap();
        assert!(decoded.header.truncated);
        assert_eq!(decoded.questions.len(), 1);
        assert!(decoded.header.answer_count < 20);
        assert_eq!(decoded.answers.len(), decoded.header.answer_count as usize);
    }

    #[test]
    fn lower_priority_sections_are_dropped_first() {
        let rr = |address| ResourceRecord::new(
            "example.com",
            RecordData::A { address },
            60,
            None,
        );
        let mut message = DnsMessage::new();
        message.header.is_response = true;
        message.questions.push(Question::new("example.com", RecordType::A, None));
        message.header.question_count = 1;
        message.answers.push(rr(std::net::Ipv4Addr::new(10, 0, 0, 1)));
        message.header.answer_count = 1;
        for _ in 0..10 {
            message.additionals.push(rr(std::net::Ipv4Addr::new(10, 0, 0, 2)));
            message.header.additional_count += 1;
        }

        let mut buf = WireBuf::new_empty(None);
        message.encode(&mut buf, Some(80)).unwrap();
        let decoded = DnsMessage::decode(&mut WireBuf::new(&buf)).unwrap();

        assert!(decoded.header.truncated);
        // The answer survived at the expense of the additional section
        assert_eq!(decoded.answers.len(), 1);
        assert!(decoded.additionals.len() < 10);
    }

    #[test]
    fn size_limit_below_header_is_an_error() {
        let message = DnsMessage::new();
        let mut buf = WireBuf::new_empty(None);
        assert_eq!(
            message.encode(&mut buf, Some(4)),
            Err(EncodeError::SizeLimitTooSmall(4))
        );
    }

    proptest! {
        #[test]
        fn dns_message_roundtrip(message in arb_dns_message()) {
            let mut buf = WireBuf::new_empty(None);
            let encoded_size = message.encode(&mut buf, None).expect("shouldn't have failed");
            assert_eq!(encoded_size, buf.len());
            let roundtripped = DnsMessage::decode(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(message, roundtripped, "DnsMessage roundtrip test failed");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Decoding any strict prefix of a valid message must fail cleanly:
        // no panic, no out-of-bounds access, no infinite pointer chase.
        #[test]
        fn every_strict_prefix_fails_to_decode(message in arb_dns_message()) {
            let mut buf = WireBuf::new_empty(None);
            message.encode(&mut buf, None).expect("shouldn't have failed");
            for prefix_len in 0..buf.len() {
                let mut prefix = WireBuf::new(&buf[..prefix_len]);
                prop_assert!(DnsMessage::decode(&mut prefix).is_err());
            }
        }
    }
}
