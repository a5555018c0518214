use std::borrow::Cow;
use std::net::{Ipv4Addr, Ipv6Addr};

use prop::strategy::Union;
#[cfg(feature = "edns")]
use proptest::collection::hash_map;
use proptest::collection::vec;
use proptest::prelude::*;

use crate::{Question, RecordData, RecordType, ResourceRecord};

prop_compose! {
    pub fn arb_question()(qname in arb_name(), qtype in arb_record_type(), qclass: u16) -> Question<'static> {
        Question { qname, qtype, qclass }
    }
}

prop_compose! {
    pub fn arb_resource_record()(name in arb_name(), data in arb_record_data(), class: u16, ttl: u32) -> ResourceRecord<'static> {
        ResourceRecord { name, class, ttl, data }
    }
}

pub fn arb_record_data() -> impl Strategy<Value = RecordData<'static>> {
    let variants = vec![
        any::<Ipv4Addr>()
            .prop_map(|address| RecordData::A { address })
            .boxed(),
        arb_name()
            .prop_map(|host| RecordData::NS { host })
            .boxed(),
        arb_name()
            .prop_map(|host| RecordData::CNAME { host })
            .boxed(),
        any::<Ipv6Addr>()
            .prop_map(|address| RecordData::AAAA { address })
            .boxed(),
        #[cfg(feature = "edns")]
        proptest::option::of(hash_map(
            any::<u16>(),
            vec(any::<u8>(), 1..100).prop_map(Cow::Owned),
            1..10,
        ))
        .prop_map(|options| RecordData::OPT { options })
        .boxed(),
        vec(any::<u8>(), 1..100)
            .prop_map(Cow::Owned)
            // The reserved QTYPE avoids collisions with types decoded structurally
            .prop_map(|rdata| RecordData::Other { rtype: 65535, rdata })
            .boxed(),
    ];

    Union::new(variants)
}

// Only types that survive an encode/decode trip unchanged: `Other` values
// colliding with a structurally decoded type would come back as that type.
pub fn arb_record_type() -> impl Strategy<Value = RecordType> {
    prop_oneof![
        Just(RecordType::A),
        Just(RecordType::NS),
        Just(RecordType::CNAME),
        Just(RecordType::AAAA),
        Just(RecordType::ANY),
        Just(RecordType::Other(65535)),
    ]
}

// Repetitions are bounded so that generated names always stay below the
// 255-byte wire limit enforced by the decoder.
fn arb_name() -> impl Strategy<Value = Cow<'static, str>> {
    proptest::string::string_regex(r"(([a-z0-9][a-z0-9-]{1,14}\.){1,8}[a-z0-9]{2,15})|")
        .expect("regex should be valid")
        .prop_map(Cow::Owned)
}
