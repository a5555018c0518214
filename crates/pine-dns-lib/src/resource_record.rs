use std::borrow::Cow;
#[cfg(feature = "edns")]
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
#[cfg(feature = "edns")]
use std::num::NonZero;

use crate::buf::LabelCache;
use crate::utils::encoded_name_len;
use crate::{
    Decode, DecodeError, Encode, EncodeError, EncodedSize, RecordType, WireBuf, IN_CLASS,
};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ResourceRecord<'a> {
    pub name: Cow<'a, str>,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData<'a>,
}

impl<'a> ResourceRecord<'a> {
    pub fn new(
        name: impl Into<Cow<'a, str>>,
        data: RecordData<'a>,
        ttl: u32,
        class: Option<u16>,
    ) -> Self {
        ResourceRecord {
            name: name.into(),
            class: class.unwrap_or(IN_CLASS),
            ttl,
            data,
        }
    }

    pub fn rtype(&self) -> RecordType {
        self.data.rtype()
    }

    pub fn into_owned(self) -> ResourceRecord<'static> {
        ResourceRecord {
            name: self.name.into_owned().into(),
            class: self.class,
            ttl: self.ttl,
            data: self.data.into_owned(),
        }
    }

    /// Interprets this record as an OPT pseudo-record, which stores EDNS
    /// data in the class and TTL fields.
    #[cfg(feature = "edns")]
    pub fn edns_data(&self) -> Option<EdnsData> {
        match self.rtype() {
            RecordType::OPT => {
                let ttl_bytes = self.ttl.to_be_bytes();
                Some(EdnsData {
                    udp_payload_size: self.class as usize,
                    extended_rcode: NonZero::new(ttl_bytes[0]),
                    version: ttl_bytes[1],
                    dnssec_ok: ttl_bytes[2] & 0x80 == 0x80,
                })
            }
            _ => None,
        }
    }
}

impl Decode for ResourceRecord<'static> {
    fn decode(buf: &mut WireBuf<'_>) -> Result<Self, DecodeError> {
        let name = buf.read_name()?;
        let rtype: RecordType = buf.read_u16("record TYPE")?.into();
        let class = buf.read_u16("record CLASS")?;
        let ttl = buf.read_u32("record TTL")?;
        let data = RecordData::decode_with_type(buf, rtype)?;
        Ok(ResourceRecord {
            name,
            class,
            ttl,
            data,
        })
    }
}

impl<'a> Encode for ResourceRecord<'a> {
    fn encode_with_cache(
        &self,
        buf: &mut WireBuf<'_>,
        mut label_cache: Option<&mut LabelCache>,
        max_size: Option<usize>,
    ) -> Result<usize, EncodeError> {
        if max_size.is_some_and(|max_size| self.encoded_size(label_cache.as_deref()) > max_size) {
            return Ok(0);
        }
        let start = buf.len();
        buf.write_name(&self.name, label_cache.as_deref_mut())?;
        buf.write_u16(self.rtype().into());
        buf.write_u16(self.class);
        buf.write_u32(self.ttl);
        self.data.encode_with_cache(buf, label_cache, None)?;
        Ok(buf.len() - start)
    }
}

impl EncodedSize for ResourceRecord<'_> {
    fn encoded_size(&self, label_cache: Option<&LabelCache>) -> usize {
        encoded_name_len(&self.name, label_cache) + 2 /* TYPE */ + 2 /* CLASS */ + 4 /* TTL */
            + self.data.encoded_size(label_cache)
    }
}

/// EDNS data packed into an OPT pseudo-record.
#[derive(Debug)]
#[cfg(feature = "edns")]
pub struct EdnsData {
    pub udp_payload_size: usize,
    pub extended_rcode: Option<NonZero<u8>>,
    pub version: u8,
    /// Set by DNSSEC-aware requesters
    pub dnssec_ok: bool,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RecordData<'a> {
    A {
        address: Ipv4Addr,
    },
    NS {
        host: Cow<'a, str>,
    },
    CNAME {
        host: Cow<'a, str>,
    },
    AAAA {
        address: Ipv6Addr,
    },
    #[cfg(feature = "edns")]
    OPT {
        options: Option<HashMap<u16, Cow<'a, [u8]>>>,
    },
    Other {
        rtype: u16,
        rdata: Cow<'a, [u8]>,
    },
}

impl<'a> RecordData<'a> {
    pub fn decode_with_type(
        buf: &mut WireBuf<'_>,
        rtype: RecordType,
    ) -> Result<RecordData<'static>, DecodeError> {
        let rd_length = buf.read_u16("RDLENGTH")? as usize;
        Ok(match rtype {
            RecordType::A => {
                if rd_length != 4 {
                    return Err(DecodeError::MalformedRecord("A record RDLENGTH is not 4"));
                }
                let raw = buf.read_bytes(4, "A record address")?;
                RecordData::A {
                    address: Ipv4Addr::from(<[u8; 4]>::try_from(raw).unwrap()),
                }
            }
            RecordType::AAAA => {
                if rd_length != 16 {
                    return Err(DecodeError::MalformedRecord("AAAA record RDLENGTH is not 16"));
                }
                let raw = buf.read_bytes(16, "AAAA record address")?;
                RecordData::AAAA {
                    address: Ipv6Addr::from(<[u8; 16]>::try_from(raw).unwrap()),
                }
            }
            // NSDNAME/CNAME may be compressed, so RDLENGTH is not trusted here
            RecordType::NS => RecordData::NS {
                host: buf.read_name()?,
            },
            RecordType::CNAME => RecordData::CNAME {
                host: buf.read_name()?,
            },
            #[cfg(feature = "edns")]
            RecordType::OPT => {
                let mut remaining = rd_length;
                let mut options: Option<HashMap<_, _>> = None;
                while remaining != 0 {
                    let code = buf.read_u16("OPT option code")?;
                    let length = buf.read_u16("OPT option length")? as usize;
                    let data = buf.read_bytes(length, "OPT option data")?;
                    options
                        .get_or_insert_with(Default::default)
                        .insert(code, Cow::Owned(data.to_vec()));
                    remaining = remaining
                        .checked_sub(4 + length)
                        .ok_or(DecodeError::MalformedRecord("OPT options overrun RDLENGTH"))?;
                }
                RecordData::OPT { options }
            }
            RecordType::ANY => {
                return Err(DecodeError::MalformedRecord(
                    "ANY is a question type, not a record type",
                ))
            }
            RecordType::Other(rtype) => {
                let rdata = buf.read_bytes(rd_length, "record RDATA")?;
                RecordData::Other {
                    rtype,
                    rdata: Cow::Owned(rdata.to_vec()),
                }
            }
        })
    }

    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A { .. } => RecordType::A,
            RecordData::NS { .. } => RecordType::NS,
            RecordData::CNAME { .. } => RecordType::CNAME,
            RecordData::AAAA { .. } => RecordType::AAAA,
            #[cfg(feature = "edns")]
            RecordData::OPT { .. } => RecordType::OPT,
            RecordData::Other { rtype, .. } => RecordType::Other(*rtype),
        }
    }

    pub fn into_owned(self) -> RecordData<'static> {
        match self {
            RecordData::A { address } => RecordData::A { address },
            RecordData::NS { host } => RecordData::NS {
                host: host.into_owned().into(),
            },
            RecordData::CNAME { host } => RecordData::CNAME {
                host: host.into_owned().into(),
            },
            RecordData::AAAA { address } => RecordData::AAAA { address },
            #[cfg(feature = "edns")]
            RecordData::OPT { options } => RecordData::OPT {
                options: options.map(|options| {
                    options
                        .into_iter()
                        .map(|(code, data)| (code, Cow::Owned(data.into_owned())))
                        .collect()
                }),
            },
            RecordData::Other { rtype, rdata } => RecordData::Other {
                rtype,
                rdata: rdata.into_owned().into(),
            },
        }
    }
}

impl<'a> Encode for RecordData<'a> {
    fn encode_with_cache(
        &self,
        buf: &mut WireBuf<'_>,
        label_cache: Option<&mut LabelCache>,
        _max_size: Option<usize>,
    ) -> Result<usize, EncodeError> {
        let start = buf.len();
        match self {
            RecordData::A { address } => {
                buf.write_u16(4);
                buf.write_bytes(&address.octets());
            }
            RecordData::AAAA { address } => {
                buf.write_u16(16);
                buf.write_bytes(&address.octets());
            }
            RecordData::NS { host } | RecordData::CNAME { host } => {
                // RDLENGTH isn't known until the name is compressed, so a
                // stub is written first and patched afterwards
                let rdlength_pos = buf.len();
                buf.write_u16(0);
                let name_len = buf.write_name(host, label_cache)?;
                buf.set_u16(rdlength_pos, name_len as u16);
            }
            #[cfg(feature = "edns")]
            RecordData::OPT { options } => {
                let rdlength_pos = buf.len();
                buf.write_u16(0);
                let mut rd_length = 0;
                if let Some(options) = options {
                    for (&code, data) in options.iter() {
                        buf.write_u16(code);
                        buf.write_u16(data.len() as u16);
                        buf.write_bytes(data);
                        rd_length += 4 + data.len();
                    }
                }
                buf.set_u16(rdlength_pos, rd_length as u16);
            }
            RecordData::Other { rdata, .. } => {
                buf.write_u16(rdata.len() as u16);
                buf.write_bytes(rdata);
            }
        }
        Ok(buf.len() - start)
    }
}

impl EncodedSize for RecordData<'_> {
    fn encoded_size(&self, label_cache: Option<&LabelCache>) -> usize {
        let mut size = 2 /* RDLENGTH */;
        match self {
            RecordData::A { .. } => size += 4,
            RecordData::AAAA { .. } => size += 16,
            RecordData::NS { host } | RecordData::CNAME { host } => {
                size += encoded_name_len(host, label_cache);
            }
            #[cfg(feature = "edns")]
            RecordData::OPT { options } => {
                if let Some(options) = options {
                    for data in options.values() {
                        size += 2 /* code */ + 2 /* length */ + data.len();
                    }
                }
            }
            RecordData::Other { rdata, .. } => size += rdata.len(),
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_record_data, arb_resource_record};
    use proptest::prelude::*;

    #[test]
    fn a_record_with_bad_rdlength() {
        // RDLENGTH of 3 for an A record
        let raw = &[0x0, 0x3, 0x1, 0x2, 0x3];
        let mut buf = WireBuf::new(raw);
        assert_eq!(
            RecordData::decode_with_type(&mut buf, RecordType::A),
            Err(DecodeError::MalformedRecord("A record RDLENGTH is not 4"))
        );
    }

    #[test]
    fn unknown_record_with_missing_rdata() {
        // RDLENGTH of 16 with only 2 bytes of payload
        let raw = &[0x0, 0x10, 0xab, 0xcd];
        let mut buf = WireBuf::new(raw);
        assert_eq!(
            RecordData::decode_with_type(&mut buf, RecordType::Other(210)),
            Err(DecodeError::Truncated("record RDATA"))
        );
    }

    #[cfg(feature = "edns")]
    #[test]
    fn opt_record_with_lying_rdlength() {
        // RDLENGTH of 2 that cannot hold a single option header
        let raw = &[0x0, 0x2, 0x0, 0x1, 0x0, 0x0];
        let mut buf = WireBuf::new(raw);
        assert_eq!(
            RecordData::decode_with_type(&mut buf, RecordType::OPT),
            Err(DecodeError::MalformedRecord("OPT options overrun RDLENGTH"))
        );
    }

    proptest! {
        #[test]
        fn record_data_roundtrip(record_data in arb_record_data()) {
            let rtype = record_data.rtype();
            let mut buf = WireBuf::new_empty(None);
            record_data.encode(&mut buf, None).expect("shouldn't have failed");
            let roundtripped = RecordData::decode_with_type(&mut buf, rtype).expect("shouldn't have failed");
            prop_assert_eq!(record_data, roundtripped, "RecordData roundtrip test failed");
        }

        #[test]
        fn resource_record_roundtrip(resource_record in arb_resource_record()) {
            let mut buf = WireBuf::new_empty(None);
            resource_record.encode(&mut buf, None).expect("shouldn't have failed");
            let roundtripped = ResourceRecord::decode(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(resource_record, roundtripped, "ResourceRecord roundtrip test failed");
        }
    }
}
