use crate::buf::LabelCache;
use crate::{Decode, DecodeError, Encode, EncodeError, WireBuf, HEADER_LEN};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Opcode {
    /// Standard query
    #[default]
    Query,
    /// Inverse query
    InverseQuery,
    /// Status request
    Status,
    /// Opcodes 3-15
    Unknown,
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0 => Opcode::Query,
            1 => Opcode::InverseQuery,
            2 => Opcode::Status,
            _ => Opcode::Unknown,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ResponseCode {
    #[default]
    NoError,
    /// Server was unable to interpret the query
    FormatError,
    /// Server was unable to process the query due to an internal error
    ServerFailure,
    /// Name referenced in the query doesn't exist
    NxDomain,
    /// Requested kind of query is not supported by the server
    NotImplemented,
    /// Server refuses to complete the specified operation
    Refused,
    /// Codes 6-15
    Unknown,
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormatError,
            2 => ResponseCode::ServerFailure,
            3 => ResponseCode::NxDomain,
            4 => ResponseCode::NotImplemented,
            5 => ResponseCode::Refused,
            _ => ResponseCode::Unknown,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Default, Clone)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Header {
    /// Unique ID of this exchange. A query and its response carry the same ID.
    pub id: u16,
    /// Query/Response bit
    pub is_response: bool,
    pub opcode: Opcode,
    /// Set by a server answering from data it is authoritative for
    pub authoritative: bool,
    /// Set when records were dropped to fit a size-limited transport
    pub truncated: bool,
    /// Set by the requester to ask for recursive resolution
    pub recursion_desired: bool,
    /// Set by the server when recursion is offered
    pub recursion_available: bool,
    /// Z/AD/CD bits
    pub z: [bool; 3],
    pub response_code: ResponseCode,
    /// Number of entries in the *Question* section
    pub question_count: u16,
    /// Number of entries in the *Answer* section
    pub answer_count: u16,
    /// Number of entries in the *Authority* section
    pub authority_count: u16,
    /// Number of entries in the *Additional* section
    pub additional_count: u16,
}

impl Header {
    pub fn new() -> Self {
        Header::default()
    }

    pub fn flags(&self) -> u16 {
        let first_byte = (self.is_response as u8) << 7
            | (self.opcode as u8) << 3
            | (self.authoritative as u8) << 2
            | (self.truncated as u8) << 1
            | self.recursion_desired as u8;
        let second_byte = (self.recursion_available as u8) << 7
            | (self.z[0] as u8) << 6
            | (self.z[1] as u8) << 5
            | (self.z[2] as u8) << 4
            | self.response_code as u8;
        (first_byte as u16) << 8 | second_byte as u16
    }
}

impl Decode for Header {
    fn decode(buf: &mut WireBuf<'_>) -> Result<Self, DecodeError> {
        let id = buf.read_u16("header id")?;
        let flags = buf.read_u16("header flags")?;

        let is_response = (flags >> 15) & 1 == 1;
        let opcode: Opcode = (((flags >> 11) & 0xf) as u8).into();
        let authoritative = (flags >> 10) & 1 == 1;
        let truncated = (flags >> 9) & 1 == 1;
        let recursion_desired = (flags >> 8) & 1 == 1;
        let recursion_available = (flags >> 7) & 1 == 1;
        let z = [
            (flags >> 6) & 1 == 1,
            (flags >> 5) & 1 == 1,
            (flags >> 4) & 1 == 1,
        ];
        let response_code: ResponseCode = ((flags & 0xf) as u8).into();

        let question_count = buf.read_u16("question count")?;
        let answer_count = buf.read_u16("answer count")?;
        let authority_count = buf.read_u16("authority count")?;
        let additional_count = buf.read_u16("additional count")?;

        Ok(Header {
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
        })
    }
}

impl Encode for Header {
    fn encode_with_cache(
        &self,
        buf: &mut WireBuf<'_>,
        _label_cache: Option<&mut LabelCache>,
        _max_size: Option<usize>,
    ) -> Result<usize, EncodeError> {
        buf.write_u16(self.id);
        buf.write_u16(self.flags());
        buf.write_u16(self.question_count);
        buf.write_u16(self.answer_count);
        buf.write_u16(self.authority_count);
        buf.write_u16(self.additional_count);
        Ok(HEADER_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_parsing() {
        let raw = &[0x0, 0xff, 0x95, 0xa4, 0x0, 0x6, 0x0, 0x7, 0x0, 0x8, 0x0, 0x9];
        let mut buf = WireBuf::new(raw);
        let header = Header::decode(&mut buf).expect("shouldn't have failed");

        assert_eq!(header.id, 255);
        assert!(header.is_response);
        assert_eq!(header.opcode, Opcode::Status);
        assert!(header.authoritative);
        assert!(!header.truncated);
        assert!(header.recursion_desired);
        assert!(header.recursion_available);
        assert!(!header.z[0]);
        assert!(header.z[1]);
        assert!(!header.z[2]);
        assert_eq!(header.response_code, ResponseCode::NotImplemented);
        assert_eq!(header.question_count, 6);
        assert_eq!(header.answer_count, 7);
        assert_eq!(header.authority_count, 8);
        assert_eq!(header.additional_count, 9);
    }

    #[test]
    fn header_too_short() {
        let mut buf = WireBuf::new(&[0x0, 0x1, 0x80]);
        assert_eq!(
            Header::decode(&mut buf),
            Err(DecodeError::Truncated("header flags"))
        );
    }

    proptest! {
        #[test]
        fn header_roundtrip(header: Header) {
            let mut buf = WireBuf::new_empty(None);
            header.encode(&mut buf, None).expect("shouldn't have failed");
            let roundtripped = Header::decode(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(header, roundtripped, "Header roundtrip test failed");
        }
    }
}
