use std::borrow::Cow;

use crate::buf::LabelCache;
use crate::utils::encoded_name_len;
use crate::{
    Decode, DecodeError, Encode, EncodeError, EncodedSize, WireBuf, IN_CLASS,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    AAAA,
    #[cfg(feature = "edns")]
    OPT,
    ANY,
    Other(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            28 => RecordType::AAAA,
            #[cfg(feature = "edns")]
            41 => RecordType::OPT,
            255 => RecordType::ANY,
            _ => RecordType::Other(value),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::AAAA => 28,
            #[cfg(feature = "edns")]
            RecordType::OPT => 41,
            RecordType::ANY => 255,
            RecordType::Other(rtype) => rtype,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Question<'a> {
    pub qname: Cow<'a, str>,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl<'a> Question<'a> {
    pub fn new(qname: &'a str, qtype: RecordType, qclass: Option<u16>) -> Self {
        Question {
            qname: Cow::Borrowed(qname),
            qtype,
            qclass: qclass.unwrap_or(IN_CLASS),
        }
    }

    pub fn into_owned(self) -> Question<'static> {
        Question {
            qname: self.qname.into_owned().into(),
            qtype: self.qtype,
            qclass: self.qclass,
        }
    }
}

impl Decode for Question<'static> {
    fn decode(buf: &mut WireBuf<'_>) -> Result<Self, DecodeError> {
        let qname = buf.read_name()?;
        let qtype = buf.read_u16("QTYPE")?.into();
        let qclass = buf.read_u16("QCLASS")?;

        Ok(Question {
            qname,
            qtype,
            qclass,
        })
    }
}

impl<'a> Encode for Question<'a> {
    fn encode_with_cache(
        &self,
        buf: &mut WireBuf<'_>,
        label_cache: Option<&mut LabelCache>,
        max_size: Option<usize>,
    ) -> Result<usize, EncodeError> {
        if max_size.is_some_and(|max_size| self.encoded_size(label_cache.as_deref()) > max_size) {
            return Ok(0);
        }
        let start = buf.len();
        buf.write_name(&self.qname, label_cache)?;
        buf.write_u16(self.qtype.into());
        buf.write_u16(self.qclass);
        Ok(buf.len() - start)
    }
}

impl EncodedSize for Question<'_> {
    fn encoded_size(&self, label_cache: Option<&LabelCache>) -> usize {
        encoded_name_len(&self.qname, label_cache) + 2 /* QTYPE */ + 2 /* QCLASS */
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::arb_question;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn question_roundtrip(question in arb_question()) {
            let mut buf = WireBuf::new_empty(None);
            let encoded_size = question.encode(&mut buf, None).expect("shouldn't have failed");
            assert_eq!(encoded_size, buf.len());
            let roundtripped = Question::decode(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(question, roundtripped, "Question roundtrip test failed");
        }
    }
}
