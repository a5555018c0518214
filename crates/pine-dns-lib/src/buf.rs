use core::str;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use crate::{DecodeError, EncodeError};

/// Offsets above this value cannot be expressed by a 14-bit compression pointer.
const MAX_POINTER_OFFSET: usize = 0x3fff;
/// Maximum length of a single label on the wire.
pub(crate) const MAX_LABEL_LEN: usize = 63;
/// Maximum encoded length of a full name, including length and null bytes.
pub(crate) const MAX_NAME_LEN: usize = 255;

/// Start offsets of names already written to the buffer, keyed by the
/// remaining name at that offset. Used for backward-pointer compression.
pub type LabelCache = HashMap<String, usize>;

/// A cursor over wire-format bytes, borrowed when decoding and owned when
/// encoding.
pub struct WireBuf<'a> {
    buf: Cow<'a, [u8]>,
    pos: usize,
}

impl<'a> Deref for WireBuf<'a> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref()
    }
}

impl<'a> DerefMut for WireBuf<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.to_mut()
    }
}

impl<'a> AsRef<[u8]> for WireBuf<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl<'a> WireBuf<'a> {
    pub fn new(src: &'a [u8]) -> WireBuf<'a> {
        WireBuf {
            buf: Cow::Borrowed(src),
            pos: 0,
        }
    }

    pub fn new_from_vec(src: Vec<u8>) -> WireBuf<'static> {
        WireBuf {
            buf: Cow::Owned(src),
            pos: 0,
        }
    }

    pub fn new_empty(capacity: Option<usize>) -> WireBuf<'static> {
        WireBuf {
            buf: Cow::Owned(Vec::with_capacity(capacity.unwrap_or(512))),
            pos: 0,
        }
    }

    pub fn into_inner(self) -> Cow<'a, [u8]> {
        self.buf
    }

    pub fn reset_pos(&mut self) {
        self.pos = 0;
    }

    pub fn clear(&mut self) {
        self.buf.to_mut().clear();
        self.pos = 0;
    }

    /// Bytes left between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        self.read_bytes(1, what).map(|bytes| bytes[0])
    }

    pub fn read_u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        self.read_bytes(2, what)
            .map(|bytes| u16::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        self.read_bytes(4, what)
            .map(|bytes| u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize, what: &'static str) -> Result<&[u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::Truncated(what))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.to_mut().push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.to_mut().extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.to_mut().extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.to_mut().extend_from_slice(data);
    }

    /// Overwrites two bytes at an absolute position, growing the buffer if
    /// needed. Used to patch header counts and stubbed RDLENGTH fields.
    pub fn set_u16(&mut self, pos: usize, value: u16) {
        let buf = self.buf.to_mut();
        if buf.len() < pos + 2 {
            buf.resize(pos + 2, 0);
        }
        buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Reads a possibly-compressed name at the cursor.
    ///
    /// Compression pointers must descend strictly: backwards from the
    /// pointer itself, and below any previously followed pointer. This
    /// bounds every chase and rejects forward pointers and cycles outright.
    pub fn read_name(&mut self) -> Result<Cow<'static, str>, DecodeError> {
        let mut labels: Vec<&str> = Vec::new();
        let mut pos = self.pos;
        let mut jumped = false;
        let mut prev_target: Option<usize> = None;
        let mut wire_len = 0usize;

        loop {
            let len = *self
                .buf
                .get(pos)
                .ok_or(DecodeError::Truncated("expected a label length"))?
                as usize;
            match len & 0xc0 {
                0xc0 => {
                    let second = *self
                        .buf
                        .get(pos + 1)
                        .ok_or(DecodeError::Truncated("expected the second pointer byte"))?;
                    let target = ((len & 0x3f) << 8) | second as usize;
                    if target >= pos {
                        return Err(DecodeError::InvalidCompression(
                            "pointer does not point backwards",
                        ));
                    }
                    if prev_target.is_some_and(|prev| target >= prev) {
                        return Err(DecodeError::InvalidCompression(
                            "pointer chain does not descend",
                        ));
                    }
                    prev_target = Some(target);
                    if !jumped {
                        self.pos = pos + 2;
                        jumped = true;
                    }
                    pos = target;
                }
                0x00 => {
                    pos += 1;
                    if len == 0 {
                        if !jumped {
                            self.pos = pos;
                        }
                        break;
                    }
                    wire_len += 1 + len;
                    if wire_len + 1 > MAX_NAME_LEN {
                        return Err(DecodeError::MalformedRecord("name exceeds 255 bytes"));
                    }
                    let label = self
                        .buf
                        .get(pos..pos + len)
                        .ok_or(DecodeError::Truncated("label runs past the buffer end"))?;
                    let label = str::from_utf8(label)
                        .map_err(|_| DecodeError::MalformedRecord("label is not valid UTF-8"))?;
                    labels.push(label);
                    pos += len;
                    if !jumped {
                        self.pos = pos;
                    }
                }
                _ => return Err(DecodeError::MalformedRecord("reserved label type")),
            }
        }

        Ok(if labels.is_empty() {
            "".into()
        } else {
            labels.join(".").into()
        })
    }

    /// Writes a name at the end of the buffer, compressing against the
    /// label cache where a previously written suffix can be pointed at.
    ///
    /// Returns the number of bytes written.
    pub fn write_name(
        &mut self,
        name: &str,
        mut label_cache: Option<&mut LabelCache>,
    ) -> Result<usize, EncodeError> {
        let labels: Vec<&str> = name.split('.').filter(|label| !label.is_empty()).collect();
        let mut written = 0;
        for (idx, label) in labels.iter().enumerate() {
            if label.len() > MAX_LABEL_LEN {
                return Err(EncodeError::LabelTooLong((*label).to_string()));
            }
            if let Some(cache) = label_cache.as_deref_mut() {
                let suffix = labels[idx..].join(".");
                if let Some(&offset) = cache.get(&suffix) {
                    self.write_u16(0xc000 | offset as u16);
                    return Ok(written + 2);
                }
                if self.buf.len() <= MAX_POINTER_OFFSET {
                    cache.insert(suffix, self.buf.len());
                }
            }
            self.write_u8(label.len() as u8);
            self.write_bytes(label.as_bytes());
            written += 1 + label.len();
        }
        self.write_u8(0);
        Ok(written + 1)
    }
}
