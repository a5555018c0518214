use thiserror::Error;

/// Errors produced while decoding a wire-format message.
///
/// Decoding operates on attacker-controlled bytes: every variant is
/// recoverable, and no failure path may read past the supplied buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A declared field would read past the end of the buffer.
    #[error("truncated message: {0}")]
    Truncated(&'static str),
    /// A name compression pointer points forwards or forms a cycle.
    #[error("invalid compression pointer: {0}")]
    InvalidCompression(&'static str),
    /// A record that contradicts itself: bad RDLENGTH, reserved label
    /// type, oversized name, duplicate OPT.
    #[error("malformed record: {0}")]
    MalformedRecord(&'static str),
}

/// Errors produced while encoding a message.
///
/// Running out of room in a size-limited message is not an error: encoding
/// drops records and sets the truncation bit instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("size limit of {0} bytes cannot fit a DNS header")]
    SizeLimitTooSmall(usize),
    #[error("label '{0}' exceeds 63 bytes")]
    LabelTooLong(String),
}
