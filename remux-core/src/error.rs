//! Error types shared by all parsers.
//!
//! Every parse function returns `Result<T, ParseError>`. A `ParseError`
//! carries the file position at which parsing failed so callers can report
//! exact byte offsets. Probe failures are ordinary values consumed by the
//! stream-typing loops, not fatal conditions.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Underlying I/O failure.
    Io,
    /// Source exhausted before a required field.
    Eof,
    /// Malformed container structure (bad FOURCC, bad EBML length, ...).
    Structure,
    /// A size field exceeds what the format can address.
    OutOfRange,
    /// Scrambled PES content; reading encrypted VOBs is not supported.
    Encrypted,
    /// Codec probing did not reach decodable headers.
    ProbeFailed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Io => "i/o error",
            ErrorKind::Eof => "unexpected end of data",
            ErrorKind::Structure => "structural error",
            ErrorKind::OutOfRange => "value out of range",
            ErrorKind::Encrypted => "encrypted content",
            ErrorKind::ProbeFailed => "codec probe failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} at byte {position}: {detail}")]
pub struct ParseError {
    pub kind: ErrorKind,
    pub position: u64,
    pub detail: String,
}

impl ParseError {
    pub fn new(kind: ErrorKind, position: u64, detail: impl Into<String>) -> Self {
        Self {
            kind,
            position,
            detail: detail.into(),
        }
    }

    pub fn io(position: u64, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, position, detail)
    }

    pub fn eof(position: u64) -> Self {
        Self::new(ErrorKind::Eof, position, "unexpected end of data")
    }

    pub fn structure(position: u64, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Structure, position, detail)
    }

    pub fn out_of_range(position: u64, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfRange, position, detail)
    }

    pub fn encrypted(position: u64) -> Self {
        Self::new(
            ErrorKind::Encrypted,
            position,
            "reading encrypted VOBs is not supported",
        )
    }

    pub fn probe_failed(position: u64, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProbeFailed, position, detail)
    }

    pub fn is_eof(&self) -> bool {
        self.kind == ErrorKind::Eof
    }
}

pub type Result<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_position() {
        let err = ParseError::structure(0x2c, "LIST chunk <4 bytes");
        let text = err.to_string();
        assert!(text.contains("44"));
        assert!(text.contains("LIST chunk"));
    }

    #[test]
    fn eof_predicate() {
        assert!(ParseError::eof(0).is_eof());
        assert!(!ParseError::io(0, "x").is_eof());
    }
}
