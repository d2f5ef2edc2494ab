// FOURCC - four character codes
//
// A FourCC is compared as a 32-bit little-endian integer in on-disk byte
// order, exactly as the RIFF family stores it.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FourCc(pub u32);

impl FourCc {
    pub const fn from_bytes(b: [u8; 4]) -> Self {
        FourCc(u32::from_le_bytes(b))
    }

    pub const fn from_str(s: &str) -> Self {
        let b = s.as_bytes();
        FourCc(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// All four bytes printable ASCII or space. Finding one that is not
    /// signals a damaged chunk tree.
    pub fn is_valid(self) -> bool {
        self.bytes()
            .iter()
            .all(|&b| b == b' ' || b.is_ascii_graphic())
    }

    /// Decodes a `##tc` stream-reference chunk id; returns the stream number
    /// when the leading two bytes are hex digits.
    pub fn stream_number(self) -> Option<usize> {
        let b = self.bytes();
        let hi = (b[0] as char).to_digit(16)?;
        let lo = (b[1] as char).to_digit(16)?;
        Some((hi * 16 + lo) as usize)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.bytes() {
            if b == b' ' || b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self)
    }
}

// ============================================================================
// RIFF / AVI constants
// ============================================================================

pub const RIFF: FourCc = FourCc::from_str("RIFF");
pub const LIST: FourCc = FourCc::from_str("LIST");
pub const JUNK: FourCc = FourCc::from_str("JUNK");
pub const AVI_: FourCc = FourCc::from_str("AVI ");
pub const AVIX: FourCc = FourCc::from_str("AVIX");
pub const HDRL: FourCc = FourCc::from_str("hdrl");
pub const STRL: FourCc = FourCc::from_str("strl");
pub const MOVI: FourCc = FourCc::from_str("movi");
pub const REC_: FourCc = FourCc::from_str("rec ");
pub const AVIH: FourCc = FourCc::from_str("avih");
pub const STRH: FourCc = FourCc::from_str("strh");
pub const STRF: FourCc = FourCc::from_str("strf");
pub const INDX: FourCc = FourCc::from_str("indx");
pub const IDX1: FourCc = FourCc::from_str("idx1");
pub const SEGM: FourCc = FourCc::from_str("segm");

pub const VIDS: FourCc = FourCc::from_str("vids");
pub const AUDS: FourCc = FourCc::from_str("auds");
pub const TXTS: FourCc = FourCc::from_str("txts");
pub const IAVS: FourCc = FourCc::from_str("iavs");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_display() {
        let cc = FourCc::from_str("movi");
        assert_eq!(cc.bytes(), *b"movi");
        assert_eq!(cc.to_string(), "movi");
        assert_eq!(cc, MOVI);
    }

    #[test]
    fn validity() {
        assert!(RIFF.is_valid());
        assert!(FourCc::from_str("00dc").is_valid());
        assert!(!FourCc::from_bytes([0x00, 0x01, b'd', b'c']).is_valid());
    }

    #[test]
    fn stream_reference_decoding() {
        assert_eq!(FourCc::from_str("00dc").stream_number(), Some(0));
        assert_eq!(FourCc::from_str("01wb").stream_number(), Some(1));
        assert_eq!(FourCc::from_str("0fdb").stream_number(), Some(15));
        assert_eq!(FourCc::from_str("xxdc").stream_number(), None);
    }
}
