// VC-1 - advanced profile sequence header capture
//
// The PS demuxer only needs enough of VC-1 to type the track: find the
// sequence header start code, confirm the advanced profile and read the
// coded dimensions.

use serde::{Deserialize, Serialize};

use crate::bits::BitReader;
use crate::start_code::find_start_code;

pub const SEQUENCE_HEADER_CODE: u8 = 0x0F;
pub const PROFILE_ADVANCED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vc1SequenceHeader {
    pub profile: u8,
    pub level: u8,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub interlaced: bool,
}

/// Incremental scanner; feed bytes until `sequence_header()` yields.
#[derive(Default)]
pub struct Vc1EsParser {
    buffer: Vec<u8>,
    seq_hdr: Option<Vc1SequenceHeader>,
}

impl Vc1EsParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        if self.seq_hdr.is_some() {
            return;
        }
        self.buffer.extend_from_slice(data);

        let mut from = 0;
        while let Some(pos) = find_start_code(&self.buffer, from) {
            if pos + 4 < self.buffer.len() && self.buffer[pos + 3] == SEQUENCE_HEADER_CODE {
                if let Some(hdr) = parse_sequence_header(&self.buffer[pos + 4..]) {
                    self.seq_hdr = Some(hdr);
                    self.buffer.clear();
                    return;
                }
            }
            from = pos + 3;
        }
        // keep a partial start code across feeds
        if self.buffer.len() > 64 {
            let cut = self.buffer.len() - 64;
            self.buffer.drain(..cut);
        }
    }

    pub fn is_sequence_header_available(&self) -> bool {
        self.seq_hdr.is_some()
    }

    pub fn sequence_header(&self) -> Option<Vc1SequenceHeader> {
        self.seq_hdr
    }
}

fn parse_sequence_header(payload: &[u8]) -> Option<Vc1SequenceHeader> {
    let mut br = BitReader::new(payload);
    let profile = br.get_bits(2).ok()? as u8;
    if profile != PROFILE_ADVANCED {
        return None;
    }
    let level = br.get_bits(3).ok()? as u8;
    br.skip_bits(2).ok()?; // colordiff_format
    br.skip_bits(3 + 5).ok()?; // frmrtq_postproc, bitrtq_postproc
    br.skip_bits(1).ok()?; // postprocflag
    let max_coded_width = br.get_bits(12).ok()? as u32;
    let max_coded_height = br.get_bits(12).ok()? as u32;
    br.skip_bits(1).ok()?; // pulldown
    let interlace = br.get_bit().ok()?;

    Some(Vc1SequenceHeader {
        profile,
        level,
        pixel_width: (max_coded_width + 1) * 2,
        pixel_height: (max_coded_height + 1) * 2,
        interlaced: interlace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_seq_header(width: u32, height: u32) -> Vec<u8> {
        let mcw = width / 2 - 1;
        let mch = height / 2 - 1;
        let mut bits = 0u64;
        let mut nbits = 0u32;
        let mut push = |value: u64, count: u32| {
            bits = (bits << count) | value;
            nbits += count;
        };
        push(3, 2); // advanced profile
        push(2, 3); // level
        push(1, 2); // colordiff
        push(0, 3 + 5);
        push(0, 1);
        push(mcw as u64, 12);
        push(mch as u64, 12);
        push(0, 1); // pulldown
        push(1, 1); // interlace
        let pad = 64 - nbits % 64; // pad to byte-ish tail
        bits <<= pad;
        nbits += pad;
        let total_bits = (nbits + 7) / 8 * 8;
        let shifted = bits << (total_bits - nbits);
        let mut payload = vec![0x00, 0x00, 0x01, SEQUENCE_HEADER_CODE];
        for i in (0..total_bits / 8).rev() {
            payload.push((shifted >> (i * 8)) as u8);
        }
        payload.push(0);
        payload
    }

    #[test]
    fn advanced_profile_dimensions() {
        let mut parser = Vc1EsParser::new();
        parser.add_bytes(&build_seq_header(1920, 1080));
        assert!(parser.is_sequence_header_available());
        let hdr = parser.sequence_header().unwrap();
        assert_eq!(hdr.profile, PROFILE_ADVANCED);
        assert_eq!(hdr.pixel_width, 1920);
        assert_eq!(hdr.pixel_height, 1080);
        assert!(hdr.interlaced);
    }

    #[test]
    fn split_feeds() {
        let data = build_seq_header(720, 576);
        let mut parser = Vc1EsParser::new();
        parser.add_bytes(&data[..5]);
        assert!(!parser.is_sequence_header_available());
        parser.add_bytes(&data[5..]);
        assert!(parser.is_sequence_header_available());
        assert_eq!(parser.sequence_header().unwrap().pixel_width, 720);
    }
}
