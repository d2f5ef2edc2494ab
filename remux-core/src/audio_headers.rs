// AUDIO HEADERS - frame-sync parsers for PS stream typing
//
// The program-stream demuxer types private-stream-1 substreams by probing
// payload bytes until one of these parsers reports a decodable header:
// MPEG audio (layers 1-3), (E)AC-3, DTS core, TrueHD/MLP.

use serde::{Deserialize, Serialize};

use crate::bits::BitReader;
use crate::io::get_u32_be;

// ============================================================================
// MPEG audio (MP1/MP2/MP3)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpegAudioHeader {
    pub version: u8, // 1, 2; 3 = MPEG-2.5
    pub layer: u8,   // 1..=3
    pub bitrate_kbps: u32,
    pub sampling_frequency: u32,
    pub channels: u8,
    pub frame_size: usize,
}

const MP_BITRATES_V1: [[u32; 15]; 3] = [
    // layer 1
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    // layer 2
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    // layer 3
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
];

const MP_BITRATES_V2: [[u32; 15]; 3] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

const MP_RATES: [[u32; 3]; 3] = [
    [44100, 48000, 32000], // v1
    [22050, 24000, 16000], // v2
    [11025, 12000, 8000],  // v2.5
];

pub fn decode_mpeg_audio_header(buf: &[u8]) -> Option<MpegAudioHeader> {
    if buf.len() < 4 {
        return None;
    }
    let hdr = get_u32_be(buf);
    if hdr >> 21 != 0x7FF {
        return None;
    }

    let version = match (hdr >> 19) & 3 {
        3 => 1u8,
        2 => 2,
        0 => 3, // MPEG-2.5
        _ => return None,
    };
    let layer = match (hdr >> 17) & 3 {
        3 => 1u8,
        2 => 2,
        1 => 3,
        _ => return None,
    };
    let bitrate_idx = ((hdr >> 12) & 0xF) as usize;
    let rate_idx = ((hdr >> 10) & 3) as usize;
    if bitrate_idx == 0 || bitrate_idx == 15 || rate_idx == 3 {
        return None;
    }

    let bitrate_kbps = if version == 1 {
        MP_BITRATES_V1[layer as usize - 1][bitrate_idx]
    } else {
        MP_BITRATES_V2[layer as usize - 1][bitrate_idx]
    };
    let sampling_frequency = MP_RATES[version as usize - 1][rate_idx];
    let padding = ((hdr >> 9) & 1) as usize;
    let channels = if (hdr >> 6) & 3 == 3 { 1 } else { 2 };

    let frame_size = match layer {
        1 => (12 * bitrate_kbps as usize * 1000 / sampling_frequency as usize + padding) * 4,
        2 => 144 * bitrate_kbps as usize * 1000 / sampling_frequency as usize + padding,
        _ => {
            let coef = if version == 1 { 144 } else { 72 };
            coef * bitrate_kbps as usize * 1000 / sampling_frequency as usize + padding
        }
    };

    Some(MpegAudioHeader {
        version,
        layer,
        bitrate_kbps,
        sampling_frequency,
        channels,
        frame_size,
    })
}

/// Offset of the first decodable MPEG audio frame header, or None.
pub fn find_mpeg_audio_header(buf: &[u8]) -> Option<(usize, MpegAudioHeader)> {
    for pos in 0..buf.len().saturating_sub(3) {
        if buf[pos] == 0xFF {
            if let Some(hdr) = decode_mpeg_audio_header(&buf[pos..]) {
                return Some((pos, hdr));
            }
        }
    }
    None
}

// ============================================================================
// (E)AC-3
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ac3Header {
    pub bs_id: u8,
    pub channels: u8,
    pub sample_rate: u32,
    pub frame_size: usize,
    pub samples: u32,
}

impl Ac3Header {
    /// `bs_id == 16` marks E-AC-3.
    pub fn is_eac3(&self) -> bool {
        self.bs_id == 16
    }
}

const AC3_CHANNELS: [u8; 8] = [2, 1, 2, 3, 3, 4, 4, 5];
const AC3_RATES: [u32; 3] = [48000, 44100, 32000];
const AC3_BITRATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

pub fn decode_ac3_header(buf: &[u8]) -> Option<Ac3Header> {
    if buf.len() < 8 {
        return None;
    }
    if buf[0] != 0x0B || buf[1] != 0x77 {
        return None;
    }

    // bsid sits at bit offset 40 in both syntax variants
    let bs_id = (buf[5] >> 3) & 0x1F;

    if bs_id <= 10 {
        let fscod = (buf[4] >> 6) as usize;
        let frmsizecod = (buf[4] & 0x3F) as usize;
        if fscod == 3 || frmsizecod >= 38 {
            return None;
        }
        let bitrate = AC3_BITRATES[frmsizecod >> 1];
        let words = match fscod {
            0 => 2 * bitrate,
            1 => bitrate * 96000 / 44100 + (frmsizecod as u32 & 1),
            _ => 3 * bitrate,
        };
        let acmod = (buf[6] >> 5) as usize;
        // lfeon follows acmod after the optional surround/center mix bits
        let mut br = BitReader::new(&buf[6..]);
        br.skip_bits(3).ok()?; // acmod
        if acmod & 1 != 0 && acmod != 1 {
            br.skip_bits(2).ok()?; // cmixlev
        }
        if acmod & 4 != 0 {
            br.skip_bits(2).ok()?; // surmixlev
        }
        if acmod == 2 {
            br.skip_bits(2).ok()?; // dsurmod
        }
        let lfeon = br.get_bit().ok()?;

        Some(Ac3Header {
            bs_id,
            channels: AC3_CHANNELS[acmod] + lfeon as u8,
            sample_rate: AC3_RATES[fscod],
            frame_size: words as usize * 2,
            samples: 1536,
        })
    } else if bs_id <= 16 {
        // E-AC-3
        let mut br = BitReader::new(&buf[2..]);
        let strmtyp = br.get_bits(2).ok()?;
        if strmtyp == 3 {
            return None;
        }
        br.skip_bits(3).ok()?; // substreamid
        let frmsiz = br.get_bits(11).ok()? as usize;
        let fscod = br.get_bits(2).ok()? as usize;
        let (sample_rate, numblks) = if fscod == 3 {
            let fscod2 = br.get_bits(2).ok()? as usize;
            if fscod2 == 3 {
                return None;
            }
            (AC3_RATES[fscod2] / 2, 6u32)
        } else {
            let numblkscod = br.get_bits(2).ok()?;
            (AC3_RATES[fscod], [1u32, 2, 3, 6][numblkscod as usize])
        };
        let acmod = br.get_bits(3).ok()? as usize;
        let lfeon = br.get_bit().ok()?;

        Some(Ac3Header {
            bs_id,
            channels: AC3_CHANNELS[acmod] + lfeon as u8,
            sample_rate,
            frame_size: (frmsiz + 1) * 2,
            samples: 256 * numblks,
        })
    } else {
        None
    }
}

pub fn find_ac3_header(buf: &[u8]) -> Option<(usize, Ac3Header)> {
    for pos in 0..buf.len().saturating_sub(7) {
        if buf[pos] == 0x0B && buf[pos + 1] == 0x77 {
            if let Some(hdr) = decode_ac3_header(&buf[pos..]) {
                return Some((pos, hdr));
            }
        }
    }
    None
}

// ============================================================================
// DTS core
// ============================================================================

pub const DTS_SYNC: u32 = 0x7FFE_8001;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtsHeader {
    pub frame_size: usize,
    pub channels: u8,
    pub sample_rate: u32,
    pub core_header: Vec<u8>,
}

const DTS_CHANNELS: [u8; 16] = [1, 2, 2, 2, 2, 3, 3, 4, 4, 5, 6, 6, 6, 7, 8, 8];

fn dts_sample_rate(sfreq: u32) -> Option<u32> {
    match sfreq {
        1 => Some(8000),
        2 => Some(16000),
        3 => Some(32000),
        6 => Some(11025),
        7 => Some(22050),
        8 => Some(44100),
        11 => Some(12000),
        12 => Some(24000),
        13 => Some(48000),
        _ => None,
    }
}

pub fn decode_dts_header(buf: &[u8]) -> Option<DtsHeader> {
    if buf.len() < 13 {
        return None;
    }
    if get_u32_be(buf) != DTS_SYNC {
        return None;
    }
    let mut br = BitReader::new(&buf[4..]);
    br.skip_bits(1).ok()?; // frame type
    br.skip_bits(5).ok()?; // deficit sample count
    br.skip_bits(1).ok()?; // crc present
    let nblks = br.get_bits(7).ok()?;
    if nblks < 5 {
        return None;
    }
    let fsize = br.get_bits(14).ok()? as usize;
    if fsize < 95 {
        return None;
    }
    let amode = br.get_bits(6).ok()? as usize;
    let sfreq = br.get_bits(4).ok()? as u32;
    let sample_rate = dts_sample_rate(sfreq)?;
    let channels = if amode < 16 { DTS_CHANNELS[amode] } else { 8 };

    let header_len = buf.len().min(13);
    Some(DtsHeader {
        frame_size: fsize + 1,
        channels,
        sample_rate,
        core_header: buf[..header_len].to_vec(),
    })
}

pub fn find_dts_header(buf: &[u8]) -> Option<(usize, DtsHeader)> {
    for pos in 0..buf.len().saturating_sub(12) {
        if buf[pos] == 0x7F && buf[pos + 1] == 0xFE {
            if let Some(hdr) = decode_dts_header(&buf[pos..]) {
                return Some((pos, hdr));
            }
        }
    }
    None
}

// ============================================================================
// TrueHD / MLP
// ============================================================================

pub const TRUEHD_SYNC: u32 = 0xF872_6FBA;
pub const MLP_SYNC: u32 = 0xF872_6FB1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruehdFrameType {
    Sync,
    Normal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruehdFrame {
    pub frame_type: TruehdFrameType,
    pub size: usize,
    pub sampling_rate: u32,
    pub channels: u8,
    pub samples_per_frame: u32,
}

fn truehd_sampling_rate(code: u32) -> Option<u32> {
    match code {
        0 => Some(48000),
        1 => Some(96000),
        2 => Some(192000),
        8 => Some(44100),
        9 => Some(88200),
        10 => Some(176400),
        _ => None,
    }
}

/// Incremental TrueHD/MLP framer. Feed bytes, drain frames; probing succeeds
/// on the first frame carrying a major sync.
pub struct TruehdParser {
    buffer: Vec<u8>,
    synced: bool,
    frames: std::collections::VecDeque<TruehdFrame>,
    sampling_rate: u32,
    channels: u8,
    samples_per_frame: u32,
}

impl Default for TruehdParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TruehdParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            synced: false,
            frames: std::collections::VecDeque::new(),
            sampling_rate: 0,
            channels: 0,
            samples_per_frame: 0,
        }
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.parse();
    }

    pub fn frame_available(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn next_frame(&mut self) -> Option<TruehdFrame> {
        self.frames.pop_front()
    }

    fn parse(&mut self) {
        if !self.synced {
            // scan for a major sync; the access-unit header sits 4 bytes
            // before it
            let mut found = None;
            let mut i = 4usize;
            while i + 4 <= self.buffer.len() {
                let sync = get_u32_be(&self.buffer[i..]);
                if sync == TRUEHD_SYNC || sync == MLP_SYNC {
                    found = Some(i - 4);
                    break;
                }
                i += 1;
            }
            match found {
                Some(start) => {
                    self.buffer.drain(..start);
                    self.synced = true;
                }
                None => {
                    let keep = self.buffer.len().min(7);
                    let cut = self.buffer.len() - keep;
                    self.buffer.drain(..cut);
                    return;
                }
            }
        }

        loop {
            if self.buffer.len() < 8 {
                return;
            }
            let size = (((self.buffer[0] & 0x0F) as usize) << 8 | self.buffer[1] as usize) * 2;
            if size < 8 {
                // lost framing; force a rescan
                self.synced = false;
                self.buffer.drain(..1);
                return;
            }
            if self.buffer.len() < size {
                return;
            }

            let sync = get_u32_be(&self.buffer[4..]);
            let frame_type = if sync == TRUEHD_SYNC || sync == MLP_SYNC {
                if sync == TRUEHD_SYNC && self.buffer.len() >= 12 {
                    let rate_code = (self.buffer[8] >> 4) as u32;
                    if let Some(rate) = truehd_sampling_rate(rate_code) {
                        self.sampling_rate = rate;
                        self.samples_per_frame = 40 * (rate / 48000).max(1);
                    }
                    // 13-bit channel assignment map of the 8ch substream
                    let map = ((self.buffer[10] as u32 & 0x1F) << 8) | self.buffer[11] as u32;
                    let mapped = truehd_map_channels(map);
                    self.channels = if mapped == 0 { 2 } else { mapped };
                }
                TruehdFrameType::Sync
            } else {
                TruehdFrameType::Normal
            };

            self.frames.push_back(TruehdFrame {
                frame_type,
                size,
                sampling_rate: self.sampling_rate,
                channels: self.channels,
                samples_per_frame: self.samples_per_frame,
            });
            self.buffer.drain(..size);
        }
    }
}

fn truehd_map_channels(map: u32) -> u8 {
    // each map bit enables a speaker group of one or two channels
    const GROUP_SIZES: [u8; 13] = [2, 1, 2, 2, 2, 1, 1, 2, 1, 2, 1, 2, 1];
    let mut channels = 0u8;
    for (bit, &size) in GROUP_SIZES.iter().enumerate() {
        if map & (1 << bit) != 0 {
            channels += size;
        }
    }
    channels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mp3_header() {
        // MPEG1 layer 3, 128 kbps, 44.1 kHz, joint stereo
        let hdr = [0xFF, 0xFB, 0x90, 0x40];
        let h = decode_mpeg_audio_header(&hdr).unwrap();
        assert_eq!(h.version, 1);
        assert_eq!(h.layer, 3);
        assert_eq!(h.bitrate_kbps, 128);
        assert_eq!(h.sampling_frequency, 44100);
        assert_eq!(h.channels, 2);
        assert_eq!(h.frame_size, 417);
    }

    #[test]
    fn mp3_sync_search() {
        let mut buf = vec![0u8; 10];
        buf.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x40, 0, 0]);
        let (pos, h) = find_mpeg_audio_header(&buf).unwrap();
        assert_eq!(pos, 10);
        assert_eq!(h.layer, 3);
        assert!(find_mpeg_audio_header(&[0u8; 32]).is_none());
    }

    #[test]
    fn ac3_classic_header() {
        // 48 kHz, frmsizecod 20 (192 kbps), bsid 8, acmod 7 (3/2), lfe on
        let buf = [0x0B, 0x77, 0x00, 0x00, 0x14, 0x40, 0xE9, 0x00];
        let h = decode_ac3_header(&buf).unwrap();
        assert_eq!(h.bs_id, 8);
        assert_eq!(h.sample_rate, 48000);
        assert_eq!(h.frame_size, 2 * 2 * 192);
        assert_eq!(h.channels, 6);
        assert!(!h.is_eac3());
    }

    #[test]
    fn eac3_header() {
        // strmtyp 0, substream 0, frmsiz 511 -> 1024 bytes, fscod 0 (48k),
        // numblkscod 3 (6 blocks), acmod 2, lfeon 0, bsid 16
        let mut buf = vec![0x0B, 0x77];
        // 00 000 00111111111 00 11 010 0 10000 ...
        buf.extend_from_slice(&[0b0000_0001, 0b1111_1111, 0b0011_0100, 0b1000_0000, 0, 0]);
        let h = decode_ac3_header(&buf).unwrap();
        assert_eq!(h.bs_id, 16);
        assert!(h.is_eac3());
        assert_eq!(h.frame_size, 1024);
        assert_eq!(h.sample_rate, 48000);
        assert_eq!(h.channels, 2);
        assert_eq!(h.samples, 1536);
    }

    #[test]
    fn dts_header() {
        // sync + ftype 1, samdeficit 31, crc 0, nblks 15, fsize 511,
        // amode 9 (5ch), sfreq 13 (48 kHz)
        let mut buf = vec![0x7F, 0xFE, 0x80, 0x01];
        // 1 11111 0 0001111 00000111111111 001001 1101 ...
        buf.extend_from_slice(&[0b1111_1100, 0b0011_1100, 0b0001_1111, 0b1111_0010, 0b0111_0100]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        let h = decode_dts_header(&buf).unwrap();
        assert_eq!(h.frame_size, 512);
        assert_eq!(h.channels, 5);
        assert_eq!(h.sample_rate, 48000);
        assert_eq!(h.core_header.len(), 13);
    }

    fn truehd_sync_frame(total: usize) -> Vec<u8> {
        let mut f = vec![0u8; total];
        let words = (total / 2) as u16;
        f[0] = (words >> 8) as u8 & 0x0F;
        f[1] = words as u8;
        f[4..8].copy_from_slice(&TRUEHD_SYNC.to_be_bytes());
        f[8] = 0x00; // 48 kHz
        f[10] = 0x00;
        f[11] = 0x1F; // five speaker groups enabled
        f
    }

    #[test]
    fn truehd_sync_then_normal() {
        let mut parser = TruehdParser::new();
        let mut data = vec![0xAA, 0xBB]; // leading garbage
        data.extend_from_slice(&truehd_sync_frame(32));
        let mut normal = vec![0u8; 16];
        normal[0] = 0;
        normal[1] = 8; // 8 words = 16 bytes
        data.extend_from_slice(&normal);
        parser.add_data(&data);

        let first = parser.next_frame().unwrap();
        assert_eq!(first.frame_type, TruehdFrameType::Sync);
        assert_eq!(first.size, 32);
        assert_eq!(first.sampling_rate, 48000);
        assert!(first.channels >= 6);
        let second = parser.next_frame().unwrap();
        assert_eq!(second.frame_type, TruehdFrameType::Normal);
        assert_eq!(second.size, 16);
    }

    #[test]
    fn truehd_waits_for_full_frame() {
        let mut parser = TruehdParser::new();
        let frame = truehd_sync_frame(64);
        parser.add_data(&frame[..40]);
        assert!(!parser.frame_available());
        parser.add_data(&frame[40..]);
        assert!(parser.frame_available());
    }
}
