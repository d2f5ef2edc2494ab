// MPEG-1/2 ES FRAMER
//
// State machine over start codes producing timestamp-carrying access units.
// Timestamps are fabricated in ticks of half a frame period so that
// repeat_first_field frames, field pairs and 2-3 pulldown all stamp exactly;
// ticks convert to nanoseconds via the sequence-header frame rate.
//
// Frames are delivered in decode order. B frames reference the surrounding
// I/P frames; the parser peeks ahead through queued chunks to count trailing
// B frames before stamping each reference frame.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::fraction::Fraction;
use crate::start_code::find_start_code;

const BUFFER_CAP: usize = 2 * 1024 * 1024;

pub const PICTURE_CODE: u8 = 0x00;
pub const SEQUENCE_CODE: u8 = 0xB3;
pub const EXTENSION_CODE: u8 = 0xB5;
pub const SEQUENCE_END_CODE: u8 = 0xB7;
pub const GOP_CODE: u8 = 0xB8;

pub const PICTURE_STRUCTURE_TOP_FIELD: u8 = 1;
pub const PICTURE_STRUCTURE_BOTTOM_FIELD: u8 = 2;
pub const PICTURE_STRUCTURE_FRAME: u8 = 3;

// ============================================================================
// Parsed headers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceHeader {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f32,
    pub frame_rate: Fraction,
    pub progressive_sequence: bool,
}

impl Default for SequenceHeader {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            aspect_ratio: -1.0,
            frame_rate: Fraction::new(25, 1),
            progressive_sequence: false,
        }
    }
}

impl SequenceHeader {
    /// Nanoseconds per half-frame tick.
    pub fn tick_duration(&self) -> Fraction {
        Fraction::new(1_000_000_000, 1).div(self.frame_rate.mul(Fraction::from_int(2)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureHeader {
    pub temporal_reference: u16,
    pub frame_type: FrameType,
    pub picture_structure: u8,
    pub top_field_first: bool,
    pub repeat_first_field: bool,
    pub progressive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    I,
    P,
    B,
}

fn frame_rate_for_code(code: u8) -> Fraction {
    match code {
        1 => Fraction::new(24000, 1001),
        2 => Fraction::new(24, 1),
        3 => Fraction::new(25, 1),
        4 => Fraction::new(30000, 1001),
        5 => Fraction::new(30, 1),
        6 => Fraction::new(50, 1),
        7 => Fraction::new(60000, 1001),
        8 => Fraction::new(60, 1),
        _ => Fraction::new(25, 1),
    }
}

fn aspect_ratio_for_code(code: u8) -> f32 {
    match code {
        1 => 1.0,
        2 => 4.0 / 3.0,
        3 => 16.0 / 9.0,
        4 => 2.21,
        _ => -1.0,
    }
}

/// Parses a sequence-header chunk (bytes start at the 00 00 01 B3 prefix).
pub fn parse_sequence_header(data: &[u8]) -> Option<SequenceHeader> {
    if data.len() < 8 {
        return None;
    }
    let width = (data[4] as u32) << 4 | (data[5] as u32) >> 4;
    let height = (data[5] as u32 & 0x0F) << 8 | data[6] as u32;
    let aspect_ratio = aspect_ratio_for_code(data[7] >> 4);
    let frame_rate = frame_rate_for_code(data[7] & 0x0F);

    // a trailing sequence extension marks MPEG-2 and carries the
    // progressive_sequence flag
    let mut progressive_sequence = false;
    let mut i = 3;
    while i + 5 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 && data[i + 3] == EXTENSION_CODE {
            if data[i + 4] >> 4 == 1 {
                progressive_sequence = (data[i + 5] >> 3) & 1 != 0;
                break;
            }
        }
        i += 1;
    }

    Some(SequenceHeader {
        width,
        height,
        aspect_ratio,
        frame_rate,
        progressive_sequence,
    })
}

/// Parses a picture chunk (bytes start at the 00 00 01 00 prefix). The
/// picture coding extension, when present, follows inside the same chunk.
pub fn parse_picture_header(data: &[u8]) -> Option<PictureHeader> {
    if data.len() < 6 {
        return None;
    }
    let temporal_reference = (data[4] as u16) << 2 | (data[5] as u16) >> 6;
    let frame_type = match (data[5] >> 3) & 0x07 {
        1 => FrameType::I,
        2 => FrameType::P,
        3 => FrameType::B,
        _ => return None,
    };

    let mut hdr = PictureHeader {
        temporal_reference,
        frame_type,
        picture_structure: PICTURE_STRUCTURE_FRAME,
        top_field_first: false,
        repeat_first_field: false,
        progressive: false,
    };

    let mut i = 3;
    while i + 8 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 && data[i + 3] == EXTENSION_CODE {
            if data[i + 4] >> 4 == 8 {
                // picture coding extension
                hdr.picture_structure = data[i + 6] & 0x03;
                hdr.top_field_first = data[i + 7] >> 7 != 0;
                hdr.repeat_first_field = (data[i + 7] >> 1) & 1 != 0;
                hdr.progressive = data[i + 8] >> 7 != 0;
                break;
            }
        }
        i += 1;
    }

    Some(hdr)
}

// ============================================================================
// Chunk splitter
// ============================================================================

#[derive(Debug, Clone)]
struct MpegChunk {
    code: u8,
    data: Vec<u8>,
}

fn is_boundary(code: u8) -> bool {
    matches!(code, PICTURE_CODE | SEQUENCE_CODE | GOP_CODE | SEQUENCE_END_CODE)
}

/// Splits a byte stream into header-level chunks. A chunk spans one boundary
/// start code (sequence, GOP, picture, sequence-end) up to the next;
/// extension start codes stay inside their owning chunk.
#[derive(Default)]
struct ChunkSplitter {
    buf: Vec<u8>,
}

impl ChunkSplitter {
    fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn free_space(&self) -> usize {
        BUFFER_CAP.saturating_sub(self.buf.len())
    }

    fn find_boundary(&self, from: usize) -> Option<usize> {
        let mut pos = from;
        while let Some(sc) = find_start_code(&self.buf, pos) {
            if sc + 3 < self.buf.len() && is_boundary(self.buf[sc + 3]) {
                return Some(sc);
            }
            pos = sc + 3;
        }
        None
    }

    fn next_chunk(&mut self) -> Option<MpegChunk> {
        let start = self.find_boundary(0)?;
        let end = self.find_boundary(start + 4)?;
        let code = self.buf[start + 3];
        let data = self.buf[start..end].to_vec();
        self.buf.drain(..end);
        Some(MpegChunk { code, data })
    }

    /// Flushes the trailing partial chunk at end of stream.
    fn force_final(&mut self) -> Option<MpegChunk> {
        let start = self.find_boundary(0)?;
        let code = self.buf[start + 3];
        let data = self.buf.split_off(start);
        self.buf.clear();
        if code == SEQUENCE_END_CODE {
            return None;
        }
        Some(MpegChunk { code, data })
    }
}

// ============================================================================
// Frames
// ============================================================================

/// One stamped access unit. `first_ref`/`second_ref` are absolute timestamps
/// of the referenced I/P frames, -1 when unused.
#[derive(Debug, Clone)]
pub struct MpegFrame {
    pub data: Vec<u8>,
    pub frame_type: FrameType,
    pub timestamp: i64,
    pub duration: i64,
    pub first_ref: i64,
    pub second_ref: i64,
    pub repeat_first_field: bool,
    pub top_field_first: bool,
    pub progressive: bool,
    pub picture_structure: u8,
    /// Sequence header bytes attached ahead of the picture data, when a new
    /// sequence header preceded this frame.
    pub has_sequence_header: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    FrameReady,
    NeedData,
    Eos,
    Error,
}

// ============================================================================
// Parser
// ============================================================================

pub struct M2vParser {
    splitter: ChunkSplitter,
    chunks: VecDeque<MpegChunk>,
    frames: VecDeque<MpegFrame>,
    seq_hdr: SequenceHeader,
    raw_seq_hdr: Option<Vec<u8>>,
    mpeg_version: u8,
    need_init: bool,
    eos: bool,
    probe_mode: bool,
    not_reached_first_gop: bool,
    current_stamping_time: i64,
    first_ref: i64,
    second_ref: i64,
    next_skip: i64,
    next_skip_duration: i64,
}

impl Default for M2vParser {
    fn default() -> Self {
        Self::new()
    }
}

impl M2vParser {
    pub fn new() -> Self {
        Self {
            splitter: ChunkSplitter::default(),
            chunks: VecDeque::new(),
            frames: VecDeque::new(),
            seq_hdr: SequenceHeader::default(),
            raw_seq_hdr: None,
            mpeg_version: 1,
            need_init: true,
            eos: false,
            probe_mode: false,
            not_reached_first_gop: true,
            current_stamping_time: 0,
            first_ref: -1,
            second_ref: -1,
            next_skip: -1,
            next_skip_duration: -1,
        }
    }

    /// Probing only needs headers and stamping; frame payloads are dropped.
    pub fn set_probe_mode(&mut self) {
        self.probe_mode = true;
    }

    pub fn free_buffer_space(&self) -> usize {
        self.splitter.free_space()
    }

    pub fn mpeg_version(&self) -> u8 {
        self.mpeg_version
    }

    pub fn sequence_header(&self) -> SequenceHeader {
        self.seq_hdr
    }

    /// The first sequence header exactly as it appeared in the stream.
    pub fn raw_sequence_header(&self) -> Option<&[u8]> {
        self.raw_seq_hdr.as_deref()
    }

    /// Feeds bytes. Returns false when the parser is at EOS or the internal
    /// buffer would overflow.
    pub fn write_data(&mut self, data: &[u8]) -> bool {
        if self.eos || data.len() > self.splitter.free_space() {
            return false;
        }
        self.splitter.feed(data);
        while let Some(chunk) = self.splitter.next_chunk() {
            self.chunks.push_back(chunk);
        }
        if self.need_init && self.init_parser() {
            self.need_init = false;
        }
        self.fill_queues();
        true
    }

    /// Forces the trailing frame out; further writes are rejected.
    pub fn set_eos(&mut self) {
        if let Some(chunk) = self.splitter.force_final() {
            self.chunks.push_back(chunk);
        }
        if self.need_init && self.init_parser() {
            self.need_init = false;
        }
        self.eos = true;
        self.fill_queues();
    }

    pub fn state(&mut self) -> ParserState {
        self.fill_queues();
        if !self.frames.is_empty() {
            ParserState::FrameReady
        } else if self.eos {
            ParserState::Eos
        } else {
            ParserState::NeedData
        }
    }

    pub fn read_frame(&mut self) -> Option<MpegFrame> {
        if self.state() != ParserState::FrameReady {
            return None;
        }
        self.frames.pop_front()
    }

    fn init_parser(&mut self) -> bool {
        for chunk in &self.chunks {
            if chunk.code == SEQUENCE_CODE {
                if let Some(hdr) = parse_sequence_header(&chunk.data) {
                    self.seq_hdr = hdr;
                    self.raw_seq_hdr = Some(chunk.data.clone());
                    // a sequence extension inside the chunk marks MPEG-2
                    let d = &chunk.data;
                    for i in 3..d.len().saturating_sub(4) {
                        if d[i] == 0
                            && d[i + 1] == 0
                            && d[i + 2] == 1
                            && d[i + 3] == EXTENSION_CODE
                            && d[i + 4] & 0xF0 == 0x10
                        {
                            self.mpeg_version = 2;
                            break;
                        }
                    }
                    return true;
                }
            }
        }
        false
    }

    /// Frame duration in half-frame ticks.
    fn frame_duration(&self, pic: &PictureHeader) -> i64 {
        if self.seq_hdr.progressive_sequence {
            if !pic.top_field_first && pic.repeat_first_field {
                return 4;
            } else if pic.top_field_first && pic.repeat_first_field {
                return 6;
            }
            return 2;
        }
        if pic.picture_structure != PICTURE_STRUCTURE_FRAME {
            return 1;
        }
        if pic.progressive && pic.repeat_first_field {
            3
        } else {
            2
        }
    }

    /// Half-frame ticks occupied by the run of B frames queued after the
    /// front chunk; -1 when the run is still open-ended.
    fn count_b_frames(&self) -> i64 {
        if self.eos {
            return 0;
        }
        if self.not_reached_first_gop {
            return 0;
        }
        let mut count = 0i64;
        for chunk in self.chunks.iter().skip(1) {
            if chunk.code != PICTURE_CODE {
                continue;
            }
            match parse_picture_header(&chunk.data) {
                Some(h) if h.frame_type == FrameType::B => count += self.frame_duration(&h),
                _ => return count,
            }
        }
        -1
    }

    /// A sequence header captured mid-round must survive an early return so
    /// the next I frame still gets it attached.
    fn restore_seq_hdr(&mut self, seq_hdr_data: Option<Vec<u8>>) {
        if let Some(data) = seq_hdr_data {
            self.chunks.push_front(MpegChunk {
                code: SEQUENCE_CODE,
                data,
            });
        }
    }

    fn shove_ref(&mut self, timestamp: i64) {
        if self.first_ref == -1 {
            self.first_ref = timestamp;
        } else if self.second_ref == -1 {
            self.second_ref = timestamp;
        } else {
            self.first_ref = self.second_ref;
            self.second_ref = timestamp;
        }
    }

    fn queue_frame(
        &mut self,
        seq_hdr: Option<Vec<u8>>,
        chunk: MpegChunk,
        timestamp: i64,
        pic: &PictureHeader,
    ) {
        let tick = self.seq_hdr.tick_duration();
        let duration = self.frame_duration(pic);

        let data = if self.probe_mode {
            Vec::new()
        } else if let Some(ref hdr) = seq_hdr {
            let mut merged = Vec::with_capacity(hdr.len() + chunk.data.len());
            merged.extend_from_slice(hdr);
            merged.extend_from_slice(&chunk.data);
            merged
        } else {
            chunk.data
        };

        let mut frame = MpegFrame {
            data,
            frame_type: pic.frame_type,
            timestamp: tick.scale_trunc(timestamp),
            duration: tick.scale_trunc(duration),
            first_ref: -1,
            second_ref: -1,
            repeat_first_field: pic.repeat_first_field,
            top_field_first: pic.top_field_first,
            progressive: pic.progressive,
            picture_structure: pic.picture_structure,
            has_sequence_header: seq_hdr.is_some(),
        };

        match pic.frame_type {
            FrameType::P => {
                frame.first_ref = tick.scale_trunc(self.first_ref);
            }
            FrameType::B => {
                frame.first_ref = tick.scale_trunc(self.first_ref);
                frame.second_ref = tick.scale_trunc(self.second_ref);
            }
            FrameType::I => {}
        }

        self.frames.push_back(frame);
    }

    fn fill_queues(&mut self) {
        if self.need_init {
            return;
        }
        loop {
            if self.chunks.is_empty() {
                return;
            }

            let mut my_time = self.current_stamping_time;
            let mut seq_hdr_data: Option<Vec<u8>> = None;

            // skip to the next picture, capturing a preceding sequence header
            loop {
                let code = match self.chunks.front() {
                    Some(c) => c.code,
                    None => {
                        // keep an unattached sequence header for the next round
                        if let Some(data) = seq_hdr_data.take() {
                            self.chunks.push_back(MpegChunk {
                                code: SEQUENCE_CODE,
                                data,
                            });
                        }
                        return;
                    }
                };
                if code == PICTURE_CODE {
                    break;
                }
                if code == SEQUENCE_CODE && self.chunks.len() == 1 && !self.eos {
                    return;
                }
                let chunk = self.chunks.pop_front().unwrap();
                if chunk.code == SEQUENCE_CODE {
                    if let Some(hdr) = parse_sequence_header(&chunk.data) {
                        self.seq_hdr = hdr;
                    }
                    seq_hdr_data = Some(chunk.data);
                }
            }

            let chunk = self.chunks.front().unwrap();
            let pic = match parse_picture_header(&chunk.data) {
                Some(p) => p,
                None => {
                    self.chunks.pop_front();
                    continue;
                }
            };

            if my_time == self.next_skip {
                my_time += self.next_skip_duration;
                self.current_stamping_time = my_time;
            }

            match pic.frame_type {
                FrameType::I => {
                    let bcount = self.count_b_frames();
                    if bcount > 0 {
                        // ..BBIBB..: the I is presented after its leading Bs
                        my_time += bcount;
                        self.next_skip = my_time;
                        self.next_skip_duration = self.frame_duration(&pic);
                    } else {
                        if bcount == -1 && !self.eos {
                            self.restore_seq_hdr(seq_hdr_data);
                            return;
                        }
                        self.current_stamping_time += self.frame_duration(&pic);
                    }
                    self.shove_ref(my_time);
                    let chunk = self.chunks.pop_front().unwrap();
                    self.queue_frame(seq_hdr_data.take(), chunk, my_time, &pic);
                    self.not_reached_first_gop = false;
                }
                FrameType::P => {
                    let bcount = self.count_b_frames();
                    if self.first_ref == -1 {
                        // a P with no reference yet is silently dropped
                        self.chunks.pop_front();
                        continue;
                    }
                    if bcount > 0 {
                        my_time += bcount;
                        self.next_skip = my_time;
                        self.next_skip_duration = self.frame_duration(&pic);
                    } else {
                        if bcount == -1 && !self.eos {
                            self.restore_seq_hdr(seq_hdr_data);
                            return;
                        }
                        self.current_stamping_time += self.frame_duration(&pic);
                    }
                    self.shove_ref(my_time);
                    let chunk = self.chunks.pop_front().unwrap();
                    self.queue_frame(seq_hdr_data.take(), chunk, my_time, &pic);
                }
                FrameType::B => {
                    if self.first_ref == -1 || self.second_ref == -1 {
                        self.chunks.pop_front();
                        continue;
                    }
                    let chunk = self.chunks.pop_front().unwrap();
                    self.queue_frame(seq_hdr_data.take(), chunk, my_time, &pic);
                    self.current_stamping_time += self.frame_duration(&pic);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_header_bytes(width: u32, height: u32, fps_code: u8, mpeg2_progressive: Option<bool>) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, SEQUENCE_CODE];
        v.push((width >> 4) as u8);
        v.push(((width & 0x0F) << 4) as u8 | (height >> 8) as u8);
        v.push(height as u8);
        v.push((2 << 4) | fps_code); // 4:3
        v.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        if let Some(progressive) = mpeg2_progressive {
            v.extend_from_slice(&[0x00, 0x00, 0x01, EXTENSION_CODE]);
            v.push(0x14); // sequence extension id + profile bits
            v.push(if progressive { 0x88 } else { 0x80 });
            v.extend_from_slice(&[0x00, 0x00]);
        }
        v
    }

    fn picture_bytes(frame_type: FrameType) -> Vec<u8> {
        let code = match frame_type {
            FrameType::I => 1u8,
            FrameType::P => 2,
            FrameType::B => 3,
        };
        let mut v = vec![0x00, 0x00, 0x01, PICTURE_CODE];
        v.push(0x00);
        v.push(code << 3);
        v.extend_from_slice(&[0x00, 0x00]);
        // slice payload filler
        v.extend_from_slice(&[0x00, 0x00, 0x01, 0x01, 0xAA, 0xBB]);
        v
    }

    fn collect(parser: &mut M2vParser) -> Vec<MpegFrame> {
        let mut out = Vec::new();
        while let Some(f) = parser.read_frame() {
            out.push(f);
        }
        out
    }

    #[test]
    fn sequence_header_fields() {
        let bytes = seq_header_bytes(720, 576, 3, Some(true));
        let hdr = parse_sequence_header(&bytes).unwrap();
        assert_eq!(hdr.width, 720);
        assert_eq!(hdr.height, 576);
        assert_eq!(hdr.frame_rate, Fraction::new(25, 1));
        assert!(hdr.progressive_sequence);
        assert!((hdr.aspect_ratio - 4.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn round_trip_law_attached_private_data() {
        let bytes = seq_header_bytes(1920, 1080, 4, Some(false));
        let mut parser = M2vParser::new();
        let mut stream = bytes.clone();
        stream.extend_from_slice(&picture_bytes(FrameType::I));
        parser.write_data(&stream);
        parser.set_eos();
        let frames = collect(&mut parser);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].has_sequence_header);
        // the attached private data parses back to the original header
        let reparsed = parse_sequence_header(&frames[0].data).unwrap();
        assert_eq!(reparsed, parse_sequence_header(&bytes).unwrap());
        assert_eq!(parser.raw_sequence_header().unwrap(), &bytes[..]);
        assert_eq!(parser.mpeg_version(), 2);
    }

    #[test]
    fn decode_order_stamping_with_b_frames() {
        // display order I B B P with decode order I P B B
        let mut parser = M2vParser::new();
        let mut stream = seq_header_bytes(352, 288, 3, None);
        for t in [FrameType::I, FrameType::P, FrameType::B, FrameType::B, FrameType::P] {
            stream.extend_from_slice(&picture_bytes(t));
        }
        parser.write_data(&stream);
        parser.set_eos();
        let frames = collect(&mut parser);

        let tick = 20_000_000i64; // 1e9 / (25 * 2)
        let types: Vec<FrameType> = frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(types, [FrameType::I, FrameType::P, FrameType::B, FrameType::B, FrameType::P]);
        let stamps: Vec<i64> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, [0, 6 * tick, 2 * tick, 4 * tick, 8 * tick]);
        for f in &frames {
            assert_eq!(f.duration, 2 * tick);
        }
        // references: P0 -> I, B -> (I, P0), P1 -> P0
        assert_eq!(frames[1].first_ref, 0);
        assert_eq!(frames[2].first_ref, 0);
        assert_eq!(frames[2].second_ref, 6 * tick);
        assert_eq!(frames[3].second_ref, 6 * tick);
        assert_eq!(frames[4].first_ref, 6 * tick);
    }

    #[test]
    fn leading_orphan_frames_are_dropped() {
        let mut parser = M2vParser::new();
        let mut stream = seq_header_bytes(352, 288, 3, None);
        for t in [FrameType::B, FrameType::P, FrameType::I, FrameType::P] {
            stream.extend_from_slice(&picture_bytes(t));
        }
        parser.write_data(&stream);
        parser.set_eos();
        let frames = collect(&mut parser);
        let types: Vec<FrameType> = frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(types, [FrameType::I, FrameType::P]);
    }

    #[test]
    fn needs_lookahead_before_stamping_references() {
        let mut parser = M2vParser::new();
        let mut stream = seq_header_bytes(352, 288, 3, None);
        stream.extend_from_slice(&picture_bytes(FrameType::I));
        parser.write_data(&stream);
        // the picture chunk is still open: its extent is unknown until the
        // next boundary start code arrives
        assert_eq!(parser.state(), ParserState::NeedData);
        parser.write_data(&picture_bytes(FrameType::P));
        assert_eq!(parser.state(), ParserState::FrameReady);
    }

    #[test]
    fn eos_state() {
        let mut parser = M2vParser::new();
        let mut stream = seq_header_bytes(352, 288, 3, None);
        stream.extend_from_slice(&picture_bytes(FrameType::I));
        stream.extend_from_slice(&picture_bytes(FrameType::P));
        parser.write_data(&stream);
        parser.set_eos();
        while parser.read_frame().is_some() {}
        assert_eq!(parser.state(), ParserState::Eos);
        assert!(!parser.write_data(&[0u8; 4]));
    }

    #[test]
    fn second_sequence_header_reattaches() {
        let mut parser = M2vParser::new();
        let mut stream = seq_header_bytes(352, 288, 3, None);
        stream.extend_from_slice(&picture_bytes(FrameType::I));
        stream.extend_from_slice(&picture_bytes(FrameType::P));
        // aspect change mid-stream
        let mut second = seq_header_bytes(352, 288, 3, None);
        second[7] = (3 << 4) | 3; // 16:9 now
        stream.extend_from_slice(&second);
        stream.extend_from_slice(&picture_bytes(FrameType::I));
        stream.extend_from_slice(&picture_bytes(FrameType::P));
        parser.write_data(&stream);
        parser.set_eos();
        let frames = collect(&mut parser);
        assert_eq!(frames.len(), 4);
        assert!(frames[0].has_sequence_header);
        assert!(!frames[1].has_sequence_header);
        assert!(frames[2].has_sequence_header);
        assert!(!frames[3].has_sequence_header);
    }
}
