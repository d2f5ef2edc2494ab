// AVC (H.264) ES PARSER
//
// Slices an elementary stream into NAL units (Annex B start codes or a
// 1/2/4-byte length prefix), collects SPS/PPS parameter sets, decodes just
// enough of each slice header to detect access-unit boundaries, and emits
// length-prefixed access units plus a Matroska-compatible avcC blob.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bits::BitReader;
use crate::error::{ParseError, Result};

pub const NALU_TYPE_NON_IDR_SLICE: u8 = 0x01;
pub const NALU_TYPE_DP_A_SLICE: u8 = 0x02;
pub const NALU_TYPE_DP_B_SLICE: u8 = 0x03;
pub const NALU_TYPE_DP_C_SLICE: u8 = 0x04;
pub const NALU_TYPE_IDR_SLICE: u8 = 0x05;
pub const NALU_TYPE_SEI: u8 = 0x06;
pub const NALU_TYPE_SEQ_PARAM: u8 = 0x07;
pub const NALU_TYPE_PIC_PARAM: u8 = 0x08;
pub const NALU_TYPE_ACCESS_UNIT: u8 = 0x09;
pub const NALU_TYPE_END_OF_SEQ: u8 = 0x0A;
pub const NALU_TYPE_END_OF_STREAM: u8 = 0x0B;
pub const NALU_TYPE_FILLER_DATA: u8 = 0x0C;

pub const SLICE_TYPE_P: u8 = 0;
pub const SLICE_TYPE_B: u8 = 1;
pub const SLICE_TYPE_I: u8 = 2;

const SEI_RECOVERY_POINT: u32 = 6;

// 17 predefined pixel aspect ratios, indexed by aspect_ratio_idc
const PREDEFINED_PARS: [(u32, u32); 17] = [
    (0, 0),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

// ============================================================================
// RBSP escaping
// ============================================================================

/// Strips emulation-prevention bytes (00 00 03 -> 00 00).
pub fn nalu_to_rbsp(nalu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalu.len());
    let mut zeros = 0;
    for (i, &b) in nalu.iter().enumerate() {
        if zeros >= 2 && b == 0x03 && i + 1 < nalu.len() && nalu[i + 1] <= 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

/// Re-inserts emulation-prevention bytes.
pub fn rbsp_to_nalu(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + 8);
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

// ============================================================================
// Parameter sets
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpsInfo {
    pub id: u32,
    pub profile_idc: u32,
    pub profile_compat: u32,
    pub level_idc: u32,
    pub chroma_format_idc: u32,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub delta_pic_order_always_zero: bool,
    pub frame_mbs_only: bool,
    pub ar_found: bool,
    pub par_num: u32,
    pub par_den: u32,
    pub timing_info_present: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate: bool,
    pub crop_left: u32,
    pub crop_top: u32,
    pub crop_right: u32,
    pub crop_bottom: u32,
    pub width: u32,
    pub height: u32,
}

impl SpsInfo {
    pub fn default_duration(&self) -> Option<i64> {
        if self.timing_info_present && self.num_units_in_tick > 0 && self.time_scale > 0 {
            // a frame is two ticks
            Some(1_000_000_000i64 * 2 * self.num_units_in_tick as i64 / self.time_scale as i64)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PpsInfo {
    pub id: u32,
    pub sps_id: u32,
    pub pic_order_present: bool,
}

fn skip_scaling_list(br: &mut BitReader<'_>, size: u32) -> Result<()> {
    let mut last_scale = 8i64;
    let mut next_scale = 8i64;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = br.get_signed_golomb()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Parses an SPS RBSP (header byte included). When `keep_ar_info` is false
/// and the VUI carries aspect-ratio information, the returned bytes are the
/// RBSP rewritten without it; otherwise `None`.
pub fn parse_sps(rbsp: &[u8], keep_ar_info: bool) -> Result<(SpsInfo, Option<Vec<u8>>)> {
    let mut sps = SpsInfo::default();
    let mut br = BitReader::new(rbsp);
    br.skip_bits(8)?; // NAL header byte

    sps.profile_idc = br.get_bits(8)? as u32;
    sps.profile_compat = br.get_bits(8)? as u32;
    sps.level_idc = br.get_bits(8)? as u32;
    sps.id = br.get_unsigned_golomb()? as u32;
    sps.chroma_format_idc = 1;

    if matches!(
        sps.profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        sps.chroma_format_idc = br.get_unsigned_golomb()? as u32;
        if sps.chroma_format_idc == 3 {
            br.skip_bits(1)?; // separate_colour_plane_flag
        }
        br.get_unsigned_golomb()?; // bit_depth_luma_minus8
        br.get_unsigned_golomb()?; // bit_depth_chroma_minus8
        br.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag
        if br.get_bit()? {
            let lists = if sps.chroma_format_idc == 3 { 12 } else { 8 };
            for idx in 0..lists {
                if br.get_bit()? {
                    skip_scaling_list(&mut br, if idx < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    sps.log2_max_frame_num = br.get_unsigned_golomb()? as u32 + 4;
    sps.pic_order_cnt_type = br.get_unsigned_golomb()? as u32;
    match sps.pic_order_cnt_type {
        0 => sps.log2_max_pic_order_cnt_lsb = br.get_unsigned_golomb()? as u32 + 4,
        1 => {
            sps.delta_pic_order_always_zero = br.get_bit()?;
            br.get_signed_golomb()?; // offset_for_non_ref_pic
            br.get_signed_golomb()?; // offset_for_top_to_bottom_field
            let cycle = br.get_unsigned_golomb()?;
            for _ in 0..cycle {
                br.get_signed_golomb()?;
            }
        }
        2 => {}
        _ => {
            return Err(ParseError::structure(
                br.bit_position() as u64,
                "invalid pic_order_cnt_type",
            ))
        }
    }

    br.get_unsigned_golomb()?; // max_num_ref_frames
    br.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag
    let mb_width = br.get_unsigned_golomb()? as u32 + 1;
    let map_height = br.get_unsigned_golomb()? as u32 + 1;
    sps.frame_mbs_only = br.get_bit()?;
    if !sps.frame_mbs_only {
        br.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }
    br.skip_bits(1)?; // direct_8x8_inference_flag

    sps.width = mb_width * 16;
    sps.height = (2 - sps.frame_mbs_only as u32) * map_height * 16;

    if br.get_bit()? {
        // frame cropping
        sps.crop_left = br.get_unsigned_golomb()? as u32;
        sps.crop_right = br.get_unsigned_golomb()? as u32;
        sps.crop_top = br.get_unsigned_golomb()? as u32;
        sps.crop_bottom = br.get_unsigned_golomb()? as u32;

        let (sub_w, sub_h) = match sps.chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        sps.width -= (sps.crop_left + sps.crop_right) * sub_w;
        sps.height -= (sps.crop_top + sps.crop_bottom) * sub_h * (2 - sps.frame_mbs_only as u32);
    }

    let mut ar_span: Option<(usize, usize)> = None;
    if br.get_bit()? {
        // VUI
        let ar_flag_pos = br.bit_position();
        if br.get_bit()? {
            // aspect_ratio_info_present
            let idc = br.get_bits(8)? as u32;
            if idc == 0xFF {
                sps.par_num = br.get_bits(16)? as u32;
                sps.par_den = br.get_bits(16)? as u32;
                sps.ar_found = true;
            } else if (idc as usize) < PREDEFINED_PARS.len() && idc > 0 {
                sps.par_num = PREDEFINED_PARS[idc as usize].0;
                sps.par_den = PREDEFINED_PARS[idc as usize].1;
                sps.ar_found = true;
            }
            ar_span = Some((ar_flag_pos, br.bit_position()));
        }
        if br.get_bit()? {
            br.skip_bits(1)?; // overscan_appropriate_flag
        }
        if br.get_bit()? {
            // video signal type
            br.skip_bits(3 + 1)?;
            if br.get_bit()? {
                br.skip_bits(24)?; // colour description
            }
        }
        if br.get_bit()? {
            // chroma loc info
            br.get_unsigned_golomb()?;
            br.get_unsigned_golomb()?;
        }
        if br.get_bit()? {
            // timing info
            sps.timing_info_present = true;
            sps.num_units_in_tick = br.get_bits(32)? as u32;
            sps.time_scale = br.get_bits(32)? as u32;
            sps.fixed_frame_rate = br.get_bit()?;
        }
        // nothing beyond the timing info is needed
    }

    let rewritten = match ar_span {
        Some((flag_pos, end_pos)) if !keep_ar_info => {
            Some(strip_bit_range(rbsp, flag_pos, end_pos))
        }
        _ => None,
    };

    Ok((sps, rewritten))
}

/// Copies `rbsp` with the bits `[flag_pos, end_pos)` replaced by a single
/// zero bit (a cleared present flag).
fn strip_bit_range(rbsp: &[u8], flag_pos: usize, end_pos: usize) -> Vec<u8> {
    let total_bits = rbsp.len() * 8;
    let mut out: Vec<u8> = Vec::with_capacity(rbsp.len());
    let mut out_bits = 0usize;
    let mut push_bit = |out: &mut Vec<u8>, bit: bool| {
        if out_bits % 8 == 0 {
            out.push(0);
        }
        if bit {
            let len = out.len();
            out[len - 1] |= 1 << (7 - (out_bits % 8));
        }
        out_bits += 1;
    };

    let bit_at = |pos: usize| (rbsp[pos >> 3] >> (7 - (pos & 7))) & 1 != 0;

    for pos in 0..flag_pos {
        push_bit(&mut out, bit_at(pos));
    }
    push_bit(&mut out, false); // cleared aspect_ratio_info_present flag
    for pos in end_pos..total_bits {
        push_bit(&mut out, bit_at(pos));
    }
    out
}

/// Parses a PPS RBSP (header byte included); only the SPS linkage and the
/// pic_order_present flag matter here.
pub fn parse_pps(rbsp: &[u8]) -> Result<PpsInfo> {
    let mut br = BitReader::new(rbsp);
    br.skip_bits(8)?;
    let mut pps = PpsInfo {
        id: br.get_unsigned_golomb()? as u32,
        sps_id: br.get_unsigned_golomb()? as u32,
        pic_order_present: false,
    };
    br.skip_bits(1)?; // entropy_coding_mode_flag
    pps.pic_order_present = br.get_bit()?;
    Ok(pps)
}

// ============================================================================
// Slice info
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceInfo {
    pub nalu_type: u8,
    pub nal_ref_idc: u8,
    pub slice_type: u8,
    pub pps_id: u32,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i64,
    pub delta_pic_order_cnt: [i64; 2],
    pub first_mb_in_slice: u32,
    pub sps_idx: usize,
    pub pps_idx: usize,
}

// ============================================================================
// Frames
// ============================================================================

/// One access unit in decode order. References are timestamp deltas relative
/// to `start`; None when unused.
#[derive(Debug, Clone)]
pub struct AvcFrame {
    pub data: Bytes,
    pub start: i64,
    pub end: i64,
    pub ref1: Option<i64>,
    pub ref2: Option<i64>,
    pub keyframe: bool,
    pub slice_info: SliceInfo,
}

struct PendingFrame {
    data: Vec<u8>,
    slice_info: SliceInfo,
    keyframe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputMode {
    AnnexB,
    LengthPrefixed,
}

// ============================================================================
// Parser
// ============================================================================

pub struct AvcEsParser {
    nalu_size_length: u32,
    input_mode: InputMode,
    keep_ar_info: bool,
    ignore_nalu_size_length_errors: bool,

    avcc_ready: bool,
    avcc_changed: bool,
    avcc_emitted_sets: Vec<Vec<u8>>,

    default_duration: i64,
    generate_timestamps: bool,
    provided_timestamps: VecDeque<i64>,
    max_timestamp: i64,
    frame_number: i64,
    num_skipped_frames: i64,

    first_keyframe_found: bool,
    recovery_point_valid: bool,

    sps_list: Vec<Vec<u8>>,
    sps_info_list: Vec<SpsInfo>,
    pps_list: Vec<Vec<u8>>,
    pps_info_list: Vec<PpsInfo>,
    extra_data: Vec<Vec<u8>>,

    unparsed_buffer: Vec<u8>,
    incomplete_frame: Option<PendingFrame>,
    unhandled_nalus: Vec<Vec<u8>>,
    frames_out: VecDeque<AvcFrame>,
    prev_reference_ts: Option<i64>,
    prepend_parameter_sets: bool,
}

impl Default for AvcEsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AvcEsParser {
    pub fn new() -> Self {
        Self {
            nalu_size_length: 4,
            input_mode: InputMode::AnnexB,
            keep_ar_info: true,
            ignore_nalu_size_length_errors: false,
            avcc_ready: false,
            avcc_changed: false,
            avcc_emitted_sets: Vec::new(),
            default_duration: 40_000_000,
            generate_timestamps: false,
            provided_timestamps: VecDeque::new(),
            max_timestamp: 0,
            frame_number: 0,
            num_skipped_frames: 0,
            first_keyframe_found: false,
            recovery_point_valid: false,
            sps_list: Vec::new(),
            sps_info_list: Vec::new(),
            pps_list: Vec::new(),
            pps_info_list: Vec::new(),
            extra_data: Vec::new(),
            unparsed_buffer: Vec::new(),
            incomplete_frame: None,
            unhandled_nalus: Vec::new(),
            frames_out: VecDeque::new(),
            prev_reference_ts: None,
            prepend_parameter_sets: false,
        }
    }

    /// Width of the size field written in front of every emitted NALU.
    pub fn set_nalu_size_length(&mut self, length: u32) {
        self.nalu_size_length = length;
    }

    pub fn nalu_size_length(&self) -> u32 {
        self.nalu_size_length
    }

    /// Switches input slicing from Annex B start codes to length-prefixed
    /// NALUs (the prefix width follows `nalu_size_length`).
    pub fn set_length_prefixed_input(&mut self, length_prefixed: bool) {
        self.input_mode = if length_prefixed {
            InputMode::LengthPrefixed
        } else {
            InputMode::AnnexB
        };
    }

    pub fn ignore_nalu_size_length_errors(&mut self) {
        self.ignore_nalu_size_length_errors = true;
    }

    pub fn set_keep_ar_info(&mut self, keep: bool) {
        self.keep_ar_info = keep;
    }

    pub fn set_prepend_parameter_sets(&mut self, prepend: bool) {
        self.prepend_parameter_sets = prepend;
    }

    pub fn set_default_duration(&mut self, duration: i64) {
        self.default_duration = duration;
    }

    pub fn enable_timestamp_generation(&mut self, default_duration: i64) {
        self.default_duration = default_duration;
        self.generate_timestamps = true;
    }

    /// Queues a container-provided timestamp for the next access units.
    pub fn add_timestamp(&mut self, timestamp: i64) {
        self.provided_timestamps.push_back(timestamp);
    }

    pub fn headers_parsed(&self) -> bool {
        self.avcc_ready
    }

    pub fn frame_available(&self) -> bool {
        !self.frames_out.is_empty()
    }

    pub fn get_frame(&mut self) -> Option<AvcFrame> {
        self.frames_out.pop_front()
    }

    pub fn num_skipped_frames(&self) -> i64 {
        self.num_skipped_frames
    }

    pub fn avcc_changed(&self) -> bool {
        self.avcc_changed
    }

    pub fn width(&self) -> u32 {
        self.sps_info_list.first().map(|s| s.width).unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.sps_info_list.first().map(|s| s.height).unwrap_or(0)
    }

    pub fn sps_info(&self) -> Option<&SpsInfo> {
        self.sps_info_list.first()
    }

    pub fn add_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.unparsed_buffer.extend_from_slice(data);
        match self.input_mode {
            InputMode::AnnexB => self.slice_annex_b(false),
            InputMode::LengthPrefixed => self.slice_length_prefixed(),
        }
    }

    /// Terminates the stream: the trailing NALU is parsed and the incomplete
    /// access unit is pushed out.
    pub fn flush(&mut self) -> Result<()> {
        match self.input_mode {
            InputMode::AnnexB => self.slice_annex_b(true)?,
            InputMode::LengthPrefixed => self.slice_length_prefixed()?,
        }
        self.flush_incomplete_frame()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // NALU slicing
    // ------------------------------------------------------------------

    fn slice_annex_b(&mut self, at_eos: bool) -> Result<()> {
        loop {
            let buf = &self.unparsed_buffer;
            let first = match crate::start_code::find_start_code(buf, 0) {
                Some(p) => p,
                None => {
                    if at_eos {
                        self.unparsed_buffer.clear();
                    }
                    return Ok(());
                }
            };
            let nalu_start = first + 3;
            match crate::start_code::find_start_code(buf, nalu_start) {
                Some(next) => {
                    let mut nalu: Vec<u8> = buf[nalu_start..next].to_vec();
                    while nalu.last() == Some(&0) {
                        nalu.pop();
                    }
                    self.unparsed_buffer.drain(..next);
                    if !nalu.is_empty() {
                        self.handle_nalu(nalu)?;
                    }
                }
                None => {
                    if !at_eos {
                        return Ok(());
                    }
                    let mut nalu: Vec<u8> = buf[nalu_start..].to_vec();
                    while nalu.last() == Some(&0) {
                        nalu.pop();
                    }
                    self.unparsed_buffer.clear();
                    if !nalu.is_empty() {
                        self.handle_nalu(nalu)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn slice_length_prefixed(&mut self) -> Result<()> {
        let field = self.nalu_size_length as usize;
        loop {
            if self.unparsed_buffer.len() < field {
                return Ok(());
            }
            let mut size = 0usize;
            for &b in &self.unparsed_buffer[..field] {
                size = size << 8 | b as usize;
            }
            if self.unparsed_buffer.len() < field + size {
                return Ok(());
            }
            let nalu = self.unparsed_buffer[field..field + size].to_vec();
            self.unparsed_buffer.drain(..field + size);
            if !nalu.is_empty() {
                self.handle_nalu(nalu)?;
            }
        }
    }

    // ------------------------------------------------------------------
    // NALU handling
    // ------------------------------------------------------------------

    fn handle_nalu(&mut self, nalu: Vec<u8>) -> Result<()> {
        let nalu_type = nalu[0] & 0x1F;
        match nalu_type {
            NALU_TYPE_SEQ_PARAM => self.handle_sps_nalu(nalu),
            NALU_TYPE_PIC_PARAM => self.handle_pps_nalu(nalu),
            NALU_TYPE_SEI => self.handle_sei_nalu(nalu),
            NALU_TYPE_ACCESS_UNIT => {
                self.flush_incomplete_frame()?;
                Ok(())
            }
            NALU_TYPE_END_OF_SEQ | NALU_TYPE_END_OF_STREAM | NALU_TYPE_FILLER_DATA => Ok(()),
            NALU_TYPE_NON_IDR_SLICE
            | NALU_TYPE_DP_A_SLICE
            | NALU_TYPE_DP_B_SLICE
            | NALU_TYPE_DP_C_SLICE
            | NALU_TYPE_IDR_SLICE => {
                if self.sps_list.is_empty() || self.pps_list.is_empty() {
                    // slices before any parameter sets wait in line
                    self.unhandled_nalus.push(nalu);
                    return Ok(());
                }
                self.handle_slice_nalu(nalu)
            }
            _ => Ok(()),
        }
    }

    fn handle_sps_nalu(&mut self, nalu: Vec<u8>) -> Result<()> {
        let rbsp = nalu_to_rbsp(&nalu);
        let (info, rewritten) = parse_sps(&rbsp, self.keep_ar_info)?;
        let final_nalu = match rewritten {
            Some(new_rbsp) => rbsp_to_nalu(&new_rbsp),
            None => nalu,
        };

        match self.sps_info_list.iter().position(|s| s.id == info.id) {
            Some(idx) => {
                if self.sps_list[idx] != final_nalu {
                    self.sps_list[idx] = final_nalu;
                    self.sps_info_list[idx] = info;
                    self.avcc_changed = true;
                }
            }
            None => {
                self.sps_list.push(final_nalu);
                self.sps_info_list.push(info);
                if self.avcc_ready {
                    self.avcc_changed = true;
                }
            }
        }
        self.flush_unhandled_nalus()
    }

    fn handle_pps_nalu(&mut self, nalu: Vec<u8>) -> Result<()> {
        let rbsp = nalu_to_rbsp(&nalu);
        let info = parse_pps(&rbsp)?;

        match self.pps_info_list.iter().position(|p| p.id == info.id) {
            Some(idx) => {
                if self.pps_list[idx] != nalu {
                    self.pps_list[idx] = nalu;
                    self.pps_info_list[idx] = info;
                    self.avcc_changed = true;
                }
            }
            None => {
                self.pps_list.push(nalu);
                self.pps_info_list.push(info);
                if self.avcc_ready {
                    self.avcc_changed = true;
                }
            }
        }
        self.flush_unhandled_nalus()
    }

    fn handle_sei_nalu(&mut self, nalu: Vec<u8>) -> Result<()> {
        let rbsp = nalu_to_rbsp(&nalu);
        // walk the SEI payload types; a recovery point makes the next
        // delimited access unit a keyframe
        let mut pos = 1usize;
        while pos + 1 < rbsp.len() {
            let mut payload_type = 0u32;
            while pos < rbsp.len() && rbsp[pos] == 0xFF {
                payload_type += 255;
                pos += 1;
            }
            if pos >= rbsp.len() {
                break;
            }
            payload_type += rbsp[pos] as u32;
            pos += 1;

            let mut payload_size = 0usize;
            while pos < rbsp.len() && rbsp[pos] == 0xFF {
                payload_size += 255;
                pos += 1;
            }
            if pos >= rbsp.len() {
                break;
            }
            payload_size += rbsp[pos] as usize;
            pos += 1;

            if payload_type == SEI_RECOVERY_POINT {
                self.recovery_point_valid = true;
            }
            pos += payload_size;
        }

        self.extra_data.push(nalu);
        Ok(())
    }

    fn handle_slice_nalu(&mut self, nalu: Vec<u8>) -> Result<()> {
        let si = self.parse_slice(&nalu)?;

        let starts_new_frame = match &self.incomplete_frame {
            Some(pending) => self.flush_decision(&si, &pending.slice_info),
            None => true,
        };

        if starts_new_frame {
            self.flush_incomplete_frame()?;

            let mut keyframe = si.nalu_type == NALU_TYPE_IDR_SLICE;
            if self.recovery_point_valid {
                keyframe = true;
                self.recovery_point_valid = false;
            }

            let mut data = Vec::with_capacity(nalu.len() + 64);
            if keyframe && self.prepend_parameter_sets {
                for sps in &self.sps_list {
                    self.write_nalu_with_size(&mut data, sps)?;
                }
                for pps in &self.pps_list {
                    self.write_nalu_with_size(&mut data, pps)?;
                }
            }
            self.write_nalu_with_size(&mut data, &nalu)?;

            self.incomplete_frame = Some(PendingFrame {
                data,
                slice_info: si,
                keyframe,
            });
        } else {
            let mut data = self
                .incomplete_frame
                .as_mut()
                .map(|p| std::mem::take(&mut p.data))
                .unwrap_or_default();
            self.write_nalu_with_size(&mut data, &nalu)?;
            if let Some(pending) = self.incomplete_frame.as_mut() {
                pending.data = data;
            }
        }
        Ok(())
    }

    fn flush_unhandled_nalus(&mut self) -> Result<()> {
        if self.sps_list.is_empty() || self.pps_list.is_empty() {
            return Ok(());
        }
        let queued = std::mem::take(&mut self.unhandled_nalus);
        for nalu in queued {
            self.handle_nalu(nalu)?;
        }
        Ok(())
    }

    fn parse_slice(&self, nalu: &[u8]) -> Result<SliceInfo> {
        let rbsp = nalu_to_rbsp(nalu);
        let mut br = BitReader::new(&rbsp);

        let mut si = SliceInfo {
            nal_ref_idc: (nalu[0] >> 5) & 0x03,
            nalu_type: nalu[0] & 0x1F,
            ..SliceInfo::default()
        };
        br.skip_bits(8)?;

        si.first_mb_in_slice = br.get_unsigned_golomb()? as u32;
        let mut slice_type = br.get_unsigned_golomb()? as u8;
        if slice_type > 9 {
            return Err(ParseError::structure(0, "invalid slice type"));
        }
        if slice_type > 4 {
            slice_type -= 5;
        }
        si.slice_type = slice_type;
        si.pps_id = br.get_unsigned_golomb()? as u32;

        let pps_idx = self
            .pps_info_list
            .iter()
            .position(|p| p.id == si.pps_id)
            .ok_or_else(|| ParseError::structure(0, "slice references unknown PPS"))?;
        let pps = self.pps_info_list[pps_idx];
        let sps_idx = self
            .sps_info_list
            .iter()
            .position(|s| s.id == pps.sps_id)
            .ok_or_else(|| ParseError::structure(0, "PPS references unknown SPS"))?;
        let sps = self.sps_info_list[sps_idx];
        si.pps_idx = pps_idx;
        si.sps_idx = sps_idx;

        si.frame_num = br.get_bits(sps.log2_max_frame_num)? as u32;
        if !sps.frame_mbs_only {
            si.field_pic_flag = br.get_bit()?;
            if si.field_pic_flag {
                si.bottom_field_flag = br.get_bit()?;
            }
        }
        if si.nalu_type == NALU_TYPE_IDR_SLICE {
            si.idr_pic_id = br.get_unsigned_golomb()? as u32;
        }
        if sps.pic_order_cnt_type == 0 {
            si.pic_order_cnt_lsb = br.get_bits(sps.log2_max_pic_order_cnt_lsb)? as u32;
            if pps.pic_order_present && !si.field_pic_flag {
                si.delta_pic_order_cnt_bottom = br.get_signed_golomb()?;
            }
        }
        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero {
            si.delta_pic_order_cnt[0] = br.get_signed_golomb()?;
            if pps.pic_order_present && !si.field_pic_flag {
                si.delta_pic_order_cnt[1] = br.get_signed_golomb()?;
            }
        }

        Ok(si)
    }

    /// True when `si` opens a new access unit relative to `ref_si`.
    fn flush_decision(&self, si: &SliceInfo, ref_si: &SliceInfo) -> bool {
        if si.nalu_type == NALU_TYPE_IDR_SLICE {
            if si.first_mb_in_slice != 0 {
                return false;
            }
            if ref_si.nalu_type != NALU_TYPE_IDR_SLICE {
                return true;
            }
            if si.idr_pic_id != ref_si.idr_pic_id {
                return true;
            }
        } else if ref_si.nalu_type == NALU_TYPE_IDR_SLICE {
            return true;
        }

        if si.frame_num != ref_si.frame_num
            || si.pps_id != ref_si.pps_id
            || si.field_pic_flag != ref_si.field_pic_flag
            || si.bottom_field_flag != ref_si.bottom_field_flag
        {
            return true;
        }

        let sps = &self.sps_info_list[si.sps_idx];
        if sps.pic_order_cnt_type == 0
            && (si.pic_order_cnt_lsb != ref_si.pic_order_cnt_lsb
                || si.delta_pic_order_cnt_bottom != ref_si.delta_pic_order_cnt_bottom)
        {
            return true;
        }
        if sps.pic_order_cnt_type == 1 && si.delta_pic_order_cnt != ref_si.delta_pic_order_cnt {
            return true;
        }

        false
    }

    fn next_timestamp(&mut self) -> i64 {
        let ts = if self.generate_timestamps {
            self.frame_number * self.default_duration
        } else {
            match self.provided_timestamps.pop_front() {
                Some(ts) => ts,
                None => self.max_timestamp + self.default_duration,
            }
        };
        self.frame_number += 1;
        if ts > self.max_timestamp {
            self.max_timestamp = ts;
        }
        ts
    }

    fn flush_incomplete_frame(&mut self) -> Result<()> {
        let pending = match self.incomplete_frame.take() {
            Some(p) => p,
            None => return Ok(()),
        };

        if !self.avcc_ready && !self.sps_list.is_empty() && !self.pps_list.is_empty() {
            self.avcc_ready = true;
        }

        if !pending.keyframe && !self.first_keyframe_found {
            // nothing can decode these; count and drop
            self.num_skipped_frames += 1;
            return Ok(());
        }
        if pending.keyframe {
            self.first_keyframe_found = true;
        }

        let start = self.next_timestamp();
        let end = start + self.default_duration;
        let ref1 = if pending.keyframe {
            None
        } else {
            self.prev_reference_ts.map(|r| r - start)
        };

        if pending.keyframe || pending.slice_info.nal_ref_idc != 0 {
            self.prev_reference_ts = Some(start);
        }

        self.frames_out.push_back(AvcFrame {
            data: Bytes::from(pending.data),
            start,
            end,
            ref1,
            ref2: None,
            keyframe: pending.keyframe,
            slice_info: pending.slice_info,
        });
        Ok(())
    }

    fn write_nalu_with_size(&self, out: &mut Vec<u8>, nalu: &[u8]) -> Result<()> {
        let field = self.nalu_size_length as usize;
        if field < 8 && nalu.len() >= 1usize << (8 * field) {
            if !self.ignore_nalu_size_length_errors {
                return Err(ParseError::out_of_range(
                    0,
                    format!(
                        "NALU of {} bytes does not fit a {}-byte size field",
                        nalu.len(),
                        field
                    ),
                ));
            }
            warn!(
                nalu_len = nalu.len(),
                size_length = field,
                "NALU exceeds the configured size field; writing truncated length"
            );
        }
        for i in (0..field).rev() {
            out.push((nalu.len() >> (8 * i)) as u8);
        }
        out.extend_from_slice(nalu);
        Ok(())
    }

    /// Builds the Matroska codec-private avcC blob from the collected
    /// parameter sets.
    pub fn get_avcc(&mut self) -> Result<Vec<u8>> {
        let sps = self
            .sps_list
            .first()
            .ok_or_else(|| ParseError::probe_failed(0, "no SPS collected"))?;
        if self.pps_list.is_empty() {
            return Err(ParseError::probe_failed(0, "no PPS collected"));
        }
        let rbsp = nalu_to_rbsp(sps);
        if rbsp.len() < 4 {
            return Err(ParseError::structure(0, "SPS too short"));
        }

        let mut avcc = Vec::with_capacity(64);
        avcc.push(0x01);
        avcc.push(rbsp[1]); // profile
        avcc.push(rbsp[2]); // constraint set flags
        avcc.push(rbsp[3]); // level
        avcc.push(0xFC | (self.nalu_size_length - 1) as u8);
        avcc.push(0xE0 | self.sps_list.len().min(31) as u8);
        for sps in &self.sps_list {
            avcc.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            avcc.extend_from_slice(sps);
        }
        avcc.push(self.pps_list.len() as u8);
        for pps in &self.pps_list {
            avcc.extend_from_slice(&(pps.len() as u16).to_be_bytes());
            avcc.extend_from_slice(pps);
        }
        for extra in &self.extra_data {
            avcc.extend_from_slice(&(extra.len() as u16).to_be_bytes());
            avcc.extend_from_slice(extra);
        }

        let mut emitted: Vec<Vec<u8>> = self.sps_list.clone();
        emitted.extend(self.pps_list.iter().cloned());
        self.avcc_changed = self.avcc_emitted_sets != emitted && !self.avcc_emitted_sets.is_empty();
        self.avcc_emitted_sets = emitted;

        Ok(avcc)
    }
}

/// Splits an avcC blob back into its parameter-set NALUs.
pub fn avcc_to_nalus(avcc: &[u8]) -> Result<Vec<Vec<u8>>> {
    if avcc.len() < 6 || avcc[0] != 1 {
        return Err(ParseError::structure(0, "not an avcC blob"));
    }
    let mut nalus = Vec::new();
    let num_sps = (avcc[5] & 0x1F) as usize;
    let mut pos = 6usize;
    for _ in 0..num_sps {
        if pos + 2 > avcc.len() {
            return Err(ParseError::eof(pos as u64));
        }
        let len = u16::from_be_bytes([avcc[pos], avcc[pos + 1]]) as usize;
        pos += 2;
        if pos + len > avcc.len() {
            return Err(ParseError::eof(pos as u64));
        }
        nalus.push(avcc[pos..pos + len].to_vec());
        pos += len;
    }
    if pos >= avcc.len() {
        return Ok(nalus);
    }
    let num_pps = avcc[pos] as usize;
    pos += 1;
    for _ in 0..num_pps {
        if pos + 2 > avcc.len() {
            break;
        }
        let len = u16::from_be_bytes([avcc[pos], avcc[pos + 1]]) as usize;
        pos += 2;
        if pos + len > avcc.len() {
            break;
        }
        nalus.push(avcc[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(nalus)
}
