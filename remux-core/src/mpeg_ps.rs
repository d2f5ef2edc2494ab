// MPEG PROGRAM STREAM DEMULTIPLEXER
//
// Walks packs, system headers, program-stream maps and PES packets;
// identifies and probes every distinct logical stream; delivers packetized
// payloads with per-packet PTS. Private stream 1 (0xBD) fans out into DVD
// audio substreams selected by the sub-id byte:
//
//   0x20..0x3f VobSub subtitles        0x88..0x9f DTS
//   0x80..0x87 (E)AC3                  0xa0..0xa7 PCM
//   0xb0..0xbf TrueHD                  0xc0..0xc7 (E)AC3
//
// 0xc0..0xdf is MPEG audio, 0xe0..0xef MPEG-1/2 video, 0xfd VC-1.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Seek};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio_headers::{
    find_ac3_header, find_dts_header, find_mpeg_audio_header, DtsHeader, TruehdFrameType,
    TruehdParser,
};
use crate::avc::{AvcEsParser, NALU_TYPE_ACCESS_UNIT, NALU_TYPE_DP_A_SLICE, NALU_TYPE_DP_B_SLICE,
    NALU_TYPE_DP_C_SLICE, NALU_TYPE_IDR_SLICE, NALU_TYPE_NON_IDR_SLICE, NALU_TYPE_PIC_PARAM,
    NALU_TYPE_SEQ_PARAM};
use crate::bits::BitReader;
use crate::error::{ErrorKind, ParseError, Result};
use crate::io::ByteSource;
use crate::m2v::{M2vParser, ParserState};
use crate::options::DemuxOptions;
use crate::start_code::{
    self, is_start_code, PACK_START_CODE, PROGRAM_END_CODE, PROGRAM_STREAM_MAP_START_CODE,
    SYSTEM_HEADER_START_CODE,
};
use crate::vc1::Vc1EsParser;

pub const PS_PROBE_SIZE: u64 = 10 * 1024 * 1024;

const BUFFER_SIZE_MPEG12: usize = 128_000;
const BUFFER_SIZE_AVC: usize = 256_000;
const BUFFER_SIZE_VC1: usize = 512_000;

// ============================================================================
// Ids and tracks
// ============================================================================

/// The identifier tuple selecting one logical stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MpegPsId {
    pub id: u8,
    pub sub_id: u8,
}

impl MpegPsId {
    pub fn new(id: u8) -> Self {
        Self { id, sub_id: 0 }
    }

    pub fn idx(&self) -> u16 {
        (self.id as u16) << 8 | self.sub_id as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PsCodec {
    Mpeg1Video,
    Mpeg2Video,
    Avc,
    Vc1,
    Mp2,
    Mp3,
    Ac3,
    Dts,
    Truehd,
    Pcm,
    VobSub,
    Mpeg4Part2,
    Aac,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PsTrackType {
    Video,
    Audio,
    Subtitle,
    Unknown,
}

impl PsTrackType {
    fn sort_rank(self) -> u32 {
        match self {
            PsTrackType::Video => 0x00000,
            PsTrackType::Audio => 0x10000,
            PsTrackType::Subtitle => 0x20000,
            PsTrackType::Unknown => 0x30000,
        }
    }
}

pub struct PsTrack {
    pub id: MpegPsId,
    pub track_type: PsTrackType,
    pub codec: PsCodec,
    /// Minimum PTS seen during probing; after the global offset pass this is
    /// the track's displacement from zero.
    pub timestamp_offset: i64,
    /// Whether delivered packets carry container timestamps. The original
    /// reader sets this only on the VC-1 typing path and leaves every other
    /// track generating its own timestamps; it is unclear whether that was
    /// intentional, but the behavior is preserved as-is.
    pub provide_timestamps: bool,

    // video parameters
    pub v_version: u8,
    pub v_width: u32,
    pub v_height: u32,
    pub v_dwidth: u32,
    pub v_dheight: u32,
    pub v_frame_rate: f64,
    pub v_aspect_ratio: f32,
    pub v_interlaced: bool,
    pub raw_seq_hdr: Option<Vec<u8>>,
    pub avcc: Option<Vec<u8>>,

    // audio parameters
    pub a_channels: u8,
    pub a_sample_rate: u32,
    pub a_bsid: u8,
    pub dts_header: Option<DtsHeader>,

    // payload coalescing
    buffer: Vec<u8>,
    buffer_size: usize,
    ts_offsets: Vec<(i64, usize)>,

    sort_key: u32,
}

impl PsTrack {
    fn new(id: MpegPsId, timestamp_offset: i64) -> Self {
        Self {
            id,
            track_type: PsTrackType::Unknown,
            codec: PsCodec::Unknown,
            timestamp_offset,
            provide_timestamps: false,
            v_version: 0,
            v_width: 0,
            v_height: 0,
            v_dwidth: 0,
            v_dheight: 0,
            v_frame_rate: 0.0,
            v_aspect_ratio: 0.0,
            v_interlaced: false,
            raw_seq_hdr: None,
            avcc: None,
            a_channels: 0,
            a_sample_rate: 0,
            a_bsid: 0,
            dts_header: None,
            buffer: Vec::new(),
            buffer_size: 0,
            ts_offsets: Vec::new(),
            sort_key: 0,
        }
    }

    fn use_buffer(&mut self, size: usize) {
        self.buffer_size = size;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsTrackInfo {
    pub stream_id: u8,
    pub sub_stream_id: u8,
    pub track_type: PsTrackType,
    pub codec: PsCodec,
    pub width: u32,
    pub height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub channels: u8,
    pub sample_rate: u32,
    pub bs_id: u8,
}

/// One demuxed payload for a track, in file order. `timestamp` is set only
/// for tracks that provide container timestamps; `ts_offsets` carries
/// per-sub-packet (timestamp, byte offset) pairs for post-hoc assignment.
#[derive(Debug, Clone)]
pub struct PsPacket {
    pub track: usize,
    pub data: Vec<u8>,
    pub timestamp: Option<i64>,
    pub ts_offsets: Vec<(i64, usize)>,
}

enum PacketOutcome {
    Payload {
        timestamp: i64,
        length: u32,
        full_length: u32,
    },
    Skip {
        full_length: u32,
    },
}

// ============================================================================
// Reader
// ============================================================================

pub struct MpegPsReader<R> {
    src: ByteSource<R>,
    version: i32,
    es_map: HashMap<u8, u8>,
    pub tracks: Vec<PsTrack>,
    id2idx: HashMap<u16, usize>,
    blacklisted: HashSet<u16>,
    global_timestamp_offset: i64,
    file_done: bool,
    pending: VecDeque<PsPacket>,
    nalu_size_lengths: HashMap<i64, u32>,
}

impl<R> std::fmt::Debug for MpegPsReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpegPsReader")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl<R: Read + Seek> MpegPsReader<R> {
    /// A program stream starts with a pack header at byte 0.
    pub fn probe(src: &mut ByteSource<R>) -> bool {
        let ok = (|| -> Result<bool> {
            src.seek(0)?;
            Ok(src.read_u32_be()? == PACK_START_CODE)
        })()
        .unwrap_or(false);
        let _ = src.seek(0);
        ok
    }

    pub fn open(mut src: ByteSource<R>, options: &DemuxOptions) -> Result<Self> {
        src.seek(0)?;
        let mut reader = Self {
            src,
            version: -1,
            es_map: HashMap::new(),
            tracks: Vec::new(),
            id2idx: HashMap::new(),
            blacklisted: HashSet::new(),
            global_timestamp_offset: 0,
            file_done: false,
            pending: VecDeque::new(),
            nalu_size_lengths: options.nalu_size_lengths.clone(),
        };
        reader.read_headers()?;
        Ok(reader)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track_infos(&self) -> Vec<PsTrackInfo> {
        self.tracks
            .iter()
            .map(|t| PsTrackInfo {
                stream_id: t.id.id,
                sub_stream_id: t.id.sub_id,
                track_type: t.track_type,
                codec: t.codec,
                width: t.v_width,
                height: t.v_height,
                display_width: t.v_dwidth,
                display_height: t.v_dheight,
                channels: t.a_channels,
                sample_rate: t.a_sample_rate,
                bs_id: t.a_bsid,
            })
            .collect()
    }

    pub fn global_timestamp_offset(&self) -> i64 {
        self.global_timestamp_offset
    }

    // ------------------------------------------------------------------
    // Header walk
    // ------------------------------------------------------------------

    fn read_headers(&mut self) -> Result<()> {
        let walk = (|| -> Result<()> {
            let mut header = self.src.read_u32_be()?;
            loop {
                match header {
                    PACK_START_CODE => {
                        debug!(position = self.src.position() - 4, "pack start");
                        self.skip_pack_header()?;
                        header = self.src.read_u32_be()?;
                    }
                    SYSTEM_HEADER_START_CODE => {
                        self.skip_system_header()?;
                        header = self.src.read_u32_be()?;
                    }
                    PROGRAM_END_CODE => {
                        if !self.resync_stream(&mut header)? {
                            break;
                        }
                    }
                    PROGRAM_STREAM_MAP_START_CODE => {
                        self.parse_program_stream_map();
                        if !self.resync_stream(&mut header)? {
                            break;
                        }
                    }
                    _ => {
                        if !is_start_code(header) {
                            debug!(header, position = self.src.position() - 4, "unknown header");
                            if !self.resync_stream(&mut header)? {
                                break;
                            }
                            continue;
                        }

                        let stream_id = (header & 0xFF) as u8;
                        self.src.save_pos();
                        let probe_result = self.found_new_stream(stream_id);
                        self.src.restore_pos()?;
                        // encrypted content is the one fatal probing outcome
                        if let Err(e) = probe_result {
                            if e.kind == ErrorKind::Encrypted {
                                return Err(e);
                            }
                        }
                        let pes_packet_length = self.src.read_u16_be()?;
                        self.src.skip(pes_packet_length as i64)?;
                        header = self.src.read_u32_be()?;
                    }
                }

                if self.src.position() >= PS_PROBE_SIZE || self.src.remaining() == 0 {
                    break;
                }
            }
            Ok(())
        })();

        match walk {
            Err(e) if e.kind == ErrorKind::Encrypted => return Err(e),
            _ => {}
        }

        self.sort_tracks();
        self.calculate_global_timestamp_offset();
        self.src.seek(0)?;
        Ok(())
    }

    fn skip_pack_header(&mut self) -> Result<()> {
        if self.version == -1 {
            let byte = self.src.read_u8()?;
            self.version = if byte & 0xC0 != 0 { 2 } else { 1 };
            self.src.skip(-1)?;
        }
        self.src.skip(8)?;
        if self.version == 2 {
            self.src.skip(1)?;
            let stuffing = self.src.read_u8()? & 0x07;
            self.src.skip(stuffing as i64)?;
        }
        Ok(())
    }

    fn skip_system_header(&mut self) -> Result<()> {
        self.src.skip(8)?;
        let mut byte = self.src.read_u8()?;
        while byte & 0x80 == 0x80 {
            self.src.skip(2)?; // P-STD info
            byte = self.src.read_u8()?;
        }
        self.src.skip(-1)?;
        Ok(())
    }

    fn resync_stream(&mut self, header: &mut u32) -> Result<bool> {
        debug!(position = self.src.position(), "synchronisation lost; scanning for start code");
        loop {
            if self.src.remaining() == 0 {
                debug!("resync failed: end of data");
                return Ok(false);
            }
            *header = (*header << 8) | self.src.read_u8()? as u32;
            if is_start_code(*header) {
                debug!(position = self.src.position() - 4, header = *header, "resync succeeded");
                return Ok(true);
            }
        }
    }

    /// Ingests the program-stream-map's elementary stream type table.
    fn parse_program_stream_map(&mut self) {
        let pos = self.src.position();
        let mut len = 0u16;

        let result = (|| -> Result<()> {
            len = self.src.read_u16_be()?;
            if len == 0 || len > 1018 {
                return Err(ParseError::structure(pos, "bad PSM length"));
            }
            self.src.skip(2)?;
            let prog_len = self.src.read_u16_be()?;
            self.src.skip(prog_len as i64)?;

            let mut es_map_len = self.src.read_u16_be()? as i64;
            es_map_len = es_map_len.min(len as i64 - prog_len as i64 - 8);

            while es_map_len >= 4 {
                let stream_type = self.src.read_u8()?;
                let es_id = self.src.read_u8()?;
                self.es_map.insert(es_id, stream_type);

                let plen = self.src.read_u16_be()? as i64;
                let plen = plen.min(es_map_len);
                self.src.skip(plen)?;
                es_map_len -= 4 + plen;
            }
            Ok(())
        })();
        let _ = result;

        let _ = self.src.seek(pos + len as u64);
    }

    // ------------------------------------------------------------------
    // Timestamps
    // ------------------------------------------------------------------

    /// Decodes the 5-byte PTS form given its first byte. Marker bits must
    /// all be present.
    fn read_timestamp(&mut self, c: u8) -> Result<Option<i64>> {
        let d = self.src.read_u16_be()?;
        let e = self.src.read_u16_be()?;

        if c & 1 != 1 || d & 1 != 1 || e & 1 != 1 {
            return Ok(None);
        }

        let ticks = (((c as i64 >> 1) & 7) << 30) | ((d as i64 >> 1) << 15) | (e as i64 >> 1);
        Ok(Some(ticks * 100_000 / 9))
    }

    fn read_timestamp_from_bits(bc: &mut BitReader<'_>) -> Result<Option<i64>> {
        bc.skip_bits(4)?;
        let mut ticks = bc.get_bits(3)? as i64;
        if !bc.get_bit()? {
            return Ok(None);
        }
        ticks = (ticks << 15) | bc.get_bits(15)? as i64;
        if !bc.get_bit()? {
            return Ok(None);
        }
        ticks = (ticks << 15) | bc.get_bits(15)? as i64;
        if !bc.get_bit()? {
            return Ok(None);
        }
        Ok(Some(ticks * 100_000 / 9))
    }

    // ------------------------------------------------------------------
    // PES parsing
    // ------------------------------------------------------------------

    /// Parses one PES packet header at the current position (just past the
    /// 4-byte start code). On `Payload` the source is positioned at the
    /// packet's payload bytes.
    fn parse_packet(&mut self, id: &mut MpegPsId) -> Result<PacketOutcome> {
        let mut length = self.src.read_u16_be()? as u32;
        let full_length = length;

        if id.id < 0xBC || (id.id >= 0xF0 && id.id != 0xFD) || id.id == 0xBF {
            // private 2 / reserved: skip wholesale
            self.src.skip(length as i64)?;
            return Ok(PacketOutcome::Skip { full_length });
        }

        if id.id == 0xBE {
            // padding stream; verify the declared length actually lands on
            // a start code, else resync
            let pos = self.src.position();
            self.src.skip(length as i64)?;
            let header = self.src.read_u32_be().unwrap_or(0);
            if is_start_code(header) {
                self.src.seek(pos + length as u64)?;
                return Ok(PacketOutcome::Skip { full_length });
            }
            debug!(position = pos - 6, "padding stream length incorrect; finding next header");
            self.src.seek(pos)?;
            let mut hdr = 0xFFFF_FFFFu32;
            if self.resync_stream(&mut hdr)? {
                let adjusted = (self.src.position() - pos - 4) as u32;
                debug!(from = length, to = adjusted, "padding stream length adjusted");
                self.src.seek(pos + adjusted as u64)?;
                return Ok(PacketOutcome::Skip {
                    full_length: adjusted,
                });
            }
            return Ok(PacketOutcome::Skip { full_length });
        }

        if length == 0 {
            return Ok(PacketOutcome::Skip { full_length });
        }

        id.sub_id = 0;
        let mut timestamp = -1i64;

        // stuffing bytes
        let mut c = 0u8;
        while length > 0 {
            c = self.src.read_u8()?;
            length -= 1;
            if c != 0xFF {
                break;
            }
        }

        // STD buffer size
        if c & 0xC0 == 0x40 {
            if length < 2 {
                return Ok(PacketOutcome::Skip { full_length });
            }
            length -= 2;
            self.src.skip(1)?;
            c = self.src.read_u8()?;
        }

        if c & 0xF0 == 0x20 {
            // MPEG-1 PTS only
            match self.read_timestamp(c)? {
                Some(ts) => timestamp = ts,
                None => return Ok(PacketOutcome::Skip { full_length }),
            }
            length -= 4;
        } else if c & 0xF0 == 0x30 {
            // MPEG-1 PTS + DTS
            match self.read_timestamp(c)? {
                Some(ts) => timestamp = ts,
                None => return Ok(PacketOutcome::Skip { full_length }),
            }
            self.src.skip(5)?;
            length -= 4 + 5;
        } else if c & 0xC0 == 0x80 {
            // MPEG-2 extended header
            if c & 0x30 != 0 {
                return Err(ParseError::encrypted(self.src.position()));
            }

            let flags = self.src.read_u8()?;
            let hdrlen = self.src.read_u8()? as u32;
            length -= 2;

            if hdrlen > length {
                return Ok(PacketOutcome::Skip { full_length });
            }
            length -= hdrlen;

            let header_data = self.src.read_vec(hdrlen as usize)?;
            let mut bc = BitReader::new(&header_data);

            let parse = (|| -> Result<()> {
                if flags & 0x80 == 0x80 {
                    if let Some(ts) = Self::read_timestamp_from_bits(&mut bc)? {
                        timestamp = ts;
                    }
                }
                if flags & 0x40 == 0x40 {
                    bc.skip_bits(5 * 8)?; // DTS
                }

                // PES extension on VC-1 carries the sub-stream id
                if id.id == 0xFD && flags & 0x01 == 0x01 {
                    let pes_ext_flags = bc.get_bits(8)? as u32;
                    if pes_ext_flags & 0x80 == 0x80 {
                        bc.skip_bits(128)?; // PES private data
                    }
                    if pes_ext_flags & 0x40 == 0x40 {
                        let pack_len = bc.get_bits(8)? as u32;
                        bc.skip_bits(8 * pack_len)?;
                    }
                    if pes_ext_flags & 0x20 == 0x20 {
                        bc.skip_bits(16)?; // program packet sequence counter
                    }
                    if pes_ext_flags & 0x10 == 0x10 {
                        bc.skip_bits(16)?; // P-STD buffer
                    }
                    if pes_ext_flags & 0x01 == 0x01 {
                        bc.skip_bits(1)?;
                        let pes_ext2_len = bc.get_bits(7)?;
                        if pes_ext2_len > 0 {
                            id.sub_id = bc.get_bits(8)? as u8;
                        }
                    }
                }
                Ok(())
            })();
            let _ = parse;

            if id.id == 0xBD {
                // DVD audio substream
                if length < 4 {
                    return Ok(PacketOutcome::Skip { full_length });
                }
                id.sub_id = self.src.read_u8()?;
                length -= 1;

                if id.sub_id & 0xE0 == 0x20 {
                    // subtitles; recognized but not emitted
                    return Ok(PacketOutcome::Skip { full_length });
                } else if (0x80..=0x8F).contains(&id.sub_id)
                    || (0x98..=0xCF).contains(&id.sub_id)
                {
                    // frame count and start position; TrueHD carries a
                    // 4-byte header, the rest 3
                    let audio_header_len = if (0xB0..=0xBF).contains(&id.sub_id) { 4 } else { 3 };
                    self.src.skip(audio_header_len)?;
                    length -= audio_header_len as u32;
                }
            }
        } else if c != 0x0F {
            return Ok(PacketOutcome::Skip { full_length });
        }

        if length == 0 {
            return Ok(PacketOutcome::Skip { full_length });
        }

        Ok(PacketOutcome::Payload {
            timestamp,
            length,
            full_length,
        })
    }

    fn find_next_packet(&mut self, id: &mut MpegPsId, max_file_pos: Option<u64>) -> bool {
        let result = (|| -> Result<bool> {
            let mut header = self.src.read_u32_be()?;
            loop {
                if let Some(max) = max_file_pos {
                    if self.src.position() > max {
                        return Ok(false);
                    }
                }

                match header {
                    PACK_START_CODE => {
                        self.skip_pack_header()?;
                        header = self.src.read_u32_be()?;
                    }
                    SYSTEM_HEADER_START_CODE => {
                        self.skip_system_header()?;
                        header = self.src.read_u32_be()?;
                    }
                    PROGRAM_END_CODE => {
                        if !self.resync_stream(&mut header)? {
                            return Ok(false);
                        }
                    }
                    PROGRAM_STREAM_MAP_START_CODE => {
                        self.parse_program_stream_map();
                        if !self.resync_stream(&mut header)? {
                            return Ok(false);
                        }
                    }
                    _ => {
                        if !is_start_code(header) {
                            if !self.resync_stream(&mut header)? {
                                return Ok(false);
                            }
                            continue;
                        }
                        id.id = (header & 0xFF) as u8;
                        return Ok(true);
                    }
                }
            }
        })();
        result.unwrap_or(false)
    }

    fn find_next_packet_for_id(&mut self, id: MpegPsId, max_file_pos: Option<u64>) -> bool {
        let mut new_id = MpegPsId::default();
        while self.find_next_packet(&mut new_id, max_file_pos) {
            if id.id == new_id.id {
                return true;
            }
            match self.src.read_u16_be() {
                Ok(len) => {
                    if self.src.skip(len as i64).is_err() {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Stream typing and probing
    // ------------------------------------------------------------------

    fn found_new_stream(&mut self, stream_id: u8) -> Result<()> {
        debug!(stream_id, "new stream id");
        if (stream_id < 0xC0 || stream_id > 0xEF) && stream_id != 0xBD && stream_id != 0xFD {
            return Ok(());
        }

        let mut id = MpegPsId::new(stream_id);
        let (timestamp, length) = match self.parse_packet(&mut id)? {
            PacketOutcome::Payload {
                timestamp, length, ..
            } => (timestamp, length),
            PacketOutcome::Skip { .. } => return Ok(()),
        };

        if id.id == 0xBD && id.sub_id == 0 {
            return Ok(());
        }
        if self.blacklisted.contains(&id.idx()) {
            return Ok(());
        }
        if let Some(&idx) = self.id2idx.get(&id.idx()) {
            let track = &mut self.tracks[idx];
            if timestamp != -1
                && (track.timestamp_offset == -1 || timestamp < track.timestamp_offset)
            {
                track.timestamp_offset = timestamp;
            }
            return Ok(());
        }

        let mut track = PsTrack::new(id, timestamp);

        // the PSM stream-type table overrides the id-based guess
        let es_type = self.es_map.get(&id.id).copied().unwrap_or(0);
        if es_type != 0 {
            match es_type {
                0x01 => {
                    track.track_type = PsTrackType::Video;
                    track.codec = PsCodec::Mpeg1Video;
                }
                0x02 => {
                    track.track_type = PsTrackType::Video;
                    track.codec = PsCodec::Mpeg2Video;
                }
                0x03 | 0x04 => {
                    track.track_type = PsTrackType::Audio;
                    track.codec = PsCodec::Mp2;
                }
                0x0F | 0x11 => {
                    track.track_type = PsTrackType::Audio;
                    track.codec = PsCodec::Aac;
                }
                0x10 => {
                    track.track_type = PsTrackType::Video;
                    track.codec = PsCodec::Mpeg4Part2;
                }
                0x1B => {
                    track.track_type = PsTrackType::Video;
                    track.codec = PsCodec::Avc;
                }
                0x81 => {
                    track.track_type = PsTrackType::Audio;
                    track.codec = PsCodec::Ac3;
                }
                _ => {}
            }
        } else if id.id == 0xBD {
            track.track_type = PsTrackType::Audio;
            match id.sub_id {
                0x20..=0x3F => {
                    track.track_type = PsTrackType::Subtitle;
                    track.codec = PsCodec::VobSub;
                }
                0x80..=0x87 | 0xC0..=0xC7 => track.codec = PsCodec::Ac3,
                0x88..=0x9F => track.codec = PsCodec::Dts,
                0xA0..=0xA7 => track.codec = PsCodec::Pcm,
                0xB0..=0xBF => track.codec = PsCodec::Truehd,
                _ => track.track_type = PsTrackType::Unknown,
            }
        } else if (0xC0..=0xDF).contains(&id.id) {
            track.track_type = PsTrackType::Audio;
            track.codec = PsCodec::Mp2;
        } else if (0xE0..=0xEF).contains(&id.id) {
            track.track_type = PsTrackType::Video;
            track.codec = if self.version == 1 {
                PsCodec::Mpeg1Video
            } else {
                PsCodec::Mpeg2Video
            };
        } else if id.id == 0xFD {
            track.track_type = PsTrackType::Video;
            track.codec = PsCodec::Vc1;
        }

        if track.track_type == PsTrackType::Unknown {
            return Ok(());
        }

        let buf = self.src.read_vec(length as usize)?;

        let probe = match track.codec {
            PsCodec::Mpeg1Video | PsCodec::Mpeg2Video => {
                self.new_stream_v_avc_or_mpeg_1_2(id, &buf, &mut track)
            }
            PsCodec::Mp2 => Self::new_stream_a_mpeg(&buf, &mut track),
            PsCodec::Ac3 => Self::new_stream_a_ac3(&buf, &mut track),
            PsCodec::Dts => self.new_stream_a_dts(id, &buf, &mut track),
            PsCodec::Vc1 => self.new_stream_v_vc1(id, &buf, &mut track),
            PsCodec::Truehd => self.new_stream_a_truehd(id, &buf, &mut track),
            _ => Err(ParseError::probe_failed(
                self.src.position(),
                "unsupported track type",
            )),
        };

        match probe {
            Ok(()) => {
                track.id = id;
                self.id2idx.insert(id.idx(), self.tracks.len());
                self.tracks.push(track);
                Ok(())
            }
            Err(e) if e.kind == ErrorKind::Encrypted => Err(e),
            Err(e) => {
                debug!(
                    id = id.id,
                    sub_id = id.sub_id,
                    error = %e,
                    "blacklisting stream id"
                );
                self.blacklisted.insert(id.idx());
                Ok(())
            }
        }
    }

    /// Reads further payload packets for `id` into `collect` until the
    /// per-codec predicate is satisfied or the probe budget runs out.
    fn gather_for_id(&mut self, id: MpegPsId, mut feed: impl FnMut(&[u8]) -> Result<bool>) -> Result<()> {
        loop {
            if self.src.position() > PS_PROBE_SIZE {
                return Err(ParseError::probe_failed(
                    self.src.position(),
                    "probe budget exhausted",
                ));
            }
            if !self.find_next_packet_for_id(id, Some(PS_PROBE_SIZE)) {
                return Err(ParseError::probe_failed(
                    self.src.position(),
                    "no more packets for id",
                ));
            }
            let mut new_id = MpegPsId::new(id.id);
            let length = match self.parse_packet(&mut new_id)? {
                PacketOutcome::Payload { length, .. } => length,
                PacketOutcome::Skip { .. } => continue,
            };
            if new_id.sub_id != id.sub_id {
                continue;
            }
            let chunk = self.src.read_vec(length as usize)?;
            if feed(&chunk)? {
                return Ok(());
            }
        }
    }

    /// 0xE0..0xEF carries either MPEG-1/2 or AVC; scan start codes until one
    /// of the two signatures settles it.
    fn new_stream_v_avc_or_mpeg_1_2(
        &mut self,
        id: MpegPsId,
        buf: &[u8],
        track: &mut PsTrack,
    ) -> Result<()> {
        self.src.save_pos();
        let scanned = self.scan_codec_signature(id, buf.to_vec());
        self.src.restore_pos()?;

        match scanned? {
            true => self.new_stream_v_avc(id, buf, track),
            false => self.new_stream_v_mpeg_1_2(id, buf, track),
        }
    }

    fn scan_codec_signature(&mut self, id: MpegPsId, mut buffer: Vec<u8>) -> Result<bool> {
        let mut mpeg_12_seqhdr_found = false;
        let mut mpeg_12_picture_found = false;
        let mut avc_seq_param_found = false;
        let mut avc_pic_param_found = false;
        let mut avc_slice_found = false;
        let mut avc_access_unit_found = false;

        let mut pos = 0usize;
        let mut marker = 0u64;

        loop {
            while pos < buffer.len() {
                marker = (marker << 8) | buffer[pos] as u64;
                pos += 1;

                if (marker >> 8) & 0xFFFF_FFFF == 0x0000_0001 {
                    let nalu_type = (marker & 0x1F) as u8;
                    match nalu_type {
                        NALU_TYPE_SEQ_PARAM => avc_seq_param_found = true,
                        NALU_TYPE_PIC_PARAM => avc_pic_param_found = true,
                        NALU_TYPE_NON_IDR_SLICE
                        | NALU_TYPE_DP_A_SLICE
                        | NALU_TYPE_DP_B_SLICE
                        | NALU_TYPE_DP_C_SLICE
                        | NALU_TYPE_IDR_SLICE => avc_slice_found = true,
                        NALU_TYPE_ACCESS_UNIT => avc_access_unit_found = true,
                        _ => {}
                    }
                    if avc_seq_param_found
                        && avc_pic_param_found
                        && (avc_access_unit_found || avc_slice_found)
                    {
                        return Ok(true);
                    }
                }

                if is_start_code(marker as u32) {
                    match marker as u32 {
                        start_code::SEQUENCE_HEADER_START_CODE => mpeg_12_seqhdr_found = true,
                        start_code::PICTURE_START_CODE => mpeg_12_picture_found = true,
                        _ => {}
                    }
                    if mpeg_12_seqhdr_found && mpeg_12_picture_found {
                        return Ok(false);
                    }
                }
            }

            self.gather_for_id(id, |chunk| {
                buffer.extend_from_slice(chunk);
                Ok(true)
            })?;
        }
    }

    fn new_stream_v_mpeg_1_2(
        &mut self,
        id: MpegPsId,
        buf: &[u8],
        track: &mut PsTrack,
    ) -> Result<()> {
        self.src.save_pos();
        let mut parser = M2vParser::new();
        parser.set_probe_mode();
        parser.write_data(buf);

        while parser.state() != ParserState::FrameReady
            && self.src.position() <= PS_PROBE_SIZE
        {
            let fed = self.gather_for_id(id, |chunk| {
                parser.write_data(chunk);
                Ok(parser.state() == ParserState::FrameReady)
            });
            if fed.is_err() {
                break;
            }
        }
        self.src.restore_pos()?;

        if parser.state() != ParserState::FrameReady {
            return Err(ParseError::probe_failed(
                self.src.position(),
                "MPEG-1/2 probe found no frame",
            ));
        }

        let seq_hdr = parser.sequence_header();
        track.codec = if parser.mpeg_version() == 1 {
            PsCodec::Mpeg1Video
        } else {
            PsCodec::Mpeg2Video
        };
        track.v_version = parser.mpeg_version();
        track.v_interlaced = !seq_hdr.progressive_sequence;
        track.v_width = seq_hdr.width;
        track.v_height = seq_hdr.height;
        track.v_frame_rate = if seq_hdr.progressive_sequence {
            seq_hdr.frame_rate.to_f64()
        } else {
            seq_hdr.frame_rate.to_f64() * 2.0
        };
        track.v_aspect_ratio = seq_hdr.aspect_ratio;

        if track.v_aspect_ratio <= 0.0 || (track.v_aspect_ratio - 1.0).abs() < f32::EPSILON {
            track.v_dwidth = track.v_width;
        } else {
            track.v_dwidth = (track.v_height as f32 * track.v_aspect_ratio) as u32;
        }
        track.v_dheight = track.v_height;

        track.raw_seq_hdr = parser.raw_sequence_header().map(|s| s.to_vec());
        track.use_buffer(BUFFER_SIZE_MPEG12);
        Ok(())
    }

    fn new_stream_v_avc(&mut self, id: MpegPsId, buf: &[u8], track: &mut PsTrack) -> Result<()> {
        self.src.save_pos();
        let mut parser = AvcEsParser::new();
        parser.ignore_nalu_size_length_errors();
        if let Some(&len) = self
            .nalu_size_lengths
            .get(&(self.tracks.len() as i64))
            .or_else(|| self.nalu_size_lengths.get(&-1))
        {
            parser.set_nalu_size_length(len);
        }

        parser.add_bytes(buf)?;
        while !parser.headers_parsed() && self.src.position() <= PS_PROBE_SIZE {
            let fed = self.gather_for_id(id, |chunk| {
                parser.add_bytes(chunk)?;
                Ok(parser.headers_parsed())
            });
            if fed.is_err() {
                break;
            }
        }
        if !parser.headers_parsed() {
            parser.flush()?;
        }
        self.src.restore_pos()?;

        if !parser.headers_parsed() {
            return Err(ParseError::probe_failed(
                self.src.position(),
                "AVC probe found no parameter sets",
            ));
        }

        let sps = *parser
            .sps_info()
            .ok_or_else(|| ParseError::probe_failed(0, "no SPS info"))?;
        track.codec = PsCodec::Avc;
        track.avcc = Some(parser.get_avcc()?);
        track.v_width = sps.width;
        track.v_height = sps.height;

        if sps.ar_found && sps.par_den != 0 {
            let aspect_ratio = sps.width as f32 / sps.height as f32 * sps.par_num as f32
                / sps.par_den as f32;
            track.v_aspect_ratio = aspect_ratio;
            if aspect_ratio > sps.width as f32 / sps.height as f32 {
                track.v_dwidth = (sps.height as f32 * aspect_ratio).round() as u32;
                track.v_dheight = sps.height;
            } else {
                track.v_dwidth = sps.width;
                track.v_dheight = (sps.width as f32 / aspect_ratio).round() as u32;
            }
        }

        track.use_buffer(BUFFER_SIZE_AVC);
        Ok(())
    }

    fn new_stream_v_vc1(&mut self, id: MpegPsId, buf: &[u8], track: &mut PsTrack) -> Result<()> {
        self.src.save_pos();
        let mut parser = Vc1EsParser::new();
        parser.add_bytes(buf);

        while !parser.is_sequence_header_available() && self.src.position() <= PS_PROBE_SIZE {
            let fed = self.gather_for_id(id, |chunk| {
                parser.add_bytes(chunk);
                Ok(parser.is_sequence_header_available())
            });
            if fed.is_err() {
                break;
            }
        }
        self.src.restore_pos()?;

        let seq_hdr = parser.sequence_header().ok_or_else(|| {
            ParseError::probe_failed(self.src.position(), "VC-1 probe found no sequence header")
        })?;

        track.codec = PsCodec::Vc1;
        track.v_width = seq_hdr.pixel_width;
        track.v_height = seq_hdr.pixel_height;
        track.v_interlaced = seq_hdr.interlaced;
        track.provide_timestamps = true;
        track.use_buffer(BUFFER_SIZE_VC1);
        Ok(())
    }

    fn new_stream_a_mpeg(buf: &[u8], track: &mut PsTrack) -> Result<()> {
        let (_, header) = find_mpeg_audio_header(buf)
            .ok_or_else(|| ParseError::probe_failed(0, "no MPEG audio header"))?;
        track.a_channels = header.channels;
        track.a_sample_rate = header.sampling_frequency;
        track.codec = match header.layer.clamp(2, 3) {
            2 => PsCodec::Mp2,
            _ => PsCodec::Mp3,
        };
        Ok(())
    }

    fn new_stream_a_ac3(buf: &[u8], track: &mut PsTrack) -> Result<()> {
        let (_, header) =
            find_ac3_header(buf).ok_or_else(|| ParseError::probe_failed(0, "no AC3 header"))?;
        debug!(
            bsid = header.bs_id,
            channels = header.channels,
            sample_rate = header.sample_rate,
            bytes = header.frame_size,
            samples = header.samples,
            "first ac3 header"
        );
        track.a_channels = header.channels;
        track.a_sample_rate = header.sample_rate;
        track.a_bsid = header.bs_id;
        Ok(())
    }

    fn new_stream_a_dts(&mut self, id: MpegPsId, buf: &[u8], track: &mut PsTrack) -> Result<()> {
        self.src.save_pos();
        let mut buffer = buf.to_vec();
        let mut found = find_dts_header(&buffer);

        while found.is_none() && self.src.position() <= PS_PROBE_SIZE {
            let fed = self.gather_for_id(id, |chunk| {
                buffer.extend_from_slice(chunk);
                Ok(find_dts_header(&buffer).is_some())
            });
            if fed.is_err() {
                break;
            }
            found = find_dts_header(&buffer);
        }
        self.src.restore_pos()?;

        let (_, header) = found
            .ok_or_else(|| ParseError::probe_failed(self.src.position(), "no DTS header"))?;
        track.a_channels = header.channels;
        track.a_sample_rate = header.sample_rate;
        track.dts_header = Some(header);
        Ok(())
    }

    fn new_stream_a_truehd(&mut self, id: MpegPsId, buf: &[u8], track: &mut PsTrack) -> Result<()> {
        self.src.save_pos();
        let mut parser = TruehdParser::new();
        parser.add_data(buf);

        let mut sync = None;
        loop {
            while let Some(frame) = parser.next_frame() {
                if frame.frame_type == TruehdFrameType::Sync {
                    debug!(
                        channels = frame.channels,
                        sampling_rate = frame.sampling_rate,
                        samples_per_frame = frame.samples_per_frame,
                        "first TrueHD header"
                    );
                    sync = Some(frame);
                    break;
                }
            }
            if sync.is_some() {
                break;
            }
            if self.src.position() > PS_PROBE_SIZE {
                break;
            }
            let fed = self.gather_for_id(id, |chunk| {
                parser.add_data(chunk);
                Ok(parser.frame_available())
            });
            if fed.is_err() {
                break;
            }
        }
        self.src.restore_pos()?;

        let frame = sync.ok_or_else(|| {
            ParseError::probe_failed(self.src.position(), "no TrueHD sync frame")
        })?;
        track.a_channels = frame.channels;
        track.a_sample_rate = frame.sampling_rate;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sorting and offsets
    // ------------------------------------------------------------------

    fn sort_tracks(&mut self) {
        for track in self.tracks.iter_mut() {
            track.sort_key = track.track_type.sort_rank() + track.id.idx() as u32;
        }
        self.tracks.sort_by_key(|t| t.sort_key);
        self.id2idx.clear();
        for (i, track) in self.tracks.iter().enumerate() {
            self.id2idx.insert(track.id.idx(), i);
        }
    }

    /// One-shot normalization so the earliest PTS of any track lands at 0.
    fn calculate_global_timestamp_offset(&mut self) {
        if self.tracks.is_empty() {
            return;
        }
        let mut offset = self.tracks[0].timestamp_offset;
        for track in self.tracks.iter().skip(1) {
            if offset == -1 || (track.timestamp_offset != -1 && track.timestamp_offset < offset) {
                offset = track.timestamp_offset;
            }
        }
        if offset != -1 {
            self.global_timestamp_offset = offset;
            for track in self.tracks.iter_mut() {
                if track.timestamp_offset != -1 {
                    track.timestamp_offset -= offset;
                }
            }
        }
        debug!(offset = self.global_timestamp_offset, "global timestamp offset");
    }

    // ------------------------------------------------------------------
    // Packet delivery
    // ------------------------------------------------------------------

    /// Delivers the next demuxed payload in file order, or None at end of
    /// stream once all track buffers are flushed.
    pub fn next_packet(&mut self) -> Result<Option<PsPacket>> {
        if let Some(p) = self.pending.pop_front() {
            return Ok(Some(p));
        }
        if self.file_done {
            return Ok(None);
        }

        let mut new_id = MpegPsId::default();
        while self.find_next_packet(&mut new_id, None) {
            let packet_pos = self.src.position() - 4;

            let (timestamp, length, full_length) = match self.parse_packet(&mut new_id) {
                Ok(PacketOutcome::Payload {
                    timestamp,
                    length,
                    full_length,
                }) => (timestamp, length, full_length),
                Ok(PacketOutcome::Skip { full_length }) => {
                    if new_id.id != 0xBE && new_id.id != 0xBF {
                        debug!(position = packet_pos, skipped = full_length, "parse_packet failed");
                    }
                    if self
                        .src
                        .seek(packet_pos + 4 + 2 + full_length as u64)
                        .is_err()
                    {
                        return self.finish();
                    }
                    continue;
                }
                Err(e) if e.kind == ErrorKind::Encrypted => return Err(e),
                Err(_) => return self.finish(),
            };

            let track_idx = match self.id2idx.get(&new_id.idx()) {
                Some(&idx) => idx,
                None => {
                    if self
                        .src
                        .seek(packet_pos + 4 + 2 + full_length as u64)
                        .is_err()
                    {
                        return self.finish();
                    }
                    continue;
                }
            };

            let provide = self.tracks[track_idx].provide_timestamps;
            let timestamp = if timestamp != -1 && provide {
                let adjusted = timestamp - self.global_timestamp_offset;
                if adjusted < 0 {
                    None
                } else {
                    Some(adjusted)
                }
            } else {
                None
            };

            let data = match self.src.read_vec(length as usize) {
                Ok(d) => d,
                Err(_) => return self.finish(),
            };

            let track = &mut self.tracks[track_idx];
            if track.buffer_size > 0 {
                let mut flushed = None;
                if track.buffer.len() + data.len() > track.buffer_size && !track.buffer.is_empty()
                {
                    flushed = Some(PsPacket {
                        track: track_idx,
                        data: std::mem::take(&mut track.buffer),
                        timestamp: None,
                        ts_offsets: std::mem::take(&mut track.ts_offsets),
                    });
                }
                if let Some(ts) = timestamp {
                    track.ts_offsets.push((ts, track.buffer.len()));
                }
                track.buffer.extend_from_slice(&data);

                if let Some(p) = flushed {
                    return Ok(Some(p));
                }
                continue;
            }

            return Ok(Some(PsPacket {
                track: track_idx,
                data,
                timestamp,
                ts_offsets: Vec::new(),
            }));
        }

        self.finish()
    }

    /// Flushes the per-track buffers at end of stream.
    fn finish(&mut self) -> Result<Option<PsPacket>> {
        if !self.file_done {
            self.file_done = true;
            for (idx, track) in self.tracks.iter_mut().enumerate() {
                if !track.buffer.is_empty() {
                    self.pending.push_back(PsPacket {
                        track: idx,
                        data: std::mem::take(&mut track.buffer),
                        timestamp: None,
                        ts_offsets: std::mem::take(&mut track.ts_offsets),
                    });
                }
            }
        }
        Ok(self.pending.pop_front())
    }
}

// JSON identification helper
pub fn mpeg_ps_probe(path: &str) -> std::result::Result<serde_json::Value, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("Open error: {}", e))?;
    let source = ByteSource::new(file).map_err(|e| format!("Open error: {}", e))?;
    let reader = MpegPsReader::open(source, &DemuxOptions::default()).map_err(|e| e.to_string())?;
    serde_json::to_value(reader.track_infos()).map_err(|e| format!("JSON error: {}", e))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pack_header_mpeg2() -> Vec<u8> {
        let mut v = PACK_START_CODE.to_be_bytes().to_vec();
        // SCR + mux rate + a zero stuffing count
        v.extend_from_slice(&[0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x00, 0x00, 0x03, 0xF8]);
        v
    }

    fn pts_bytes(pts: u64) -> [u8; 5] {
        let b0 = 0b0010_0000 | (((pts >> 30) & 7) as u8) << 1 | 1;
        let mid = ((((pts >> 15) & 0x7FFF) << 1) | 1) as u16;
        let low = (((pts & 0x7FFF) << 1) | 1) as u16;
        let mut out = [0u8; 5];
        out[0] = b0;
        out[1..3].copy_from_slice(&mid.to_be_bytes());
        out[3..5].copy_from_slice(&low.to_be_bytes());
        out
    }

    fn pes(stream_id: u8, pts: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut hdr_data = Vec::new();
        let mut flags = 0x00u8;
        if let Some(pts) = pts {
            hdr_data.extend_from_slice(&pts_bytes(pts));
            flags |= 0x80;
        }
        let total = 3 + hdr_data.len() + payload.len();

        let mut v = vec![0x00, 0x00, 0x01, stream_id];
        v.extend_from_slice(&(total as u16).to_be_bytes());
        v.push(0x80); // marker, no scrambling
        v.push(flags);
        v.push(hdr_data.len() as u8);
        v.extend_from_slice(&hdr_data);
        v.extend_from_slice(payload);
        v
    }

    fn bd_audio_payload(sub_id: u8, frame: &[u8]) -> Vec<u8> {
        let mut v = vec![sub_id, 0x01, 0x00, 0x04]; // sub id + frame count + pointer
        v.extend_from_slice(frame);
        v
    }

    const AC3_FRAME: [u8; 8] = [0x0B, 0x77, 0x00, 0x00, 0x14, 0x40, 0xE9, 0x00];

    fn m2v_seq_header() -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0xB3];
        v.push((720u32 >> 4) as u8);
        v.push(((720u32 & 0x0F) << 4) as u8 | (576u32 >> 8) as u8);
        v.push((576u32 & 0xFF) as u8);
        v.push((2 << 4) | 3); // 4:3, 25 fps
        v.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        v
    }

    fn m2v_picture(frame_type: u8) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0x00];
        v.push(0x00);
        v.push(frame_type << 3);
        v.extend_from_slice(&[0x00, 0x00]);
        v.extend_from_slice(&[0x00, 0x00, 0x01, 0xA5, 0xAA, 0xBB]); // slice filler
        v
    }

    fn m2v_stream() -> Vec<u8> {
        let mut v = m2v_seq_header();
        v.extend_from_slice(&m2v_picture(1)); // I
        v.extend_from_slice(&m2v_picture(2)); // P
        v.extend_from_slice(&m2v_picture(2)); // P
        v
    }

    fn open_ps(bytes: Vec<u8>) -> MpegPsReader<Cursor<Vec<u8>>> {
        let src = ByteSource::new(Cursor::new(bytes)).unwrap();
        MpegPsReader::open(src, &DemuxOptions::default()).unwrap()
    }

    #[test]
    fn probe_detects_pack_start() {
        let mut src = ByteSource::new(Cursor::new(pack_header_mpeg2())).unwrap();
        assert!(MpegPsReader::probe(&mut src));
        let mut other = ByteSource::new(Cursor::new(vec![0x47u8; 16])).unwrap();
        assert!(!MpegPsReader::probe(&mut other));
    }

    #[test]
    fn typing_sorting_and_timestamp_offsets() {
        let mut file = pack_header_mpeg2();
        file.extend_from_slice(&pes(0xE0, Some(7200), &m2v_stream()));
        file.extend_from_slice(&pes(0xBD, Some(3600), &bd_audio_payload(0x81, &AC3_FRAME)));
        file.extend_from_slice(&pes(0xBD, Some(10800), &bd_audio_payload(0x80, &AC3_FRAME)));

        let reader = open_ps(file);
        assert_eq!(reader.track_count(), 3);

        // video sorts before audio; audio by sub id
        assert_eq!(reader.tracks[0].track_type, PsTrackType::Video);
        assert_eq!(reader.tracks[0].codec, PsCodec::Mpeg2Video);
        assert_eq!(reader.tracks[0].v_width, 720);
        assert_eq!(reader.tracks[0].v_height, 576);
        assert!(reader.tracks[0].raw_seq_hdr.is_some());
        assert!(!reader.tracks[0].provide_timestamps);

        assert_eq!(reader.tracks[1].id, MpegPsId { id: 0xBD, sub_id: 0x80 });
        assert_eq!(reader.tracks[1].codec, PsCodec::Ac3);
        assert_eq!(reader.tracks[1].a_channels, 6);
        assert_eq!(reader.tracks[1].a_sample_rate, 48000);
        assert_eq!(reader.tracks[2].id, MpegPsId { id: 0xBD, sub_id: 0x81 });

        // earliest PTS (the 0x81 substream) anchors the offset at zero
        let ns = |ticks: i64| ticks * 100_000 / 9;
        assert_eq!(reader.global_timestamp_offset(), ns(3600));
        assert_eq!(reader.tracks[2].timestamp_offset, 0);
        assert_eq!(reader.tracks[0].timestamp_offset, ns(7200) - ns(3600));
        assert_eq!(reader.tracks[1].timestamp_offset, ns(10800) - ns(3600));
    }

    #[test]
    fn delivery_follows_file_order_with_buffering() {
        let video = m2v_stream();
        let mut file = pack_header_mpeg2();
        file.extend_from_slice(&pes(0xE0, Some(3600), &video));
        file.extend_from_slice(&pes(0xBD, Some(3600), &bd_audio_payload(0x80, &AC3_FRAME)));
        file.extend_from_slice(&pes(0xBD, Some(7200), &bd_audio_payload(0x81, &AC3_FRAME)));

        let mut reader = open_ps(file);
        // track 0 video (buffered), 1 = 0xBD80, 2 = 0xBD81

        let p1 = reader.next_packet().unwrap().unwrap();
        assert_eq!(p1.track, 1);
        assert_eq!(p1.data, AC3_FRAME.to_vec());
        // audio passes through, no container timestamps on non-VC-1 tracks
        assert_eq!(p1.timestamp, None);

        let p2 = reader.next_packet().unwrap().unwrap();
        assert_eq!(p2.track, 2);
        assert_eq!(p2.data, AC3_FRAME.to_vec());

        // end of stream flushes the buffered video track
        let p3 = reader.next_packet().unwrap().unwrap();
        assert_eq!(p3.track, 0);
        assert_eq!(p3.data, video);

        assert!(reader.next_packet().unwrap().is_none());
    }

    #[test]
    fn encrypted_pes_is_fatal() {
        let mut file = pack_header_mpeg2();
        let mut packet = pes(0xE0, None, &m2v_stream());
        packet[6] |= 0x10; // scrambling control bits
        file.extend_from_slice(&packet);

        let src = ByteSource::new(Cursor::new(file)).unwrap();
        let err = MpegPsReader::open(src, &DemuxOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Encrypted);
    }

    #[test]
    fn program_stream_map_overrides_id_typing() {
        let mut file = pack_header_mpeg2();
        // PSM: stream type 0x81 (AC-3) for elementary stream id 0xC0
        let mut psm = vec![0x00, 0x00, 0x01, 0xBC];
        psm.extend_from_slice(&14u16.to_be_bytes());
        psm.extend_from_slice(&[0xE0, 0x00]); // current/next + version
        psm.extend_from_slice(&0u16.to_be_bytes()); // program info length
        psm.extend_from_slice(&4u16.to_be_bytes()); // es map length
        psm.extend_from_slice(&[0x81, 0xC0]);
        psm.extend_from_slice(&0u16.to_be_bytes()); // es info length
        psm.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // crc
        file.extend_from_slice(&psm);
        file.extend_from_slice(&pes(0xC0, Some(3600), &AC3_FRAME));

        let reader = open_ps(file);
        assert_eq!(reader.track_count(), 1);
        let t = &reader.tracks[0];
        assert_eq!(t.id.id, 0xC0);
        assert_eq!(t.codec, PsCodec::Ac3);
        assert_eq!(t.track_type, PsTrackType::Audio);
        assert_eq!(t.a_bsid, 8);
    }

    #[test]
    fn vobsub_substreams_are_recognized_but_not_emitted() {
        let mut file = pack_header_mpeg2();
        file.extend_from_slice(&pes(0xBD, Some(3600), &bd_audio_payload(0x20, &[0u8; 16])));
        file.extend_from_slice(&pes(0xBD, Some(3600), &bd_audio_payload(0x80, &AC3_FRAME)));
        let reader = open_ps(file);
        // only the AC-3 substream yields a track
        assert_eq!(reader.track_count(), 1);
        assert_eq!(reader.tracks[0].codec, PsCodec::Ac3);
    }

    #[test]
    fn unparseable_bytes_resync_to_next_start_code() {
        let mut file = pack_header_mpeg2();
        file.extend_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x9A]); // garbage
        file.extend_from_slice(&pes(0xBD, Some(3600), &bd_audio_payload(0x80, &AC3_FRAME)));
        let reader = open_ps(file);
        assert_eq!(reader.track_count(), 1);
    }
}
