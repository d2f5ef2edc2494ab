// AVI READ ENGINE - RIFF('AVI ') / RIFF('AVIX') reader
//
// Parses the chunk tree, builds per-stream descriptors and indexes (legacy
// idx1, OpenDML indx/ix## hierarchy, or a full file scan), and exposes
// per-stream reads with keyframe queries and a streaming cache for
// sequential consumers. Appended files chain onto an open reader; index
// positions carry the backing file number in bits 48..63.

use std::io::{Read, Seek};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::avi_cache::AviReadCache;
use crate::avi_index::{
    vbr_statistics, AviIndex, IndexEntry2, VbrStats, AVIIF_KEYFRAME, NOT_KEYFRAME_FLAG,
    POSITION_MASK, SIZE_MASK,
};
use crate::error::{ParseError, Result};
use crate::fourcc::{self, FourCc};
use crate::io::{get_u16_le, get_u32_le, ByteSource};

const STREAM_SIZE: usize = 1_048_576;
const STREAM_RT_SIZE: usize = 65_536;
const STREAM_BLOCK_SIZE: i64 = 4096;

/// Chunk sizes at or past this are treated as file damage.
pub const DAMAGE_SENTINEL: u32 = 0x7FFF_FFF0;
/// Foreign chunks larger than this force a streaming-window reset.
const OVERSIZE_SKIP: u32 = 262_144;
/// Streaming engages only when the file cursor is within this window.
const STREAM_WINDOW: i64 = 4_194_304;
/// Consecutive pattern reads before streaming is declared.
const STREAM_DETECT_READS: u32 = 15;

const CACHE_LINES_VIDEO: usize = 131_072;
const CACHE_LINES_AUDIO: usize = 16_384;
const REMEDIATION_MIN_READS: u32 = 50;
const LEADER_MIN_AHEAD: i64 = 524_288;

// ============================================================================
// Headers
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MainAviHeader {
    pub microsec_per_frame: u32,
    pub max_bytes_per_sec: u32,
    pub padding_granularity: u32,
    pub flags: u32,
    pub total_frames: u32,
    pub initial_frames: u32,
    pub streams: u32,
    pub suggested_buffer_size: u32,
    pub width: u32,
    pub height: u32,
}

/// The VfW stream header. The rcFrame rectangle uses 2-byte shorts; legacy
/// parsers reject AVIs written with 4-byte fields.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AviStreamHeader {
    pub fcc_type: FourCc,
    pub fcc_handler: FourCc,
    pub flags: u32,
    pub priority: u16,
    pub language: u16,
    pub initial_frames: u32,
    pub scale: u32,
    pub rate: u32,
    pub start: u32,
    pub length: u32,
    pub suggested_buffer_size: u32,
    pub quality: u32,
    pub sample_size: u32,
    pub rc_frame: (i16, i16, i16, i16),
}

// WAVEFORMATEX field peeks over the opaque format blob
fn wave_format_tag(format: &[u8]) -> u16 {
    if format.len() >= 2 {
        get_u16_le(format)
    } else {
        0
    }
}

fn wave_avg_bytes_per_sec(format: &[u8]) -> u32 {
    if format.len() >= 12 {
        get_u32_le(&format[8..])
    } else {
        0
    }
}

fn wave_block_align(format: &[u8]) -> u32 {
    if format.len() >= 14 {
        get_u16_le(&format[12..]) as u32
    } else {
        0
    }
}

fn set_wave_block_align(format: &mut [u8], value: u16) {
    if format.len() >= 14 {
        format[12..14].copy_from_slice(&value.to_le_bytes());
    }
}

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_MP3: u16 = 0x0055;
const PCMWAVEFORMAT_LEN: usize = 16;

// codecs where every frame stands alone
const KEYFRAME_ONLY_COMPRESSIONS: [&[u8; 4]; 15] = [
    b"RAW ", b"DIB ", b"dmb1", b"mjpg", b"MJPG", b"VYUY", b"YUY2", b"UYVY", b"YVYU", b"YV12",
    b"I420", b"Y41P", b"cyuv", b"HFYU", b"bt20",
];

// ============================================================================
// Stream node
// ============================================================================

pub struct AviStream {
    pub header: AviStreamHeader,
    pub format: Vec<u8>,
    pub index: AviIndex,
    pub total_bytes: i64,
    pub keyframe_only: bool,
    pub was_vbr: bool,
    pub vbr: Option<VbrStats>,
    /// sample units; `total_bytes / sample_size` for blocked streams
    pub length: i64,
    pub frame_count: i64,

    pub(crate) cache: Option<AviReadCache>,
    streaming_count: u32,
    stream_push_pos: i64,
    stream_bytes: i64,
    stream_pushes: u32,

    // per-stream read state (the read-handle state of the original)
    cached_position: i64,
    cached_entry: usize,
    streaming_enabled: bool,
    streaming_active: bool,
    stream_track_count: u32,
    stream_track_value: i64,
    stream_track_interval: i64,
    real_time: bool,
}

impl AviStream {
    fn new() -> Self {
        Self {
            header: AviStreamHeader::default(),
            format: Vec::new(),
            index: AviIndex::new(),
            total_bytes: 0,
            keyframe_only: false,
            was_vbr: false,
            vbr: None,
            length: 0,
            frame_count: 0,
            cache: None,
            streaming_count: 0,
            stream_push_pos: 0,
            stream_bytes: 0,
            stream_pushes: 0,
            cached_position: 0,
            cached_entry: 0,
            streaming_enabled: false,
            streaming_active: false,
            stream_track_count: 0,
            stream_track_value: -1,
            stream_track_interval: -1,
            real_time: false,
        }
    }

    /// Effective sample size; the Microsoft parser ignores the header value
    /// for audio and uses nBlockAlign instead.
    pub fn sample_size(&self) -> u32 {
        if self.header.fcc_type == fourcc::AUDS {
            wave_block_align(&self.format)
        } else {
            self.header.sample_size
        }
    }

    fn reinit_read_state(&mut self) {
        self.cached_position = 0;
        self.cached_entry = 0;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AviStreamInfo {
    pub stream_type: String,
    pub handler: String,
    pub rate: u32,
    pub scale: u32,
    pub sample_size: u32,
    pub length: i64,
    pub frame_count: i64,
    pub total_bytes: i64,
    pub keyframe_only: bool,
    pub was_vbr: bool,
    pub bitrate_mean: Option<f64>,
    pub bitrate_stddev: Option<f64>,
    pub max_relative_deviation: Option<f64>,
}

pub struct StreamReadResult {
    pub data: Vec<u8>,
    pub samples: i64,
}

// ============================================================================
// Reader
// ============================================================================

pub struct AviReader<R> {
    sources: Vec<ByteSource<R>>,
    current_file: i64,
    streams: Vec<AviStream>,
    main_header: Option<MainAviHeader>,
    segment_hint: Option<Vec<u8>>,

    fake_index: bool,
    file_damaged: bool,
    disable_fast_io: bool,
    disable_multi_file: bool,

    stream_buffer: Option<Vec<u8>>,
    stream_position: i64,
    sb_position: usize,
    sb_size: usize,
    streams_active: u32,
    n_real_time: u32,
    n_active_streamers: u32,
}

struct ParsedFile {
    streams: Vec<AviStream>,
    main_header: Option<MainAviHeader>,
    segment_hint: Option<Vec<u8>>,
    fake_index: bool,
    damaged: bool,
}

impl<R: Read + Seek> AviReader<R> {
    /// Cheap magic check.
    pub fn probe(src: &mut ByteSource<R>) -> bool {
        let ok = (|| -> Result<bool> {
            src.seek(0)?;
            let riff = FourCc(src.read_u32_le()?);
            src.skip(4)?;
            let form = FourCc(src.read_u32_le()?);
            Ok(riff == fourcc::RIFF && form == fourcc::AVI_)
        })()
        .unwrap_or(false);
        let _ = src.seek(0);
        ok
    }

    pub fn open(source: ByteSource<R>) -> Result<Self> {
        Self::open_with_options(source, &crate::options::DemuxOptions::default())
    }

    pub fn open_with_options(
        mut source: ByteSource<R>,
        options: &crate::options::DemuxOptions,
    ) -> Result<Self> {
        source.seek(0)?;
        let parsed = Self::parse_source(&mut source, 0, options.disable_multi_file)?;
        Ok(Self {
            sources: vec![source],
            current_file: 0,
            streams: parsed.streams,
            main_header: parsed.main_header,
            segment_hint: parsed.segment_hint,
            fake_index: parsed.fake_index,
            file_damaged: parsed.damaged,
            disable_fast_io: false,
            disable_multi_file: options.disable_multi_file,
            stream_buffer: None,
            stream_position: -1,
            sb_position: 0,
            sb_size: 0,
            streams_active: 0,
            n_real_time: 0,
            n_active_streamers: 0,
        })
    }

    pub fn enable_fast_io(&mut self, enable: bool) {
        self.disable_fast_io = !enable;
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, index: usize) -> &AviStream {
        &self.streams[index]
    }

    pub fn main_header(&self) -> Option<&MainAviHeader> {
        self.main_header.as_ref()
    }

    pub fn segment_hint(&self) -> Option<&[u8]> {
        self.segment_hint.as_deref()
    }

    pub fn is_index_fabricated(&self) -> bool {
        self.fake_index
    }

    pub fn is_damaged(&self) -> bool {
        self.file_damaged
    }

    pub fn is_streaming(&self) -> bool {
        self.n_active_streamers != 0 && !self.file_damaged
    }

    pub fn is_optimized_for_realtime(&self) -> bool {
        self.n_real_time != 0
    }

    pub fn stream_info(&self, index: usize) -> AviStreamInfo {
        let s = &self.streams[index];
        AviStreamInfo {
            stream_type: s.header.fcc_type.to_string(),
            handler: s.header.fcc_handler.to_string(),
            rate: s.header.rate,
            scale: s.header.scale,
            sample_size: s.header.sample_size,
            length: s.length,
            frame_count: s.frame_count,
            total_bytes: s.total_bytes,
            keyframe_only: s.keyframe_only,
            was_vbr: s.was_vbr,
            bitrate_mean: s.vbr.map(|v| v.bitrate_mean),
            bitrate_stddev: s.vbr.map(|v| v.bitrate_stddev),
            max_relative_deviation: s.vbr.map(|v| v.max_relative_deviation),
        }
    }

    // ------------------------------------------------------------------
    // Parsing
    // ------------------------------------------------------------------

    fn read_chunk_header(src: &mut ByteSource<R>) -> Option<(FourCc, u32)> {
        let mut hdr = [0u8; 8];
        match src.read(&mut hdr) {
            Ok(8) => Some((FourCc(get_u32_le(&hdr)), get_u32_le(&hdr[4..]))),
            _ => None,
        }
    }

    fn parse_source(
        src: &mut ByteSource<R>,
        file_number: usize,
        disable_multi_file: bool,
    ) -> Result<ParsedFile> {
        let mut parsed = ParsedFile {
            streams: Vec::new(),
            main_header: None,
            segment_hint: None,
            fake_index: false,
            damaged: false,
        };

        let (riff, _) = Self::read_chunk_header(src)
            .ok_or_else(|| ParseError::structure(0, "file is less than 8 bytes"))?;
        if riff != fourcc::RIFF {
            return Err(ParseError::structure(0, "not a RIFF file"));
        }
        let mut form = [0u8; 4];
        if src.read(&mut form)? != 4 {
            // an improperly closed file; treat as empty
            return Ok(parsed);
        }
        if FourCc(get_u32_le(&form)) != fourcc::AVI_ {
            return Err(ParseError::structure(8, "RIFF type is not 'AVI '"));
        }

        let mut index_found = false;
        let mut accept_index_only = true;
        let mut hyperindexed = false;
        let mut scan_required = false;
        let mut aggressive = false;
        let mut movi_pos: i64 = 0;
        let mut movi_len: u32 = 0;

        'walk: while let Some((fcc, mut len)) = Self::read_chunk_header(src) {
            if !fcc.is_valid() {
                aggressive = true;
                break;
            }

            match fcc {
                fourcc::LIST => {
                    let mut sub = [0u8; 4];
                    if src.read(&mut sub)? != 4 {
                        break 'walk;
                    }
                    let subtype = FourCc(get_u32_le(&sub));

                    // zero-size LIST/movi: unclosed writer output, jump
                    // straight to reindexing
                    if len == 0 && subtype == fourcc::MOVI {
                        movi_pos = src.position() as i64;
                        movi_len = DAMAGE_SENTINEL;
                        break 'walk;
                    }

                    if len < 4 && subtype != fourcc::HDRL {
                        return Err(ParseError::structure(
                            src.position(),
                            "LIST chunk <4 bytes",
                        ));
                    }
                    len = len.saturating_sub(4);

                    match subtype {
                        fourcc::MOVI => {
                            movi_pos = src.position() as i64;
                            if len < 8 {
                                movi_len = DAMAGE_SENTINEL;
                                len = 0;
                            } else {
                                movi_len = len;
                            }
                            if accept_index_only {
                                break 'walk;
                            }
                        }
                        fourcc::REC_ | fourcc::HDRL => len = 0, // descend silently
                        fourcc::STRL => {
                            match Self::parse_stream_header(src, &mut parsed.streams, len)? {
                                StrlOutcome::Plain => accept_index_only = false,
                                StrlOutcome::HyperIndexed => {
                                    debug!(
                                        stream = parsed.streams.len() - 1,
                                        "OpenDML hierarchical index detected"
                                    );
                                    hyperindexed = true;
                                }
                                StrlOutcome::IndexDamaged => {
                                    accept_index_only = false;
                                    scan_required = true;
                                }
                            }
                            len = 0;
                        }
                        _ => {}
                    }
                }

                fourcc::IDX1 => {
                    if !hyperindexed {
                        index_found =
                            Self::parse_index_block(src, &mut parsed.streams, len / 16, movi_pos)?;
                        len &= 15;
                    }
                }

                fourcc::JUNK => {}

                fourcc::SEGM => {
                    let mut hint = vec![0u8; len as usize];
                    if src.read(&mut hint)? != len as usize {
                        break 'walk;
                    }
                    if len & 1 != 0 {
                        src.skip(1)?;
                    }
                    parsed.segment_hint = Some(hint);
                    len = 0;
                }

                fourcc::AVIH => {
                    if parsed.main_header.is_none() {
                        let tc = (len as usize).min(56);
                        let mut buf = vec![0u8; tc];
                        if src.read(&mut buf)? != tc {
                            break 'walk;
                        }
                        buf.resize(56, 0);
                        parsed.main_header = Some(MainAviHeader {
                            microsec_per_frame: get_u32_le(&buf),
                            max_bytes_per_sec: get_u32_le(&buf[4..]),
                            padding_granularity: get_u32_le(&buf[8..]),
                            flags: get_u32_le(&buf[12..]),
                            total_frames: get_u32_le(&buf[16..]),
                            initial_frames: get_u32_le(&buf[20..]),
                            streams: get_u32_le(&buf[24..]),
                            suggested_buffer_size: get_u32_le(&buf[28..]),
                            width: get_u32_le(&buf[32..]),
                            height: get_u32_le(&buf[36..]),
                        });
                        len -= tc as u32;
                    }
                }

                _ => {}
            }

            if len != 0 && src.skip((len + (len & 1)) as i64).is_err() {
                break;
            }

            // quit as soon as the index block has been seen
            if fcc == fourcc::IDX1 {
                break;
            }
        }

        if movi_pos == 0 {
            return Err(ParseError::structure(
                src.position(),
                "this AVI file has no movie data block (movi)",
            ));
        }

        if !hyperindexed && !index_found {
            scan_required = true;
        }

        if scan_required {
            warn!("index not found or damaged; reconstructing via file scan");
            Self::scan_for_index(
                src,
                &mut parsed.streams,
                movi_pos,
                movi_len,
                hyperindexed,
                disable_multi_file,
                &mut aggressive,
            )?;
            parsed.fake_index = true;
        }

        parsed.damaged = aggressive;

        // glue the indices together and fix the headers up
        for (stream_no, stream) in parsed.streams.iter_mut().enumerate() {
            if !stream.index.materialize_index2() {
                return Err(ParseError::structure(src.position(), "out of memory"));
            }
            stream.frame_count = stream.index.entries().len() as i64;

            if file_number > 0 {
                // stamp the backing file into every entry
                let tagged: Vec<IndexEntry2> = stream
                    .index
                    .take_index2()
                    .into_iter()
                    .map(|mut e| {
                        e.pos |= (file_number as i64) << 48;
                        e
                    })
                    .collect();
                stream.index.clear();
                for e in &tagged {
                    stream.index.add_entry(*e);
                }
                stream.index.materialize_index2();
            }

            // the AVI sample-size field is meaningless for video
            if stream.header.fcc_type == fourcc::VIDS {
                stream.header.sample_size = 0;
            }

            if stream.header.rate == 0 || stream.header.scale == 0 {
                if stream.header.fcc_type == fourcc::VIDS {
                    if let Some(hdr) = &parsed.main_header {
                        stream.header.rate = hdr.microsec_per_frame;
                        stream.header.scale = 1_000_000;
                    }
                } else if stream.header.fcc_type == fourcc::AUDS {
                    stream.header.rate = wave_avg_bytes_per_sec(&stream.format);
                    stream.header.scale = wave_block_align(&stream.format);
                }
                if stream.header.rate == 0 || stream.header.scale == 0 {
                    stream.header.rate = 15;
                    stream.header.scale = 1;
                }
                warn!(
                    stream = stream_no,
                    rate = stream.header.rate as f64 / stream.header.scale as f64,
                    "stream has an invalid sample rate; substituting a placeholder"
                );
            }

            if stream.header.fcc_type == fourcc::AUDS {
                let block_align = wave_block_align(&stream.format);
                stream.header.sample_size = block_align;

                let frames = stream.index.entries().len();
                let runt = stream.index.entries()[..frames.saturating_sub(1)]
                    .iter()
                    .any(|e| {
                        let s = e.payload_size();
                        s != 0 && s < block_align
                    });
                if runt {
                    Self::fix_vbr_audio(stream, stream_no);
                }
            }

            stream.length = if stream.header.sample_size != 0 {
                stream.total_bytes / stream.header.sample_size as i64
            } else {
                stream.frame_count
            };
        }

        Ok(parsed)
    }

    /// Undo a VBR hack: reclassify the stream and compute its statistics.
    fn fix_vbr_audio(stream: &mut AviStream, stream_no: usize) {
        if wave_format_tag(&stream.format) == WAVE_FORMAT_MP3 {
            // undo the Nandub 1152 value
            set_wave_block_align(&mut stream.format, 1);
        }

        stream.was_vbr = true;
        let stats = vbr_statistics(
            stream.index.entries(),
            stream.total_bytes,
            stream.header.rate,
            stream.header.scale,
        );
        warn!(
            stream = stream_no,
            bitrate_mean = stats.bitrate_mean,
            bitrate_stddev = stats.bitrate_stddev,
            max_relative_deviation = stats.max_relative_deviation,
            "VBR audio detected"
        );

        let block_align = wave_block_align(&stream.format);
        stream.header.rate = (stats.bitrate_mean / 8.0 + 0.5) as u32;
        stream.header.scale = block_align;
        stream.header.sample_size = block_align;
        stream.vbr = Some(stats);
    }

    fn parse_stream_header(
        src: &mut ByteSource<R>,
        streams: &mut Vec<AviStream>,
        mut length_left: u32,
    ) -> Result<StrlOutcome> {
        let mut stream = AviStream::new();
        let mut outcome = StrlOutcome::Plain;

        while length_left >= 8 {
            let (fcc, mut len) = match Self::read_chunk_header(src) {
                Some(v) => v,
                None => break,
            };
            length_left -= 8;
            if len > length_left {
                return Err(ParseError::structure(
                    src.position(),
                    "chunk size extends outside of parent",
                ));
            }
            length_left -= len + (len & 1);

            match fcc {
                fourcc::STRH => {
                    let tc = (len as usize).min(56);
                    let mut buf = vec![0u8; tc];
                    src.read_exact(&mut buf)?;
                    buf.resize(56, 0);
                    stream.header = AviStreamHeader {
                        fcc_type: FourCc(get_u32_le(&buf)),
                        fcc_handler: FourCc(get_u32_le(&buf[4..])),
                        flags: get_u32_le(&buf[8..]),
                        priority: get_u16_le(&buf[12..]),
                        language: get_u16_le(&buf[14..]),
                        initial_frames: get_u32_le(&buf[16..]),
                        scale: get_u32_le(&buf[20..]),
                        rate: get_u32_le(&buf[24..]),
                        start: get_u32_le(&buf[28..]),
                        length: get_u32_le(&buf[32..]),
                        suggested_buffer_size: get_u32_le(&buf[36..]),
                        quality: get_u32_le(&buf[40..]),
                        sample_size: get_u32_le(&buf[44..]),
                        rc_frame: (
                            get_u16_le(&buf[48..]) as i16,
                            get_u16_le(&buf[50..]) as i16,
                            get_u16_le(&buf[52..]) as i16,
                            get_u16_le(&buf[54..]) as i16,
                        ),
                    };
                    if len as usize > tc {
                        src.skip((len as usize - tc) as i64 + (len & 1) as i64)?;
                    } else if len & 1 != 0 {
                        src.skip(1)?;
                    }
                    stream.keyframe_only = false;
                    len = 0;
                }

                fourcc::STRF => {
                    stream.format = src.read_vec(len as usize)?;
                    if stream.header.fcc_type == fourcc::VIDS && stream.format.len() >= 20 {
                        let compression = get_u32_le(&stream.format[16..]);
                        stream.keyframe_only = compression == 0
                            || KEYFRAME_ONLY_COMPRESSIONS
                                .iter()
                                .any(|cc| FourCc::from_bytes(**cc).0 == compression);
                    }
                    if len & 1 != 0 {
                        src.skip(1)?;
                    }
                    len = 0;
                }

                fourcc::INDX => {
                    src.save_pos();
                    match Self::parse_extended_index(src, &mut stream, -1) {
                        Ok(()) => outcome = StrlOutcome::HyperIndexed,
                        Err(_) => outcome = StrlOutcome::IndexDamaged,
                    }
                    src.restore_pos()?;
                }

                fourcc::JUNK => {}

                _ => {}
            }

            if len != 0 {
                src.skip((len + (len & 1)) as i64)?;
            }
        }

        if length_left != 0 {
            src.skip(length_left as i64)?;
        }

        streams.push(stream);
        Ok(outcome)
    }

    /// Legacy idx1 ingestion. The whole table is pre-scanned for the
    /// absolute-vs-relative decision; offsets below the movi position mean
    /// the table is relative to `movi - 4`.
    fn parse_index_block(
        src: &mut ByteSource<R>,
        streams: &mut Vec<AviStream>,
        count: u32,
        movi_pos: i64,
    ) -> Result<bool> {
        // an empty table is as good as a missing one
        if count == 0 {
            return Ok(false);
        }
        let mut raw = vec![0u8; count as usize * 16];
        if src.read(&mut raw)? != raw.len() {
            for stream in streams.iter_mut() {
                stream.index.clear();
                stream.total_bytes = 0;
            }
            return Ok(false);
        }

        let absolute = !raw
            .chunks_exact(16)
            .any(|rec| (get_u32_le(&rec[8..]) as i64) < movi_pos);

        for rec in raw.chunks_exact(16) {
            let ckid = FourCc(get_u32_le(rec));
            let flags = get_u32_le(&rec[4..]);
            let offset = get_u32_le(&rec[8..]) as i64;
            let size = get_u32_le(&rec[12..]);

            let stream_no = match ckid.stream_number() {
                Some(n) => n,
                None => continue,
            };
            if let Some(stream) = streams.get_mut(stream_no) {
                let pos = if absolute {
                    offset
                } else {
                    (movi_pos - 4) + offset
                };
                stream
                    .index
                    .add(ckid, pos, size, flags & AVIIF_KEYFRAME != 0);
                stream.total_bytes += size as i64;
            }
        }

        Ok(true)
    }

    /// OpenDML hierarchical index walk: a super-index (`bIndexType == 0`)
    /// fans out to std-indexes (`bIndexType == 1`).
    fn parse_extended_index(
        src: &mut ByteSource<R>,
        stream: &mut AviStream,
        fpos: i64,
    ) -> Result<()> {
        let saved = src.position();
        if fpos >= 0 {
            src.seek(fpos as u64)?;
        }

        let longs_per_entry = src.read_u16_le()?;
        let _index_sub_type = src.read_u8()?;
        let index_type = src.read_u8()?;
        let entries_in_use = src.read_u32_le()?;
        let chunk_id = FourCc(src.read_u32_le()?);

        let result = match index_type {
            0 if longs_per_entry != 4 => Err(ParseError::structure(
                src.position(),
                "invalid superindex block in stream",
            )),
            0 => {
                // index of indexes
                let walk = (|| -> Result<Vec<i64>> {
                    src.skip(12)?; // dwReserved[3]
                    let mut children = Vec::with_capacity(entries_in_use as usize);
                    for _ in 0..entries_in_use {
                        let offset = src.read_i64_le()?;
                        let _size = src.read_u32_le()?;
                        let _duration = src.read_u32_le()?;
                        children.push(offset);
                    }
                    Ok(children)
                })();
                match walk {
                    Ok(children) => {
                        let mut result = Ok(());
                        for offset in children {
                            result = Self::parse_extended_index(src, stream, offset + 8);
                            if result.is_err() {
                                break;
                            }
                        }
                        result
                    }
                    Err(e) => Err(e),
                }
            }
            1 => {
                // index of chunks
                // wLongsPerEntry 2 and 3 carry (offset, size|keyflag);
                // 6 carries (_, _, offset, _, size, _) with all keyframes
                if longs_per_entry != 2 && longs_per_entry != 3 && longs_per_entry != 6 {
                    return Err(ParseError::structure(
                        src.position(),
                        format!("invalid OpenDML index block, wLongsPerEntry={}", longs_per_entry),
                    ));
                }
                let base_offset = src.read_i64_le()?;
                let _reserved = src.read_u32_le()?;

                for _ in 0..entries_in_use {
                    let mut longs = [0u32; 6];
                    for l in longs.iter_mut().take(longs_per_entry as usize) {
                        *l = src.read_u32_le()?;
                    }
                    if longs_per_entry == 6 {
                        let offset = longs[2];
                        let size = longs[4];
                        stream
                            .index
                            .add(chunk_id, base_offset + offset as i64 - 8, size, true);
                        stream.total_bytes += size as i64;
                    } else {
                        let offset = longs[0];
                        let size = longs[1];
                        stream.index.add(
                            chunk_id,
                            base_offset + offset as i64 - 8,
                            size & SIZE_MASK,
                            size & NOT_KEYFRAME_FLAG == 0,
                        );
                        stream.total_bytes += (size & SIZE_MASK) as i64;
                    }
                }
                Ok(())
            }
            _ => Err(ParseError::structure(
                src.position(),
                "unknown hyperindex type",
            )),
        };

        src.seek(saved)?;
        result
    }

    /// Rebuilds all indexes by walking the movi payload chunk by chunk.
    /// Aggressive mode engages on the first invalid header; from then on an
    /// entry is accepted only when the following chunk header also parses.
    fn scan_for_index(
        src: &mut ByteSource<R>,
        streams: &mut Vec<AviStream>,
        movi_pos: i64,
        movi_len: u32,
        hyperindexed: bool,
        disable_multi_file: bool,
        aggressive: &mut bool,
    ) -> Result<()> {
        for stream in streams.iter_mut() {
            stream.index.clear();
            stream.total_bytes = 0;
        }

        let file_size = src.size() as i64;
        let mut length_left = movi_len;
        let mut stop_when_exhausted = !hyperindexed && !*aggressive;

        src.seek(movi_pos as u64)?;

        loop {
            if stop_when_exhausted && length_left < 8 {
                break;
            }

            let (fcc, len) = match Self::read_chunk_header(src) {
                Some(v) => v,
                None => break,
            };

            let mut valid =
                fcc.is_valid() && (src.position() as i64 + len as i64) <= file_size;

            if *aggressive && valid {
                let current = src.position() as i64;
                let rounded = (len as i64 + 1) & !1;
                if current + len as i64 > file_size {
                    valid = false;
                } else if current + rounded <= file_size - 8 {
                    src.seek((current + rounded) as u64)?;
                    match Self::read_chunk_header(src) {
                        Some((next_fcc, next_len)) => {
                            valid &= next_fcc.is_valid()
                                && (src.position() as i64 + next_len as i64) <= file_size;
                        }
                        None => break,
                    }
                    src.seek(current as u64)?;
                }
            }

            if !valid {
                if !*aggressive {
                    warn!(
                        position = src.position(),
                        "invalid chunk detected; enabling aggressive recovery mode"
                    );
                    *aggressive = true;
                    stop_when_exhausted = false;
                }
                // back up seven bytes past the bad header and retry
                src.skip(-7)?;
                continue;
            }

            length_left = length_left.saturating_sub(8 + len + (len & 1));
            let header_pos = src.position() as i64 - 8;

            // skip the payload, but descend into RIFF/AVIX and LIST/movi
            if len != 0 {
                if fcc == fourcc::RIFF || fcc == fourcc::LIST {
                    let mut sub = [0u8; 4];
                    if src.read(&mut sub)? != 4 {
                        break;
                    }
                    let subtype = FourCc(get_u32_le(&sub));
                    let descend = subtype == fourcc::MOVI
                        || (subtype == fourcc::AVIX && !disable_multi_file);
                    if !descend && src.skip((len + (len & 1)) as i64 - 4).is_err() {
                        break;
                    }
                } else if src.skip((len + (len & 1)) as i64).is_err() {
                    break;
                }
            }

            if src.position() as i64 > file_size {
                break;
            }

            if let Some(stream_no) = fcc.stream_number() {
                if let Some(stream) = streams.get_mut(stream_no) {
                    // first sample and keyframe-only codecs get the keyframe
                    // flag; zero-byte drop frames never do
                    let keyframe =
                        (stream.total_bytes == 0 || stream.keyframe_only) && len > 0;
                    stream.index.add(fcc, header_pos, len, keyframe);
                    stream.total_bytes += len as i64;
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Appending
    // ------------------------------------------------------------------

    /// Chains another AVI file onto this reader. Every stream must match in
    /// type, sampling ratio, sample size and format bytes (PCM compares only
    /// the PCMWAVEFORMAT prefix).
    pub fn append(&mut self, mut source: ByteSource<R>) -> Result<()> {
        if self.disable_multi_file {
            return Err(ParseError::structure(
                0,
                "multi-file handling is disabled",
            ));
        }
        source.seek(0)?;
        let file_number = self.sources.len();
        let parsed = Self::parse_source(&mut source, file_number, self.disable_multi_file)?;

        if parsed.streams.len() != self.streams.len() {
            return Err(ParseError::structure(
                0,
                "cannot append segment: different number of streams",
            ));
        }

        for (old, new) in self.streams.iter().zip(parsed.streams.iter()) {
            if old.header.fcc_type != new.header.fcc_type {
                return Err(ParseError::structure(
                    0,
                    "cannot append segment: stream types do not match",
                ));
            }
            // A/B ?= C/D  ==>  A*D ?= B*C
            if old.header.scale as i64 * new.header.rate as i64
                != new.header.scale as i64 * old.header.rate as i64
            {
                return Err(ParseError::structure(
                    0,
                    "cannot append segment: different sampling rates",
                ));
            }
            if old.header.sample_size != new.header.sample_size {
                return Err(ParseError::structure(
                    0,
                    "cannot append segment: different block sizes",
                ));
            }

            let pcm_pair = old.header.fcc_type == fourcc::AUDS
                && wave_format_tag(&old.format) == WAVE_FORMAT_PCM
                && wave_format_tag(&new.format) == WAVE_FORMAT_PCM;
            let formats_match = if pcm_pair {
                let n = PCMWAVEFORMAT_LEN.min(old.format.len()).min(new.format.len());
                old.format[..n] == new.format[..n]
            } else {
                old.format == new.format
            };
            if !formats_match {
                return Err(ParseError::structure(
                    0,
                    "cannot append segment: different data formats",
                ));
            }
        }

        // accept the segment; merge stream by stream
        for (old, mut new) in self.streams.iter_mut().zip(parsed.streams.into_iter()) {
            old.header.length = old.header.length.wrapping_add(new.header.length);
            if new.header.suggested_buffer_size > old.header.suggested_buffer_size {
                old.header.suggested_buffer_size = new.header.suggested_buffer_size;
            }
            old.total_bytes += new.total_bytes;
            old.frame_count += new.frame_count;
            old.length += new.length;

            // Historical quirk, preserved bit-for-bit: every re-added
            // entry's stored size is XORed with bit 31 and the re-add
            // decodes the flipped bit as the keyframe flag, so the two
            // cancel out.
            let old_entries = old.index.take_index2();
            old.index.clear();
            for e in old_entries {
                let flipped = e.size ^ NOT_KEYFRAME_FLAG;
                old.index.add(
                    e.ckid,
                    e.pos,
                    flipped & SIZE_MASK,
                    flipped & NOT_KEYFRAME_FLAG != 0,
                );
            }
            for e in new.index.take_index2() {
                let flipped = e.size ^ NOT_KEYFRAME_FLAG;
                old.index.add(
                    e.ckid,
                    e.pos,
                    flipped & SIZE_MASK,
                    flipped & NOT_KEYFRAME_FLAG != 0,
                );
            }
            old.index.materialize_index2();
            old.reinit_read_state();
        }

        self.sources.push(source);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw reads
    // ------------------------------------------------------------------

    fn read_data(&mut self, position: i64, buf: &mut [u8]) -> Result<usize> {
        let file = (position >> 48) as usize;
        if self.current_file != file as i64 {
            self.current_file = file as i64;
        }
        let src = self
            .sources
            .get_mut(file)
            .ok_or_else(|| ParseError::structure(0, "index references unknown file"))?;
        src.seek((position & POSITION_MASK) as u64)?;
        src.read(buf)
    }

    // ------------------------------------------------------------------
    // Streaming driver
    // ------------------------------------------------------------------

    fn stream_ptr(&self) -> i64 {
        self.stream_position + self.sb_position as i64
    }

    fn enable_streaming(&mut self, stream: usize) {
        if self.streams_active == 0 {
            self.stream_buffer = Some(vec![0u8; STREAM_SIZE]);
            self.stream_position = -1;
            self.sb_position = 0;
            self.sb_size = 0;
        }
        self.streams_active |= 1 << stream;
        self.n_active_streamers += 1;
    }

    fn disable_streaming(&mut self, stream: usize) {
        self.streams_active &= !(1 << stream);
        if self.streams_active == 0 {
            self.stream_buffer = None;
        }
        self.n_active_streamers = self.n_active_streamers.saturating_sub(1);
    }

    fn adjust_real_time(&mut self, increase: bool) {
        if increase {
            self.n_real_time += 1;
        } else {
            self.n_real_time = self.n_real_time.saturating_sub(1);
        }
    }

    /// Refills the stream buffer as needed and hands out up to `want`
    /// buffered bytes as a range into the buffer.
    fn stream_read(&mut self, want: usize) -> Result<Option<std::ops::Range<usize>>> {
        let file = (self.stream_position >> 48) as usize;
        if self.current_file != file as i64 {
            self.current_file = file as i64;
        }
        let file_size = match self.sources.get(file) {
            Some(s) => s.size() as i64,
            None => return Ok(None),
        };

        if self.sb_position >= self.sb_size {
            let low_pos = self.stream_position & POSITION_MASK;
            let near_eof =
                ((low_pos + self.sb_size as i64) & !(STREAM_BLOCK_SIZE - 1)) + STREAM_SIZE as i64
                    > file_size;
            if self.n_real_time > 0 || near_eof {
                self.stream_position += self.sb_size as i64;
                self.sb_position = 0;
                let target = (self.stream_position & POSITION_MASK) as u64;
                let src = &mut self.sources[file];
                src.seek(target)?;
                let buf = self.stream_buffer.as_mut().unwrap();
                self.sb_size = src.read(&mut buf[..STREAM_RT_SIZE])?;
            } else {
                self.stream_position += self.sb_size as i64;
                self.sb_position = (self.stream_position & (STREAM_BLOCK_SIZE - 1)) as usize;
                self.stream_position &= !(STREAM_BLOCK_SIZE - 1);
                let target = (self.stream_position & POSITION_MASK) as u64;
                let src = &mut self.sources[file];
                src.seek(target)?;
                let buf = self.stream_buffer.as_mut().unwrap();
                self.sb_size = src.read(&mut buf[..STREAM_SIZE])?;
            }
        }

        if self.sb_position >= self.sb_size {
            return Ok(None);
        }
        let take = want.min(self.sb_size - self.sb_position);
        self.sb_position += take;
        Ok(Some(self.sb_position - take..self.sb_position))
    }

    /// Walks the file forward from the streaming cursor, pushing every
    /// recognized chunk into the cache of the stream that owns it. Returns
    /// true while progress toward `pos` is being made.
    fn drive_streaming(&mut self, pusher: usize, pos: i64) -> Result<bool> {
        // aggressively recovered files are never streamed
        if self.file_damaged {
            return Ok(false);
        }
        if self.stream_buffer.is_none() {
            return Ok(false);
        }

        if self.stream_position == -1 {
            self.stream_position = pos;
            self.sb_position = 0;
        }
        if pos < self.stream_ptr() {
            return Ok(false);
        }
        // more than 4 MiB past the current position: reseek
        if pos > self.stream_ptr() + STREAM_WINDOW {
            self.stream_position = pos;
            self.sb_size = 0;
            self.sb_position = 0;
        }

        self.streams[pusher].stream_pushes += 1;
        self.streams[pusher].stream_push_pos = pos;

        let mut read_something = false;

        while pos >= self.stream_ptr() {
            // chunk header, possibly split across refills
            let mut hdr = [0u8; 8];
            let mut got = 0usize;
            while got < 8 {
                match self.stream_read(8 - got)? {
                    Some(range) => {
                        let taken = range.len();
                        let buf = self.stream_buffer.as_ref().unwrap();
                        hdr[got..got + taken].copy_from_slice(&buf[range]);
                        got += taken;
                    }
                    None => return Ok(read_something),
                }
            }

            let fcc = FourCc(get_u32_le(&hdr));
            let len = get_u32_le(&hdr[4..]);
            let stream_no = fcc.stream_number();

            let owned = stream_no
                .map(|n| n < 32 && self.streams_active & (1 << n) != 0)
                .unwrap_or(false);

            if owned {
                let stream_no = stream_no.unwrap();
                let chunk_size = len + (len & 1);

                if chunk_size >= DAMAGE_SENTINEL {
                    warn!(
                        position = self.stream_ptr() - 8,
                        "invalid block found; disabling streaming"
                    );
                    self.file_damaged = true;
                    self.stream_position = -1;
                    self.sb_position = 0;
                    self.sb_size = 0;
                    return Ok(false);
                }

                let block_pos = self.stream_ptr();
                let writing = match self.streams[stream_no].cache.as_mut() {
                    Some(cache) => cache.write_begin(block_pos, chunk_size as usize),
                    None => false,
                };

                let mut left = chunk_size as usize;
                while left > 0 {
                    match self.stream_read(left)? {
                        Some(range) => {
                            let taken = range.len();
                            if writing {
                                let data = &self.stream_buffer.as_ref().unwrap()[range];
                                self.streams[stream_no].cache.as_mut().unwrap().write(data);
                            }
                            left -= taken;
                        }
                        None => {
                            if writing {
                                self.streams[stream_no].cache.as_mut().unwrap().write_end();
                            }
                            return Ok(read_something);
                        }
                    }
                }
                if writing {
                    self.streams[stream_no].cache.as_mut().unwrap().write_end();
                }
                read_something = true;
            } else if fcc != fourcc::LIST && fcc != fourcc::RIFF {
                let chunk_size = len + (len & 1);

                if chunk_size >= DAMAGE_SENTINEL {
                    self.file_damaged = true;
                    self.stream_position = -1;
                    self.sb_position = 0;
                    self.sb_size = 0;
                    return Ok(false);
                }

                // an overly large foreign chunk would stall streaming;
                // force a resynchronization instead
                if chunk_size > OVERSIZE_SKIP {
                    self.stream_position += chunk_size as i64;
                    self.sb_position = 0;
                    self.sb_size = 0;
                    return Ok(read_something);
                }

                let mut left = chunk_size as usize;
                while left > 0 {
                    match self.stream_read(left)? {
                        Some(range) => left -= range.len(),
                        None => return Ok(read_something),
                    }
                }
            } else {
                // descend into the container: consume the subtype only
                let mut left = 4usize;
                while left > 0 {
                    match self.stream_read(left)? {
                        Some(range) => left -= range.len(),
                        None => return Ok(read_something),
                    }
                }
            }
        }

        Ok(true)
    }

    /// A cached read: cache lookup, cooperative fill, then the direct-read
    /// fallback with miss accounting.
    fn read_block(&mut self, stream: usize, chunk_pos: i64, pos: i64, out: &mut [u8]) -> Result<usize> {
        loop {
            match self.streams[stream].cache.as_mut() {
                Some(cache) => {
                    if let Some(n) = cache.read(out, pos) {
                        self.streams[stream].stream_bytes += n as i64;
                        return Ok(n);
                    }
                }
                None => break,
            }
            if self.stream_ptr() > chunk_pos {
                break;
            }
            if !self.drive_streaming(stream, chunk_pos)? {
                break;
            }
        }

        if let Some(cache) = self.streams[stream].cache.as_mut() {
            cache.note_miss(out.len());
        }
        self.read_data(pos, out)
    }

    // ------------------------------------------------------------------
    // Stream reads
    // ------------------------------------------------------------------

    /// Latches real-time mode for slow consumers and arms streaming
    /// detection. `rate` is per-mille of normal speed; at or below 1500 the
    /// consumer is considered real-time.
    pub fn begin_streaming(&mut self, stream: usize, _start: i64, _end: i64, rate: i64) {
        if self.streams[stream].streaming_enabled {
            return;
        }
        if rate <= 1500 {
            self.adjust_real_time(true);
            self.streams[stream].real_time = true;
        } else {
            self.streams[stream].real_time = false;
        }
        if self.disable_fast_io {
            return;
        }

        let s = &mut self.streams[stream];
        if s.streaming_count == 0 {
            s.stream_bytes = 0;
            s.stream_pushes = 0;
            s.stream_push_pos = 0;
        }
        s.streaming_count += 1;
        s.streaming_enabled = true;
        s.streaming_active = false;
        s.stream_track_count = 0;
        s.stream_track_value = -1;
        s.stream_track_interval = -1;
    }

    pub fn end_streaming(&mut self, stream: usize) {
        if !self.streams[stream].streaming_enabled {
            return;
        }
        if self.streams[stream].real_time {
            self.adjust_real_time(false);
        }
        if self.streams[stream].streaming_active {
            self.disable_streaming(stream);
        }
        let s = &mut self.streams[stream];
        s.streaming_enabled = false;
        s.streaming_active = false;
        s.streaming_count -= 1;
        if s.streaming_count == 0 {
            s.cache = None;
        }
    }

    pub fn is_keyframe(&self, stream: usize, frame: i64) -> bool {
        let s = &self.streams[stream];
        if s.sample_size() != 0 {
            return true;
        }
        if frame < 0 || frame >= s.length {
            return false;
        }
        s.index.entries()[frame as usize].is_keyframe()
    }

    pub fn prev_keyframe(&self, stream: usize, frame: i64) -> i64 {
        let s = &self.streams[stream];
        if s.sample_size() != 0 {
            return if frame > 0 { frame - 1 } else { -1 };
        }
        if frame < 0 {
            return -1;
        }
        let mut frame = frame.min(s.length);
        loop {
            frame -= 1;
            if frame <= 0 {
                return -1;
            }
            if s.index.entries()[frame as usize].is_keyframe() {
                return frame;
            }
        }
    }

    pub fn next_keyframe(&self, stream: usize, frame: i64) -> i64 {
        let s = &self.streams[stream];
        if s.sample_size() != 0 {
            return if frame < s.length { frame + 1 } else { -1 };
        }
        if frame < 0 {
            return 0;
        }
        if frame >= s.length {
            return -1;
        }
        let mut frame = frame;
        while frame + 1 < s.length {
            frame += 1;
            if s.index.entries()[frame as usize].is_keyframe() {
                return frame;
            }
        }
        -1
    }

    pub fn nearest_keyframe(&self, stream: usize, frame: i64) -> i64 {
        let s = &self.streams[stream];
        if s.sample_size() != 0 {
            return frame;
        }
        if self.is_keyframe(stream, frame) {
            return frame;
        }
        let prev = self.prev_keyframe(stream, frame);
        if prev < 0 {
            0
        } else {
            prev
        }
    }

    /// Reads `count` samples (blocked streams) or one frame (discrete
    /// streams) starting at `start`. Streaming detection runs inside.
    pub fn read(&mut self, stream: usize, start: i64, count: i64) -> Result<StreamReadResult> {
        let length = self.streams[stream].length;
        if start < 0 || start >= length || count <= 0 {
            return Ok(StreamReadResult {
                data: Vec::new(),
                samples: 0,
            });
        }

        let sample_size = self.streams[stream].sample_size() as i64;
        let result = if sample_size != 0 {
            self.read_blocked(stream, start, count, sample_size)?
        } else {
            self.read_discrete(stream, start)?
        };

        // high cache-miss rate remediation
        let needs_fixing = match self.streams[stream].cache.as_ref() {
            Some(cache) => {
                self.streams[stream].streaming_active
                    && cache.cache_miss_bytes * 2 > cache.cache_hit_bytes
                    && cache.reads > REMEDIATION_MIN_READS
            }
            None => false,
        };
        if needs_fixing {
            self.fix_cache_problems(stream);
            self.streams[stream].stream_track_count = 0;
        }

        Ok(result)
    }

    fn detect_streaming_blocked(&mut self, stream: usize, start: i64, first_chunk_pos: i64) {
        if !self.streams[stream].streaming_enabled {
            return;
        }
        if start == self.streams[stream].stream_track_value {
            self.streams[stream].stream_track_count += 1;
            if self.streams[stream].stream_track_count >= STREAM_DETECT_READS {
                self.activate_streaming(stream, first_chunk_pos, CACHE_LINES_AUDIO);
            }
        } else {
            self.streams[stream].stream_track_count = 0;
            if self.streams[stream].streaming_active {
                self.streams[stream].streaming_active = false;
                self.disable_streaming(stream);
            }
        }
    }

    fn detect_streaming_discrete(&mut self, stream: usize, start: i64, chunk_pos: i64) {
        if !self.streams[stream].streaming_enabled
            || start == self.streams[stream].stream_track_value
        {
            return;
        }
        let value = self.streams[stream].stream_track_value;
        let interval = self.streams[stream].stream_track_interval;
        if value >= 0 && start - value == interval {
            self.streams[stream].stream_track_count += 1;
            if self.streams[stream].stream_track_count >= STREAM_DETECT_READS {
                self.activate_streaming(stream, chunk_pos, CACHE_LINES_VIDEO);
            }
        } else {
            self.streams[stream].stream_track_count = 0;
            self.streams[stream].stream_track_interval = if value >= 0 && start > value {
                start - value
            } else {
                -1
            };
            if self.streams[stream].streaming_active {
                self.streams[stream].streaming_active = false;
                self.disable_streaming(stream);
            }
        }
        self.streams[stream].stream_track_value = start;
    }

    fn activate_streaming(&mut self, stream: usize, target_pos: i64, cache_lines: usize) {
        let streamptr = if self.stream_buffer.is_some() {
            self.stream_ptr()
        } else {
            -1
        };
        let fptrdiff = streamptr - target_pos;
        if !self.is_streaming() || streamptr < 0 || fptrdiff.abs() < STREAM_WINDOW {
            match self.streams[stream].cache.as_mut() {
                Some(cache) => cache.reset_statistics(),
                None => self.streams[stream].cache = Some(AviReadCache::new(cache_lines)),
            }
            if !self.streams[stream].streaming_active {
                self.streams[stream].streaming_active = true;
                self.enable_streaming(stream);
            }
        }
    }

    fn read_blocked(
        &mut self,
        stream: usize,
        start: i64,
        mut samples: i64,
        sample_size: i64,
    ) -> Result<StreamReadResult> {
        let length = self.streams[stream].length;
        let mut byte_off = start * sample_size;

        // resume from the cached walk position when reading forward
        let (mut entry_idx, mut block_pos) = {
            let s = &self.streams[stream];
            if byte_off >= s.cached_position {
                (s.cached_entry, s.cached_position)
            } else {
                (0, 0)
            }
        };
        byte_off -= block_pos;

        loop {
            let entry = self.streams[stream].index.entries()[entry_idx];
            let size = entry.payload_size() as i64;
            if byte_off < size {
                break;
            }
            byte_off -= size;
            block_pos += size;
            entry_idx += 1;
        }
        self.streams[stream].cached_entry = entry_idx;
        self.streams[stream].cached_position = block_pos;

        if start + samples > length {
            samples = length - start;
        }
        let mut bytecnt = samples * sample_size;
        let mut data = vec![0u8; bytecnt as usize];
        let mut actual_bytes = 0usize;

        let first_entry = self.streams[stream].index.entries()[entry_idx];
        self.detect_streaming_blocked(stream, start, first_entry.pos);

        let mut write_at = 0usize;
        while bytecnt > 0 {
            let entry = self.streams[stream].index.entries()[entry_idx];
            let mut tc = entry.payload_size() as i64 - byte_off;
            if tc > bytecnt {
                tc = bytecnt;
            }

            let use_cache = self.streams[stream].streaming_active
                && self.streams[stream]
                    .cache
                    .as_ref()
                    .map(|c| (tc as usize) < c.max_read())
                    .unwrap_or(false);

            let read_pos = entry.pos + byte_off + 8;
            let n = if use_cache {
                if let Some(c) = self.streams[stream].cache.as_mut() {
                    c.reads += 1;
                }
                self.read_block(stream, entry.pos, read_pos, &mut data[write_at..write_at + tc as usize])?
            } else {
                self.read_data(read_pos, &mut data[write_at..write_at + tc as usize])?
            };

            actual_bytes += n;
            entry_idx += 1;
            byte_off = 0;

            if (n as i64) < tc {
                break;
            }
            bytecnt -= tc;
            write_at += tc as usize;
        }

        if (actual_bytes as i64) < sample_size {
            return Err(ParseError::eof(0));
        }
        let actual_bytes = actual_bytes - actual_bytes % sample_size as usize;
        data.truncate(actual_bytes);
        let samples_read = actual_bytes as i64 / sample_size;

        self.streams[stream].stream_track_value = start + samples_read;

        Ok(StreamReadResult {
            data,
            samples: samples_read,
        })
    }

    fn read_discrete(&mut self, stream: usize, start: i64) -> Result<StreamReadResult> {
        let entry = self.streams[stream].index.entries()[start as usize];
        let size = entry.payload_size() as usize;

        self.detect_streaming_discrete(stream, start, entry.pos);

        let mut data = vec![0u8; size];
        let use_cache = self.streams[stream].streaming_active
            && self.streams[stream]
                .cache
                .as_ref()
                .map(|c| size < c.max_read())
                .unwrap_or(false);

        let n = if use_cache {
            if let Some(c) = self.streams[stream].cache.as_mut() {
                c.reads += 1;
            }
            self.read_block(stream, entry.pos, entry.pos + 8, &mut data)?
        } else {
            self.read_data(entry.pos + 8, &mut data)?
        };

        if n != size {
            return Err(ParseError::eof((entry.pos + 8) as u64));
        }

        Ok(StreamReadResult { data, samples: 1 })
    }

    /// Cache-miss remediation: tear down a puny stream leader running far
    /// ahead, or disable the aggrieved stream's own streaming.
    fn fix_cache_problems(&mut self, aggrieved: usize) {
        let mut leader: Option<usize> = None;
        for (i, s) in self.streams.iter().enumerate() {
            if s.cache.is_some()
                && leader
                    .map(|l| s.stream_pushes > self.streams[l].stream_pushes)
                    .unwrap_or(true)
            {
                leader = Some(i);
            }
        }

        let tear_down_leader = leader
            .map(|l| {
                self.streams[l].stream_bytes * 2 < self.streams[aggrieved].stream_bytes
                    && self.streams[l].stream_push_pos
                        >= self.streams[aggrieved].stream_push_pos + LEADER_MIN_AHEAD
            })
            .unwrap_or(false);

        if tear_down_leader {
            let l = leader.unwrap();
            debug!(stream = l, "disabling cache on fast puny stream leader");
            self.streams[l].cache = None;
            self.disable_streaming(l);
            self.stream_position = -1;
            self.sb_position = 0;
            self.sb_size = 0;
        } else {
            debug!(stream = aggrieved, "disabling streaming at client request");
            self.end_streaming(aggrieved);
            if Some(aggrieved) == leader {
                self.stream_position = -1;
                self.sb_position = 0;
                self.sb_size = 0;
            }
        }

        for s in self.streams.iter_mut() {
            if let Some(cache) = s.cache.as_mut() {
                cache.reset_statistics();
            }
        }
    }
}

enum StrlOutcome {
    Plain,
    HyperIndexed,
    IndexDamaged,
}

// JSON identification helper
pub fn avi_probe(path: &str) -> std::result::Result<serde_json::Value, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("Open error: {}", e))?;
    let source = ByteSource::new(file).map_err(|e| format!("Open error: {}", e))?;
    let reader = AviReader::open(source).map_err(|e| e.to_string())?;
    let infos: Vec<AviStreamInfo> = (0..reader.stream_count())
        .map(|i| reader.stream_info(i))
        .collect();
    serde_json::to_value(serde_json::json!({
        "streams": infos,
        "index_fabricated": reader.is_index_fabricated(),
        "damaged": reader.is_damaged(),
    }))
    .map_err(|e| format!("JSON error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chunk(fcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut v = fcc.to_vec();
        v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        v.extend_from_slice(payload);
        if payload.len() % 2 == 1 {
            v.push(0);
        }
        v
    }

    fn list(subtype: &[u8; 4], children: &[u8]) -> Vec<u8> {
        let mut payload = subtype.to_vec();
        payload.extend_from_slice(children);
        chunk(b"LIST", &payload)
    }

    fn avih_payload(streams: u32) -> Vec<u8> {
        let mut v = Vec::new();
        for dw in [40_000u32, 0, 0, 0, 0, 0, streams, 0, 320, 240, 0, 0, 0, 0] {
            v.extend_from_slice(&dw.to_le_bytes());
        }
        v
    }

    fn strh_payload(
        fcc_type: &[u8; 4],
        handler: &[u8; 4],
        scale: u32,
        rate: u32,
        length: u32,
        sample_size: u32,
    ) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(fcc_type);
        v.extend_from_slice(handler);
        for dw in [0u32, 0] {
            v.extend_from_slice(&dw.to_le_bytes()); // flags, priority+language
        }
        for dw in [0u32, scale, rate, 0, length, 0, 0, sample_size] {
            v.extend_from_slice(&dw.to_le_bytes());
        }
        v.extend_from_slice(&[0u8; 8]); // rcFrame shorts
        v
    }

    fn strf_video(compression: &[u8; 4]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&40u32.to_le_bytes());
        v.extend_from_slice(&320u32.to_le_bytes());
        v.extend_from_slice(&240u32.to_le_bytes());
        v.extend_from_slice(&1u16.to_le_bytes());
        v.extend_from_slice(&24u16.to_le_bytes());
        v.extend_from_slice(compression);
        v.extend_from_slice(&[0u8; 20]);
        v
    }

    fn strf_audio(tag: u16, block_align: u16, avg_bps: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&tag.to_le_bytes());
        v.extend_from_slice(&2u16.to_le_bytes()); // channels
        v.extend_from_slice(&44100u32.to_le_bytes());
        v.extend_from_slice(&avg_bps.to_le_bytes());
        v.extend_from_slice(&block_align.to_le_bytes());
        v.extend_from_slice(&16u16.to_le_bytes());
        v
    }

    struct MoviChunk {
        fcc: [u8; 4],
        payload: Vec<u8>,
        keyframe: bool,
    }

    struct BuiltAvi {
        bytes: Vec<u8>,
        chunk_positions: Vec<u32>,
        movi_pos: u32,
    }

    fn build_avi(strls: Vec<Vec<u8>>, movi: &[MoviChunk], idx1: Idx1Mode) -> BuiltAvi {
        let mut hdrl_children = chunk(b"avih", &avih_payload(strls.len() as u32));
        for strl_children in &strls {
            hdrl_children.extend_from_slice(&list(b"strl", strl_children));
        }
        let hdrl = list(b"hdrl", &hdrl_children);

        // positions: RIFF header (12) + hdrl + "LIST" size "movi" (12)
        let movi_base = 12 + hdrl.len() as u32 + 12;
        let mut movi_children = Vec::new();
        let mut chunk_positions = Vec::new();
        for c in movi {
            chunk_positions.push(movi_base + movi_children.len() as u32);
            movi_children.extend_from_slice(&chunk(&c.fcc, &c.payload));
        }
        let movi_list = list(b"movi", &movi_children);

        let mut body = hdrl;
        body.extend_from_slice(&movi_list);

        match idx1 {
            Idx1Mode::None => {}
            Idx1Mode::Absolute | Idx1Mode::Relative => {
                let mut idx_payload = Vec::new();
                for (i, c) in movi.iter().enumerate() {
                    let offset = match idx1 {
                        Idx1Mode::Absolute => chunk_positions[i],
                        _ => chunk_positions[i] - (movi_base - 4),
                    };
                    idx_payload.extend_from_slice(&c.fcc);
                    let flags: u32 = if c.keyframe { AVIIF_KEYFRAME } else { 0 };
                    idx_payload.extend_from_slice(&flags.to_le_bytes());
                    idx_payload.extend_from_slice(&offset.to_le_bytes());
                    idx_payload.extend_from_slice(&(c.payload.len() as u32).to_le_bytes());
                }
                body.extend_from_slice(&chunk(b"idx1", &idx_payload));
            }
        }

        let mut file = b"RIFF".to_vec();
        file.extend_from_slice(&(body.len() as u32 + 4).to_le_bytes());
        file.extend_from_slice(b"AVI ");
        file.extend_from_slice(&body);

        BuiltAvi {
            bytes: file,
            chunk_positions,
            movi_pos: movi_base,
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Idx1Mode {
        None,
        Absolute,
        Relative,
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    fn video_strl(compression: &[u8; 4], frames: u32) -> Vec<u8> {
        let mut v = chunk(b"strh", &strh_payload(b"vids", compression, 1, 25, frames, 0));
        v.extend_from_slice(&chunk(b"strf", &strf_video(compression)));
        v
    }

    fn audio_strl(tag: u16, block_align: u16, avg_bps: u32) -> Vec<u8> {
        let mut v = chunk(b"strh", &strh_payload(b"auds", b"\0\0\0\0", 1, 44100, 0, block_align as u32));
        v.extend_from_slice(&chunk(b"strf", &strf_audio(tag, block_align, avg_bps)));
        v
    }

    fn open_avi(bytes: Vec<u8>) -> AviReader<Cursor<Vec<u8>>> {
        let src = ByteSource::new(Cursor::new(bytes)).unwrap();
        AviReader::open(src).unwrap()
    }

    #[test]
    fn trivial_mjpeg_with_idx1() {
        let movi: Vec<MoviChunk> = (0..3)
            .map(|i| MoviChunk {
                fcc: *b"00dc",
                payload: pattern(100, i as u8),
                keyframe: i == 2,
            })
            .collect();
        let built = build_avi(vec![video_strl(b"MJPG", 3)], &movi, Idx1Mode::Absolute);
        let mut reader = open_avi(built.bytes);

        assert_eq!(reader.stream_count(), 1);
        assert!(!reader.is_index_fabricated());
        let s = reader.stream(0);
        assert!(s.keyframe_only);
        assert_eq!(s.frame_count, 3);
        assert_eq!(s.length, 3);
        assert_eq!(s.total_bytes, 300);
        assert_eq!(s.index.entries().len(), 3);
        for (i, e) in s.index.entries().iter().enumerate() {
            assert_eq!(e.pos, built.chunk_positions[i] as i64);
            assert_eq!(e.is_keyframe(), i == 2);
        }

        // sample size must have been cleared for video
        assert_eq!(reader.stream(0).header.sample_size, 0);

        let r = reader.read(0, 1, 1).unwrap();
        assert_eq!(r.samples, 1);
        assert_eq!(r.data, pattern(100, 1));
        assert!(!reader.is_keyframe(0, 1));
        assert!(reader.is_keyframe(0, 2));
        assert_eq!(reader.prev_keyframe(0, 2), -1);
        assert_eq!(reader.next_keyframe(0, 0), 2);
        assert_eq!(reader.nearest_keyframe(0, 1), 0);
    }

    #[test]
    fn relative_idx1_offsets_are_rebased() {
        let movi: Vec<MoviChunk> = (0..2)
            .map(|i| MoviChunk {
                fcc: *b"00dc",
                payload: pattern(64, i as u8),
                keyframe: true,
            })
            .collect();
        let built = build_avi(vec![video_strl(b"xvid", 2)], &movi, Idx1Mode::Relative);
        let reader = open_avi(built.bytes);

        let entries = reader.stream(0).index.entries();
        assert_eq!(entries[0].pos, built.chunk_positions[0] as i64);
        assert_eq!(entries[1].pos, built.chunk_positions[1] as i64);
    }

    #[test]
    fn missing_index_triggers_file_scan() {
        let movi = vec![
            MoviChunk { fcc: *b"00dc", payload: pattern(64, 0), keyframe: false },
            MoviChunk { fcc: *b"01wb", payload: pattern(32, 1), keyframe: false },
            MoviChunk { fcc: *b"00dc", payload: pattern(64, 2), keyframe: false },
            MoviChunk { fcc: *b"01wb", payload: pattern(16, 3), keyframe: false },
        ];
        let built = build_avi(
            vec![video_strl(b"xvid", 2), audio_strl(WAVE_FORMAT_PCM, 1, 44100)],
            &movi,
            Idx1Mode::None,
        );
        let mut reader = open_avi(built.bytes);

        assert!(reader.is_index_fabricated());
        assert_eq!(reader.stream_count(), 2);

        let video = reader.stream(0);
        assert_eq!(video.frame_count, 2);
        // only the first scanned chunk gets the keyframe flag
        assert!(video.index.entries()[0].is_keyframe());
        assert!(!video.index.entries()[1].is_keyframe());

        let audio = reader.stream(1);
        assert_eq!(audio.total_bytes, 48);
        assert_eq!(audio.length, 48); // sample_size 1

        // audio read spans both chunks
        let r = reader.read(1, 0, 48).unwrap();
        assert_eq!(r.samples, 48);
        assert_eq!(&r.data[..32], &pattern(32, 1)[..]);
        assert_eq!(&r.data[32..], &pattern(16, 3)[..]);

        // the first video frame in file order reads back intact
        let v = reader.read(0, 0, 1).unwrap();
        assert_eq!(v.data, pattern(64, 0));
    }

    #[test]
    fn zero_size_movi_reindexes_without_error() {
        let movi = vec![
            MoviChunk { fcc: *b"00dc", payload: pattern(64, 0), keyframe: false },
            MoviChunk { fcc: *b"00dc", payload: pattern(64, 1), keyframe: false },
        ];
        let built = build_avi(vec![video_strl(b"xvid", 2)], &movi, Idx1Mode::None);

        // corrupt the LIST/movi size field to zero (unclosed writer)
        let mut bytes = built.bytes;
        let movi_list_at = built.movi_pos as usize - 12;
        assert_eq!(&bytes[movi_list_at..movi_list_at + 4], b"LIST");
        bytes[movi_list_at + 4..movi_list_at + 8].copy_from_slice(&0u32.to_le_bytes());

        let reader = open_avi(bytes);
        assert!(reader.is_index_fabricated());
        assert_eq!(reader.stream(0).frame_count, 2);
    }

    #[test]
    fn empty_idx1_falls_back_to_scan() {
        let movi = vec![MoviChunk { fcc: *b"00dc", payload: pattern(64, 0), keyframe: false }];
        let mut built = build_avi(vec![video_strl(b"xvid", 1)], &movi, Idx1Mode::None);
        // append an empty idx1
        built.bytes.extend_from_slice(&chunk(b"idx1", &[]));
        let len = built.bytes.len() as u32 - 8;
        built.bytes[4..8].copy_from_slice(&len.to_le_bytes());

        let reader = open_avi(built.bytes);
        assert!(reader.is_index_fabricated());
        assert_eq!(reader.stream(0).frame_count, 1);
    }

    #[test]
    fn runt_audio_chunks_reclassify_as_vbr() {
        let movi = vec![
            MoviChunk { fcc: *b"00wb", payload: pattern(100, 0), keyframe: true },
            MoviChunk { fcc: *b"00wb", payload: pattern(200, 1), keyframe: true },
            MoviChunk { fcc: *b"00wb", payload: pattern(1152, 2), keyframe: true },
        ];
        let built = build_avi(
            vec![audio_strl(WAVE_FORMAT_MP3, 1152, 16000)],
            &movi,
            Idx1Mode::Absolute,
        );
        let reader = open_avi(built.bytes);

        let s = reader.stream(0);
        assert!(s.was_vbr);
        // the Nandub 1152 is undone for MP3: block align forced to 1
        assert_eq!(wave_block_align(&s.format), 1);
        assert_eq!(s.header.sample_size, 1);
        assert_eq!(s.header.scale, 1);
        let stats = s.vbr.unwrap();
        assert!(stats.bitrate_mean > 0.0);
        assert_eq!(s.length, s.total_bytes);
    }

    #[test]
    fn append_merges_streams_and_tags_file_numbers() {
        let make = |seed: u8| {
            let movi: Vec<MoviChunk> = (0..3)
                .map(|i| MoviChunk {
                    fcc: *b"00dc",
                    payload: pattern(80, seed + i as u8),
                    keyframe: i == 0,
                })
                .collect();
            build_avi(vec![video_strl(b"xvid", 3)], &movi, Idx1Mode::Absolute)
        };

        let first = make(0);
        let second = make(100);
        let mut reader = open_avi(first.bytes);
        let src2 = ByteSource::new(Cursor::new(second.bytes)).unwrap();
        reader.append(src2).unwrap();

        let s = reader.stream(0);
        assert_eq!(s.frame_count, 6);
        assert_eq!(s.total_bytes, 6 * 80);
        let entries = s.index.entries();
        // keyframe flags survive the merge quirk bit-for-bit
        assert!(entries[0].is_keyframe());
        assert!(!entries[1].is_keyframe());
        assert!(entries[3].is_keyframe());
        assert_eq!(entries[0].file_number(), 0);
        assert_eq!(entries[3].file_number(), 1);
        assert_eq!(entries[3].file_offset(), second.chunk_positions[0] as i64);

        // reads dispatch to the second backing file
        let r = reader.read(0, 4, 1).unwrap();
        assert_eq!(r.data, pattern(80, 101));
    }

    #[test]
    fn append_rejects_mismatched_formats() {
        let movi = vec![MoviChunk { fcc: *b"00dc", payload: pattern(10, 0), keyframe: true }];
        let a = build_avi(vec![video_strl(b"xvid", 1)], &movi, Idx1Mode::Absolute);
        let b = build_avi(vec![video_strl(b"MJPG", 1)], &movi, Idx1Mode::Absolute);
        let mut reader = open_avi(a.bytes);
        let err = reader
            .append(ByteSource::new(Cursor::new(b.bytes)).unwrap())
            .unwrap_err();
        assert!(err.detail.contains("data formats"));
    }

    #[test]
    fn opendml_hierarchical_index() {
        // two passes: learn where the ix00 chunk lands, then patch the
        // super-index entry
        let build = |ix_pos: u64| -> (Vec<u8>, Vec<u32>, u32) {
            let movi: Vec<MoviChunk> = (0..2)
                .map(|i| MoviChunk {
                    fcc: *b"00dc",
                    payload: pattern(48, i as u8),
                    keyframe: true,
                })
                .collect();

            // the std index is patched after positions are known
            let mut std_index = Vec::new();
            std_index.extend_from_slice(&2u16.to_le_bytes()); // wLongsPerEntry
            std_index.push(0); // bIndexSubType
            std_index.push(1); // bIndexType: index of chunks
            std_index.extend_from_slice(&2u32.to_le_bytes()); // nEntriesInUse
            std_index.extend_from_slice(b"00dc");
            std_index.extend_from_slice(&0u64.to_le_bytes()); // qwBaseOffset (patched)
            std_index.extend_from_slice(&0u32.to_le_bytes()); // reserved
            std_index.extend_from_slice(&[0u8; 16]); // entries (patched)

            let mut super_index = Vec::new();
            super_index.extend_from_slice(&4u16.to_le_bytes());
            super_index.push(0);
            super_index.push(0); // index of indexes
            super_index.extend_from_slice(&1u32.to_le_bytes());
            super_index.extend_from_slice(b"00dc");
            super_index.extend_from_slice(&[0u8; 12]); // reserved
            super_index.extend_from_slice(&ix_pos.to_le_bytes());
            super_index.extend_from_slice(&(std_index.len() as u32 + 8).to_le_bytes());
            super_index.extend_from_slice(&2u32.to_le_bytes()); // duration

            let mut strl = chunk(b"strh", &strh_payload(b"vids", b"xvid", 1, 25, 2, 0));
            strl.extend_from_slice(&chunk(b"strf", &strf_video(b"xvid")));
            strl.extend_from_slice(&chunk(b"indx", &super_index));

            let built = build_avi(vec![strl], &movi, Idx1Mode::None);
            let ix_chunk_pos = built.bytes.len() as u32;
            let mut bytes = built.bytes;

            // patch the std index: base = movi base, offsets point past the
            // chunk headers
            let base = built.movi_pos as u64;
            std_index[12..20].copy_from_slice(&base.to_le_bytes());
            for (i, cp) in built.chunk_positions.iter().enumerate() {
                let off = cp - built.movi_pos + 8;
                let at = 24 + i * 8;
                std_index[at..at + 4].copy_from_slice(&off.to_le_bytes());
                std_index[at + 4..at + 8]
                    .copy_from_slice(&(48u32 | if i == 1 { NOT_KEYFRAME_FLAG } else { 0 }).to_le_bytes());
            }

            bytes.extend_from_slice(&chunk(b"ix00", &std_index));
            let len = bytes.len() as u32 - 8;
            bytes[4..8].copy_from_slice(&len.to_le_bytes());
            (bytes, built.chunk_positions, ix_chunk_pos)
        };

        let (_, _, ix_pos) = build(0);
        let (bytes, chunk_positions, _) = build(ix_pos as u64);

        let reader = open_avi(bytes);
        assert!(!reader.is_index_fabricated());
        let entries = reader.stream(0).index.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pos, chunk_positions[0] as i64);
        assert_eq!(entries[1].pos, chunk_positions[1] as i64);
        assert!(entries[0].is_keyframe());
        assert!(!entries[1].is_keyframe());
    }

    #[test]
    fn streaming_detection_builds_cache() {
        let frames = 40usize;
        let movi: Vec<MoviChunk> = (0..frames)
            .map(|i| MoviChunk {
                fcc: *b"00dc",
                payload: pattern(64, i as u8),
                keyframe: i == 0,
            })
            .collect();
        let built = build_avi(vec![video_strl(b"xvid", frames as u32)], &movi, Idx1Mode::Absolute);
        let mut reader = open_avi(built.bytes);

        reader.begin_streaming(0, 0, frames as i64, 1000);
        assert!(reader.is_optimized_for_realtime());

        for i in 0..frames {
            let r = reader.read(0, i as i64, 1).unwrap();
            assert_eq!(r.data, pattern(64, i as u8), "frame {}", i);
        }

        // fifteen constant-stride reads later the cache is live
        assert!(reader.streams[0].streaming_active);
        assert!(reader.streams[0].cache.is_some());
        assert!(reader.streams[0].stream_bytes > 0);

        reader.end_streaming(0);
        assert!(reader.streams[0].cache.is_none());
        assert!(!reader.is_optimized_for_realtime());
    }

    #[test]
    fn corrupt_stream_chunk_disables_streaming() {
        let frames = 20usize;
        let movi: Vec<MoviChunk> = (0..frames)
            .map(|i| MoviChunk {
                fcc: *b"00dc",
                payload: pattern(64, i as u8),
                keyframe: i == 0,
            })
            .collect();
        let mut built = build_avi(vec![video_strl(b"xvid", frames as u32)], &movi, Idx1Mode::Absolute);

        // wreck the size field of a late chunk past the sentinel
        let bad = built.chunk_positions[18] as usize;
        built.bytes[bad + 4..bad + 8].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());

        let mut reader = open_avi(built.bytes);
        reader.begin_streaming(0, 0, frames as i64, 1000);
        for i in 0..19 {
            let _ = reader.read(0, i as i64, 1).unwrap();
        }
        assert!(reader.is_damaged());
        // once damaged the reader still serves direct reads
        let r = reader.read(0, 17, 1).unwrap();
        assert_eq!(r.data, pattern(64, 17));
    }
}
