// READER DISPATCH - probe a source, pick the format, deliver frames
//
// The fixed set of input readers behind one facade. Probing is cheap and
// magic-driven where possible (RIFF, pack start code, PG magic), content
// driven for the elementary streams. Frames come out in the order the
// underlying container presents them; per-track reordering to presentation
// order is the consumer's business.

use std::collections::VecDeque;
use std::io::{Read, Seek};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::avc::AvcEsParser;
use crate::avi_reader::AviReader;
use crate::corepano::CorePanoramaReader;
use crate::error::{ParseError, Result};
use crate::fourcc;
use crate::fraction::Fraction;
use crate::m2v::{M2vParser, ParserState};
use crate::mpeg_ps::{MpegPsReader, PsCodec, PsTrackType};
use crate::options::DemuxOptions;
use crate::packet::{AudioParams, Frame, TrackDescriptor, TrackType, VideoParams};
use crate::packetizer::{AvcPacketizer, Mpeg12Packetizer, Packetizer, PassthroughPacketizer};
use crate::pgs::PgsReader;
use crate::io::{get_u32_be, ByteSource};
use crate::start_code::{self, is_start_code};

const READ_SIZE: usize = 1024 * 1024;
const MAX_PROBE_BUFFERS: usize = 50;
const ES_DEFAULT_FRAME_DURATION: i64 = 40_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputFormat {
    Avi,
    MpegPs,
    MpegEs,
    AvcEs,
    Pgs,
    CorePanorama,
}

pub enum MediaReader<R> {
    Avi(AviDispatch<R>),
    MpegPs(PsDispatch<R>),
    MpegEs(MpegEsDispatch<R>),
    AvcEs(AvcEsDispatch<R>),
    Pgs(PgsDispatch<R>),
    CorePanorama(CorePanoramaDispatch),
}

impl<R> std::fmt::Debug for MediaReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Self::Avi(_) => "Avi",
            Self::MpegPs(_) => "MpegPs",
            Self::MpegEs(_) => "MpegEs",
            Self::AvcEs(_) => "AvcEs",
            Self::Pgs(_) => "Pgs",
            Self::CorePanorama(_) => "CorePanorama",
        };
        f.debug_tuple(variant).finish()
    }
}

impl<R: Read + Seek> MediaReader<R> {
    /// Probes the source against every known format and opens the winner.
    pub fn open(mut src: ByteSource<R>, options: &DemuxOptions) -> Result<Self> {
        if AviReader::probe(&mut src) {
            debug!("probe: AVI");
            return Ok(Self::Avi(AviDispatch::new(AviReader::open_with_options(
                src, options,
            )?)));
        }
        if MpegPsReader::probe(&mut src) {
            debug!("probe: MPEG program stream");
            return Ok(Self::MpegPs(PsDispatch::new(
                MpegPsReader::open(src, options)?,
                options,
            )?));
        }
        if PgsReader::probe(&mut src) {
            debug!("probe: PGS");
            return Ok(Self::Pgs(PgsDispatch::new(PgsReader::open(src)?)));
        }
        if let Some(text) = CorePanoramaDispatch::probe(&mut src)? {
            debug!("probe: CorePanorama");
            return Ok(Self::CorePanorama(CorePanoramaDispatch::new(&text)?));
        }
        if MpegEsDispatch::probe(&mut src)? {
            debug!("probe: MPEG elementary stream");
            return Ok(Self::MpegEs(MpegEsDispatch::new(src, options)?));
        }
        if AvcEsDispatch::probe(&mut src, options)? {
            debug!("probe: AVC elementary stream");
            return Ok(Self::AvcEs(AvcEsDispatch::new(src, options)?));
        }
        Err(ParseError::structure(0, "unsupported file type"))
    }

    pub fn format(&self) -> InputFormat {
        match self {
            Self::Avi(_) => InputFormat::Avi,
            Self::MpegPs(_) => InputFormat::MpegPs,
            Self::MpegEs(_) => InputFormat::MpegEs,
            Self::AvcEs(_) => InputFormat::AvcEs,
            Self::Pgs(_) => InputFormat::Pgs,
            Self::CorePanorama(_) => InputFormat::CorePanorama,
        }
    }

    pub fn track_count(&self) -> usize {
        match self {
            Self::Avi(d) => d.reader.stream_count(),
            Self::MpegPs(d) => d.reader.track_count(),
            Self::MpegEs(_) | Self::AvcEs(_) | Self::Pgs(_) | Self::CorePanorama(_) => 1,
        }
    }

    pub fn track_descriptor(&self, track: usize) -> TrackDescriptor {
        match self {
            Self::Avi(d) => d.track_descriptor(track),
            Self::MpegPs(d) => d.track_descriptor(track),
            Self::MpegEs(d) => d.descriptor.clone(),
            Self::AvcEs(d) => d.descriptor.clone(),
            Self::Pgs(_) => TrackDescriptor::subtitle("S_HDMV/PGS"),
            Self::CorePanorama(d) => d.track_descriptor(),
        }
    }

    /// True when parsing had to engage aggressive recovery; the muxer must
    /// not enable streaming-mode optimizations then.
    pub fn file_is_damaged(&self) -> bool {
        match self {
            Self::Avi(d) => d.reader.is_damaged(),
            _ => false,
        }
    }

    /// The next access unit in container order: `(track, frame)`.
    pub fn next_frame(&mut self) -> Result<Option<(usize, Frame)>> {
        match self {
            Self::Avi(d) => d.next_frame(),
            Self::MpegPs(d) => d.next_frame(),
            Self::MpegEs(d) => d.next_frame(),
            Self::AvcEs(d) => d.next_frame(),
            Self::Pgs(d) => d.next_frame(),
            Self::CorePanorama(d) => d.next_frame(),
        }
    }
}

// ============================================================================
// AVI
// ============================================================================

pub struct AviDispatch<R> {
    pub reader: AviReader<R>,
    /// next index entry per stream
    cursors: Vec<usize>,
    /// consumed sample-units per stream (audio)
    sample_positions: Vec<i64>,
}

impl<R: Read + Seek> AviDispatch<R> {
    pub fn new(reader: AviReader<R>) -> Self {
        let n = reader.stream_count();
        Self {
            reader,
            cursors: vec![0; n],
            sample_positions: vec![0; n],
        }
    }

    fn timestamp_base(&self, stream: usize) -> Fraction {
        let header = &self.reader.stream(stream).header;
        Fraction::new(1_000_000_000, 1).mul(Fraction::new(
            header.scale.max(1) as i64,
            header.rate.max(1) as i64,
        ))
    }

    pub fn track_descriptor(&self, stream: usize) -> TrackDescriptor {
        let s = self.reader.stream(stream);
        let base = self.timestamp_base(stream);
        if s.header.fcc_type == fourcc::VIDS {
            let mut desc = TrackDescriptor::video(
                "V_MS/VFW/FOURCC",
                VideoParams {
                    pixel_width: self.reader.main_header().map(|h| h.width).unwrap_or(0),
                    pixel_height: self.reader.main_header().map(|h| h.height).unwrap_or(0),
                    display_width: 0,
                    display_height: 0,
                    frame_rate: s.header.rate as f64 / s.header.scale.max(1) as f64,
                    interlaced: false,
                },
            );
            desc.codec_private = Some(s.format.clone());
            desc.default_duration = Some(base.scale_trunc(1));
            desc
        } else if s.header.fcc_type == fourcc::AUDS {
            let mut desc = TrackDescriptor::audio(
                "A_MS/ACM",
                AudioParams {
                    channels: if s.format.len() >= 4 {
                        s.format[2] as u8
                    } else {
                        0
                    },
                    sample_rate: if s.format.len() >= 8 {
                        crate::io::get_u32_le(&s.format[4..])
                    } else {
                        0
                    },
                },
            );
            desc.codec_private = Some(s.format.clone());
            desc
        } else {
            TrackDescriptor::subtitle("S_TEXT/UTF8")
        }
    }

    fn next_stream_by_file_order(&self) -> Option<usize> {
        let mut best: Option<(usize, i64)> = None;
        for stream in 0..self.reader.stream_count() {
            let entries = self.reader.stream(stream).index.entries();
            if let Some(entry) = entries.get(self.cursors[stream]) {
                let offset = entry.pos;
                if best.map(|(_, o)| offset < o).unwrap_or(true) {
                    best = Some((stream, offset));
                }
            }
        }
        best.map(|(s, _)| s)
    }

    pub fn next_frame(&mut self) -> Result<Option<(usize, Frame)>> {
        let stream = match self.next_stream_by_file_order() {
            Some(s) => s,
            None => return Ok(None),
        };

        let base = self.timestamp_base(stream);
        let entry_idx = self.cursors[stream];
        let sample_size = self.reader.stream(stream).sample_size() as i64;

        let frame = if sample_size != 0 {
            let entry = self.reader.stream(stream).index.entries()[entry_idx];
            let samples_in_chunk = (entry.payload_size() as i64 / sample_size).max(1);
            let start = self.sample_positions[stream];
            let read = self.reader.read(stream, start, samples_in_chunk)?;
            let samples = read.samples.max(1);
            self.sample_positions[stream] += samples;
            self.cursors[stream] += 1;

            let mut frame = Frame::new(read.data.into(), base.scale_trunc(start));
            frame.duration = Some(base.scale_trunc(samples));
            frame.keyframe = true;
            frame
        } else {
            let keyframe = self.reader.stream(stream).keyframe_only
                || self.reader.is_keyframe(stream, entry_idx as i64);
            let read = self.reader.read(stream, entry_idx as i64, 1)?;
            self.cursors[stream] += 1;

            let mut frame = Frame::new(read.data.into(), base.scale_trunc(entry_idx as i64));
            frame.duration = Some(base.scale_trunc(1));
            frame.keyframe = keyframe;
            if !keyframe {
                let prev = self.reader.prev_keyframe(stream, entry_idx as i64);
                if prev >= 0 {
                    frame.back_ref =
                        Some(frame.timestamp - base.scale_trunc(prev));
                }
            }
            frame
        };

        Ok(Some((stream, frame)))
    }
}

// ============================================================================
// MPEG PS
// ============================================================================

pub struct PsDispatch<R> {
    pub reader: MpegPsReader<R>,
    packetizers: Vec<Packetizer>,
    queue: VecDeque<(usize, Frame)>,
    flushed: bool,
}

impl<R: Read + Seek> PsDispatch<R> {
    pub fn new(reader: MpegPsReader<R>, options: &DemuxOptions) -> Result<Self> {
        let mut packetizers = Vec::with_capacity(reader.track_count());
        for (idx, track) in reader.tracks.iter().enumerate() {
            let packetizer = match track.codec {
                PsCodec::Mpeg1Video | PsCodec::Mpeg2Video => {
                    Packetizer::Mpeg12(Mpeg12Packetizer::new(options.use_codec_state))
                }
                PsCodec::Avc => {
                    let mut parser = AvcEsParser::new();
                    parser.ignore_nalu_size_length_errors();
                    if let Some(len) = options.nalu_size_length_for(idx as i64) {
                        parser.set_nalu_size_length(len);
                    }
                    if !track.provide_timestamps {
                        parser.enable_timestamp_generation(ES_DEFAULT_FRAME_DURATION);
                    }
                    Packetizer::Avc(AvcPacketizer::new(parser))
                }
                _ => {
                    let track_type = match track.track_type {
                        PsTrackType::Subtitle => TrackType::Subtitle,
                        _ => TrackType::Audio,
                    };
                    Packetizer::Passthrough(PassthroughPacketizer::new(
                        track_type,
                        audio_frame_duration(track.codec, track.a_sample_rate),
                    ))
                }
            };
            packetizers.push(packetizer);
        }

        Ok(Self {
            reader,
            packetizers,
            queue: VecDeque::new(),
            flushed: false,
        })
    }

    pub fn track_descriptor(&self, track: usize) -> TrackDescriptor {
        let t = &self.reader.tracks[track];
        match t.track_type {
            PsTrackType::Video => {
                let mut desc = TrackDescriptor::video(
                    match t.codec {
                        PsCodec::Mpeg1Video => "V_MPEG1",
                        PsCodec::Mpeg2Video => "V_MPEG2",
                        PsCodec::Avc => "V_MPEG4/ISO/AVC",
                        PsCodec::Vc1 => "V_MS/VFW/WVC1",
                        _ => "V_UNKNOWN",
                    },
                    VideoParams {
                        pixel_width: t.v_width,
                        pixel_height: t.v_height,
                        display_width: t.v_dwidth,
                        display_height: t.v_dheight,
                        frame_rate: t.v_frame_rate,
                        interlaced: t.v_interlaced,
                    },
                );
                desc.codec_private = t.avcc.clone().or_else(|| t.raw_seq_hdr.clone());
                desc
            }
            _ => {
                let mut desc = TrackDescriptor::audio(
                    match t.codec {
                        PsCodec::Mp2 => "A_MPEG/L2",
                        PsCodec::Mp3 => "A_MPEG/L3",
                        PsCodec::Ac3 if t.a_bsid == 16 => "A_EAC3",
                        PsCodec::Ac3 => "A_AC3",
                        PsCodec::Dts => "A_DTS",
                        PsCodec::Truehd => "A_TRUEHD",
                        PsCodec::Pcm => "A_PCM/INT/LIT",
                        _ => "A_UNKNOWN",
                    },
                    AudioParams {
                        channels: t.a_channels,
                        sample_rate: t.a_sample_rate,
                    },
                );
                let duration = audio_frame_duration(t.codec, t.a_sample_rate);
                if duration > 0 {
                    desc.default_duration = Some(duration);
                }
                desc
            }
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<(usize, Frame)>> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Ok(Some(item));
            }
            if self.flushed {
                return Ok(None);
            }

            match self.reader.next_packet()? {
                Some(packet) => {
                    let timestamp = packet
                        .timestamp
                        .or_else(|| packet.ts_offsets.first().map(|&(ts, _)| ts));
                    let packetizer = &mut self.packetizers[packet.track];
                    packetizer.process(&packet.data, timestamp)?;
                    for frame in packetizer.take_frames() {
                        self.queue.push_back((packet.track, frame));
                    }
                }
                None => {
                    self.flushed = true;
                    for (track, packetizer) in self.packetizers.iter_mut().enumerate() {
                        packetizer.flush()?;
                        for frame in packetizer.take_frames() {
                            self.queue.push_back((track, frame));
                        }
                    }
                }
            }
        }
    }

    pub fn wants_cue_duration(&self, track: usize) -> bool {
        self.packetizers
            .get(track)
            .map(|p| p.wants_cue_duration())
            .unwrap_or(false)
    }
}

fn audio_frame_duration(codec: PsCodec, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    let samples = match codec {
        PsCodec::Ac3 => 1536,
        PsCodec::Mp2 | PsCodec::Mp3 => 1152,
        PsCodec::Dts => 512,
        PsCodec::Truehd => 40,
        _ => return 0,
    };
    samples * 1_000_000_000 / sample_rate as i64
}

// ============================================================================
// MPEG-1/2 elementary stream
// ============================================================================

pub struct MpegEsDispatch<R> {
    src: ByteSource<R>,
    packetizer: Mpeg12Packetizer,
    pub descriptor: TrackDescriptor,
    queue: VecDeque<Frame>,
    eof: bool,
}

impl<R: Read + Seek> MpegEsDispatch<R> {
    /// MPEG ES detection: not TS, not PS, starts on a start code, and shows
    /// sequence + picture + (GOP | extension | slice) start codes in the
    /// first megabyte; finally one whole frame must parse.
    pub fn probe(src: &mut ByteSource<R>) -> Result<bool> {
        src.seek(0)?;
        let mut buf = vec![0u8; READ_SIZE];
        let num_read = src.read(&mut buf)?;
        src.seek(0)?;
        if num_read < 4 {
            return Ok(false);
        }
        buf.truncate(num_read);

        if buf[0] == 0x47 {
            return Ok(false); // transport stream
        }
        let value = get_u32_be(&buf);
        if value == start_code::PACK_START_CODE {
            return Ok(false); // program stream
        }
        if !is_start_code(value) {
            return Ok(false);
        }

        let mut sequence_found = false;
        let mut picture_found = false;
        let mut gop_or_ext_found = false;
        let mut slice_found = false;
        let mut ok = false;

        let mut value = value;
        for &byte in buf.iter().skip(4) {
            if is_start_code(value) {
                match value {
                    start_code::SEQUENCE_HEADER_START_CODE => sequence_found = true,
                    start_code::PICTURE_START_CODE => picture_found = true,
                    start_code::GOP_START_CODE | start_code::EXT_START_CODE => {
                        gop_or_ext_found = true
                    }
                    v if (start_code::FIRST_SLICE_START_CODE..=start_code::LAST_SLICE_START_CODE)
                        .contains(&v) =>
                    {
                        slice_found = true
                    }
                    _ => {}
                }
                ok = sequence_found && picture_found && (gop_or_ext_found || slice_found);
                if ok {
                    break;
                }
            }
            value = value << 8 | byte as u32;
        }
        if !ok {
            return Ok(false);
        }

        // one whole frame must come out
        let mut parser = M2vParser::new();
        parser.set_probe_mode();
        parser.write_data(&buf);
        parser.set_eos();
        Ok(parser.state() == ParserState::FrameReady)
    }

    pub fn new(mut src: ByteSource<R>, options: &DemuxOptions) -> Result<Self> {
        // find the first frame for resolution, version and rate
        src.seek(0)?;
        let mut probe_parser = M2vParser::new();
        probe_parser.set_probe_mode();
        let mut buf = vec![0u8; READ_SIZE];
        while probe_parser.state() == ParserState::NeedData {
            let take = probe_parser.free_buffer_space().min(READ_SIZE);
            let n = src.read(&mut buf[..take])?;
            if n == 0 {
                break;
            }
            probe_parser.write_data(&buf[..n]);
            if src.remaining() == 0 {
                probe_parser.set_eos();
                break;
            }
        }
        if probe_parser.state() != ParserState::FrameReady {
            return Err(ParseError::probe_failed(0, "no MPEG frame found"));
        }

        let seq = probe_parser.sequence_header();
        let frame_rate = if seq.progressive_sequence {
            seq.frame_rate.to_f64()
        } else {
            seq.frame_rate.to_f64() * 2.0
        };
        let mut descriptor = TrackDescriptor::video(
            if probe_parser.mpeg_version() == 1 {
                "V_MPEG1"
            } else {
                "V_MPEG2"
            },
            VideoParams {
                pixel_width: seq.width,
                pixel_height: seq.height,
                display_width: if seq.aspect_ratio > 0.0 && (seq.aspect_ratio - 1.0).abs() > f32::EPSILON {
                    (seq.height as f32 * seq.aspect_ratio) as u32
                } else {
                    seq.width
                },
                display_height: seq.height,
                frame_rate,
                interlaced: !seq.progressive_sequence,
            },
        );
        descriptor.codec_private = probe_parser.raw_sequence_header().map(|s| s.to_vec());

        src.seek(0)?;
        Ok(Self {
            src,
            packetizer: Mpeg12Packetizer::new(options.use_codec_state),
            descriptor,
            queue: VecDeque::new(),
            eof: false,
        })
    }

    pub fn next_frame(&mut self) -> Result<Option<(usize, Frame)>> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(Some((0, frame)));
            }
            if self.eof {
                return Ok(None);
            }

            let take = self.packetizer.free_buffer_space().min(READ_SIZE);
            let mut buf = vec![0u8; take];
            let n = self.src.read(&mut buf)?;
            if n == 0 {
                self.eof = true;
                self.packetizer.flush()?;
            } else {
                self.packetizer.process(&buf[..n], None)?;
            }
            self.queue.extend(self.packetizer.take_frames());
        }
    }
}

// ============================================================================
// AVC elementary stream
// ============================================================================

pub struct AvcEsDispatch<R> {
    src: ByteSource<R>,
    packetizer: AvcPacketizer,
    pub descriptor: TrackDescriptor,
    queue: VecDeque<Frame>,
    eof: bool,
}

impl<R: Read + Seek> AvcEsDispatch<R> {
    /// Feeds up to fifty megabyte-sized buffers until the parameter sets
    /// parse.
    pub fn probe(src: &mut ByteSource<R>, options: &DemuxOptions) -> Result<bool> {
        src.seek(0)?;
        let mut parser = AvcEsParser::new();
        parser.ignore_nalu_size_length_errors();
        parser.enable_timestamp_generation(ES_DEFAULT_FRAME_DURATION);
        if let Some(len) = options.nalu_size_length_for(-1) {
            parser.set_nalu_size_length(len);
            parser.set_length_prefixed_input(true);
        }

        let mut buf = vec![0u8; READ_SIZE];
        let mut first = true;
        let result = (|| -> Result<bool> {
            for _ in 0..MAX_PROBE_BUFFERS {
                let n = src.read(&mut buf)?;
                if n < 4 {
                    return Ok(false);
                }
                if first && buf[0] == 0x47 {
                    return Ok(false); // transport stream
                }
                first = false;
                parser.add_bytes(&buf[..n])?;
                if parser.headers_parsed() {
                    return Ok(true);
                }
                if n < READ_SIZE {
                    break;
                }
            }
            Ok(false)
        })();
        src.seek(0)?;
        Ok(result.unwrap_or(false))
    }

    pub fn new(mut src: ByteSource<R>, options: &DemuxOptions) -> Result<Self> {
        src.seek(0)?;
        let mut parser = AvcEsParser::new();
        parser.ignore_nalu_size_length_errors();
        parser.enable_timestamp_generation(ES_DEFAULT_FRAME_DURATION);
        if let Some(len) = options.nalu_size_length_for(0) {
            parser.set_nalu_size_length(len);
            parser.set_length_prefixed_input(true);
        }

        // probe pass for geometry and the avcC blob
        let mut probe_parser = AvcEsParser::new();
        probe_parser.ignore_nalu_size_length_errors();
        probe_parser.enable_timestamp_generation(ES_DEFAULT_FRAME_DURATION);
        if let Some(len) = options.nalu_size_length_for(0) {
            probe_parser.set_nalu_size_length(len);
            probe_parser.set_length_prefixed_input(true);
        }
        let mut buf = vec![0u8; READ_SIZE];
        for _ in 0..MAX_PROBE_BUFFERS {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            probe_parser.add_bytes(&buf[..n])?;
            if probe_parser.headers_parsed() {
                break;
            }
        }
        if !probe_parser.headers_parsed() {
            let _ = probe_parser.flush();
        }
        if !probe_parser.headers_parsed() {
            return Err(ParseError::probe_failed(0, "no AVC parameter sets found"));
        }

        let sps = probe_parser.sps_info().copied().unwrap_or_default();
        let mut descriptor = TrackDescriptor::video(
            "V_MPEG4/ISO/AVC",
            VideoParams {
                pixel_width: sps.width,
                pixel_height: sps.height,
                display_width: if sps.ar_found && sps.par_den != 0 {
                    (sps.width as u64 * sps.par_num as u64 / sps.par_den as u64) as u32
                } else {
                    sps.width
                },
                display_height: sps.height,
                frame_rate: 0.0,
                interlaced: false,
            },
        );
        descriptor.codec_private = Some(probe_parser.get_avcc()?);
        descriptor.default_duration = sps
            .default_duration()
            .or(Some(ES_DEFAULT_FRAME_DURATION));

        src.seek(0)?;
        Ok(Self {
            src,
            packetizer: AvcPacketizer::new(parser),
            descriptor,
            queue: VecDeque::new(),
            eof: false,
        })
    }

    /// Frames discarded ahead of the first keyframe.
    pub fn num_skipped_frames(&mut self) -> i64 {
        self.packetizer.parser_mut().num_skipped_frames()
    }

    pub fn next_frame(&mut self) -> Result<Option<(usize, Frame)>> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(Some((0, frame)));
            }
            if self.eof {
                return Ok(None);
            }

            let mut buf = vec![0u8; READ_SIZE];
            let n = self.src.read(&mut buf)?;
            if n == 0 {
                self.eof = true;
                self.packetizer.flush()?;
            } else {
                self.packetizer.process(&buf[..n], None)?;
            }
            self.queue.extend(self.packetizer.take_frames());
        }
    }
}

// ============================================================================
// CorePanorama
// ============================================================================

pub struct CorePanoramaDispatch {
    pub reader: CorePanoramaReader,
}

impl CorePanoramaDispatch {
    /// Returns the document text when the source is a CorePanorama XML.
    pub fn probe<R: Read + Seek>(src: &mut ByteSource<R>) -> Result<Option<String>> {
        src.seek(0)?;
        let take = (src.size() as usize).min(1024 * 1024);
        let bytes = src.read_vec(take)?;
        src.seek(0)?;
        match String::from_utf8(bytes) {
            Ok(text) if CorePanoramaReader::probe(&text) => Ok(Some(text)),
            _ => Ok(None),
        }
    }

    /// Picture file urls resolve against the current directory unless they
    /// are absolute.
    pub fn new(text: &str) -> Result<Self> {
        Ok(Self {
            reader: CorePanoramaReader::parse(text, std::path::Path::new("."))?,
        })
    }

    pub fn track_descriptor(&self) -> TrackDescriptor {
        let info = self.reader.info();
        let mut desc = TrackDescriptor::video(
            "V_COREPICTURE",
            VideoParams {
                pixel_width: info.width.max(0) as u32,
                pixel_height: info.height.max(0) as u32,
                display_width: info.width.max(0) as u32,
                display_height: info.height.max(0) as u32,
                frame_rate: 0.0,
                interlaced: false,
            },
        );
        desc.codec_private = Some(self.reader.codec_private().to_vec());
        desc
    }

    pub fn next_frame(&mut self) -> Result<Option<(usize, Frame)>> {
        match self.reader.next_frame()? {
            Some(picture) => {
                let mut frame = Frame::new(picture.data.into(), picture.timestamp);
                frame.duration = picture.duration;
                frame.keyframe = true;
                Ok(Some((0, frame)))
            }
            None => Ok(None),
        }
    }
}

// ============================================================================
// PGS
// ============================================================================

pub struct PgsDispatch<R> {
    pub reader: PgsReader<R>,
}

impl<R: Read + Seek> PgsDispatch<R> {
    pub fn new(reader: PgsReader<R>) -> Self {
        Self { reader }
    }

    pub fn next_frame(&mut self) -> Result<Option<(usize, Frame)>> {
        match self.reader.next_frame() {
            Some(pgs) => {
                let mut frame = Frame::new(pgs.data.into(), pgs.timestamp as i64);
                frame.keyframe = true;
                Ok(Some((0, frame)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn src(bytes: Vec<u8>) -> ByteSource<Cursor<Vec<u8>>> {
        ByteSource::new(Cursor::new(bytes)).unwrap()
    }

    fn m2v_stream() -> Vec<u8> {
        // sequence header 352x288 @ 25fps followed by I P P pictures
        let mut v = vec![0x00, 0x00, 0x01, 0xB3];
        v.push((352u32 >> 4) as u8);
        v.push(((352u32 & 0x0F) << 4) as u8 | (288u32 >> 8) as u8);
        v.push((288u32 & 0xFF) as u8);
        v.push((2 << 4) | 3);
        v.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        for code in [1u8, 2, 2] {
            v.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x00, code << 3, 0x00, 0x00]);
            v.extend_from_slice(&[0x00, 0x00, 0x01, 0x01, 0xAA, 0xBB]);
        }
        v
    }

    #[test]
    fn unknown_bytes_are_rejected() {
        let err = MediaReader::open(src(vec![0xDEu8; 256]), &DemuxOptions::default()).unwrap_err();
        assert!(err.detail.contains("unsupported"));
    }

    #[test]
    fn mpeg_es_end_to_end() {
        let reader = MediaReader::open(src(m2v_stream()), &DemuxOptions::default());
        let mut reader = reader.unwrap();
        assert_eq!(reader.format(), InputFormat::MpegEs);
        assert_eq!(reader.track_count(), 1);

        let desc = reader.track_descriptor(0);
        assert_eq!(desc.codec_id, "V_MPEG1");
        let video = desc.video.unwrap();
        assert_eq!(video.pixel_width, 352);
        assert_eq!(video.pixel_height, 288);
        assert!(desc.codec_private.is_some());

        let mut frames = Vec::new();
        while let Some((track, frame)) = reader.next_frame().unwrap() {
            assert_eq!(track, 0);
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3);
        assert!(frames[0].keyframe);
        assert_eq!(frames[0].timestamp, 0);
        assert_eq!(frames[1].timestamp, 40_000_000);
        assert_eq!(frames[1].back_ref, Some(40_000_000));
        for f in &frames {
            f.validate().unwrap();
            assert_eq!(f.duration, Some(40_000_000));
        }
    }

    #[test]
    fn pgs_end_to_end() {
        let mut file = Vec::new();
        for (pts, ty, payload) in [
            (90_000u32, 0x16u8, vec![1u8, 2]),
            (90_000, 0x80, vec![]),
            (180_000, 0x16, vec![3]),
            (180_000, 0x80, vec![]),
        ] {
            file.extend_from_slice(&crate::pgs::PGS_FILE_MAGIC.to_be_bytes());
            file.extend_from_slice(&pts.to_be_bytes());
            file.extend_from_slice(&0u32.to_be_bytes());
            file.push(ty);
            file.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            file.extend_from_slice(&payload);
        }

        let mut reader = MediaReader::open(src(file), &DemuxOptions::default()).unwrap();
        assert_eq!(reader.format(), InputFormat::Pgs);
        assert_eq!(
            reader.track_descriptor(0).codec_id,
            "S_HDMV/PGS"
        );
        let (_, f1) = reader.next_frame().unwrap().unwrap();
        assert_eq!(f1.timestamp, 1_000_000_000);
        let (_, f2) = reader.next_frame().unwrap().unwrap();
        assert_eq!(f2.timestamp, 2_000_000_000);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn corepanorama_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let pic = dir.path().join("p.png");
        std::fs::write(&pic, [0x89, 0x50, 0x4E]).unwrap();
        let doc = format!(
            r#"<CorePanorama><Info width="640" height="480"/>
<Picture time="00:00:01" end="00:00:03" type="png" panorama="flat" url="{}"/>
</CorePanorama>"#,
            pic.display()
        );

        let mut reader =
            MediaReader::open(src(doc.into_bytes()), &DemuxOptions::default()).unwrap();
        assert_eq!(reader.format(), InputFormat::CorePanorama);
        let desc = reader.track_descriptor(0);
        assert_eq!(desc.codec_id, "V_COREPICTURE");
        assert_eq!(desc.video.unwrap().pixel_width, 640);
        assert_eq!(desc.codec_private.as_ref().unwrap().len(), 5);

        let (_, frame) = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.timestamp, 1_000_000_000);
        assert_eq!(frame.duration, Some(2_000_000_000));
        assert_eq!(&frame.data[7..], &[0x89, 0x50, 0x4E]);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn avi_end_to_end_with_keyframe_only_override() {
        // minimal MJPG AVI: three frames, only the last idx1-flagged
        let mut strf = Vec::new();
        strf.extend_from_slice(&40u32.to_le_bytes());
        strf.extend_from_slice(&320u32.to_le_bytes());
        strf.extend_from_slice(&240u32.to_le_bytes());
        strf.extend_from_slice(&1u16.to_le_bytes());
        strf.extend_from_slice(&24u16.to_le_bytes());
        strf.extend_from_slice(b"MJPG");
        strf.extend_from_slice(&[0u8; 20]);

        let mut strh = Vec::new();
        strh.extend_from_slice(b"vids");
        strh.extend_from_slice(b"MJPG");
        strh.extend_from_slice(&[0u8; 12]);
        strh.extend_from_slice(&1u32.to_le_bytes()); // scale
        strh.extend_from_slice(&25u32.to_le_bytes()); // rate
        strh.extend_from_slice(&0u32.to_le_bytes());
        strh.extend_from_slice(&3u32.to_le_bytes()); // length
        strh.extend_from_slice(&[0u8; 20]);

        let chunk = |fcc: &[u8; 4], payload: &[u8]| {
            let mut v = fcc.to_vec();
            v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            v.extend_from_slice(payload);
            v
        };
        let list = |subtype: &[u8; 4], children: &[u8]| {
            let mut payload = subtype.to_vec();
            payload.extend_from_slice(children);
            chunk(b"LIST", &payload)
        };

        let mut avih = Vec::new();
        for dw in [40_000u32, 0, 0, 0, 3, 0, 1, 0, 320, 240, 0, 0, 0, 0] {
            avih.extend_from_slice(&dw.to_le_bytes());
        }

        let mut strl = chunk(b"strh", &strh);
        strl.extend_from_slice(&chunk(b"strf", &strf));
        let mut hdrl_children = chunk(b"avih", &avih);
        hdrl_children.extend_from_slice(&list(b"strl", &strl));
        let hdrl = list(b"hdrl", &hdrl_children);

        let movi_base = 12 + hdrl.len() as u32 + 12;
        let mut movi_children = Vec::new();
        let mut positions = Vec::new();
        for seed in 0..3u8 {
            positions.push(movi_base + movi_children.len() as u32);
            let payload: Vec<u8> = (0..32).map(|i| seed.wrapping_add(i)).collect();
            movi_children.extend_from_slice(&chunk(b"00dc", &payload));
        }
        let movi = list(b"movi", &movi_children);

        let mut idx = Vec::new();
        for (i, pos) in positions.iter().enumerate() {
            idx.extend_from_slice(b"00dc");
            idx.extend_from_slice(&if i == 2 { 0x10u32 } else { 0 }.to_le_bytes());
            idx.extend_from_slice(&pos.to_le_bytes());
            idx.extend_from_slice(&32u32.to_le_bytes());
        }

        let mut body = hdrl;
        body.extend_from_slice(&movi);
        body.extend_from_slice(&chunk(b"idx1", &idx));
        let mut file = b"RIFF".to_vec();
        file.extend_from_slice(&(body.len() as u32 + 4).to_le_bytes());
        file.extend_from_slice(b"AVI ");
        file.extend_from_slice(&body);

        let mut reader = MediaReader::open(src(file), &DemuxOptions::default()).unwrap();
        assert_eq!(reader.format(), InputFormat::Avi);
        let desc = reader.track_descriptor(0);
        assert_eq!(desc.codec_id, "V_MS/VFW/FOURCC");
        assert_eq!(desc.default_duration, Some(40_000_000));

        let mut frames = Vec::new();
        while let Some((track, frame)) = reader.next_frame().unwrap() {
            assert_eq!(track, 0);
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3);
        // MJPEG is keyframe-only: the heuristic overrides the index flags
        assert!(frames.iter().all(|f| f.keyframe));
        let stamps: Vec<i64> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, [0, 40_000_000, 80_000_000]);
        assert!(!reader.file_is_damaged());
    }
}
