// PACKETIZERS - thin per-codec adapters between demuxed payloads and frames
//
// A packetizer consumes raw track payloads (PES data, ES slabs) and drains
// finished access units. The heavy lifting lives in the codec parsers; the
// adapters wire timestamps, references and codec-state deduplication.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::avc::AvcEsParser;
use crate::error::Result;
use crate::m2v::M2vParser;
use crate::packet::{Frame, TrackType};
use crate::start_code::find_start_code;

// ============================================================================
// MPEG-1/2 video
// ============================================================================

pub struct Mpeg12Packetizer {
    parser: M2vParser,
    use_codec_state: bool,
    last_codec_state: Option<Vec<u8>>,
    frames: VecDeque<Frame>,
}

impl Mpeg12Packetizer {
    pub fn new(use_codec_state: bool) -> Self {
        Self {
            parser: M2vParser::new(),
            use_codec_state,
            last_codec_state: None,
            frames: VecDeque::new(),
        }
    }

    pub fn free_buffer_space(&self) -> usize {
        self.parser.free_buffer_space()
    }

    pub fn parser(&self) -> &M2vParser {
        &self.parser
    }

    pub fn process(&mut self, data: &[u8], _timestamp: Option<i64>) -> Result<()> {
        self.parser.write_data(data);
        self.drain();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.parser.set_eos();
        self.drain();
        Ok(())
    }

    fn drain(&mut self) {
        while let Some(m) = self.parser.read_frame() {
            let mut data = m.data;
            let mut codec_state = None;

            if m.has_sequence_header && self.use_codec_state {
                // the attached sequence header region runs up to the first
                // picture start code; matching headers are deduplicated
                let header_len = find_picture_offset(&data).unwrap_or(0);
                if header_len > 0 {
                    let header = data[..header_len].to_vec();
                    data.drain(..header_len);
                    if self.last_codec_state.as_deref() != Some(&header[..]) {
                        codec_state = Some(Bytes::from(header.clone()));
                        self.last_codec_state = Some(header);
                    }
                }
            }

            let timestamp = m.timestamp;
            self.frames.push_back(Frame {
                data: Bytes::from(data),
                timestamp,
                duration: Some(m.duration),
                back_ref: (m.first_ref >= 0).then(|| timestamp - m.first_ref),
                forward_ref: (m.second_ref >= 0).then(|| m.second_ref - timestamp),
                keyframe: m.frame_type == crate::m2v::FrameType::I,
                codec_state,
            });
        }
    }

    pub fn take_frames(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }
}

fn find_picture_offset(data: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while let Some(sc) = find_start_code(data, pos) {
        if sc + 3 < data.len() && data[sc + 3] == crate::m2v::PICTURE_CODE {
            return Some(sc);
        }
        pos = sc + 3;
    }
    None
}

// ============================================================================
// AVC
// ============================================================================

pub struct AvcPacketizer {
    parser: AvcEsParser,
    frames: VecDeque<Frame>,
}

impl AvcPacketizer {
    pub fn new(parser: AvcEsParser) -> Self {
        Self {
            parser,
            frames: VecDeque::new(),
        }
    }

    pub fn parser_mut(&mut self) -> &mut AvcEsParser {
        &mut self.parser
    }

    pub fn process(&mut self, data: &[u8], timestamp: Option<i64>) -> Result<()> {
        if let Some(ts) = timestamp {
            self.parser.add_timestamp(ts);
        }
        self.parser.add_bytes(data)?;
        self.drain();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.parser.flush()?;
        self.drain();
        Ok(())
    }

    fn drain(&mut self) {
        while let Some(f) = self.parser.get_frame() {
            self.frames.push_back(Frame {
                data: f.data,
                timestamp: f.start,
                duration: Some(f.end - f.start),
                // the parser reports the earlier reference as a negative
                // delta; frames count the distance
                back_ref: f.ref1.map(|r| -r),
                forward_ref: f.ref2,
                keyframe: f.keyframe,
                codec_state: None,
            });
        }
    }

    pub fn take_frames(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }
}

// ============================================================================
// Pass-through
// ============================================================================

/// Audio and subtitle payloads pass through whole; timestamps either come
/// from the container or advance by a default duration.
pub struct PassthroughPacketizer {
    track_type: TrackType,
    default_duration: i64,
    next_timestamp: i64,
    frames: VecDeque<Frame>,
}

impl PassthroughPacketizer {
    pub fn new(track_type: TrackType, default_duration: i64) -> Self {
        Self {
            track_type,
            default_duration,
            next_timestamp: 0,
            frames: VecDeque::new(),
        }
    }

    pub fn process(&mut self, data: &[u8], timestamp: Option<i64>) -> Result<()> {
        self.process_with_duration(data, timestamp, None)
    }

    pub fn process_with_duration(
        &mut self,
        data: &[u8],
        timestamp: Option<i64>,
        duration: Option<i64>,
    ) -> Result<()> {
        let ts = timestamp.unwrap_or(self.next_timestamp);
        self.next_timestamp = ts + duration.unwrap_or(self.default_duration);
        self.frames.push_back(Frame {
            data: Bytes::copy_from_slice(data),
            timestamp: ts,
            duration: duration.or({
                if self.default_duration > 0 {
                    Some(self.default_duration)
                } else {
                    None
                }
            }),
            back_ref: None,
            forward_ref: None,
            keyframe: true,
            codec_state: None,
        });
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn take_frames(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

pub enum Packetizer {
    Mpeg12(Mpeg12Packetizer),
    Avc(AvcPacketizer),
    Passthrough(PassthroughPacketizer),
}

impl Packetizer {
    pub fn process(&mut self, data: &[u8], timestamp: Option<i64>) -> Result<()> {
        match self {
            Packetizer::Mpeg12(p) => p.process(data, timestamp),
            Packetizer::Avc(p) => p.process(data, timestamp),
            Packetizer::Passthrough(p) => p.process(data, timestamp),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            Packetizer::Mpeg12(p) => p.flush(),
            Packetizer::Avc(p) => p.flush(),
            Packetizer::Passthrough(p) => p.flush(),
        }
    }

    pub fn take_frames(&mut self) -> Vec<Frame> {
        match self {
            Packetizer::Mpeg12(p) => p.take_frames(),
            Packetizer::Avc(p) => p.take_frames(),
            Packetizer::Passthrough(p) => p.take_frames(),
        }
    }

    /// Subtitle packetizers want their durations indexed in the cues.
    pub fn wants_cue_duration(&self) -> bool {
        matches!(
            self,
            Packetizer::Passthrough(p) if p.track_type == TrackType::Subtitle
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_header_bytes() -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0xB3];
        v.push((352u32 >> 4) as u8);
        v.push(((352u32 & 0x0F) << 4) as u8 | (288u32 >> 8) as u8);
        v.push((288u32 & 0xFF) as u8);
        v.push((2 << 4) | 3);
        v.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        v
    }

    fn picture_bytes(code: u8) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0x00, 0x00, code << 3, 0x00, 0x00];
        v.extend_from_slice(&[0x00, 0x00, 0x01, 0x01, 0xAA]);
        v
    }

    #[test]
    fn mpeg12_codec_state_deduplication() {
        let mut packetizer = Mpeg12Packetizer::new(true);
        let mut stream = seq_header_bytes();
        stream.extend_from_slice(&picture_bytes(1)); // I
        stream.extend_from_slice(&picture_bytes(2)); // P
        stream.extend_from_slice(&seq_header_bytes()); // identical header again
        stream.extend_from_slice(&picture_bytes(1)); // I
        stream.extend_from_slice(&picture_bytes(2)); // P
        packetizer.process(&stream, None).unwrap();
        packetizer.flush().unwrap();

        let frames = packetizer.take_frames();
        assert_eq!(frames.len(), 4);
        // first I carries the state; the identical second header is elided
        assert!(frames[0].codec_state.is_some());
        assert!(frames[2].codec_state.is_none());
        // the stripped frames start at their picture start code
        assert_eq!(&frames[0].data[..4], &[0, 0, 1, 0]);
        assert_eq!(&frames[2].data[..4], &[0, 0, 1, 0]);
    }

    #[test]
    fn mpeg12_changed_header_emits_new_state() {
        let mut packetizer = Mpeg12Packetizer::new(true);
        let mut stream = seq_header_bytes();
        stream.extend_from_slice(&picture_bytes(1));
        stream.extend_from_slice(&picture_bytes(2));
        let mut second = seq_header_bytes();
        second[7] = (3 << 4) | 3; // 16:9 now
        stream.extend_from_slice(&second);
        stream.extend_from_slice(&picture_bytes(1));
        stream.extend_from_slice(&picture_bytes(2));
        packetizer.process(&stream, None).unwrap();
        packetizer.flush().unwrap();

        let frames = packetizer.take_frames();
        let state0 = frames[0].codec_state.as_ref().unwrap();
        let state2 = frames[2].codec_state.as_ref().unwrap();
        assert_ne!(state0, state2);
    }

    #[test]
    fn mpeg12_reference_deltas_are_distances() {
        let mut packetizer = Mpeg12Packetizer::new(false);
        let mut stream = seq_header_bytes();
        for code in [1u8, 2, 3, 2] {
            stream.extend_from_slice(&picture_bytes(code));
        }
        packetizer.process(&stream, None).unwrap();
        packetizer.flush().unwrap();

        let frames = packetizer.take_frames();
        // decode order: I P B P
        assert!(frames[0].keyframe);
        for frame in &frames {
            frame.validate().unwrap();
        }
        let b = &frames[2];
        assert!(b.back_ref.unwrap() > 0);
        assert!(b.forward_ref.unwrap() > 0);
    }

    #[test]
    fn passthrough_advances_by_default_duration() {
        let mut packetizer = PassthroughPacketizer::new(TrackType::Audio, 24_000_000);
        packetizer.process(&[1, 2], None).unwrap();
        packetizer.process(&[3, 4], None).unwrap();
        packetizer.process(&[5], Some(96_000_000)).unwrap();
        packetizer.process(&[6], None).unwrap();

        let frames = packetizer.take_frames();
        let stamps: Vec<i64> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, [0, 24_000_000, 96_000_000, 120_000_000]);
        assert!(frames.iter().all(|f| f.keyframe));
    }

    #[test]
    fn cue_duration_policy() {
        let subtitle = Packetizer::Passthrough(PassthroughPacketizer::new(TrackType::Subtitle, 0));
        let audio = Packetizer::Passthrough(PassthroughPacketizer::new(TrackType::Audio, 0));
        let video = Packetizer::Mpeg12(Mpeg12Packetizer::new(false));
        assert!(subtitle.wants_cue_duration());
        assert!(!audio.wants_cue_duration());
        assert!(!video.wants_cue_duration());
    }
}
