//! The access-unit model handed to the muxer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
}

/// One delivered access unit, in decode order.
///
/// References are timestamp distances relative to the frame's own
/// timestamp: `back_ref` counts backwards to an earlier reference frame,
/// `forward_ref` forwards to a later one. Both are None when unused and
/// never negative.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    /// nanoseconds
    pub timestamp: i64,
    pub duration: Option<i64>,
    pub back_ref: Option<i64>,
    pub forward_ref: Option<i64>,
    pub keyframe: bool,
    /// deduplicated codec private data that changed ahead of this frame
    pub codec_state: Option<Bytes>,
}

impl Frame {
    pub fn new(data: Bytes, timestamp: i64) -> Self {
        Self {
            data,
            timestamp,
            duration: None,
            back_ref: None,
            forward_ref: None,
            keyframe: false,
            codec_state: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.keyframe {
            if let Some(back_ref) = self.back_ref {
                if back_ref < 0 {
                    return Err(ParseError::structure(
                        0,
                        "negative back reference on a predicted frame",
                    ));
                }
            }
        }
        if self.timestamp < 0 {
            return Err(ParseError::structure(0, "negative frame timestamp"));
        }
        Ok(())
    }
}

/// Video geometry for the muxer's track headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub frame_rate: f64,
    pub interlaced: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    pub channels: u8,
    pub sample_rate: u32,
}

/// Per-track metadata exposed to the muxer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub track_type: TrackType,
    pub codec_id: String,
    pub codec_private: Option<Vec<u8>>,
    pub default_duration: Option<i64>,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
}

impl TrackDescriptor {
    pub fn video(codec_id: impl Into<String>, params: VideoParams) -> Self {
        Self {
            track_type: TrackType::Video,
            codec_id: codec_id.into(),
            codec_private: None,
            default_duration: None,
            video: Some(params),
            audio: None,
        }
    }

    pub fn audio(codec_id: impl Into<String>, params: AudioParams) -> Self {
        Self {
            track_type: TrackType::Audio,
            codec_id: codec_id.into(),
            codec_private: None,
            default_duration: None,
            video: None,
            audio: Some(params),
        }
    }

    pub fn subtitle(codec_id: impl Into<String>) -> Self {
        Self {
            track_type: TrackType::Subtitle,
            codec_id: codec_id.into(),
            codec_private: None,
            default_duration: None,
            video: None,
            audio: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_validation() {
        let mut frame = Frame::new(Bytes::from_static(b"x"), 0);
        frame.keyframe = true;
        assert!(frame.validate().is_ok());

        frame.keyframe = false;
        frame.back_ref = Some(40_000_000);
        assert!(frame.validate().is_ok());

        frame.back_ref = Some(-1);
        assert!(frame.validate().is_err());

        frame.back_ref = None;
        frame.timestamp = -5;
        assert!(frame.validate().is_err());
    }
}
