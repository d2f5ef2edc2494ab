//! Open-time configuration shared by the readers and the cues writer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMESTAMP_SCALE: u64 = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemuxOptions {
    /// Per-track NALU size-field length for length-prefixed AVC ({1,2,4});
    /// the key -1 holds the global default.
    pub nalu_size_lengths: HashMap<i64, u32>,
    /// Suppress OpenDML AVIX continuation handling / multi-file opening.
    pub disable_multi_file: bool,
    /// Suppress CueDuration emission.
    pub no_cue_duration: bool,
    /// Suppress CueRelativePosition emission.
    pub no_cue_relative_position: bool,
    /// Emit deduplicated MPEG-1/2 sequence headers as codec state.
    pub use_codec_state: bool,
    /// Nanoseconds per Matroska tick.
    pub timestamp_scale: u64,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            nalu_size_lengths: HashMap::new(),
            disable_multi_file: false,
            no_cue_duration: false,
            no_cue_relative_position: false,
            use_codec_state: false,
            timestamp_scale: DEFAULT_TIMESTAMP_SCALE,
        }
    }
}

impl DemuxOptions {
    pub fn nalu_size_length_for(&self, track: i64) -> Option<u32> {
        self.nalu_size_lengths
            .get(&track)
            .or_else(|| self.nalu_size_lengths.get(&-1))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_default_fallback() {
        let mut opts = DemuxOptions::default();
        opts.nalu_size_lengths.insert(-1, 4);
        opts.nalu_size_lengths.insert(2, 2);
        assert_eq!(opts.nalu_size_length_for(2), Some(2));
        assert_eq!(opts.nalu_size_length_for(0), Some(4));
        assert_eq!(DemuxOptions::default().nalu_size_length_for(0), None);
    }

    #[test]
    fn round_trips_through_json() {
        let opts = DemuxOptions {
            use_codec_state: true,
            timestamp_scale: 100_000,
            ..DemuxOptions::default()
        };
        let json = serde_json::to_string(&opts).unwrap();
        let back: DemuxOptions = serde_json::from_str(&json).unwrap();
        assert!(back.use_codec_state);
        assert_eq!(back.timestamp_scale, 100_000);
    }
}
