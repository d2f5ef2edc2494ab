// CUES ACCUMULATOR - exact-bit CuePoint emission
//
// Cue points accumulate per mux session while clusters are written; each
// finished cluster is postprocessed to fill in the cluster-relative block
// positions. At write time the serialized size of every cue is precomputed
// so the CUES element head can be emitted in place, with no patching pass.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::ebml::{bytes_for_uint, id_length, write_element_head, write_uint};
use crate::mkv::{element_ids, Cluster, SeekHead};
use crate::options::DemuxOptions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuePoint {
    /// nanoseconds
    pub timestamp: u64,
    /// nanoseconds; 0 = absent
    pub duration: u64,
    /// segment-relative cluster position
    pub cluster_position: u64,
    pub track_num: u32,
    /// block offset from the cluster's data start; 0 = absent
    pub relative_position: u64,
}

/// Per-track cue policy the mux session owns; looked up by track number
/// during postprocessing.
pub trait CueDurationPolicy {
    fn wants_cue_duration(&self, track_num: u64) -> bool;
}

impl CueDurationPolicy for HashMap<u64, bool> {
    fn wants_cue_duration(&self, track_num: u64) -> bool {
        self.get(&track_num).copied().unwrap_or(false)
    }
}

pub struct Cues {
    points: Vec<CuePoint>,
    id_timestamp_duration_map: HashMap<(u64, u64), u64>,
    codec_state_position_map: HashMap<(u64, u64), u64>,
    num_postprocessed: usize,
    no_cue_duration: bool,
    no_cue_relative_position: bool,
    timestamp_scale: u64,
}

impl Cues {
    pub fn new(options: &DemuxOptions) -> Self {
        Self {
            points: Vec::new(),
            id_timestamp_duration_map: HashMap::new(),
            codec_state_position_map: HashMap::new(),
            num_postprocessed: 0,
            no_cue_duration: options.no_cue_duration,
            no_cue_relative_position: options.no_cue_relative_position,
            timestamp_scale: options.timestamp_scale,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn add(&mut self, point: CuePoint) {
        self.points.push(point);
    }

    /// Records a duration the packetizer wants attached to the cue for
    /// `(track, timestamp)`; adopted during postprocessing.
    pub fn set_duration_for(&mut self, track_num: u64, timestamp: u64, duration: u64) {
        if !self.no_cue_duration {
            self.id_timestamp_duration_map
                .insert((track_num, timestamp), duration);
        }
    }

    /// Records where stream-state-changing codec private data was written.
    pub fn set_codec_state_position(&mut self, track_num: u64, timestamp: u64, position: u64) {
        self.codec_state_position_map
            .insert((track_num, timestamp), position);
    }

    /// Fills in relative positions and durations for the cue points added
    /// since the last postprocessing pass, against the cluster that was
    /// just written.
    pub fn postprocess_cues(&mut self, cluster: &Cluster, policy: &dyn CueDurationPolicy) {
        if self.no_cue_duration && self.no_cue_relative_position {
            self.num_postprocessed = self.points.len();
            return;
        }

        let cluster_data_start = cluster.data_start();
        let block_positions = cluster.block_positions();

        for point in self.points[self.num_postprocessed..].iter_mut() {
            if !self.no_cue_relative_position {
                let relative = block_positions
                    .get(&(point.track_num as u64, point.timestamp as i64))
                    .map(|&position| position.max(cluster_data_start) - cluster_data_start)
                    .unwrap_or(0);
                point.relative_position = relative;
                trace!(
                    track = point.track_num,
                    timestamp = point.timestamp,
                    cluster_data_start,
                    relative,
                    "cue relative position"
                );
            }

            if self.no_cue_duration || !policy.wants_cue_duration(point.track_num as u64) {
                continue;
            }
            if let Some(&duration) = self
                .id_timestamp_duration_map
                .get(&(point.track_num as u64, point.timestamp))
            {
                point.duration = duration;
            }
        }

        self.num_postprocessed = self.points.len();
        self.id_timestamp_duration_map.clear();
    }

    fn sort(&mut self) {
        self.points.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.track_num.cmp(&b.track_num))
                .then(a.cluster_position.cmp(&b.cluster_position))
        });
    }

    fn scaled_duration(&self, duration: u64) -> u64 {
        // rounded to the timestamp scale before scaling down
        (duration + self.timestamp_scale / 2) / self.timestamp_scale
    }

    fn calculate_point_size(&self, point: &CuePoint) -> u64 {
        let mut size = id_length(element_ids::CUE_POINT) as u64
            + 1
            + id_length(element_ids::CUE_TIME) as u64
            + 1
            + bytes_for_uint(point.timestamp / self.timestamp_scale) as u64
            + id_length(element_ids::CUE_TRACK_POSITIONS) as u64
            + 1
            + id_length(element_ids::CUE_TRACK) as u64
            + 1
            + bytes_for_uint(point.track_num as u64) as u64
            + id_length(element_ids::CUE_CLUSTER_POSITION) as u64
            + 1
            + bytes_for_uint(point.cluster_position) as u64;

        if let Some(&codec_state) = self
            .codec_state_position_map
            .get(&(point.track_num as u64, point.timestamp))
        {
            size += id_length(element_ids::CUE_CODEC_STATE) as u64
                + 1
                + bytes_for_uint(codec_state) as u64;
        }
        if point.relative_position != 0 {
            size += id_length(element_ids::CUE_RELATIVE_POSITION) as u64
                + 1
                + bytes_for_uint(point.relative_position) as u64;
        }
        if point.duration != 0 {
            size += id_length(element_ids::CUE_DURATION) as u64
                + 1
                + bytes_for_uint(self.scaled_duration(point.duration)) as u64;
        }
        size
    }

    /// Serialized byte count of all cue points (the CUES element payload).
    pub fn calculate_total_size(&self) -> u64 {
        self.points
            .iter()
            .map(|p| self.calculate_point_size(p))
            .sum()
    }

    fn write_point(&self, out: &mut Vec<u8>, point: &CuePoint) {
        // every child of a cue point is a small unsigned integer; the size
        // field is always a single byte
        fn write_uint_element(out: &mut Vec<u8>, id: u32, value: u64) {
            crate::ebml::write_id(out, id);
            out.push(0x80 | bytes_for_uint(value) as u8);
            write_uint(out, value);
        }

        let mut positions = Vec::new();
        write_uint_element(&mut positions, element_ids::CUE_TRACK, point.track_num as u64);
        write_uint_element(
            &mut positions,
            element_ids::CUE_CLUSTER_POSITION,
            point.cluster_position,
        );
        if let Some(&codec_state) = self
            .codec_state_position_map
            .get(&(point.track_num as u64, point.timestamp))
        {
            write_uint_element(&mut positions, element_ids::CUE_CODEC_STATE, codec_state);
        }
        if point.relative_position != 0 {
            write_uint_element(
                &mut positions,
                element_ids::CUE_RELATIVE_POSITION,
                point.relative_position,
            );
        }
        if point.duration != 0 {
            write_uint_element(
                &mut positions,
                element_ids::CUE_DURATION,
                self.scaled_duration(point.duration),
            );
        }

        let mut cue_time = Vec::new();
        write_uint_element(
            &mut cue_time,
            element_ids::CUE_TIME,
            point.timestamp / self.timestamp_scale,
        );

        let point_payload = cue_time.len() as u64
            + id_length(element_ids::CUE_TRACK_POSITIONS) as u64
            + 1
            + positions.len() as u64;

        write_element_head(out, element_ids::CUE_POINT, point_payload);
        out.extend_from_slice(&cue_time);
        write_element_head(out, element_ids::CUE_TRACK_POSITIONS, positions.len() as u64);
        out.extend_from_slice(&positions);
    }

    /// Sorts, reserves a seek-head slot, and writes the CUES element with
    /// its precomputed size. Returns the number of payload bytes written,
    /// which always equals `calculate_total_size()` before the call.
    pub fn write(&mut self, out: &mut Vec<u8>, seek_head: &mut SeekHead) -> u64 {
        if self.points.is_empty() {
            return 0;
        }

        self.sort();

        let position = out.len() as u64;
        seek_head.index_element(element_ids::CUES, position);

        let total_size = self.calculate_total_size();
        write_element_head(out, element_ids::CUES, total_size);

        let body_start = out.len();
        for point in &self.points {
            self.write_point(out, point);
        }
        debug_assert_eq!((out.len() - body_start) as u64, total_size);

        self.points.clear();
        self.codec_state_position_map.clear();
        self.num_postprocessed = 0;

        (out.len() - body_start) as u64
    }
}
