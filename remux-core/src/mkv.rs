// MATROSKA LEVEL-1 LAYER - resynchronisation and cluster inspection
//
// After a torn read the resynchroniser byte-shifts a 32-bit window through
// the remaining file and accepts a candidate level-1 id only when three
// additional well-formed element headers follow it; on arbitrary binary
// payloads anything less drowns in false positives.
//
// The cluster scanner maps (track, timestamp) to absolute block element
// positions, which is what cue postprocessing needs.

use std::collections::HashMap;
use std::io::{Read, Seek};

use tracing::debug;

use crate::ebml::Vint;
use crate::error::{ParseError, Result};
use crate::io::ByteSource;

// ============================================================================
// Element IDs
// ============================================================================

pub mod element_ids {
    pub const EBML: u32 = 0x1A45DFA3;
    pub const SEGMENT: u32 = 0x18538067;

    // level 1
    pub const SEEK_HEAD: u32 = 0x114D9B74;
    pub const SEGMENT_INFO: u32 = 0x1549A966;
    pub const TRACKS: u32 = 0x1654AE6B;
    pub const CHAPTERS: u32 = 0x1043A770;
    pub const CLUSTER: u32 = 0x1F43B675;
    pub const CUES: u32 = 0x1C53BB6B;
    pub const ATTACHMENTS: u32 = 0x1941A469;
    pub const TAGS: u32 = 0x1254C367;

    // cluster children
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const BLOCK_DURATION: u32 = 0x9B;

    // cues
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
    pub const CUE_RELATIVE_POSITION: u32 = 0xF0;
    pub const CUE_DURATION: u32 = 0xB2;
    pub const CUE_CODEC_STATE: u32 = 0xEA;

    // seek head children
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;
}

const LEVEL1_IDS: [u32; 8] = [
    element_ids::SEEK_HEAD,
    element_ids::SEGMENT_INFO,
    element_ids::TRACKS,
    element_ids::CHAPTERS,
    element_ids::CLUSTER,
    element_ids::CUES,
    element_ids::ATTACHMENTS,
    element_ids::TAGS,
];

pub fn is_level1_element_id(id: u32) -> bool {
    LEVEL1_IDS.contains(&id)
}

// ============================================================================
// KaxFile
// ============================================================================

/// A parsed level-1 element header. `size` is the payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level1Element {
    pub id: u32,
    pub position: u64,
    pub head_size: u64,
    pub size: u64,
}

impl Level1Element {
    pub fn end_position(&self) -> u64 {
        self.position + self.head_size + self.size
    }
}

pub struct KaxFile<R> {
    src: ByteSource<R>,
    file_size: u64,
    resynced: bool,
    resync_start_pos: u64,
}

impl<R: Read + Seek> KaxFile<R> {
    pub fn new(src: ByteSource<R>) -> Self {
        let file_size = src.size();
        Self {
            src,
            file_size,
            resynced: false,
            resync_start_pos: 0,
        }
    }

    pub fn was_resynced(&self) -> bool {
        self.resynced
    }

    pub fn resync_start_pos(&self) -> u64 {
        self.resync_start_pos
    }

    pub fn position(&self) -> u64 {
        self.src.position()
    }

    pub fn seek(&mut self, position: u64) -> Result<()> {
        self.src.seek(position)
    }

    pub fn read_payload(&mut self, element: &Level1Element) -> Result<Vec<u8>> {
        self.src.seek(element.position + element.head_size)?;
        let payload = self.src.read_vec(element.size as usize)?;
        self.src.seek(element.end_position())?;
        Ok(payload)
    }

    /// Reads the element bytes in whole (head included).
    pub fn read_element_bytes(&mut self, element: &Level1Element) -> Result<Vec<u8>> {
        self.src.seek(element.position)?;
        let bytes = self
            .src
            .read_vec((element.head_size + element.size) as usize)?;
        Ok(bytes)
    }

    /// Reads the next level-1 element, resynchronising when the data in
    /// front of the cursor is torn. `wanted_id == 0` accepts any level-1
    /// element.
    pub fn read_next_level1_element(&mut self, wanted_id: u32) -> Result<Option<Level1Element>> {
        self.resynced = false;
        self.resync_start_pos = 0;

        loop {
            if self.file_size.saturating_sub(self.src.position()) < 4 {
                return Ok(None);
            }

            let search_start_pos = self.src.position();
            let actual_id = self.src.read_u32_be()?;
            self.src.seek(search_start_pos)?;

            // easiest case: the element we want comes right away
            if wanted_id == actual_id || (wanted_id == 0 && is_level1_element_id(actual_id)) {
                return Ok(self.parse_element_at(search_start_pos)?);
            }

            // a different level-1 element: skip it and retry
            if wanted_id != 0 && is_level1_element_id(actual_id) {
                match self.parse_element_at(search_start_pos)? {
                    Some(other) => {
                        debug!(
                            id = other.id,
                            new_pos = other.end_position(),
                            "skipping other level 1 element"
                        );
                        self.src.seek(other.end_position())?;
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            // no valid id in front: byte-for-byte search
            return self.resync_to_level1_element(wanted_id);
        }
    }

    /// Parses the element header at `position` and positions the reader
    /// past the whole element.
    fn parse_element_at(&mut self, position: u64) -> Result<Option<Level1Element>> {
        self.src.seek(position)?;
        let id = self.src.read_u32_be()?;
        let length = match Vint::read(&mut self.src) {
            Ok(v) => v,
            Err(e) if e.is_eof() => return Ok(None),
            Err(e) => return Err(e),
        };
        let element = Level1Element {
            id,
            position,
            head_size: 4 + length.coded_size as u64,
            size: length.value as u64,
        };
        if element.end_position() > self.file_size {
            return Ok(None);
        }
        self.src.seek(element.end_position())?;
        Ok(Some(element))
    }

    /// Byte-wise scan for the next level-1 id confirmed by three follow-up
    /// headers.
    pub fn resync_to_level1_element(&mut self, wanted_id: u32) -> Result<Option<Level1Element>> {
        self.resynced = true;
        self.resync_start_pos = self.src.position();
        debug!(position = self.resync_start_pos, "resyncing to next level 1 element");

        let mut actual_id = match self.src.read_u32_be() {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };

        while self.src.position() < self.file_size {
            actual_id = (actual_id << 8) | self.src.read_u8()? as u32;

            if (wanted_id != 0 && wanted_id != actual_id)
                || (wanted_id == 0 && !is_level1_element_id(actual_id))
            {
                continue;
            }

            let current_start_pos = self.src.position() - 4;
            let mut element_pos = current_start_pos;
            let mut num_headers = 1u32;

            let confirm = (|| -> Result<()> {
                for _ in 0..3 {
                    let length = Vint::read(&mut self.src)?;
                    if element_pos + length.value as u64 + length.coded_size as u64 + 2 * 4
                        >= self.file_size
                    {
                        return Ok(());
                    }
                    self.src
                        .seek(element_pos + 4 + length.value as u64 + length.coded_size as u64)?;

                    element_pos = self.src.position();
                    let next_id = self.src.read_u32_be()?;

                    if (wanted_id != 0 && wanted_id != next_id)
                        || (wanted_id == 0 && !is_level1_element_id(next_id))
                    {
                        return Ok(());
                    }
                    num_headers += 1;
                }
                Ok(())
            })();
            let _ = confirm;

            if num_headers == 4 {
                debug!(position = current_start_pos, "resync succeeded");
                self.src.seek(current_start_pos)?;
                return self.read_next_level1_element(wanted_id);
            }

            self.src.seek(current_start_pos + 4)?;
        }

        Ok(None)
    }

    pub fn resync_to_cluster(&mut self) -> Result<Option<Level1Element>> {
        self.resync_to_level1_element(element_ids::CLUSTER)
    }

    pub fn read_next_cluster(&mut self) -> Result<Option<Level1Element>> {
        self.read_next_level1_element(element_ids::CLUSTER)
    }
}

// ============================================================================
// Cluster inspection
// ============================================================================

/// One block inside a written cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterBlock {
    pub track: u64,
    /// absolute timestamp in nanoseconds
    pub timestamp: i64,
    /// absolute file position of the SimpleBlock/Block element
    pub position: u64,
}

/// A just-written cluster, parsed back for cue postprocessing.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub position: u64,
    pub head_size: u64,
    pub timestamp: i64,
    pub blocks: Vec<ClusterBlock>,
}

impl Cluster {
    /// Parses a complete cluster element (head included) that was written
    /// at `element_position`. Timestamps scale by `timestamp_scale` into
    /// nanoseconds.
    pub fn parse(data: &[u8], element_position: u64, timestamp_scale: u64) -> Result<Cluster> {
        if data.len() < 4 || crate::io::get_u32_be(data) != element_ids::CLUSTER {
            return Err(ParseError::structure(element_position, "not a cluster"));
        }
        let size = Vint::parse(&data[4..])?;
        let head_size = 4 + size.coded_size as u64;
        let payload_end = (head_size + size.value as u64).min(data.len() as u64) as usize;

        let mut cluster = Cluster {
            position: element_position,
            head_size,
            timestamp: 0,
            blocks: Vec::new(),
        };

        let mut pos = head_size as usize;
        while pos < payload_end {
            let (child_id, id_len) = read_child_id(&data[pos..])?;
            let child_size = Vint::parse(&data[pos + id_len..])?;
            let payload_at = pos + id_len + child_size.coded_size as usize;
            let payload =
                &data[payload_at..(payload_at + child_size.value as usize).min(data.len())];

            match child_id {
                element_ids::TIMECODE => {
                    let mut value = 0i64;
                    for &b in payload {
                        value = value << 8 | b as i64;
                    }
                    cluster.timestamp = value;
                }
                element_ids::SIMPLE_BLOCK => {
                    if let Some(block) =
                        parse_block_head(payload, element_position + pos as u64)?
                    {
                        cluster.blocks.push(block);
                    }
                }
                element_ids::BLOCK_GROUP => {
                    let mut group_pos = 0usize;
                    while group_pos < payload.len() {
                        let (group_child, group_id_len) = read_child_id(&payload[group_pos..])?;
                        let group_size = Vint::parse(&payload[group_pos + group_id_len..])?;
                        let group_payload_at =
                            group_pos + group_id_len + group_size.coded_size as usize;
                        if group_child == element_ids::BLOCK {
                            let block_payload = &payload[group_payload_at
                                ..(group_payload_at + group_size.value as usize)
                                    .min(payload.len())];
                            if let Some(block) = parse_block_head(
                                block_payload,
                                element_position + (payload_at + group_pos) as u64,
                            )? {
                                cluster.blocks.push(block);
                            }
                        }
                        group_pos = group_payload_at + group_size.value as usize;
                    }
                }
                _ => {}
            }

            pos = payload_at + child_size.value as usize;
        }

        // resolve relative block timestamps against the cluster timecode
        for block in cluster.blocks.iter_mut() {
            block.timestamp =
                (cluster.timestamp + block.timestamp) * timestamp_scale as i64;
        }
        cluster.timestamp *= timestamp_scale as i64;

        Ok(cluster)
    }

    pub fn data_start(&self) -> u64 {
        self.position + self.head_size
    }

    /// (track, timestamp) -> absolute block element position.
    pub fn block_positions(&self) -> HashMap<(u64, i64), u64> {
        self.blocks
            .iter()
            .map(|b| ((b.track, b.timestamp), b.position))
            .collect()
    }
}

fn read_child_id(data: &[u8]) -> Result<(u32, usize)> {
    if data.is_empty() {
        return Err(ParseError::eof(0));
    }
    let first = data[0];
    let len = if first & 0x80 != 0 {
        1
    } else if first & 0x40 != 0 {
        2
    } else if first & 0x20 != 0 {
        3
    } else if first & 0x10 != 0 {
        4
    } else {
        return Err(ParseError::structure(0, "invalid element id"));
    };
    if data.len() < len {
        return Err(ParseError::eof(0));
    }
    let mut id = 0u32;
    for &b in &data[..len] {
        id = id << 8 | b as u32;
    }
    Ok((id, len))
}

/// Decodes a block header: track vint, 16-bit relative timestamp. The
/// returned timestamp is still cluster-relative ticks.
fn parse_block_head(payload: &[u8], element_position: u64) -> Result<Option<ClusterBlock>> {
    let track_vint = Vint::parse(payload)?;
    let at = track_vint.coded_size as usize;
    if payload.len() < at + 2 {
        return Ok(None);
    }
    let rel = i16::from_be_bytes([payload[at], payload[at + 1]]);
    Ok(Some(ClusterBlock {
        track: track_vint.value as u64,
        timestamp: rel as i64,
        position: element_position,
    }))
}

// ============================================================================
// Seek head
// ============================================================================

/// Collects (id, position) pairs for the meta-seek element. Serialization
/// is the writer's business; this is the consumed contract.
#[derive(Debug, Default, Clone)]
pub struct SeekHead {
    entries: Vec<(u32, u64)>,
}

impl SeekHead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_element(&mut self, id: u32, position: u64) {
        self.entries.push((id, position));
    }

    pub fn entries(&self) -> &[(u32, u64)] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebml::write_element_head;
    use std::io::Cursor;

    fn simple_block(track: u64, rel_ts: i16, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0x80 | track as u8); // one-byte track vint
        body.extend_from_slice(&rel_ts.to_be_bytes());
        body.push(0x80); // flags: keyframe
        body.extend_from_slice(payload);

        let mut out = Vec::new();
        write_element_head(&mut out, element_ids::SIMPLE_BLOCK, body.len() as u64);
        out.extend_from_slice(&body);
        out
    }

    fn cluster_bytes(timecode: u64, blocks: &[Vec<u8>]) -> Vec<u8> {
        let mut payload = Vec::new();
        write_element_head(&mut payload, element_ids::TIMECODE, 1);
        payload.push(timecode as u8);
        for b in blocks {
            payload.extend_from_slice(b);
        }

        let mut out = Vec::new();
        write_element_head(&mut out, element_ids::CLUSTER, payload.len() as u64);
        out.extend_from_slice(&payload);
        out
    }

    fn kax(bytes: Vec<u8>) -> KaxFile<Cursor<Vec<u8>>> {
        KaxFile::new(ByteSource::new(Cursor::new(bytes)).unwrap())
    }

    #[test]
    fn level1_id_table() {
        assert!(is_level1_element_id(element_ids::CLUSTER));
        assert!(is_level1_element_id(element_ids::CUES));
        assert!(!is_level1_element_id(0x12345678));
    }

    #[test]
    fn sequential_clusters_read_without_resync() {
        let c1 = cluster_bytes(0, &[simple_block(1, 0, &[1, 2, 3])]);
        let c2 = cluster_bytes(10, &[simple_block(1, 0, &[4])]);
        let mut file = c1.clone();
        file.extend_from_slice(&c2);

        let mut kax = kax(file);
        let e1 = kax.read_next_cluster().unwrap().unwrap();
        assert_eq!(e1.position, 0);
        assert!(!kax.was_resynced());
        let e2 = kax.read_next_cluster().unwrap().unwrap();
        assert_eq!(e2.position, c1.len() as u64);
        assert!(kax.read_next_cluster().unwrap().is_none());
    }

    #[test]
    fn resync_skips_torn_bytes_to_next_cluster() {
        let block = simple_block(1, 0, &[0u8; 16]);
        let c1 = cluster_bytes(0, &[block.clone()]);
        let garbage = vec![0x55u8; 1000];

        let mut file = c1.clone();
        file.extend_from_slice(&garbage);
        let second_start = file.len() as u64;
        for tc in [10, 20, 30, 40] {
            file.extend_from_slice(&cluster_bytes(tc, &[block.clone()]));
        }

        let mut kax = kax(file);
        let first = kax.read_next_cluster().unwrap().unwrap();
        assert_eq!(first.position, 0);

        // the garbage forces a byte-for-byte search confirmed by the three
        // following cluster headers
        let second = kax.read_next_cluster().unwrap().unwrap();
        assert!(kax.was_resynced());
        assert_eq!(kax.resync_start_pos(), c1.len() as u64);
        assert_eq!(second.position, second_start);
    }

    #[test]
    fn resync_rejects_lone_id_pattern() {
        let c1 = cluster_bytes(0, &[simple_block(1, 0, &[0u8; 8])]);
        let mut file = c1;
        // garbage, then a fake cluster id with no well-formed followers
        file.extend_from_slice(&[0x99u8; 16]);
        file.extend_from_slice(&element_ids::CLUSTER.to_be_bytes());
        file.extend_from_slice(&[0xFF, 0xEE, 0xDD]);
        file.extend_from_slice(&[0x99u8; 64]);

        let mut kax = kax(file);
        kax.read_next_cluster().unwrap().unwrap();
        assert!(kax.read_next_cluster().unwrap().is_none());
    }

    #[test]
    fn wanted_id_skips_other_level1_elements() {
        let mut file = Vec::new();
        // a Tracks element first
        write_element_head(&mut file, element_ids::TRACKS, 4);
        file.extend_from_slice(&[0u8; 4]);
        let cluster_at = file.len() as u64;
        file.extend_from_slice(&cluster_bytes(5, &[simple_block(2, 0, &[9])]));

        let mut kax = kax(file);
        let cluster = kax.read_next_cluster().unwrap().unwrap();
        assert_eq!(cluster.position, cluster_at);
        assert!(!kax.was_resynced());
    }

    #[test]
    fn cluster_block_positions() {
        let blocks = vec![
            simple_block(1, 0, &[1, 2, 3, 4]),
            simple_block(2, 5, &[9; 10]),
        ];
        let bytes = cluster_bytes(100, &blocks);
        let cluster = Cluster::parse(&bytes, 0x5000, 1_000_000).unwrap();

        assert_eq!(cluster.position, 0x5000);
        assert_eq!(cluster.timestamp, 100_000_000);
        assert_eq!(cluster.blocks.len(), 2);

        // first block: right after the cluster head + timecode element
        let timecode_len = 2 + 1;
        assert_eq!(
            cluster.blocks[0].position,
            0x5000 + cluster.head_size + timecode_len
        );
        assert_eq!(cluster.blocks[0].track, 1);
        assert_eq!(cluster.blocks[0].timestamp, 100_000_000);

        assert_eq!(cluster.blocks[1].track, 2);
        assert_eq!(cluster.blocks[1].timestamp, 105_000_000);
        let map = cluster.block_positions();
        assert_eq!(map[&(2, 105_000_000)], cluster.blocks[1].position);
    }

    #[test]
    fn block_group_blocks_are_indexed() {
        // BlockGroup { Block { track 3, rel 7, data } }
        let mut block = Vec::new();
        block.push(0x83);
        block.extend_from_slice(&7i16.to_be_bytes());
        block.push(0x00);
        block.extend_from_slice(&[1, 2]);

        let mut group_payload = Vec::new();
        write_element_head(&mut group_payload, element_ids::BLOCK, block.len() as u64);
        group_payload.extend_from_slice(&block);

        let mut group = Vec::new();
        write_element_head(&mut group, element_ids::BLOCK_GROUP, group_payload.len() as u64);
        group.extend_from_slice(&group_payload);

        let bytes = cluster_bytes(0, &[group]);
        let cluster = Cluster::parse(&bytes, 0, 1).unwrap();
        assert_eq!(cluster.blocks.len(), 1);
        assert_eq!(cluster.blocks[0].track, 3);
        assert_eq!(cluster.blocks[0].timestamp, 7);
    }
}
