// AVI INDEX ENGINE
//
// A growing, ordered list of index entries per stream. Entries are bucketed
// in chain nodes of 2048 while the index is being built, then collapsed into
// one of three materialized forms: the in-memory IndexEntry2 array, the
// on-disk legacy idx1 record shape, or the OpenDML relative pair form.
//
// The non-keyframe flag lives in bit 31 of the stored size; the file number
// of an appended segment lives in bits 48..63 of the stored position.

use serde::{Deserialize, Serialize};

use crate::fourcc::FourCc;

pub const CHAIN_NODE_ENTRIES: usize = 2048;
pub const SIZE_MASK: u32 = 0x7FFF_FFFF;
pub const NOT_KEYFRAME_FLAG: u32 = 0x8000_0000;
pub const POSITION_MASK: i64 = 0x0000_FFFF_FFFF_FFFF;

pub const AVIIF_KEYFRAME: u32 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry2 {
    pub ckid: FourCc,
    pub pos: i64,
    /// chunk payload size; bit 31 set when this is NOT a keyframe
    pub size: u32,
}

impl IndexEntry2 {
    pub fn payload_size(&self) -> u32 {
        self.size & SIZE_MASK
    }

    pub fn is_keyframe(&self) -> bool {
        self.size & NOT_KEYFRAME_FLAG == 0
    }

    /// Backing file for appended segments.
    pub fn file_number(&self) -> usize {
        (self.pos >> 48) as usize
    }

    pub fn file_offset(&self) -> i64 {
        self.pos & POSITION_MASK
    }
}

/// One 16-byte record of the on-disk `idx1` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyIndexEntry {
    pub ckid: FourCc,
    pub flags: u32,
    pub chunk_offset: u32,
    pub chunk_length: u32,
}

/// One pair-of-u32 record of an OpenDML std-index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry3 {
    pub offset: u32,
    pub size_keyframe: u32,
}

// ============================================================================
// Index
// ============================================================================

#[derive(Default)]
pub struct AviIndex {
    chain: Vec<Vec<IndexEntry2>>,
    total_entries: usize,
    index2: Option<Vec<IndexEntry2>>,
}

impl AviIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.total_entries
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries == 0
    }

    /// Appends one entry. Returns false when a new chain node cannot be
    /// allocated.
    pub fn add(&mut self, ckid: FourCc, pos: i64, size: u32, is_keyframe: bool) -> bool {
        let need_node = self
            .chain
            .last()
            .map_or(true, |node| node.len() >= CHAIN_NODE_ENTRIES);
        if need_node {
            let mut node: Vec<IndexEntry2> = Vec::new();
            if node.try_reserve_exact(CHAIN_NODE_ENTRIES).is_err() {
                return false;
            }
            self.chain.push(node);
        }
        let size = if is_keyframe {
            size & SIZE_MASK
        } else {
            NOT_KEYFRAME_FLAG | (size & SIZE_MASK)
        };
        self.chain.last_mut().unwrap().push(IndexEntry2 { ckid, pos, size });
        self.total_entries += 1;
        true
    }

    /// Re-adds an already-encoded entry, keyframe bit included.
    pub fn add_entry(&mut self, entry: IndexEntry2) -> bool {
        self.add(
            entry.ckid,
            entry.pos,
            entry.payload_size(),
            entry.is_keyframe(),
        )
    }

    /// Collapses the chain into the contiguous IndexEntry2 array.
    pub fn materialize_index2(&mut self) -> bool {
        let mut out: Vec<IndexEntry2> = Vec::new();
        if out.try_reserve_exact(self.total_entries).is_err() {
            return false;
        }
        for node in self.chain.drain(..) {
            out.extend(node);
        }
        self.index2 = Some(out);
        true
    }

    pub fn entries(&self) -> &[IndexEntry2] {
        self.index2.as_deref().unwrap_or(&[])
    }

    /// Takes the materialized array, leaving the index empty of it.
    pub fn take_index2(&mut self) -> Vec<IndexEntry2> {
        self.index2.take().unwrap_or_default()
    }

    /// Collapses into the on-disk idx1 record shape for round-tripping.
    pub fn materialize_legacy_index(&mut self) -> Vec<LegacyIndexEntry> {
        let mut out = Vec::with_capacity(self.total_entries);
        for node in self.chain.drain(..) {
            for e in node {
                out.push(LegacyIndexEntry {
                    ckid: e.ckid,
                    flags: if e.is_keyframe() { AVIIF_KEYFRAME } else { 0 },
                    chunk_offset: e.pos as u32,
                    chunk_length: e.payload_size(),
                });
            }
        }
        out
    }

    /// Collapses into the OpenDML pair form, offsets relative to
    /// `base_offset`.
    pub fn materialize_index3(&mut self, base_offset: i64) -> Vec<IndexEntry3> {
        let mut out = Vec::with_capacity(self.total_entries);
        for node in self.chain.drain(..) {
            for e in node {
                out.push(IndexEntry3 {
                    offset: (e.pos - base_offset) as u32,
                    size_keyframe: e.size,
                });
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.chain.clear();
        self.index2 = None;
        self.total_entries = 0;
    }
}

// ============================================================================
// VBR statistics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VbrStats {
    /// bits per second
    pub bitrate_mean: f64,
    /// bits per second
    pub bitrate_stddev: f64,
    /// seconds
    pub max_relative_deviation: f64,
}

/// Computes the audio VBR statistics over a finished index.
///
///   SD(x) = sqrt(n*S(X2) - S(X)^2) / n
pub fn vbr_statistics(entries: &[IndexEntry2], total_bytes: i64, rate: u32, scale: u32) -> VbrStats {
    let frames = entries.len() as i64;
    if frames == 0 || scale == 0 {
        return VbrStats {
            bitrate_mean: 0.0,
            bitrate_stddev: 0.0,
            max_relative_deviation: 0.0,
        };
    }

    let mut size_accum = 0i64;
    let mut max_dev = 0i64;
    let mut size_sq_sum = 0.0f64;

    for (i, entry) in entries.iter().enumerate() {
        let size = entry.payload_size() as i64;
        let mean_center = total_bytes * (2 * i as i64 + 1) / (2 * frames);
        let dev = (mean_center - (size_accum + size / 2)).abs();
        if dev > max_dev {
            max_dev = dev;
        }
        size_accum += size;
        size_sq_sum += (size as f64) * (size as f64);
    }

    let frames_per_second = rate as f64 / scale as f64;
    let sum1_bits = total_bytes as f64 * 8.0;
    let sum2_bits = size_sq_sum * 64.0;

    let bitrate_mean = sum1_bits / frames as f64 * frames_per_second;
    let bitrate_stddev =
        (frames as f64 * sum2_bits - sum1_bits * sum1_bits).max(0.0).sqrt() / frames as f64
            * frames_per_second;
    let max_relative_deviation = if bitrate_mean > 0.0 {
        max_dev as f64 * 8.0 / bitrate_mean
    } else {
        0.0
    };

    VbrStats {
        bitrate_mean,
        bitrate_stddev,
        max_relative_deviation,
    }
}
