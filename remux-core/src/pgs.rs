// PGS/SUP READER - Blu-ray presentation graphics subtitles
//
// A SUP file is a sequence of "PG" segments: magic, 90 kHz PTS/DTS, segment
// type, segment size, payload. Segments accumulate into one frame until a
// display segment closes the set.

use std::io::{Read, Seek};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::{put_u16_be, ByteSource};

pub const PGS_FILE_MAGIC: u16 = 0x5047; // "PG"
pub const PGS_DISPLAY_SEGMENT: u8 = 0x80;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgsFrame {
    /// nanoseconds, from the first segment's 90 kHz PTS
    pub timestamp: u64,
    /// segment stream with the 10-byte per-segment file headers dropped;
    /// each segment keeps its (type, size) prefix
    pub data: Vec<u8>,
}

pub struct PgsReader<R> {
    src: ByteSource<R>,
    bytes_processed: u64,
}

impl<R: Read + Seek> PgsReader<R> {
    pub fn probe(src: &mut ByteSource<R>) -> bool {
        let ok = (|| -> Result<bool> {
            if src.size() < 5 {
                return Ok(false);
            }
            src.seek(0)?;
            if src.read_u16_be()? != PGS_FILE_MAGIC {
                return Ok(false);
            }
            src.skip(4 + 4 + 1)?;
            let segment_size = src.read_u16_be()?;
            if src.position() + segment_size as u64 + 2 >= src.size() {
                return Ok(false);
            }
            src.skip(segment_size as i64)?;
            Ok(src.read_u16_be()? == PGS_FILE_MAGIC)
        })()
        .unwrap_or(false);
        let _ = src.seek(0);
        ok
    }

    pub fn open(mut src: ByteSource<R>) -> Result<Self> {
        src.seek(0)?;
        Ok(Self {
            src,
            bytes_processed: 0,
        })
    }

    pub fn progress(&self) -> u32 {
        if self.src.size() == 0 {
            return 100;
        }
        (100 * self.bytes_processed / self.src.size()) as u32
    }

    /// Reads segments up to and including the next display segment. Returns
    /// None at end of stream.
    pub fn next_frame(&mut self) -> Option<PgsFrame> {
        let mut frame: Vec<u8> = Vec::new();
        let mut timestamp = 0u64;

        loop {
            let read = (|| -> Result<(u8, u16, Vec<u8>)> {
                if self.src.read_u16_be()? != PGS_FILE_MAGIC {
                    return Err(crate::error::ParseError::structure(
                        self.src.position(),
                        "lost PGS segment sync",
                    ));
                }
                if frame.is_empty() {
                    timestamp = self.src.read_u32_be()? as u64 * 100_000 / 9;
                } else {
                    self.src.skip(4)?;
                }
                self.src.skip(4)?; // DTS

                let segment_type = self.src.read_u8()?;
                let segment_size = self.src.read_u16_be()?;
                let payload = self.src.read_vec(segment_size as usize)?;
                Ok((segment_type, segment_size, payload))
            })();

            let (segment_type, segment_size, payload) = match read {
                Ok(v) => v,
                Err(_) => return None,
            };

            let previous_size = frame.len();
            frame.resize(previous_size + 3 + segment_size as usize, 0);
            frame[previous_size] = segment_type;
            put_u16_be(&mut frame[previous_size + 1..], segment_size);
            frame[previous_size + 3..].copy_from_slice(&payload);

            self.bytes_processed += 10 + 3 + segment_size as u64;

            if segment_type == PGS_DISPLAY_SEGMENT {
                return Some(PgsFrame {
                    timestamp,
                    data: frame,
                });
            }
        }
    }
}

// JSON identification helper
pub fn pgs_probe(path: &str) -> std::result::Result<serde_json::Value, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("Open error: {}", e))?;
    let mut source = ByteSource::new(file).map_err(|e| format!("Open error: {}", e))?;
    let recognized = PgsReader::probe(&mut source);
    serde_json::to_value(serde_json::json!({
        "container": "PGSSUP",
        "recognized": recognized,
        "tracks": if recognized { vec!["PGS"] } else { vec![] },
    }))
    .map_err(|e| format!("JSON error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn segment(pts: u32, segment_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = PGS_FILE_MAGIC.to_be_bytes().to_vec();
        v.extend_from_slice(&pts.to_be_bytes());
        v.extend_from_slice(&0u32.to_be_bytes()); // DTS
        v.push(segment_type);
        v.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    fn open(bytes: Vec<u8>) -> PgsReader<Cursor<Vec<u8>>> {
        PgsReader::open(ByteSource::new(Cursor::new(bytes)).unwrap()).unwrap()
    }

    #[test]
    fn probe_needs_two_segments() {
        let mut file = segment(0, 0x16, &[1, 2, 3]);
        file.extend_from_slice(&segment(0, PGS_DISPLAY_SEGMENT, &[]));
        let mut src = ByteSource::new(Cursor::new(file)).unwrap();
        assert!(PgsReader::probe(&mut src));

        let mut garbage = ByteSource::new(Cursor::new(vec![0u8; 32])).unwrap();
        assert!(!PgsReader::probe(&mut garbage));
    }

    #[test]
    fn segments_accumulate_until_display() {
        let mut file = segment(90_000, 0x16, &[0xAA, 0xBB]);
        file.extend_from_slice(&segment(90_000, 0x17, &[0xCC]));
        file.extend_from_slice(&segment(90_000, PGS_DISPLAY_SEGMENT, &[]));
        file.extend_from_slice(&segment(180_000, 0x16, &[0x11]));
        file.extend_from_slice(&segment(180_000, PGS_DISPLAY_SEGMENT, &[]));

        let mut reader = open(file);

        let f1 = reader.next_frame().unwrap();
        assert_eq!(f1.timestamp, 1_000_000_000);
        assert_eq!(
            f1.data,
            vec![0x16, 0x00, 0x02, 0xAA, 0xBB, 0x17, 0x00, 0x01, 0xCC, 0x80, 0x00, 0x00]
        );

        let f2 = reader.next_frame().unwrap();
        assert_eq!(f2.timestamp, 2_000_000_000);
        assert_eq!(f2.data, vec![0x16, 0x00, 0x01, 0x11, 0x80, 0x00, 0x00]);

        assert!(reader.next_frame().is_none());
        assert_eq!(reader.progress(), 100);
    }
}
