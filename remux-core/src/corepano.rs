// COREPANORAMA READER - still-image panorama XML
//
// A CorePanorama file lists timed still pictures:
//
//   <CorePanorama>
//     <Info width="1024" height="768"/>
//     <Picture time="00:00:01.000" end="00:00:05.000" type="jpeg"
//              panorama="flat" url="pic1.jpg"/>
//   </CorePanorama>
//
// Each delivered frame is a 7-byte private header (header size, panorama
// type, picture type) followed by the picture file's bytes.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ParseError, Result};
use crate::io::{put_u16_be, put_u32_be};

pub const COREPICTURE_TYPE_JPEG: u8 = 1;
pub const COREPICTURE_TYPE_PNG: u8 = 2;

pub const COREPICTURE_PAN_FLAT: u32 = 0;
pub const COREPICTURE_PAN_BASIC: u32 = 1;
pub const COREPICTURE_PAN_WRAPAROUND: u32 = 2;
pub const COREPICTURE_PAN_SPHERICAL: u32 = 3;

pub const COREPICTURE_USE_JPEG: u32 = 1;
pub const COREPICTURE_USE_PNG: u32 = 2;

static ELEMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\s*([A-Za-z]+)((?:\s+[A-Za-z]+\s*=\s*\x22[^\x22]*\x22)*)\s*/?>").unwrap());
static ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z]+)\s*=\s*"([^"]*)""#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorePicture {
    pub time: i64,
    pub end_time: i64,
    pub pic_type: u8,
    pub pan_type: u32,
    pub url: PathBuf,
}

impl CorePicture {
    fn is_valid(&self) -> bool {
        self.time >= 0 && self.pic_type != 0 && !self.url.as_os_str().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorePanoramaInfo {
    pub width: i32,
    pub height: i32,
    pub pictures: Vec<CorePicture>,
}

/// One delivered still: private header + picture bytes.
#[derive(Debug, Clone)]
pub struct CorePictureFrame {
    pub timestamp: i64,
    pub duration: Option<i64>,
    pub data: Vec<u8>,
}

/// Parses "HH:MM:SS", "HH:MM:SS.fff" or plain seconds into nanoseconds.
pub fn parse_timecode(s: &str) -> Option<i64> {
    static TC_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(?:(\d+):)?(\d+):(\d+)(?:\.(\d{1,9}))?$").unwrap());

    if let Some(caps) = TC_RE.captures(s.trim()) {
        let hours: i64 = caps.get(1).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let minutes: i64 = caps[2].parse().ok()?;
        let seconds: i64 = caps[3].parse().ok()?;
        let nanos = match caps.get(4) {
            Some(frac) => {
                let digits = frac.as_str();
                let value: i64 = digits.parse().ok()?;
                value * 10i64.pow(9 - digits.len() as u32)
            }
            None => 0,
        };
        return Some(((hours * 60 + minutes) * 60 + seconds) * 1_000_000_000 + nanos);
    }

    s.trim()
        .parse::<i64>()
        .ok()
        .map(|secs| secs * 1_000_000_000)
}

pub struct CorePanoramaReader {
    info: CorePanoramaInfo,
    base_dir: PathBuf,
    current: usize,
}

impl CorePanoramaReader {
    /// The root element must be CorePanorama.
    pub fn probe(text: &str) -> bool {
        ELEMENT_RE
            .captures(text)
            .map(|c| c[1].eq_ignore_ascii_case("CorePanorama"))
            .unwrap_or(false)
    }

    pub fn parse(text: &str, base_dir: &Path) -> Result<Self> {
        if !Self::probe(text) {
            return Err(ParseError::structure(0, "not a CorePanorama document"));
        }

        let mut info = CorePanoramaInfo {
            width: -1,
            height: -1,
            pictures: Vec::new(),
        };

        for element in ELEMENT_RE.captures_iter(text) {
            let name = &element[1];
            let attrs = element.get(2).map(|m| m.as_str()).unwrap_or("");

            if name.eq_ignore_ascii_case("Info") {
                for attr in ATTR_RE.captures_iter(attrs) {
                    match attr[1].to_ascii_lowercase().as_str() {
                        "width" => info.width = attr[2].parse().unwrap_or(-1),
                        "height" => info.height = attr[2].parse().unwrap_or(-1),
                        _ => {}
                    }
                }
            } else if name.eq_ignore_ascii_case("Picture") {
                let mut picture = CorePicture {
                    time: -1,
                    end_time: -1,
                    pic_type: 0,
                    pan_type: COREPICTURE_PAN_FLAT,
                    url: PathBuf::new(),
                };
                for attr in ATTR_RE.captures_iter(attrs) {
                    let value = &attr[2];
                    match attr[1].to_ascii_lowercase().as_str() {
                        "time" => {
                            picture.time = parse_timecode(value).ok_or_else(|| {
                                ParseError::structure(0, "invalid start timecode")
                            })?
                        }
                        "end" => picture.end_time = parse_timecode(value).unwrap_or(-1),
                        "type" => {
                            picture.pic_type = match value.to_ascii_lowercase().as_str() {
                                "jpeg" | "jpg" => COREPICTURE_TYPE_JPEG,
                                "png" => COREPICTURE_TYPE_PNG,
                                other => {
                                    warn!(picture_type = other, "picture type not recognized");
                                    0
                                }
                            }
                        }
                        "panorama" => {
                            picture.pan_type = match value.to_ascii_lowercase().as_str() {
                                "flat" => COREPICTURE_PAN_FLAT,
                                "pan" => COREPICTURE_PAN_BASIC,
                                "wraparound" => COREPICTURE_PAN_WRAPAROUND,
                                "spherical" => COREPICTURE_PAN_SPHERICAL,
                                other => {
                                    warn!(panorama = other, "panoramic mode not recognized");
                                    COREPICTURE_PAN_FLAT
                                }
                            }
                        }
                        "url" => picture.url = PathBuf::from(value),
                        _ => {}
                    }
                }
                if picture.is_valid() {
                    info.pictures.push(picture);
                }
            }
        }

        info.pictures.sort_by_key(|p| p.time);

        Ok(Self {
            info,
            base_dir: base_dir.to_path_buf(),
            current: 0,
        })
    }

    pub fn info(&self) -> &CorePanoramaInfo {
        &self.info
    }

    /// Codec private data: version byte plus the set of picture codecs used.
    pub fn codec_private(&self) -> [u8; 5] {
        let mut codec_used = 0u32;
        for picture in &self.info.pictures {
            match picture.pic_type {
                COREPICTURE_TYPE_JPEG => codec_used |= COREPICTURE_USE_JPEG,
                COREPICTURE_TYPE_PNG => codec_used |= COREPICTURE_USE_PNG,
                _ => {}
            }
        }
        let mut private = [0u8; 5];
        put_u32_be(&mut private[1..], codec_used);
        private
    }

    pub fn progress(&self) -> u32 {
        if self.info.pictures.is_empty() {
            return 0;
        }
        (100 * self.current / self.info.pictures.len()) as u32
    }

    /// Reads the next picture file and wraps it with the private header.
    pub fn next_frame(&mut self) -> Result<Option<CorePictureFrame>> {
        let picture = match self.info.pictures.get(self.current) {
            Some(p) => p.clone(),
            None => return Ok(None),
        };
        self.current += 1;

        let path = if picture.url.is_absolute() {
            picture.url.clone()
        } else {
            self.base_dir.join(&picture.url)
        };
        let bytes = std::fs::read(&path).map_err(|e| {
            ParseError::io(0, format!("impossible to use file '{}': {}", path.display(), e))
        })?;

        let mut data = vec![0u8; 7 + bytes.len()];
        put_u16_be(&mut data[0..], 7);
        put_u32_be(&mut data[2..], picture.pan_type);
        data[6] = picture.pic_type;
        data[7..].copy_from_slice(&bytes);

        let duration = if picture.end_time == -1 {
            None
        } else {
            Some(picture.end_time - picture.time)
        };

        Ok(Some(CorePictureFrame {
            timestamp: picture.time,
            duration,
            data,
        }))
    }
}

// JSON identification helper
pub fn corepano_probe(path: &str) -> std::result::Result<serde_json::Value, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("Open error: {}", e))?;
    let base = Path::new(path).parent().unwrap_or_else(|| Path::new("."));
    let reader = CorePanoramaReader::parse(&text, base).map_err(|e| e.to_string())?;
    serde_json::to_value(reader.info()).map_err(|e| format!("JSON error: {}", e))
}
