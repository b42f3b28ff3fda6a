//! EXIF metadata extraction
//!
//! Extraction runs through a bounded pool so at most `exif_tool_count`
//! files are being parsed at any moment, no matter how many indexing
//! workers are running. Date strings are tried against the configured
//! formats in order until one parses; formats carrying a `%z` offset keep
//! their timezone, the rest are assumed UTC.

use crate::error::{SourceError, SourceResult};
use crate::types::Info;
use chrono::{DateTime, NaiveDateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use exif::{In, Tag, Value};
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// Bounded permit pool for concurrent extractions
struct ExtractPool {
    permits: Receiver<()>,
    returns: Sender<()>,
}

impl ExtractPool {
    fn new(count: usize) -> Self {
        let (tx, rx) = bounded(count);
        for _ in 0..count {
            tx.send(()).expect("pool channel sized to permit count");
        }
        Self {
            permits: rx,
            returns: tx,
        }
    }

    fn acquire(&self) -> Permit<'_> {
        self.permits.recv().expect("pool channel never closes");
        Permit { pool: self }
    }
}

/// RAII permit; returning it unblocks the next extraction
struct Permit<'a> {
    pool: &'a ExtractPool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let _ = self.pool.returns.send(());
    }
}

/// EXIF extractor with a bounded concurrency pool
pub struct Extractor {
    pool: ExtractPool,
    date_formats: Vec<String>,
}

impl Extractor {
    pub fn new(tool_count: usize, date_formats: Vec<String>) -> Self {
        Self {
            pool: ExtractPool::new(tool_count.max(1)),
            date_formats,
        }
    }

    /// Extract dimensions, orientation, capture time and GPS position
    ///
    /// Dimensions come from the image header even when EXIF is absent;
    /// an absent or unparseable date leaves the info incomplete rather
    /// than guessing from the filename.
    pub fn extract(&self, path: &str) -> SourceResult<Info> {
        let _permit = self.pool.acquire();

        let mut info = Info::default();

        if let Ok((width, height)) = image::image_dimensions(path) {
            info.width = width;
            info.height = height;
        }

        let exif_data = match read_exif(Path::new(path)) {
            Some(data) => data,
            None => {
                debug!(path, "no EXIF data");
                return Ok(info);
            }
        };

        if let Some(field) = exif_data.get_field(Tag::Orientation, In::PRIMARY) {
            if let Some(v @ 1..=8) = field.value.get_uint(0) {
                info.orientation = v as u8;
            }
        }

        for tag in [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime] {
            let text = match exif_data.get_field(tag, In::PRIMARY).map(|f| &f.value) {
                Some(Value::Ascii(items)) if !items.is_empty() => {
                    String::from_utf8_lossy(&items[0]).into_owned()
                }
                _ => continue,
            };
            if let Some(taken) = parse_exif_date(&text, &self.date_formats) {
                info.taken_at_unix = taken.timestamp();
                break;
            }
        }

        if let Some((lat, lon)) = extract_gps(&exif_data) {
            info.lat = Some(lat);
            info.lon = Some(lon);
        }

        Ok(info)
    }

    /// Raw bytes of the thumbnail embedded in the EXIF block, if any
    pub fn embedded_thumbnail(&self, path: &str) -> SourceResult<Vec<u8>> {
        let _permit = self.pool.acquire();

        let exif_data = read_exif(Path::new(path)).ok_or(SourceError::NotFound)?;

        let offset = exif_data
            .get_field(Tag::JPEGInterchangeFormat, In::THUMBNAIL)
            .and_then(|f| f.value.get_uint(0))
            .ok_or(SourceError::NotFound)? as usize;
        let length = exif_data
            .get_field(Tag::JPEGInterchangeFormatLength, In::THUMBNAIL)
            .and_then(|f| f.value.get_uint(0))
            .ok_or(SourceError::NotFound)? as usize;

        let buf = exif_data.buf();
        if offset.saturating_add(length) > buf.len() || length == 0 {
            return Err(SourceError::transient(
                "exif-thumb",
                "embedded thumbnail out of bounds",
            ));
        }
        Ok(buf[offset..offset + length].to_vec())
    }
}

fn read_exif(path: &Path) -> Option<exif::Exif> {
    let file = std::fs::File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    exif::Reader::new().read_from_container(&mut reader).ok()
}

/// Try each configured format in order until one parses
pub fn parse_exif_date(text: &str, formats: &[String]) -> Option<DateTime<Utc>> {
    let text = text.trim().trim_matches('"');
    for format in formats {
        if format.contains("%z") {
            if let Ok(dt) = DateTime::parse_from_str(text, format) {
                return Some(dt.with_timezone(&Utc));
            }
        } else if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Extract GPS coordinates as (latitude, longitude) in decimal degrees
fn extract_gps(exif_data: &exif::Exif) -> Option<(f64, f64)> {
    let lat_field = exif_data.get_field(Tag::GPSLatitude, In::PRIMARY)?;
    let lon_field = exif_data.get_field(Tag::GPSLongitude, In::PRIMARY)?;

    let mut lat = parse_gps_coordinate(&lat_field.value)?;
    let mut lon = parse_gps_coordinate(&lon_field.value)?;

    if let Some(field) = exif_data.get_field(Tag::GPSLatitudeRef, In::PRIMARY) {
        let r = field.value.display_as(Tag::GPSLatitudeRef).to_string();
        if r.trim().eq_ignore_ascii_case("S") {
            lat = -lat;
        }
    }
    if let Some(field) = exif_data.get_field(Tag::GPSLongitudeRef, In::PRIMARY) {
        let r = field.value.display_as(Tag::GPSLongitudeRef).to_string();
        if r.trim().eq_ignore_ascii_case("W") {
            lon = -lon;
        }
    }

    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}

/// Convert a degrees/minutes/seconds rational triple to decimal degrees
fn parse_gps_coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::Rational(parts) if !parts.is_empty() => {
            let degrees = parts[0].to_f64();
            let minutes = parts.get(1).map(|r| r.to_f64()).unwrap_or(0.0);
            let seconds = parts.get(2).map(|r| r.to_f64()).unwrap_or(0.0);
            Some(degrees + minutes / 60.0 + seconds / 3600.0)
        }
        _ => None,
    }
}
