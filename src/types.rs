//! Core row and identifier types shared across the pipeline

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Dense 32-bit image identifier assigned by the catalog on first sighting
/// of a path. Ids are never reused within a database; a deleted row leaves
/// a tombstone.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ImageId(pub u32);

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Pixel dimensions of an image or rendition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Area in megapixels
    pub fn megapixels(&self) -> f64 {
        (self.width as f64 * self.height as f64) / 1_000_000.0
    }

    /// True when this size covers `other` in both dimensions
    pub fn covers(&self, other: Size) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Dimensions after scaling to fit inside `bounds`, preserving aspect
    pub fn fit_inside(&self, bounds: Size) -> Size {
        if self.width == 0 || self.height == 0 {
            return bounds;
        }
        let scale = f64::min(
            bounds.width as f64 / self.width as f64,
            bounds.height as f64 / self.height as f64,
        );
        Size {
            width: ((self.width as f64 * scale) as u32).max(1),
            height: ((self.height as f64 * scale) as u32).max(1),
        }
    }
}

/// Per-image indexed attributes
///
/// Zero-valued fields mean "not indexed yet": `width == 0` or a zero
/// timestamp marks missing metadata, `color == 0` marks a missing dominant
/// color. The embedding lives in its own catalog table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Info {
    pub width: u32,
    pub height: u32,
    /// EXIF orientation, 1..=8; 1 is the identity
    #[serde(default = "default_orientation")]
    pub orientation: u8,
    /// Capture timestamp as unix seconds, 0 = unknown
    pub taken_at_unix: i64,
    /// Dominant color packed as 0x00RRGGBB, 0 = unknown
    pub color: u32,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Reverse-geocoded place name, when the geocoder is enabled
    pub location: Option<String>,
}

fn default_orientation() -> u8 {
    1
}

impl Info {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Width/height after applying the EXIF orientation swap
    pub fn oriented_size(&self) -> Size {
        match self.orientation {
            5..=8 => Size::new(self.height, self.width),
            _ => self.size(),
        }
    }

    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        if self.taken_at_unix == 0 {
            return None;
        }
        Utc.timestamp_opt(self.taken_at_unix, 0).single()
    }

    /// Metadata flag: dimensions or timestamp have not been indexed
    pub fn needs_meta(&self) -> bool {
        self.width == 0 || self.taken_at_unix == 0
    }

    /// Color flag: no dominant color computed yet
    pub fn needs_color(&self) -> bool {
        self.color == 0
    }
}

/// A listing row: an id together with its indexed attributes
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedInfo {
    pub id: ImageId,
    pub info: Info,
}

/// An id resolved back to its filesystem path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPath {
    pub id: ImageId,
    pub path: String,
}

/// Which parts of an image's indexed state are absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Missing {
    pub metadata: bool,
    pub color: bool,
    pub embedding: bool,
}

impl Missing {
    pub fn any(&self) -> bool {
        self.metadata || self.color || self.embedding
    }
}

/// Work order produced to the indexing queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingInfo {
    pub id: ImageId,
    pub path: String,
    pub missing: Missing,
}

/// A listing row scored against a reference embedding
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityInfo {
    pub sourced: SourcedInfo,
    pub similarity: f32,
}

/// How a catalog write applies to an existing row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert only if the path is absent, preserving any existing id
    Append,
    /// Overwrite only the non-default fields of the incoming info
    Merge,
    /// Replace the row fully
    Update,
}

/// Request-scoped cancellation token with an optional deadline
///
/// Every lazy-sequence producer polls the token and closes its output
/// channel promptly once it trips.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    deadline: parking_lot::Mutex<Option<Instant>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that trips automatically after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        *token.inner.deadline.lock() = Some(Instant::now() + timeout);
        token
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match *self.inner.deadline.lock() {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Shared immutable byte buffer handed out by sources and caches
pub type SharedBytes = Arc<[u8]>;

/// Wrap shared bytes in a `Read + Seek` cursor
pub fn bytes_reader(bytes: SharedBytes) -> std::io::Cursor<SharedBytes> {
    std::io::Cursor::new(bytes)
}

/// Pack RGB components into the catalog's 0x00RRGGBB representation
pub fn pack_rgb(r: u8, g: u8, b: u8) -> u32 {
    ((r as u32) << 16) | ((g as u32) << 8) | (b as u32)
}

/// Unpack a 0x00RRGGBB color
pub fn unpack_rgb(color: u32) -> (u8, u8, u8) {
    (
        ((color >> 16) & 0xff) as u8,
        ((color >> 8) & 0xff) as u8,
        (color & 0xff) as u8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_flags() {
        let mut info = Info::default();
        assert!(info.needs_meta());
        assert!(info.needs_color());

        info.width = 4032;
        info.height = 3024;
        assert!(info.needs_meta()); // timestamp still unset

        info.taken_at_unix = 1_600_000_000;
        assert!(!info.needs_meta());

        info.color = pack_rgb(0x20, 0x40, 0x80);
        assert!(!info.needs_color());
    }

    #[test]
    fn test_oriented_size() {
        let info = Info {
            width: 4000,
            height: 3000,
            orientation: 6,
            ..Info::default()
        };
        assert_eq!(info.oriented_size(), Size::new(3000, 4000));
    }

    #[test]
    fn test_fit_inside() {
        let original = Size::new(4000, 3000);
        let fitted = original.fit_inside(Size::new(256, 256));
        assert_eq!(fitted, Size::new(256, 192));
        assert!(Size::new(256, 256).covers(fitted));
    }

    #[test]
    fn test_taken_at() {
        let info = Info {
            taken_at_unix: 1_626_342_600,
            ..Info::default()
        };
        let taken = info.taken_at().unwrap();
        assert_eq!(taken.timestamp(), 1_626_342_600);
        assert!(Info::default().taken_at().is_none());
    }

    #[test]
    fn test_pack_unpack_rgb() {
        let packed = pack_rgb(0x12, 0x34, 0x56);
        assert_eq!(packed, 0x123456);
        assert_eq!(unpack_rgb(packed), (0x12, 0x34, 0x56));
    }

    #[test]
    fn test_cancel_token_deadline() {
        let token = CancelToken::with_timeout(Duration::from_millis(0));
        assert!(token.is_cancelled());

        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
