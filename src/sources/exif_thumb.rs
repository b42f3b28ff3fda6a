//! Embedded EXIF thumbnail source
//!
//! Cameras embed a small JPEG preview in the EXIF block of most photos;
//! serving it avoids decoding the full image for low zoom levels. Bytes
//! are sniffed before being returned so a mangled preview falls through to
//! the next source instead of rendering garbage.

use crate::config::Fit;
use crate::error::{SourceError, SourceResult};
use crate::exif::Extractor;
use crate::sources::{Declared, ReadSource, SourceMeta};
use crate::types::{CancelToken, ImageId, SharedBytes};
use std::sync::Arc;

/// Typical embedded preview bound
const EXIF_THUMB_EDGE: u32 = 160;

pub struct ExifThumbSource {
    extractor: Arc<Extractor>,
}

impl ExifThumbSource {
    pub fn new(extractor: Arc<Extractor>) -> Self {
        Self { extractor }
    }
}

impl SourceMeta for ExifThumbSource {
    fn name(&self) -> &str {
        "exif-thumb"
    }

    fn declared(&self) -> Declared {
        Declared::bounded(EXIF_THUMB_EDGE, EXIF_THUMB_EDGE, Fit::Inside)
    }

    fn exists(&self, _id: ImageId, path: &str) -> bool {
        self.extractor.embedded_thumbnail(path).is_ok()
    }
}

impl ReadSource for ExifThumbSource {
    fn read(&self, _ctx: &CancelToken, _id: ImageId, path: &str) -> SourceResult<SharedBytes> {
        let bytes = self.extractor.embedded_thumbnail(path)?;
        if !infer::is_image(&bytes) {
            return Err(SourceError::transient(
                self.name(),
                "embedded thumbnail is not an image",
            ));
        }
        Ok(bytes.into())
    }
}
