//! Thumbnail generator source
//!
//! Generates one canonical thumbnail variant by decoding the original and
//! resizing it to the configured class, encoding as JPEG. Only consulted
//! when every thumbnail source misses; the pipeline persists its output
//! into the sink.

use crate::config::{Fit, ThumbnailSpec};
use crate::error::{SourceError, SourceResult};
use crate::sources::decoder::DecoderSource;
use crate::sources::{DecodeSource, Declared, ReadSource, SourceMeta};
use crate::types::{CancelToken, ImageId, SharedBytes};
use image::codecs::jpeg::JpegEncoder;
use std::path::Path;

const JPEG_QUALITY: u8 = 85;

pub struct ResizeGenerator {
    name: String,
    spec: ThumbnailSpec,
    decoder: DecoderSource,
}

impl ResizeGenerator {
    pub fn new(spec: ThumbnailSpec) -> Self {
        Self {
            name: format!("gen-{}", spec.name),
            spec,
            decoder: DecoderSource,
        }
    }

    /// Extensions this generator accepts; empty list means all
    fn accepts(&self, path: &str) -> bool {
        if self.spec.extensions.is_empty() {
            return true;
        }
        let ext = match path.rfind('.') {
            Some(idx) => path[idx..].to_lowercase(),
            None => return false,
        };
        self.spec.extensions.iter().any(|e| *e == ext)
    }
}

impl SourceMeta for ResizeGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn declared(&self) -> Declared {
        Declared::bounded(self.spec.width, self.spec.height, self.spec.fit)
    }

    fn exists(&self, _id: ImageId, path: &str) -> bool {
        self.accepts(path) && Path::new(path).is_file()
    }
}

impl ReadSource for ResizeGenerator {
    fn read(&self, ctx: &CancelToken, id: ImageId, path: &str) -> SourceResult<SharedBytes> {
        if !self.accepts(path) {
            return Err(SourceError::NotAnImage);
        }

        let decoded = self.decoder.decode(ctx, id, path)?;
        let resized = match self.spec.fit {
            Fit::Inside => decoded
                .image
                .thumbnail(self.spec.width, self.spec.height),
            Fit::Outside => decoded.image.resize_to_fill(
                self.spec.width,
                self.spec.height,
                image::imageops::FilterType::Triangle,
            ),
            Fit::Original => decoded.image,
        };

        let mut bytes = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
        resized
            .to_rgb8()
            .write_with_encoder(encoder)
            .map_err(|e| SourceError::transient(&self.name, e))?;
        Ok(bytes.into())
    }
}
