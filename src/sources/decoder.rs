//! Full-image decoder source
//!
//! Decodes the original file into pixels, applying the EXIF orientation so
//! downstream consumers always see upright images. The most expensive
//! source in the chain; everything else exists to avoid it.

use crate::error::{SourceError, SourceResult};
use crate::sources::{Decoded, DecodeSource, Declared, SourceMeta};
use crate::types::{CancelToken, ImageId};
use image::DynamicImage;
use std::path::Path;

pub struct DecoderSource;

impl DecoderSource {
    fn decode_oriented(&self, path: &str) -> SourceResult<DynamicImage> {
        let reader = image::ImageReader::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::NotFound
            } else {
                SourceError::transient("decoder", e)
            }
        })?;
        let decoded = reader
            .with_guessed_format()
            .map_err(|e| SourceError::transient("decoder", e))?
            .decode()
            .map_err(|e| SourceError::transient("decoder", e))?;
        Ok(apply_orientation(decoded, orientation_of(path)))
    }
}

impl SourceMeta for DecoderSource {
    fn name(&self) -> &str {
        "decoder"
    }

    fn declared(&self) -> Declared {
        Declared::original()
    }

    fn exists(&self, _id: ImageId, path: &str) -> bool {
        Path::new(path).is_file()
    }
}

impl DecodeSource for DecoderSource {
    fn decode(&self, _ctx: &CancelToken, _id: ImageId, path: &str) -> SourceResult<Decoded> {
        Ok(Decoded {
            image: self.decode_oriented(path)?,
        })
    }
}

fn orientation_of(path: &str) -> u8 {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return 1,
    };
    let mut reader = std::io::BufReader::new(file);
    let exif_data = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(data) => data,
        Err(_) => return 1,
    };
    exif_data
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .filter(|v| (1..=8).contains(v))
        .unwrap_or(1) as u8
}

/// Normalize an image per its EXIF orientation value (1..=8)
fn apply_orientation(image: DynamicImage, orientation: u8) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}
