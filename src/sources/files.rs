//! Original-file source
//!
//! Reads the image file itself, unscaled. Sits last in the render chain as
//! the rendition of last resort for byte requests.

use crate::error::{SourceError, SourceResult};
use crate::sources::{retry_transient, Declared, ReadSource, SourceMeta};
use crate::types::{CancelToken, ImageId, SharedBytes};
use std::path::Path;

pub struct FileSource;

impl SourceMeta for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    fn declared(&self) -> Declared {
        Declared::original()
    }

    fn exists(&self, _id: ImageId, path: &str) -> bool {
        Path::new(path).is_file()
    }
}

impl ReadSource for FileSource {
    fn read(&self, _ctx: &CancelToken, _id: ImageId, path: &str) -> SourceResult<SharedBytes> {
        retry_transient(3, || match std::fs::read(path) {
            Ok(bytes) => Ok(bytes.into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SourceError::NotFound),
            Err(e) => Err(SourceError::transient("file", e)),
        })
    }
}
