//! Templated filesystem thumbnail source
//!
//! NAS appliances pre-generate thumbnails next to the originals in
//! appliance-specific layouts, e.g. Synology's
//! `{{.Dir}}@eaDir/{{.Filename}}/SYNOPHOTO_THUMB_SM.jpg`. The template
//! placeholders are:
//!
//! - `{{.Dir}}`: the containing directory, with trailing separator
//! - `{{.Filename}}`: the basename without extension

use crate::error::{SourceError, SourceResult};
use crate::sources::{retry_transient, Declared, ReadSource, SourceMeta};
use crate::types::{CancelToken, ImageId, SharedBytes};
use std::path::Path;

pub struct NasThumbSource {
    name: String,
    template: String,
    declared: Declared,
}

impl NasThumbSource {
    pub fn new(name: &str, template: &str, declared: Declared) -> Self {
        Self {
            name: name.to_string(),
            template: template.to_string(),
            declared,
        }
    }

    /// Render the template for an original image path
    fn thumbnail_path(&self, original: &str) -> Option<String> {
        let path = Path::new(original);
        let dir = path.parent()?.to_str()?;
        let stem = path.file_stem()?.to_str()?;

        let mut dir_with_sep = dir.to_string();
        if !dir_with_sep.ends_with(std::path::MAIN_SEPARATOR) {
            dir_with_sep.push(std::path::MAIN_SEPARATOR);
        }

        Some(
            self.template
                .replace("{{.Dir}}", &dir_with_sep)
                .replace("{{.Filename}}", stem),
        )
    }
}

impl SourceMeta for NasThumbSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn declared(&self) -> Declared {
        self.declared
    }

    fn exists(&self, _id: ImageId, path: &str) -> bool {
        self.thumbnail_path(path)
            .map(|p| Path::new(&p).is_file())
            .unwrap_or(false)
    }
}

impl ReadSource for NasThumbSource {
    fn read(&self, _ctx: &CancelToken, _id: ImageId, path: &str) -> SourceResult<SharedBytes> {
        let thumb_path = self.thumbnail_path(path).ok_or(SourceError::NotFound)?;
        retry_transient(3, || match std::fs::read(&thumb_path) {
            Ok(bytes) => Ok(bytes.into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SourceError::NotFound),
            Err(e) => Err(SourceError::transient(&self.name, e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Fit;

    fn source(template: &str) -> NasThumbSource {
        NasThumbSource::new(
            "synology-sm",
            template,
            Declared::bounded(320, 320, Fit::Inside),
        )
    }

    #[test]
    fn test_template_rendering() {
        let sep = std::path::MAIN_SEPARATOR;
        let template = format!("{{{{.Dir}}}}@eaDir{}{{{{.Filename}}}}{}SYNOPHOTO_THUMB_SM.jpg", sep, sep);
        let source = source(&template);

        let original = format!("{0}photos{0}trip{0}IMG_0042.JPG", sep);
        let rendered = source.thumbnail_path(&original).unwrap();
        assert_eq!(
            rendered,
            format!("{0}photos{0}trip{0}@eaDir{0}IMG_0042{0}SYNOPHOTO_THUMB_SM.jpg", sep)
        );
    }

    #[test]
    fn test_read_rendered_path() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("IMG_1.jpg");
        std::fs::write(&original, b"orig").unwrap();
        std::fs::write(dir.path().join("IMG_1.thumb.jpg"), b"thumb bytes").unwrap();

        let source = source("{{.Dir}}{{.Filename}}.thumb.jpg");
        let original_str = original.to_str().unwrap();
        assert!(source.exists(ImageId(1), original_str));
        let bytes = source
            .read(&CancelToken::new(), ImageId(1), original_str)
            .unwrap();
        assert_eq!(&bytes[..], b"thumb bytes");
    }

    #[test]
    fn test_missing_thumbnail_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("IMG_2.jpg");
        std::fs::write(&original, b"orig").unwrap();

        let source = source("{{.Dir}}{{.Filename}}.thumb.jpg");
        assert!(!source.exists(ImageId(1), original.to_str().unwrap()));
        assert_eq!(
            source
                .read(&CancelToken::new(), ImageId(1), original.to_str().unwrap())
                .unwrap_err(),
            SourceError::NotFound
        );
    }
}
