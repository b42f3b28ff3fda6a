//! Tags and compressed image-id sets
//!
//! A tag owns an [`Ids`] set: a sorted compressed bitmap over image ids,
//! stored in the catalog as a serialized blob. Every mutation bumps the
//! tag's revision; revisions are strictly monotonic per tag so readers can
//! detect staleness without comparing whole bitmaps.

use crate::error::{SourceError, SourceResult};
use crate::types::ImageId;
use roaring::RoaringBitmap;
use serde::Serialize;

/// Tag identifier assigned by the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TagId(pub i64);

/// A named tag at a specific revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub revision: i64,
}

impl Tag {
    /// Render as the wire form `name:revision`
    pub fn name_rev(&self) -> String {
        format!("{}:{}", self.name, self.revision)
    }

    /// Parse the wire form `name:revision`; revision defaults to 0
    pub fn parse_name_rev(text: &str) -> SourceResult<(String, i64)> {
        match text.rsplit_once(':') {
            Some((name, rev)) => {
                if name.is_empty() {
                    return Err(SourceError::NotFound);
                }
                let revision = rev
                    .parse::<i64>()
                    .map_err(|_| SourceError::transient("tag", "invalid revision"))?;
                Ok((name.to_string(), revision))
            }
            None if !text.is_empty() => Ok((text.to_string(), 0)),
            None => Err(SourceError::NotFound),
        }
    }
}

/// A sorted compressed set of image ids
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ids {
    bitmap: RoaringBitmap,
}

impl Ids {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deserialize from the catalog blob form
    pub fn from_blob(blob: &[u8]) -> SourceResult<Self> {
        let bitmap = RoaringBitmap::deserialize_from(blob)
            .map_err(|e| SourceError::Corruption {
                operation: "tag bitmap deserialize".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { bitmap })
    }

    /// Serialize to the catalog blob form
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.bitmap.serialized_size());
        self.bitmap
            .serialize_into(&mut blob)
            .expect("serializing into a Vec cannot fail");
        blob
    }

    pub fn add(&mut self, id: ImageId) {
        self.bitmap.insert(id.0);
    }

    pub fn contains(&self, id: ImageId) -> bool {
        self.bitmap.contains(id.0)
    }

    pub fn len(&self) -> u64 {
        self.bitmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// Set union with `other`
    pub fn union_with(&mut self, other: &Ids) {
        self.bitmap |= &other.bitmap;
    }

    /// Set difference: remove every id in `other`
    pub fn difference_with(&mut self, other: &Ids) {
        self.bitmap -= &other.bitmap;
    }

    /// Toggle membership for every id in `other`
    pub fn symmetric_difference_with(&mut self, other: &Ids) {
        self.bitmap ^= &other.bitmap;
    }

    pub fn iter(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.bitmap.iter().map(ImageId)
    }
}

impl FromIterator<ImageId> for Ids {
    fn from_iter<I: IntoIterator<Item = ImageId>>(iter: I) -> Self {
        let mut set = Ids::new();
        for id in iter {
            set.add(id);
        }
        set
    }
}
