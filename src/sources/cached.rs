//! Byte-cache wrapper around a read source
//!
//! Every render source is wrapped by the shared byte cache, keyed by
//! (source name, image id, declared size). Concurrent requests for the
//! same key coalesce onto a single underlying read; immediate repeats are
//! served byte-identical from memory without touching the source.

use crate::cache::{ByteCache, ByteCacheKey};
use crate::error::SourceResult;
use crate::sources::{Declared, ReadSource, SourceMeta};
use crate::types::{CancelToken, ImageId, SharedBytes};
use std::sync::Arc;

pub struct CachedSource {
    inner: Arc<dyn ReadSource>,
    cache: Arc<ByteCache>,
    size_label: String,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn ReadSource>, cache: Arc<ByteCache>) -> Self {
        let declared = inner.declared();
        let size_label = if declared.size == crate::types::Size::default() {
            "original".to_string()
        } else {
            format!("{}x{}", declared.size.width, declared.size.height)
        };
        Self {
            inner,
            cache,
            size_label,
        }
    }

    fn key(&self, id: ImageId) -> ByteCacheKey {
        ByteCacheKey::new(self.inner.name(), id, &self.size_label)
    }
}

impl SourceMeta for CachedSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn declared(&self) -> Declared {
        self.inner.declared()
    }

    fn exists(&self, id: ImageId, path: &str) -> bool {
        self.cache.get(&self.key(id)).is_some() || self.inner.exists(id, path)
    }
}

impl ReadSource for CachedSource {
    fn read(&self, ctx: &CancelToken, id: ImageId, path: &str) -> SourceResult<SharedBytes> {
        self.cache
            .get_or_fill(&self.key(id), || self.inner.read(ctx, id, path))
    }
}
