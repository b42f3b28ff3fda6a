//! Thumbnail pipeline
//!
//! Read-through over the thumbnail sources with generation on miss:
//!
//! 1. query the thumbnail sources in priority order and return the first
//!    hit
//! 2. on total miss, run the first generator whose declared output matches
//!    the request; its bytes go to the caller and to the persistent sink
//! 3. on generator failure fall back to the next generator; when all fail
//!    the request is `NotFound`
//!
//! Concurrent generations for the same (id, size) coalesce: one leader
//! computes, everyone else waits on the same completion.

use crate::error::{SourceError, SourceResult};
use crate::metrics::Registry;
use crate::sources::thumbdb::ThumbDb;
use crate::sources::{ReadSource, SizeRequest, SourceSet};
use crate::types::{CancelToken, ImageId, SharedBytes, Size};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

type Waiters = Vec<Sender<SourceResult<SharedBytes>>>;

pub struct ThumbnailPipeline {
    sources: SourceSet,
    generators: Vec<Arc<dyn ReadSource>>,
    sink: Arc<ThumbDb>,
    registry: Arc<Registry>,
    pending: Mutex<HashMap<(ImageId, String), Waiters>>,
}

impl ThumbnailPipeline {
    pub fn new(
        sources: SourceSet,
        generators: Vec<Arc<dyn ReadSource>>,
        sink: Arc<ThumbDb>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            sources,
            generators,
            sink,
            registry,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a thumbnail of size class `want` named `size_name`
    pub fn get(
        &self,
        ctx: &CancelToken,
        id: ImageId,
        path: &str,
        original: Size,
        want: SizeRequest,
        size_name: &str,
    ) -> SourceResult<SharedBytes> {
        match self
            .sources
            .resolve_reader(ctx, &self.registry, id, path, original, want)
        {
            Ok(bytes) => return Ok(bytes),
            Err(SourceError::NotFound) => {}
            Err(e) => return Err(e),
        }

        self.generate_coalesced(ctx, id, path, original, want, size_name)
    }

    /// Run the generators, deduplicating concurrent requests per (id, size)
    fn generate_coalesced(
        &self,
        ctx: &CancelToken,
        id: ImageId,
        path: &str,
        original: Size,
        want: SizeRequest,
        size_name: &str,
    ) -> SourceResult<SharedBytes> {
        let key = (id, size_name.to_string());

        let waiter = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&key) {
                Some(waiters) => {
                    let (tx, rx) = bounded(1);
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    pending.insert(key.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.recv() {
                Ok(result) => result,
                Err(_) => Err(SourceError::transient("thumbs", "coalesced generation abandoned")),
            };
        }

        // This caller may have lost the race against a generation that
        // completed between its source query and becoming leader; the sink
        // has the bytes in that case.
        let result = match self.sink.read(id, size_name) {
            Ok(bytes) => Ok(bytes),
            Err(_) => self.generate(ctx, id, path, original, want, size_name),
        };

        let waiters = self.pending.lock().remove(&key).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        result
    }

    /// Try each matching generator in order; persist the first success
    fn generate(
        &self,
        ctx: &CancelToken,
        id: ImageId,
        path: &str,
        _original: Size,
        want: SizeRequest,
        size_name: &str,
    ) -> SourceResult<SharedBytes> {
        for generator in &self.generators {
            if !generator.declared().satisfies(want.size) {
                continue;
            }
            if ctx.is_cancelled() {
                return Err(SourceError::transient("thumbs", "cancelled"));
            }
            let started = Instant::now();
            match generator.read(ctx, id, path) {
                Ok(bytes) => {
                    self.registry
                        .observe_source_latency(generator.name(), started.elapsed());
                    if let Err(e) = self.sink.write(id, size_name, &bytes) {
                        warn!(%id, size_name, "failed to persist thumbnail: {}", e);
                    }
                    return Ok(bytes);
                }
                Err(SourceError::NotAnImage) => return Err(SourceError::NotAnImage),
                Err(e) => {
                    debug!(generator = generator.name(), %id, "generator failed: {}", e);
                }
            }
        }
        Err(SourceError::NotFound)
    }

    /// Forget stored and pending renditions of `id`
    pub fn delete(&self, id: ImageId) -> SourceResult<()> {
        self.sink.delete(id)
    }

    pub fn sink(&self) -> &Arc<ThumbDb> {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Fit;
    use crate::sources::testing::StubSource;
    use crate::sources::{Capability, Declared};
    use tempfile::tempdir;

    fn pipeline(
        sources: Vec<Arc<StubSource>>,
        generators: Vec<Arc<StubSource>>,
        dir: &tempfile::TempDir,
    ) -> ThumbnailPipeline {
        let sink = Arc::new(ThumbDb::open(&dir.path().join("t.thumbs.db")).unwrap());
        ThumbnailPipeline::new(
            SourceSet::new(
                sources
                    .into_iter()
                    .map(|s| Capability::Read(s as Arc<dyn ReadSource>))
                    .collect(),
            ),
            generators
                .into_iter()
                .map(|g| g as Arc<dyn ReadSource>)
                .collect(),
            sink,
            Arc::new(Registry::new()),
        )
    }

    fn want() -> SizeRequest {
        SizeRequest {
            size: Size::new(100, 100),
            fit: Fit::Inside,
        }
    }

    fn declared() -> Declared {
        Declared::bounded(120, 120, Fit::Inside)
    }

    #[test]
    fn test_source_hit_skips_generators() {
        let dir = tempdir().unwrap();
        let source = Arc::new(StubSource::hit("stored", declared(), b"stored"));
        let generator = Arc::new(StubSource::hit("gen", declared(), b"generated"));
        let pipeline = pipeline(vec![source], vec![generator.clone()], &dir);

        let bytes = pipeline
            .get(&CancelToken::new(), ImageId(1), "/p/a.jpg", Size::new(4000, 3000), want(), "S")
            .unwrap();
        assert_eq!(&bytes[..], b"stored");
        assert_eq!(generator.calls(), 0);
    }

    #[test]
    fn test_miss_generates_and_persists() {
        let dir = tempdir().unwrap();
        let source = Arc::new(StubSource::miss("stored", declared(), SourceError::NotFound));
        let generator = Arc::new(StubSource::hit("gen", declared(), b"generated"));
        let pipeline = pipeline(vec![source], vec![generator.clone()], &dir);

        let bytes = pipeline
            .get(&CancelToken::new(), ImageId(1), "/p/a.jpg", Size::new(4000, 3000), want(), "S")
            .unwrap();
        assert_eq!(&bytes[..], b"generated");
        assert_eq!(generator.calls(), 1);
        assert_eq!(&pipeline.sink().read(ImageId(1), "S").unwrap()[..], b"generated");
    }

    #[test]
    fn test_generator_fallback() {
        let dir = tempdir().unwrap();
        let source = Arc::new(StubSource::miss("stored", declared(), SourceError::NotFound));
        let broken = Arc::new(StubSource::miss(
            "broken",
            declared(),
            SourceError::transient("broken", "decode failed"),
        ));
        let backup = Arc::new(StubSource::hit("backup", declared(), b"backup"));
        let pipeline = pipeline(vec![source], vec![broken.clone(), backup.clone()], &dir);

        let bytes = pipeline
            .get(&CancelToken::new(), ImageId(1), "/p/a.jpg", Size::new(4000, 3000), want(), "S")
            .unwrap();
        assert_eq!(&bytes[..], b"backup");
        assert_eq!(broken.calls(), 1);
    }

    #[test]
    fn test_all_generators_fail_is_not_found() {
        let dir = tempdir().unwrap();
        let source = Arc::new(StubSource::miss("stored", declared(), SourceError::NotFound));
        let broken = Arc::new(StubSource::miss(
            "broken",
            declared(),
            SourceError::transient("broken", "boom"),
        ));
        let pipeline = pipeline(vec![source], vec![broken], &dir);

        assert_eq!(
            pipeline
                .get(&CancelToken::new(), ImageId(1), "/p/a.jpg", Size::new(4000, 3000), want(), "S")
                .unwrap_err(),
            SourceError::NotFound
        );
    }

    #[test]
    fn test_concurrent_requests_generate_once() {
        let dir = tempdir().unwrap();
        let source = Arc::new(StubSource::miss("stored", declared(), SourceError::NotFound));
        let generator = Arc::new(StubSource::hit("gen", declared(), b"generated"));
        let pipeline = Arc::new(pipeline(vec![source], vec![generator.clone()], &dir));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let pipeline = Arc::clone(&pipeline);
            handles.push(std::thread::spawn(move || {
                pipeline.get(
                    &CancelToken::new(),
                    ImageId(9),
                    "/p/a.jpg",
                    Size::new(4000, 3000),
                    want(),
                    "S",
                )
            }));
        }
        for handle in handles {
            assert_eq!(&handle.join().unwrap().unwrap()[..], b"generated");
        }
        assert_eq!(generator.calls(), 1);
    }
}
