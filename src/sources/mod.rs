//! Rendition sources and the priority-ordered chain
//!
//! A source is any provider that can produce bytes or decoded pixels for a
//! given (image id, path). Capabilities are narrow traits ([`ReadSource`]
//! for encoded bytes, [`DecodeSource`] for pixels) and a chain entry
//! carries exactly the capability its provider implements, so resolution
//! dispatches on the capability set instead of probing at runtime.
//!
//! Resolving a request scans the chain in priority order, skipping entries
//! whose declared output cannot satisfy the requested size, preferring the
//! smallest sufficient rendition (with a matching fit mode breaking ties)
//! and falling through per-source misses and transient failures. Each
//! successful call records latency into the metrics registry.

pub mod cached;
pub mod decoder;
pub mod exif_thumb;
pub mod files;
pub mod nas;
pub mod resize;
pub mod thumbdb;
pub mod video;

use crate::config::Fit;
use crate::error::{SourceError, SourceResult};
use crate::metrics::Registry;
use crate::types::{CancelToken, ImageId, SharedBytes, Size};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Decoded pixels produced by a [`DecodeSource`]
#[derive(Debug)]
pub struct Decoded {
    pub image: image::DynamicImage,
}

impl Decoded {
    pub fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }
}

/// Declared output class of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Declared {
    /// Bounding box of produced renditions; zero means original-sized
    pub size: Size,
    pub fit: Fit,
}

impl Declared {
    pub fn original() -> Self {
        Self {
            size: Size::default(),
            fit: Fit::Original,
        }
    }

    pub fn bounded(width: u32, height: u32, fit: Fit) -> Self {
        Self {
            size: Size::new(width, height),
            fit,
        }
    }

    /// Whether this class can satisfy a request for `want`
    pub fn satisfies(&self, want: Size) -> bool {
        match self.fit {
            Fit::Original => true,
            _ => self.size.covers(want),
        }
    }

    /// Output pixel count for an original of `original` size, used to rank
    /// candidates cheapest-first
    pub fn output_area(&self, original: Size) -> u64 {
        let out = match self.fit {
            Fit::Original => original,
            Fit::Inside => original.fit_inside(self.size),
            Fit::Outside => self.size,
        };
        // Unknown original dimensions rank original-size sources last.
        if out.width == 0 || out.height == 0 {
            return u64::MAX;
        }
        out.width as u64 * out.height as u64
    }
}

/// Shared metadata of every source
pub trait SourceMeta: Send + Sync {
    fn name(&self) -> &str;

    fn declared(&self) -> Declared;

    /// Cheap existence probe without producing bytes
    fn exists(&self, id: ImageId, path: &str) -> bool;
}

/// A source producing encoded image bytes
pub trait ReadSource: SourceMeta {
    fn read(&self, ctx: &CancelToken, id: ImageId, path: &str) -> SourceResult<SharedBytes>;
}

/// A source producing decoded pixels
pub trait DecodeSource: SourceMeta {
    fn decode(&self, ctx: &CancelToken, id: ImageId, path: &str) -> SourceResult<Decoded>;
}

/// The capability a chain entry exposes
#[derive(Clone)]
pub enum Capability {
    Read(Arc<dyn ReadSource>),
    Decode(Arc<dyn DecodeSource>),
}

impl Capability {
    pub fn meta(&self) -> &dyn SourceMeta {
        match self {
            Capability::Read(s) => s.as_ref(),
            Capability::Decode(s) => s.as_ref(),
        }
    }
}

/// A size request against the chain
#[derive(Debug, Clone, Copy)]
pub struct SizeRequest {
    pub size: Size,
    pub fit: Fit,
}

impl SizeRequest {
    pub fn original() -> Self {
        Self {
            size: Size::default(),
            fit: Fit::Original,
        }
    }
}

/// Bounded retry for transient per-source failures
pub(crate) fn retry_transient<T>(
    attempts: u32,
    mut f: impl FnMut() -> SourceResult<T>,
) -> SourceResult<T> {
    let mut backoff = Duration::from_millis(10);
    let mut tried = 0;
    loop {
        match f() {
            Err(SourceError::Transient { .. }) if tried + 1 < attempts => {
                tried += 1;
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            other => return other,
        }
    }
}

/// A priority-ordered list of sources
#[derive(Clone, Default)]
pub struct SourceSet {
    entries: Vec<Capability>,
}

impl SourceSet {
    pub fn new(entries: Vec<Capability>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.entries.iter()
    }

    /// Candidate entries able to satisfy `want`, cheapest first
    ///
    /// Stable ordering implements the tie-breaks: within one size class a
    /// fit mode matching the request wins, fit-inside beats fit-outside
    /// when neither matches, and the earlier entry wins otherwise.
    fn candidates(&self, original: Size, want: SizeRequest) -> Vec<&Capability> {
        let mut out: Vec<(u64, u8, usize, &Capability)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.meta().declared().satisfies(want.size))
            .map(|(idx, entry)| {
                let declared = entry.meta().declared();
                let fit_rank = if declared.fit == want.fit {
                    0
                } else {
                    match declared.fit {
                        Fit::Inside => 1,
                        Fit::Outside => 2,
                        Fit::Original => 3,
                    }
                };
                (declared.output_area(original), fit_rank, idx, entry)
            })
            .collect();
        out.sort_by_key(|&(area, fit_rank, idx, _)| (area, fit_rank, idx));
        out.into_iter().map(|(_, _, _, entry)| entry).collect()
    }

    /// Resolve encoded bytes for the request
    ///
    /// Per-source misses and transient failures advance to the next entry;
    /// `NotAnImage` short-circuits. Returns `NotFound` when every candidate
    /// missed.
    pub fn resolve_reader(
        &self,
        ctx: &CancelToken,
        registry: &Registry,
        id: ImageId,
        path: &str,
        original: Size,
        want: SizeRequest,
    ) -> SourceResult<SharedBytes> {
        for entry in self.candidates(original, want) {
            if ctx.is_cancelled() {
                return Err(SourceError::transient("chain", "cancelled"));
            }
            let reader = match entry {
                Capability::Read(reader) => reader,
                Capability::Decode(_) => continue,
            };
            let started = Instant::now();
            match reader.read(ctx, id, path) {
                Ok(bytes) => {
                    registry.observe_source_latency(reader.name(), started.elapsed());
                    return Ok(bytes);
                }
                Err(SourceError::NotAnImage) => return Err(SourceError::NotAnImage),
                Err(e @ SourceError::Corruption { .. }) => return Err(e),
                Err(e) => {
                    debug!(source = reader.name(), %id, "source miss: {}", e);
                }
            }
        }
        Err(SourceError::NotFound)
    }

    /// Resolve decoded pixels for the request
    ///
    /// Decode capabilities produce pixels directly; read capabilities
    /// produce bytes which are decoded here.
    pub fn resolve_decoded(
        &self,
        ctx: &CancelToken,
        registry: &Registry,
        id: ImageId,
        path: &str,
        original: Size,
        want: SizeRequest,
    ) -> SourceResult<Decoded> {
        for entry in self.candidates(original, want) {
            if ctx.is_cancelled() {
                return Err(SourceError::transient("chain", "cancelled"));
            }
            let started = Instant::now();
            let result = match entry {
                Capability::Decode(source) => source.decode(ctx, id, path),
                Capability::Read(source) => source.read(ctx, id, path).and_then(|bytes| {
                    image::load_from_memory(&bytes)
                        .map(|image| Decoded { image })
                        .map_err(|e| SourceError::transient(source.name(), e))
                }),
            };
            let name = entry.meta().name();
            match result {
                Ok(decoded) => {
                    let elapsed = started.elapsed();
                    registry.observe_source_latency(name, elapsed);
                    registry.observe_megapixel_latency(
                        name,
                        elapsed,
                        original.megapixels(),
                        decoded.size().megapixels(),
                    );
                    return Ok(decoded);
                }
                Err(SourceError::NotAnImage) => return Err(SourceError::NotAnImage),
                Err(e @ SourceError::Corruption { .. }) => return Err(e),
                Err(e) => {
                    debug!(source = name, %id, "source miss: {}", e);
                }
            }
        }
        Err(SourceError::NotFound)
    }

    /// First entry with the given name that can produce bytes
    pub fn reader_by_name(&self, name: &str) -> Option<&Arc<dyn ReadSource>> {
        self.entries.iter().find_map(|entry| match entry {
            Capability::Read(reader) if reader.name() == name => Some(reader),
            _ => None,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Stub sources for chain and pipeline tests

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted read source counting its invocations
    pub struct StubSource {
        pub name: String,
        pub declared: Declared,
        pub bytes: Option<SharedBytes>,
        pub error: Option<SourceError>,
        pub calls: AtomicUsize,
    }

    impl StubSource {
        pub fn hit(name: &str, declared: Declared, bytes: &[u8]) -> Self {
            Self {
                name: name.to_string(),
                declared,
                bytes: Some(bytes.into()),
                error: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn miss(name: &str, declared: Declared, error: SourceError) -> Self {
            Self {
                name: name.to_string(),
                declared,
                bytes: None,
                error: Some(error),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl SourceMeta for StubSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn declared(&self) -> Declared {
            self.declared
        }

        fn exists(&self, _id: ImageId, _path: &str) -> bool {
            self.bytes.is_some()
        }
    }

    impl ReadSource for StubSource {
        fn read(&self, _ctx: &CancelToken, _id: ImageId, _path: &str) -> SourceResult<SharedBytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match (&self.bytes, &self.error) {
                (_, Some(error)) => Err(error.clone()),
                (Some(bytes), None) => Ok(bytes.clone()),
                (None, None) => Err(SourceError::NotFound),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StubSource;
    use super::*;

    fn want(width: u32, height: u32) -> SizeRequest {
        SizeRequest {
            size: Size::new(width, height),
            fit: Fit::Inside,
        }
    }

    #[test]
    fn test_declared_satisfies() {
        let small = Declared::bounded(120, 120, Fit::Inside);
        assert!(small.satisfies(Size::new(100, 100)));
        assert!(!small.satisfies(Size::new(200, 100)));
        assert!(Declared::original().satisfies(Size::new(4000, 4000)));
    }

    #[test]
    fn test_chain_prefers_smallest_sufficient() {
        let small = Arc::new(StubSource::hit(
            "small",
            Declared::bounded(120, 120, Fit::Inside),
            b"small",
        ));
        let large = Arc::new(StubSource::hit(
            "large",
            Declared::bounded(1280, 1280, Fit::Inside),
            b"large",
        ));
        let chain = SourceSet::new(vec![
            Capability::Read(large.clone()),
            Capability::Read(small.clone()),
        ]);

        let registry = Registry::new();
        let bytes = chain
            .resolve_reader(
                &CancelToken::new(),
                &registry,
                ImageId(1),
                "/p/a.jpg",
                Size::new(4000, 3000),
                want(100, 100),
            )
            .unwrap();
        assert_eq!(&bytes[..], b"small");
        assert_eq!(small.calls(), 1);
        assert_eq!(large.calls(), 0);
        assert_eq!(registry.count(crate::metrics::SOURCE_LATENCY, "small"), 1);
    }

    #[test]
    fn test_chain_skips_insufficient_classes() {
        let small = Arc::new(StubSource::hit(
            "small",
            Declared::bounded(120, 120, Fit::Inside),
            b"small",
        ));
        let large = Arc::new(StubSource::hit(
            "large",
            Declared::bounded(1280, 1280, Fit::Inside),
            b"large",
        ));
        let chain = SourceSet::new(vec![
            Capability::Read(small.clone()),
            Capability::Read(large.clone()),
        ]);

        let bytes = chain
            .resolve_reader(
                &CancelToken::new(),
                &Registry::new(),
                ImageId(1),
                "/p/a.jpg",
                Size::new(4000, 3000),
                want(640, 640),
            )
            .unwrap();
        assert_eq!(&bytes[..], b"large");
        assert_eq!(small.calls(), 0);
    }

    #[test]
    fn test_chain_advances_past_misses() {
        let missing = Arc::new(StubSource::miss(
            "missing",
            Declared::bounded(120, 120, Fit::Inside),
            SourceError::NotFound,
        ));
        let flaky = Arc::new(StubSource::miss(
            "flaky",
            Declared::bounded(120, 120, Fit::Inside),
            SourceError::transient("flaky", "io"),
        ));
        let good = Arc::new(StubSource::hit(
            "good",
            Declared::bounded(120, 120, Fit::Inside),
            b"ok",
        ));
        let chain = SourceSet::new(vec![
            Capability::Read(missing.clone()),
            Capability::Read(flaky.clone()),
            Capability::Read(good.clone()),
        ]);

        let bytes = chain
            .resolve_reader(
                &CancelToken::new(),
                &Registry::new(),
                ImageId(1),
                "/p/a.jpg",
                Size::new(4000, 3000),
                want(100, 100),
            )
            .unwrap();
        assert_eq!(&bytes[..], b"ok");
        assert_eq!(missing.calls(), 1);
        assert_eq!(flaky.calls(), 1);
    }

    #[test]
    fn test_chain_short_circuits_not_an_image() {
        let gate = Arc::new(StubSource::miss(
            "gate",
            Declared::bounded(120, 120, Fit::Inside),
            SourceError::NotAnImage,
        ));
        let never = Arc::new(StubSource::hit(
            "never",
            Declared::bounded(120, 120, Fit::Inside),
            b"x",
        ));
        let chain = SourceSet::new(vec![
            Capability::Read(gate.clone()),
            Capability::Read(never.clone()),
        ]);

        let err = chain
            .resolve_reader(
                &CancelToken::new(),
                &Registry::new(),
                ImageId(1),
                "/p/a.mov",
                Size::new(1920, 1080),
                want(100, 100),
            )
            .unwrap_err();
        assert_eq!(err, SourceError::NotAnImage);
        assert_eq!(never.calls(), 0);
    }

    #[test]
    fn test_tiebreak_same_class_earlier_wins() {
        let first = Arc::new(StubSource::hit(
            "first",
            Declared::bounded(120, 120, Fit::Inside),
            b"first",
        ));
        let second = Arc::new(StubSource::hit(
            "second",
            Declared::bounded(120, 120, Fit::Inside),
            b"second",
        ));
        let chain = SourceSet::new(vec![
            Capability::Read(first.clone()),
            Capability::Read(second.clone()),
        ]);

        let bytes = chain
            .resolve_reader(
                &CancelToken::new(),
                &Registry::new(),
                ImageId(1),
                "/p/a.jpg",
                Size::new(4000, 3000),
                want(100, 100),
            )
            .unwrap();
        assert_eq!(&bytes[..], b"first");
    }

    #[test]
    fn test_tiebreak_matching_fit_wins() {
        let outside = Arc::new(StubSource::hit(
            "outside",
            Declared::bounded(120, 120, Fit::Outside),
            b"outside",
        ));
        let inside = Arc::new(StubSource::hit(
            "inside",
            Declared::bounded(120, 120, Fit::Inside),
            b"inside",
        ));
        let chain = SourceSet::new(vec![
            Capability::Read(outside.clone()),
            Capability::Read(inside.clone()),
        ]);

        // Equal areas force the fit comparison; only the square original
        // keeps inside/outside outputs identical in size.
        let bytes = chain
            .resolve_reader(
                &CancelToken::new(),
                &Registry::new(),
                ImageId(1),
                "/p/a.jpg",
                Size::new(2000, 2000),
                want(100, 100),
            )
            .unwrap();
        assert_eq!(&bytes[..], b"inside");
    }

    #[test]
    fn test_tiebreak_inside_wins_when_neither_fit_matches() {
        let outside = Arc::new(StubSource::hit(
            "outside",
            Declared::bounded(120, 120, Fit::Outside),
            b"outside",
        ));
        let inside = Arc::new(StubSource::hit(
            "inside",
            Declared::bounded(120, 120, Fit::Inside),
            b"inside",
        ));
        let chain = SourceSet::new(vec![
            Capability::Read(outside.clone()),
            Capability::Read(inside.clone()),
        ]);

        // The request asks for the original fit, so neither candidate
        // matches; with equal output areas (square original) the inside
        // variant must still win over the earlier-registered outside one.
        let bytes = chain
            .resolve_reader(
                &CancelToken::new(),
                &Registry::new(),
                ImageId(1),
                "/p/a.jpg",
                Size::new(2000, 2000),
                SizeRequest {
                    size: Size::new(100, 100),
                    fit: Fit::Original,
                },
            )
            .unwrap();
        assert_eq!(&bytes[..], b"inside");
        assert_eq!(outside.calls(), 0);
    }

    #[test]
    fn test_retry_transient_bounded() {
        let mut calls = 0;
        let result: SourceResult<()> = retry_transient(3, || {
            calls += 1;
            Err(SourceError::transient("s", "io"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result = retry_transient(3, || {
            calls += 1;
            if calls < 2 {
                Err(SourceError::transient("s", "io"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 2);
    }
}
