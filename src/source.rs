//! The image source: catalog, chains, queues and caches wired together
//!
//! ```text
//! ┌───────────────┐    walk     ┌──────────────┐   write/batch   ┌─────────────┐
//! │  Directories  ├────────────►│    Walker    ├────────────────►│   Catalog   │
//! └───────────────┘             └──────────────┘                 │  (SQLite)   │
//!                                                                └──────┬──────┘
//!                               ┌──────────────┐   MissingInfo          │
//!                               │ Index queues │◄───────────────────────┘
//!                               │ meta/contents│
//!                               └──────┬───────┘
//!                                      │ EXIF / color / embedding
//!                                      ▼
//! ┌───────────────┐   resolve   ┌──────────────┐   miss   ┌───────────────────┐
//! │ Tile requests ├────────────►│ Source chain ├─────────►│ Thumbnail pipeline│
//! └───────────────┘             │ (cached)     │          │ generate + sink   │
//!                               └──────────────┘          └───────────────────┘
//! ```
//!
//! One `ImageSource` is shared process-wide; everything inside is behind
//! its own synchronization.

use crate::cache::{ByteCache, InfoCache, PathCache};
use crate::catalog::{Catalog, ListOptions};
use crate::color::prominent_color;
use crate::config::{Config, Fit, ThumbnailSpec};
use crate::embedding::{Clip, DisabledClip, Embedding};
use crate::error::{PipelineError, Result, SourceError, SourceResult};
use crate::exif::Extractor;
use crate::geo::{DisabledGeocoder, ReverseGeocoder};
use crate::metrics::Registry;
use crate::queue::{IndexQueue, QueueProgress};
use crate::sources::cached::CachedSource;
use crate::sources::decoder::DecoderSource;
use crate::sources::exif_thumb::ExifThumbSource;
use crate::sources::files::FileSource;
use crate::sources::nas::NasThumbSource;
use crate::sources::resize::ResizeGenerator;
use crate::sources::thumbdb::{ThumbDb, ThumbDbSource};
use crate::sources::video::{find_ffmpeg, VideoFrameSource, VIDEO_TIERS};
use crate::sources::{
    Capability, Decoded, Declared, ReadSource, SizeRequest, SourceSet,
};
use crate::tags::{Ids, Tag, TagId};
use crate::thumbs::ThumbnailPipeline;
use crate::types::{
    bytes_reader, CancelToken, ImageId, Info, Missing, MissingInfo, SharedBytes, Size,
    SourcedInfo, WriteMode,
};
use crate::walker::walk_files;
use crossbeam_channel::Receiver;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Catalog database filename inside the data directory
const CATALOG_FILE: &str = "photocanvas.cache.db";

/// Thumbnail sink filename inside the data directory
const THUMBS_FILE: &str = "photocanvas.thumbs.db";

/// Decode size used when computing dominant colors
const COLOR_DECODE_EDGE: u32 = 256;

/// Byte size class handed to the AI collaborator
const EMBED_EDGE: u32 = 720;

pub struct ImageSource {
    config: Config,
    catalog: Catalog,
    extractor: Arc<Extractor>,
    registry: Arc<Registry>,

    path_cache: PathCache,
    info_cache: InfoCache,
    byte_cache: Arc<ByteCache>,

    render_sources: SourceSet,
    thumbs: ThumbnailPipeline,

    clip: Arc<dyn Clip>,
    geocoder: Arc<dyn ReverseGeocoder>,

    metadata_queue: OnceLock<Arc<IndexQueue<MissingInfo>>>,
    contents_queue: OnceLock<Arc<IndexQueue<MissingInfo>>>,
}

impl ImageSource {
    /// Build the source with the default (disabled) collaborators
    pub fn new(config: Config, data_dir: &Path) -> Result<Arc<Self>> {
        Self::with_collaborators(
            config,
            data_dir,
            Arc::new(DisabledClip),
            Arc::new(DisabledGeocoder),
        )
    }

    pub fn with_collaborators(
        config: Config,
        data_dir: &Path,
        clip: Arc<dyn Clip>,
        geocoder: Arc<dyn ReverseGeocoder>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let catalog = Catalog::open(&data_dir.join(CATALOG_FILE))?;
        let sink = Arc::new(ThumbDb::open(&data_dir.join(THUMBS_FILE))?);
        let registry = Arc::new(Registry::new());
        let byte_cache = Arc::new(ByteCache::new(
            config.caches.image.max_size_bytes().map_err(PipelineError::Config)?,
        ));
        let extractor = Arc::new(Extractor::new(
            config.exif_tool_count,
            config.date_formats.clone(),
        ));

        let (render_sources, thumb_sources, generators) =
            build_chains(&config, &sink, &extractor, &byte_cache);

        let thumbs = ThumbnailPipeline::new(
            thumb_sources,
            generators,
            Arc::clone(&sink),
            Arc::clone(&registry),
        );

        let source = Arc::new(Self {
            config,
            catalog,
            extractor,
            registry,
            path_cache: PathCache::new(),
            info_cache: InfoCache::new(),
            byte_cache,
            render_sources,
            thumbs,
            clip,
            geocoder,
            metadata_queue: OnceLock::new(),
            contents_queue: OnceLock::new(),
        });

        if source.config.skip_load_info {
            info!("skipping load info; indexing queues not started");
        } else {
            let for_meta = Arc::clone(&source);
            let _ = source.metadata_queue.set(IndexQueue::start(
                "index-metadata",
                source.config.concurrent_meta_loads,
                move |item| for_meta.index_metadata_item(item),
            ));
            let for_contents = Arc::clone(&source);
            let _ = source.contents_queue.set(IndexQueue::start(
                "index-contents",
                source.config.concurrent_color_loads,
                move |item| for_contents.index_contents_item(item),
            ));
        }

        Ok(source)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ---- media kinds ----

    pub fn is_supported_image(&self, path: &str) -> bool {
        self.config.images.matches(path)
    }

    pub fn is_supported_video(&self, path: &str) -> bool {
        self.config.videos.matches(path)
    }

    // ---- point lookups ----

    /// Prefer ImageId over paths; this is the read-through id -> path map
    pub fn get_image_path(&self, id: ImageId) -> SourceResult<String> {
        if let Some(path) = self.path_cache.get(id) {
            return Ok(path);
        }
        match self.catalog.get_path_from_id(id) {
            Ok(path) => {
                self.path_cache.set(id, path.clone());
                Ok(path)
            }
            Err(crate::error::CatalogError::NotFound) => Err(SourceError::NotFound),
            Err(e) => Err(SourceError::Corruption {
                operation: "get_path_from_id".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Id for a path, assigning one through the catalog when unseen
    pub fn get_image_id(&self, path: &str) -> SourceResult<ImageId> {
        let path = normalize_path(path);
        if let Ok(id) = self.catalog.get_id_from_path(&path) {
            return Ok(id);
        }
        self.catalog.write(&path, Info::default(), WriteMode::Append);
        self.catalog.wait_for_commit();
        self.catalog
            .get_id_from_path(&path)
            .map_err(|_| SourceError::NotFound)
    }

    pub fn get_info(&self, id: ImageId) -> SourceResult<Info> {
        if let Some(info) = self.info_cache.get(id) {
            return Ok(info);
        }
        match self.catalog.get_info(id) {
            Ok(info) => {
                self.info_cache.set(id, info.clone());
                Ok(info)
            }
            Err(_) => Err(SourceError::NotFound),
        }
    }

    pub fn get_dir(&self, dir: &str) -> SourceResult<crate::catalog::DirRow> {
        self.catalog
            .get_dir(&normalize_path(dir))
            .map_err(|_| SourceError::NotFound)
    }

    pub fn get_dirs_count(&self, dirs: &[String]) -> u64 {
        let dirs = normalize_paths(dirs);
        self.catalog.get_dirs_count(&dirs).unwrap_or(0)
    }

    pub fn get_image_embedding(&self, id: ImageId) -> SourceResult<Embedding> {
        self.catalog
            .get_image_embedding(id)
            .map_err(|_| SourceError::NotFound)
    }

    // ---- listings ----

    /// Paths of indexed images under `dirs`, capped at `max` per root
    pub fn list_images(
        &self,
        dirs: &[String],
        max: usize,
        cancel: CancelToken,
    ) -> Receiver<String> {
        self.catalog.list_paths(&normalize_paths(dirs), max, cancel)
    }

    pub fn list_image_ids(
        &self,
        dirs: &[String],
        max: usize,
        cancel: CancelToken,
    ) -> Receiver<ImageId> {
        self.catalog
            .list_ids(&normalize_paths(dirs), max, false, self.clip.model(), cancel)
    }

    /// Ids lacking an embedding row for the current model
    pub fn list_missing_embedding_ids(
        &self,
        dirs: &[String],
        max: usize,
        cancel: CancelToken,
    ) -> Receiver<ImageId> {
        self.catalog
            .list_ids(&normalize_paths(dirs), max, true, self.clip.model(), cancel)
    }

    pub fn list_infos(
        &self,
        dirs: &[String],
        options: ListOptions,
        cancel: CancelToken,
    ) -> Receiver<SourcedInfo> {
        self.catalog.list(&normalize_paths(dirs), options, cancel)
    }

    fn list_missing(
        &self,
        dirs: &[String],
        max: usize,
        want: Missing,
        force: Missing,
        cancel: CancelToken,
    ) -> Receiver<MissingInfo> {
        // Forcing any flag lists every row; the forced flags are OR-ed back
        // into each work order.
        let effective = if force.any() { Missing::default() } else { want };
        let rx = self.catalog.list_missing(
            &normalize_paths(dirs),
            max,
            effective,
            self.clip.model(),
            cancel,
        );
        if !force.any() {
            return rx;
        }
        let (tx, out) = crossbeam_channel::bounded(256);
        std::thread::Builder::new()
            .name("force-missing".into())
            .spawn(move || {
                for mut item in rx {
                    item.missing.metadata |= force.metadata;
                    item.missing.color |= force.color;
                    item.missing.embedding |= force.embedding;
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn force-missing forwarder");
        out
    }

    // ---- indexing ----

    /// Walk `dir` into the catalog, dropping rows whose files are gone
    ///
    /// `progress` is called with a running count of walked files.
    pub fn index_files<F: Fn(u64)>(&self, dir: &str, max: usize, progress: F) -> Result<u64> {
        let dir = normalize_path(dir);
        let cancel = CancelToken::new();
        let paths = walk_files(Path::new(&dir), &self.config.extensions, max, cancel.clone())?;

        let mut observed: HashSet<String> = HashSet::new();
        let mut count = 0u64;
        for path in paths {
            self.catalog.write(&path, Info::default(), WriteMode::Append);
            observed.insert(path);
            count += 1;
            progress(count);
        }

        for id_path in self.catalog.delete_nonexistent(&dir, observed, cancel) {
            debug!(path = %id_path.path, id = %id_path.id, "removing vanished file");
            self.catalog.delete(id_path.id);
            if let Err(e) = self.thumbs.delete(id_path.id) {
                warn!(id = %id_path.id, "failed to delete thumbnails: {}", e);
            }
            self.path_cache.remove(id_path.id);
            self.info_cache.remove(id_path.id);
            self.byte_cache.invalidate_id(id_path.id);
        }

        self.catalog.set_indexed(&dir);
        self.catalog.wait_for_commit();
        Ok(count)
    }

    /// Queue metadata extraction for everything missing it
    pub fn index_metadata(&self, dirs: &[String], max: usize, force: Missing) {
        let queue = match self.metadata_queue.get() {
            Some(queue) => queue,
            None => {
                debug!("metadata queue not running");
                return;
            }
        };
        let want = Missing {
            metadata: true,
            ..Missing::default()
        };
        let force = Missing {
            metadata: force.metadata,
            ..Missing::default()
        };
        queue.append_items(self.list_missing(dirs, max, want, force, CancelToken::new()));
    }

    /// Queue color and embedding extraction for everything missing them
    pub fn index_contents(&self, dirs: &[String], max: usize, force: Missing) {
        let queue = match self.contents_queue.get() {
            Some(queue) => queue,
            None => {
                debug!("contents queue not running");
                return;
            }
        };
        let want = Missing {
            color: true,
            embedding: self.clip.available(),
            ..Missing::default()
        };
        let force = Missing {
            color: force.color,
            embedding: force.embedding,
            ..Missing::default()
        };
        queue.append_items(self.list_missing(dirs, max, want, force, CancelToken::new()));
    }

    pub fn metadata_progress(&self) -> QueueProgress {
        self.metadata_queue
            .get()
            .map(|q| q.progress())
            .unwrap_or_default()
    }

    pub fn contents_progress(&self) -> QueueProgress {
        self.contents_queue
            .get()
            .map(|q| q.progress())
            .unwrap_or_default()
    }

    /// Block until both queues are quiescent and their writes committed
    pub fn wait_for_indexing(&self) {
        if let Some(queue) = self.metadata_queue.get() {
            queue.wait_until_done();
        }
        if let Some(queue) = self.contents_queue.get() {
            queue.wait_until_done();
        }
        self.catalog.wait_for_commit();
    }

    /// Metadata worker: EXIF, date heuristics, optional geocoding
    fn index_metadata_item(&self, item: MissingInfo) -> Result<()> {
        if !item.missing.metadata {
            return Ok(());
        }
        if !self.is_supported_image(&item.path) && !self.is_supported_video(&item.path) {
            return Err(SourceError::NotAnImage.into());
        }

        let mut info = self.extractor.extract(&item.path)?;

        if self.geocoder.available() {
            if let (Some(lat), Some(lon)) = (info.lat, info.lon) {
                match self.geocoder.reverse_geocode(lat, lon) {
                    Ok(location) => info.location = Some(location),
                    Err(SourceError::Unavailable) => {}
                    Err(e) => debug!(path = %item.path, "reverse geocode failed: {}", e),
                }
            }
        }

        self.catalog.write(&item.path, info, WriteMode::Merge);
        self.info_cache.remove(item.id);
        Ok(())
    }

    /// Contents worker: dominant color, then embedding when available
    fn index_contents_item(&self, item: MissingInfo) -> Result<()> {
        if item.missing.color {
            let ctx = CancelToken::new();
            let original = self.get_info(item.id).map(|i| i.size()).unwrap_or_default();
            let decoded = self.resolve_decoded_at(
                &ctx,
                item.id,
                &item.path,
                original,
                Size::new(COLOR_DECODE_EDGE, COLOR_DECODE_EDGE),
            )?;
            let color = prominent_color(&decoded.image);
            self.catalog.write(
                &item.path,
                Info {
                    color,
                    ..Info::default()
                },
                WriteMode::Merge,
            );
            self.info_cache.remove(item.id);
        }

        if item.missing.embedding {
            if !self.clip.available() {
                return Err(SourceError::Unavailable.into());
            }
            let ctx = CancelToken::new();
            let original = self.get_info(item.id).map(|i| i.size()).unwrap_or_default();
            let bytes = self.render_sources.resolve_reader(
                &ctx,
                &self.registry,
                item.id,
                &item.path,
                original,
                SizeRequest {
                    size: Size::new(EMBED_EDGE, EMBED_EDGE),
                    fit: Fit::Inside,
                },
            )?;
            let embedding = self.clip.embed_image(&bytes)?;
            self.catalog.write_embedding(item.id, embedding);
        }

        Ok(())
    }

    // ---- renditions ----

    /// Encoded bytes of the cheapest rendition at least as large as `want`
    pub fn get_render_bytes(
        &self,
        ctx: &CancelToken,
        id: ImageId,
        want: SizeRequest,
    ) -> SourceResult<SharedBytes> {
        let path = self.get_image_path(id)?;
        let original = self.get_info(id).map(|i| i.size()).unwrap_or_default();
        self.render_sources
            .resolve_reader(ctx, &self.registry, id, &path, original, want)
    }

    /// Decoded pixels of the cheapest rendition at least as large as `want`
    pub fn get_decoded(
        &self,
        ctx: &CancelToken,
        id: ImageId,
        want: SizeRequest,
    ) -> SourceResult<Decoded> {
        let path = self.get_image_path(id)?;
        let original = self.get_info(id).map(|i| i.size()).unwrap_or_default();
        self.resolve_decoded_at(ctx, id, &path, original, want.size)
    }

    fn resolve_decoded_at(
        &self,
        ctx: &CancelToken,
        id: ImageId,
        path: &str,
        original: Size,
        size: Size,
    ) -> SourceResult<Decoded> {
        self.render_sources.resolve_decoded(
            ctx,
            &self.registry,
            id,
            path,
            original,
            SizeRequest {
                size,
                fit: Fit::Inside,
            },
        )
    }

    /// Seekable reader over the bytes of one specific named render source
    pub fn get_image_reader(
        &self,
        ctx: &CancelToken,
        id: ImageId,
        source_name: &str,
    ) -> SourceResult<std::io::Cursor<SharedBytes>> {
        let path = self.get_image_path(id)?;
        let reader = self
            .render_sources
            .reader_by_name(source_name)
            .ok_or(SourceError::NotFound)?;
        reader.read(ctx, id, &path).map(bytes_reader)
    }

    /// Thumbnail of the configured size class `size_name`
    pub fn get_thumbnail(
        &self,
        ctx: &CancelToken,
        id: ImageId,
        size_name: &str,
    ) -> SourceResult<SharedBytes> {
        let spec = self
            .config
            .thumbnails
            .iter()
            .find(|t| t.name == size_name)
            .ok_or(SourceError::NotFound)?;
        let path = self.get_image_path(id)?;
        if !self.is_supported_image(&path) && !self.is_supported_video(&path) {
            return Err(SourceError::NotAnImage);
        }
        let original = self.get_info(id).map(|i| i.size()).unwrap_or_default();
        self.thumbs.get(
            ctx,
            id,
            &path,
            original,
            SizeRequest {
                size: Size::new(spec.width, spec.height),
                fit: spec.fit,
            },
            &spec.name,
        )
    }

    // ---- tags ----

    pub fn add_tag(&self, name: &str) -> SourceResult<Tag> {
        self.catalog
            .add_tag(name)
            .map_err(|e| SourceError::transient("catalog", e))
    }

    pub fn get_tag(&self, name: &str) -> SourceResult<Tag> {
        self.catalog
            .get_tag_by_name(name)
            .map_err(|_| SourceError::NotFound)
    }

    pub fn get_tag_id(&self, name: &str) -> SourceResult<TagId> {
        self.catalog.get_tag_id(name).map_err(|_| SourceError::NotFound)
    }

    pub fn add_tag_ids(&self, tag_id: TagId, ids: Receiver<ImageId>) -> SourceResult<i64> {
        let ids: Ids = ids.iter().collect();
        self.catalog
            .add_tag_ids(tag_id, &ids)
            .map_err(tag_mutation_error)
    }

    pub fn remove_tag_ids(&self, tag_id: TagId, ids: Receiver<ImageId>) -> SourceResult<i64> {
        let ids: Ids = ids.iter().collect();
        self.catalog
            .remove_tag_ids(tag_id, &ids)
            .map_err(tag_mutation_error)
    }

    pub fn invert_tag_ids(&self, tag_id: TagId, ids: Receiver<ImageId>) -> SourceResult<i64> {
        let ids: Ids = ids.iter().collect();
        self.catalog
            .invert_tag_ids(tag_id, &ids)
            .map_err(tag_mutation_error)
    }

    pub fn get_tag_image_ids(&self, tag_id: TagId) -> SourceResult<Ids> {
        self.catalog
            .get_tag_image_ids(tag_id)
            .map_err(|_| SourceError::NotFound)
    }

    pub fn list_image_tags(&self, id: ImageId, cancel: CancelToken) -> Receiver<Tag> {
        self.catalog.list_image_tags(id, cancel)
    }

    pub fn list_tags(&self, prefix: &str, limit: usize, cancel: CancelToken) -> Receiver<Tag> {
        self.catalog.list_tags(prefix, limit, cancel)
    }

    /// Resolve a `name:rev` reference, creating the tag when absent
    pub fn get_or_create_tag_from_name_rev(&self, name_rev: &str) -> SourceResult<Tag> {
        let (name, _rev) = Tag::parse_name_rev(name_rev)?;
        match self.get_tag(&name) {
            Ok(tag) => Ok(tag),
            Err(SourceError::NotFound) => self.add_tag(&name),
            Err(e) => Err(e),
        }
    }

    // ---- maintenance ----

    pub fn vacuum(&self) -> Result<()> {
        self.catalog.vacuum()?;
        Ok(())
    }

    /// Stop accepting queue work and drain the writer
    pub fn close(&self) {
        if let Some(queue) = self.metadata_queue.get() {
            queue.close();
        }
        if let Some(queue) = self.contents_queue.get() {
            queue.close();
        }
        self.catalog.wait_for_commit();
    }
}

fn tag_mutation_error(e: crate::error::CatalogError) -> SourceError {
    match e {
        crate::error::CatalogError::NotFound => SourceError::NotFound,
        other => SourceError::transient("catalog", other),
    }
}

/// Normalize a path to OS-native separators
pub fn normalize_path(path: &str) -> String {
    if std::path::MAIN_SEPARATOR == '/' {
        path.replace('\\', "/")
    } else {
        path.replace('/', &std::path::MAIN_SEPARATOR.to_string())
    }
}

fn normalize_paths(paths: &[String]) -> Vec<String> {
    paths.iter().map(|p| normalize_path(p)).collect()
}

/// Compose the three chains from one configured source set
///
/// Render sources are wrapped by the shared byte cache; thumbnail sources
/// and generators are not, since their results land in the sink or the
/// render cache anyway.
fn build_chains(
    config: &Config,
    sink: &Arc<ThumbDb>,
    extractor: &Arc<Extractor>,
    byte_cache: &Arc<ByteCache>,
) -> (SourceSet, SourceSet, Vec<Arc<dyn ReadSource>>) {
    let mut render: Vec<Capability> = Vec::new();
    let mut thumb_sources: Vec<Capability> = Vec::new();
    let mut generators: Vec<Arc<dyn ReadSource>> = Vec::new();

    let cached = |source: Arc<dyn ReadSource>| -> Capability {
        Capability::Read(Arc::new(CachedSource::new(source, Arc::clone(byte_cache))))
    };

    for spec in &config.thumbnails {
        let declared = declared_of(spec);
        let source: Arc<dyn ReadSource> = match &spec.path_template {
            Some(template) => Arc::new(NasThumbSource::new(&spec.name, template, declared)),
            None => Arc::new(ThumbDbSource::new(Arc::clone(sink), &spec.name, declared)),
        };
        render.push(cached(Arc::clone(&source)));
        thumb_sources.push(Capability::Read(source));
        if spec.path_template.is_none() {
            generators.push(Arc::new(ResizeGenerator::new(spec.clone())));
        }
    }

    let exif_thumb: Arc<dyn ReadSource> = Arc::new(ExifThumbSource::new(Arc::clone(extractor)));
    render.push(cached(Arc::clone(&exif_thumb)));
    thumb_sources.push(Capability::Read(exif_thumb));

    if !config.videos.extensions.is_empty() {
        match find_ffmpeg() {
            Some(ffmpeg) => {
                for &tier in VIDEO_TIERS {
                    let source: Arc<dyn ReadSource> =
                        Arc::new(VideoFrameSource::new(ffmpeg.clone(), tier));
                    render.push(cached(Arc::clone(&source)));
                    generators.push(source);
                }
            }
            None => info!("ffmpeg not found; video renditions disabled"),
        }
    }

    render.push(Capability::Decode(Arc::new(DecoderSource)));
    render.push(cached(Arc::new(FileSource)));

    (
        SourceSet::new(render),
        SourceSet::new(thumb_sources),
        generators,
    )
}

fn declared_of(spec: &ThumbnailSpec) -> Declared {
    Declared::bounded(spec.width, spec.height, spec.fit)
}
