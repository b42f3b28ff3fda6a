//! photocanvas - Image Source Pipeline
//!
//! The indexing and rendition-serving core of a photo-browsing server that
//! renders large photo collections as a single zoomable canvas. Turns
//! directories on disk into a queryable, incrementally indexed catalog and
//! resolves any rendition of an image (thumbnail, decoded pixels,
//! embedding, EXIF metadata) through a prioritized chain of cooperating
//! sources.
//!
//! # Features
//!
//! - **Incremental indexing**: A lazy walker feeds a batched SQLite
//!   writer; re-indexing only touches what changed and deletes what
//!   vanished.
//!
//! - **Prioritized source chain**: Stored thumbnails, NAS sidecar files,
//!   embedded EXIF previews, video poster frames and the full decoder are
//!   consulted cheapest-first, behind a byte-bounded cache with in-flight
//!   coalescing.
//!
//! - **Background queues**: Metadata and contents extraction run on
//!   bounded worker pools fed by lazy catalog streams, with progress
//!   accounting and quiescence tracking.
//!
//! - **Tag bitmaps**: Compressed integer sets with monotonic revisions
//!   back selection overlays over any listing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Collections                              │
//! │                   (named groups of roots)                        │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ walk
//!                                 ▼
//! ┌──────────────────┐  append   ┌──────────────────────────────────┐
//! │      Walker      ├──────────►│        Catalog (SQLite)          │
//! │ (lazy, filtered) │           │  paths · infos · embeddings ·    │
//! └──────────────────┘           │  tags · batched single writer    │
//!                                └───────┬──────────────┬───────────┘
//!                     MissingInfo        │              │ listings
//!                                        ▼              ▼
//!                          ┌──────────────────┐  ┌──────────────┐
//!                          │  Index queues    │  │  Lazy streams│
//!                          │ metadata/contents│  │  (channels)  │
//!                          └──────────────────┘  └──────────────┘
//!
//!  Tile request ──► Source chain (byte cache, coalesced)
//!                      ├─ sqlite thumbnail sink
//!                      ├─ NAS thumbnail templates
//!                      ├─ embedded EXIF previews
//!                      ├─ ffmpeg poster frames
//!                      └─ full decoder / original file
//!                   miss └──► Thumbnail pipeline ──► generate + persist
//! ```

pub mod cache;
pub mod catalog;
pub mod collection;
pub mod color;
pub mod config;
pub mod embedding;
pub mod error;
pub mod exif;
pub mod geo;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod source;
pub mod sources;
pub mod stream;
pub mod tags;
pub mod thumbs;
pub mod types;
pub mod walker;

pub use collection::Collection;
pub use config::{CliArgs, Command, Config};
pub use error::{PipelineError, Result, SourceError};
pub use source::ImageSource;
pub use types::{ImageId, Info, MissingInfo, SourcedInfo};
