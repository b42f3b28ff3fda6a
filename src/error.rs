//! Error types for the image source pipeline
//!
//! This module defines the error hierarchy covering:
//! - Rendition resolution through the source chain
//! - Catalog (SQLite) storage errors
//! - Configuration errors
//! - Walker and indexing-queue errors
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - `NotFound` / `NotAnImage` / `Unavailable` surface to callers unchanged;
//!   transient failures are retried or skipped where they occur
//! - Preserve error chains for debugging

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Rendition resolution errors
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Catalog storage errors
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Directory walking errors
    #[error("walk error: {0}")]
    Walk(#[from] WalkError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel closed unexpectedly
    #[error("channel closed unexpectedly")]
    ChannelClosed,
}

/// Errors produced while resolving a rendition of an image
///
/// These are deliberately `Clone`: a single in-flight computation may be
/// delivered to many coalesced waiters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// No such id, path, tag or stored rendition
    #[error("not found")]
    NotFound,

    /// The path's extension is not in the configured image list
    #[error("not a supported image extension, might be video")]
    NotAnImage,

    /// An optional collaborator (AI, geocoder) is disabled
    #[error("unavailable")]
    Unavailable,

    /// I/O, external-tool or decoder failure; safe to retry
    #[error("transient failure in '{source_name}': {reason}")]
    Transient { source_name: String, reason: String },

    /// Storage integrity failure; fatal
    #[error("corruption during {operation}: {reason}")]
    Corruption { operation: String, reason: String },
}

impl SourceError {
    /// Transient failure attributed to a named source
    pub fn transient(source_name: &str, reason: impl ToString) -> Self {
        SourceError::Transient {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Check whether the chain should advance past this error
    ///
    /// Only `NotFound` and `NotAnImage` short-circuit resolution; everything
    /// else means "try the next source".
    pub fn is_advanceable(&self) -> bool {
        matches!(
            self,
            SourceError::Transient { .. } | SourceError::Unavailable
        )
    }
}

/// Catalog storage errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to create or open the database file
    #[error("failed to open catalog at '{path}': {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    /// Migration failure
    #[error("migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// Row not found
    #[error("not found")]
    NotFound,

    /// Writer channel closed unexpectedly
    #[error("catalog writer channel closed unexpectedly")]
    ChannelClosed,

    /// Database integrity failure
    #[error("catalog corruption during {operation}")]
    Corruption { operation: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid cache size
    #[error("invalid cache size '{value}': {reason}")]
    InvalidCacheSize { value: String, reason: String },

    /// Invalid extension entry
    #[error("invalid extension '{ext}': must be lowercase with a leading dot")]
    InvalidExtension { ext: String },

    /// Thumbnail pipeline misconfiguration (exit code 2)
    #[error("thumbnail '{name}' misconfigured: {reason}")]
    Thumbnail { name: String, reason: String },

    /// Data directory error
    #[error("invalid data directory '{path}': {reason}")]
    InvalidDataDir { path: PathBuf, reason: String },

    /// Config file error
    #[error("failed to read config '{path}': {reason}")]
    ReadFailed { path: PathBuf, reason: String },
}

/// Directory walking errors
#[derive(Error, Debug)]
pub enum WalkError {
    /// The walk root itself could not be read; fails the enumeration
    #[error("failed to read walk root '{path}': {reason}")]
    RootFailed { path: String, reason: String },

    /// Output channel disconnected before the walk finished
    #[error("walk output channel disconnected")]
    Disconnected,
}

/// Result type alias for PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for SourceError
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Result type alias for CatalogError
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
