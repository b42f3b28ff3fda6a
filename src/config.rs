//! Configuration types for the image source pipeline
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - The serde-backed pipeline configuration with validation
//! - Human-readable byte-size parsing for cache bounds

use crate::error::ConfigError;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum reasonable worker count for any queue
const MAX_WORKERS: usize = 512;

/// Command-line interface for the indexing binary
#[derive(Parser, Debug, Clone)]
#[command(
    name = "photocanvas",
    version,
    about = "Photo catalog indexer and rendition pipeline",
    long_about = "Indexes directories of photos into a local catalog and resolves \
                  renditions (thumbnails, decoded pixels, metadata) through a \
                  prioritized chain of sources with caching.",
    after_help = "EXAMPLES:\n    \
        photocanvas index ~/Photos\n    \
        photocanvas index /mnt/nas/photos --max 10000 -v\n    \
        photocanvas vacuum"
)]
pub struct CliArgs {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,

    /// Path to a JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the catalog and thumbnail databases
    #[arg(long, value_name = "DIR", default_value = ".", global = true)]
    pub data_dir: PathBuf,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Walk directories into the catalog and run the indexing queues
    Index {
        /// Directories to index
        #[arg(value_name = "DIR", required = true)]
        dirs: Vec<PathBuf>,

        /// Maximum files per directory root (0 = unbounded)
        #[arg(long, default_value = "0", value_name = "NUM")]
        max: usize,

        /// Re-extract metadata even when already indexed
        #[arg(long)]
        force_metadata: bool,

        /// Recompute colors and embeddings even when already indexed
        #[arg(long)]
        force_contents: bool,
    },

    /// Compact the catalog database
    Vacuum,
}

/// How a rendition's dimensions relate to the requested size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fit {
    /// Scaled to fit entirely inside the requested box
    #[default]
    Inside,
    /// Scaled to cover the requested box, possibly exceeding it
    Outside,
    /// Unscaled original dimensions
    Original,
}

/// Extension lists for a media kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileKinds {
    /// Accepted extensions, lowercase with a leading dot
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl FileKinds {
    /// Case-insensitive extension membership test
    pub fn matches(&self, path: &str) -> bool {
        let ext = match path.rfind('.') {
            Some(idx) => path[idx..].to_lowercase(),
            None => return false,
        };
        self.extensions.iter().any(|e| *e == ext)
    }
}

/// One configured thumbnail variant
///
/// Entries with a `path_template` point at pre-existing files produced by a
/// NAS appliance; the template understands `{{.Dir}}` (containing directory,
/// with trailing separator) and `{{.Filename}}` (basename without
/// extension). Entries without a template are generated on demand and
/// persisted into the thumbnail sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailSpec {
    pub name: String,
    #[serde(default)]
    pub fit: Fit,
    pub width: u32,
    pub height: u32,
    /// Extensions this variant applies to; empty = all images
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub path_template: Option<String>,
}

/// Byte-bounded cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSpec {
    /// Human-readable size, e.g. "256MB"
    pub max_size: String,
}

impl Default for CacheSpec {
    fn default() -> Self {
        Self {
            max_size: "256MB".to_string(),
        }
    }
}

impl CacheSpec {
    pub fn max_size_bytes(&self) -> Result<u64, ConfigError> {
        parse_size(&self.max_size).map_err(|reason| ConfigError::InvalidCacheSize {
            value: self.max_size.clone(),
            reason,
        })
    }
}

/// Cache bounds, one per cache kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Caches {
    #[serde(default)]
    pub image: CacheSpec,
}

/// Geography collaborator switches
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Geo {
    #[serde(default)]
    pub reverse_geocode: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Extensions accepted by the walker, lowercase with a leading dot
    pub extensions: Vec<String>,

    /// Media-kind split used when serving and choosing sources
    pub images: FileKinds,
    pub videos: FileKinds,

    /// Patterns tried in order against EXIF date strings (chrono syntax)
    pub date_formats: Vec<String>,

    /// Concurrency bound for the EXIF extraction pool
    pub exif_tool_count: usize,

    /// When true, the indexing queues are not started
    pub skip_load_info: bool,

    pub concurrent_meta_loads: usize,
    pub concurrent_color_loads: usize,
    pub concurrent_ai_loads: usize,

    pub caches: Caches,

    /// Ordered thumbnail variants; order decides chain priority
    pub thumbnails: Vec<ThumbnailSpec>,

    pub geo: Geo,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extensions: [".jpg", ".jpeg", ".png", ".gif", ".webp", ".mp4", ".mov"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            images: FileKinds {
                extensions: [".jpg", ".jpeg", ".png", ".gif", ".webp"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            videos: FileKinds {
                extensions: [".mp4", ".mov", ".avi", ".mkv"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            date_formats: [
                "%Y:%m:%d %H:%M:%S",
                "%Y-%m-%d %H:%M:%S",
                "%Y-%m-%dT%H:%M:%S%z",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exif_tool_count: 4,
            skip_load_info: false,
            concurrent_meta_loads: num_cpus::get(),
            concurrent_color_loads: num_cpus::get(),
            concurrent_ai_loads: 8,
            caches: Caches::default(),
            thumbnails: vec![
                ThumbnailSpec {
                    name: "S".to_string(),
                    fit: Fit::Inside,
                    width: 120,
                    height: 120,
                    extensions: vec![],
                    path_template: None,
                },
                ThumbnailSpec {
                    name: "M".to_string(),
                    fit: Fit::Inside,
                    width: 320,
                    height: 320,
                    extensions: vec![],
                    path_template: None,
                },
                ThumbnailSpec {
                    name: "L".to_string(),
                    fit: Fit::Inside,
                    width: 1280,
                    height: 1280,
                    extensions: vec![],
                    path_template: None,
                },
            ],
            geo: Geo::default(),
        }
    }
}

impl Config {
    /// Load a config file, falling back to defaults when `path` is None
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) => {
                let text =
                    std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFailed {
                        path: p.to_path_buf(),
                        reason: e.to_string(),
                    })?;
                serde_json::from_str(&text).map_err(|e| ConfigError::ReadFailed {
                    path: p.to_path_buf(),
                    reason: e.to_string(),
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints and cross-field invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        for ext in self
            .extensions
            .iter()
            .chain(&self.images.extensions)
            .chain(&self.videos.extensions)
        {
            let valid = ext.starts_with('.')
                && ext.len() > 1
                && ext[1..].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
            if !valid {
                return Err(ConfigError::InvalidExtension { ext: ext.clone() });
            }
        }

        for count in [
            self.exif_tool_count,
            self.concurrent_meta_loads,
            self.concurrent_color_loads,
            self.concurrent_ai_loads,
        ] {
            if count == 0 || count > MAX_WORKERS {
                return Err(ConfigError::InvalidWorkerCount {
                    count,
                    max: MAX_WORKERS,
                });
            }
        }

        self.caches.image.max_size_bytes()?;

        for thumb in &self.thumbnails {
            if thumb.width == 0 || thumb.height == 0 {
                return Err(ConfigError::Thumbnail {
                    name: thumb.name.clone(),
                    reason: "width and height must be non-zero".to_string(),
                });
            }
            if let Some(template) = &thumb.path_template {
                if !template.contains("{{.Dir}}") && !template.contains("{{.Filename}}") {
                    return Err(ConfigError::Thumbnail {
                        name: thumb.name.clone(),
                        reason: "path_template has no {{.Dir}} or {{.Filename}} placeholder"
                            .to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Parse a human-readable size string (e.g., "256MB", "2GB")
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(stripped) = s.strip_suffix("TB") {
        (stripped, 1024u64 * 1024 * 1024 * 1024)
    } else if let Some(stripped) = s.strip_suffix("GB") {
        (stripped, 1024u64 * 1024 * 1024)
    } else if let Some(stripped) = s.strip_suffix("MB") {
        (stripped, 1024u64 * 1024)
    } else if let Some(stripped) = s.strip_suffix("KB") {
        (stripped, 1024u64)
    } else if let Some(stripped) = s.strip_suffix('B') {
        (stripped, 1u64)
    } else {
        // Assume bytes if no suffix
        (s.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid size value: {}", s))?;
    if num < 0.0 {
        return Err(format!("negative size: {}", s));
    }

    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2TB").unwrap(), 2 * 1024 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("256MB").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_size("1024KB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("512B").unwrap(), 512);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert!(parse_size("many").is_err());
    }

    #[test]
    fn test_default_config_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_bad_extension_rejected() {
        let config = Config {
            extensions: vec!["jpg".to_string()],
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidExtension { .. })
        ));
    }

    #[test]
    fn test_template_requires_placeholder() {
        let mut config = Config::default();
        config.thumbnails.push(ThumbnailSpec {
            name: "nas".to_string(),
            fit: Fit::Inside,
            width: 320,
            height: 320,
            extensions: vec![],
            path_template: Some("/fixed/path.jpg".to_string()),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Thumbnail { .. })
        ));
    }

    #[test]
    fn test_file_kinds_matches() {
        let kinds = FileKinds {
            extensions: vec![".jpg".to_string(), ".png".to_string()],
        };
        assert!(kinds.matches("/photos/a.JPG"));
        assert!(kinds.matches("/photos/b.png"));
        assert!(!kinds.matches("/photos/notes.txt"));
        assert!(!kinds.matches("/photos/noext"));
    }
}
