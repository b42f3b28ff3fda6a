//! Collections: named groups of root directories
//!
//! A collection is the browsable unit: one or more roots, an optional
//! per-root listing limit, and an optional expansion into one child
//! collection per immediate subdirectory.

use crate::error::{PipelineError, Result, WalkError};
use crate::source::ImageSource;
use crate::stream::send_cancellable;
use crate::types::{CancelToken, ImageId};
use crossbeam_channel::{bounded, Receiver};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Channel capacity for merged collection streams
const MERGE_CHANNEL_CAP: usize = 256;

/// Sort order applied to expanded children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpandSort {
    /// Directory enumeration order
    #[default]
    Unsorted,
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Collection {
    /// Slug derived from the name
    pub id: String,
    pub name: String,
    /// Per-root listing cap, 0 = unbounded
    pub list_limit: usize,
    pub expand_subdirs: bool,
    pub expand_sort: ExpandSort,
    pub dirs: Vec<String>,
}

impl Collection {
    pub fn new(name: &str, dirs: Vec<String>) -> Self {
        let mut collection = Self {
            name: name.to_string(),
            dirs,
            ..Self::default()
        };
        collection.generate_id();
        collection
    }

    /// Derive the id slug from the name
    pub fn generate_id(&mut self) {
        self.id = slugify(&self.name);
    }

    /// One child collection per immediate subdirectory of each root
    ///
    /// Children inherit `list_limit`. An unreadable root is fatal to the
    /// whole expansion.
    pub fn expand(&self) -> Result<Vec<Collection>> {
        let mut children = Vec::new();
        for dir in &self.dirs {
            let entries = std::fs::read_dir(dir).map_err(|e| {
                PipelineError::Walk(WalkError::RootFailed {
                    path: dir.clone(),
                    reason: e.to_string(),
                })
            })?;
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(dir = %dir, "skipping unreadable entry: {}", e);
                        continue;
                    }
                };
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if !is_dir {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let child_dir = Path::new(dir).join(&name).to_string_lossy().into_owned();
                let mut child = Collection {
                    name,
                    dirs: vec![child_dir],
                    list_limit: self.list_limit,
                    ..Collection::default()
                };
                child.generate_id();
                children.push(child);
            }
        }
        match self.expand_sort {
            ExpandSort::Asc => children.sort_by(|a, b| a.name.cmp(&b.name)),
            ExpandSort::Desc => children.sort_by(|a, b| b.name.cmp(&a.name)),
            ExpandSort::Unsorted => {}
        }
        Ok(children)
    }

    /// Merge the path streams of all roots concurrently
    pub fn get_paths(&self, source: &Arc<ImageSource>, cancel: CancelToken) -> Receiver<String> {
        let (tx, rx) = bounded(MERGE_CHANNEL_CAP);
        for dir in &self.dirs {
            let sub = source.list_images(std::slice::from_ref(dir), self.list_limit, cancel.clone());
            let tx = tx.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("collection-paths".into())
                .spawn(move || {
                    for path in sub {
                        if !send_cancellable(&tx, path, &cancel) {
                            break;
                        }
                    }
                })
                .expect("failed to spawn collection merger");
        }
        rx
    }

    /// Map every path to its image id via the source
    pub fn get_ids(&self, source: &Arc<ImageSource>, cancel: CancelToken) -> Receiver<ImageId> {
        let (tx, rx) = bounded(MERGE_CHANNEL_CAP);
        let paths = self.get_paths(source, cancel.clone());
        let source = Arc::clone(source);
        thread::Builder::new()
            .name("collection-ids".into())
            .spawn(move || {
                for path in paths {
                    match source.get_image_id(&path) {
                        Ok(id) => {
                            if !send_cancellable(&tx, id, &cancel) {
                                break;
                            }
                        }
                        Err(e) => warn!(path = %path, "no id for path: {}", e),
                    }
                }
            })
            .expect("failed to spawn collection id mapper");
        rx
    }
}

/// Lowercase, alphanumeric, dash-separated slug
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_alphanumeric() {
            for lower in c.to_lowercase() {
                slug.push(lower);
            }
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
