//! Lazy recursive directory enumeration
//!
//! Walks a root directory on a producer thread and publishes matching file
//! paths into a bounded channel, so consumers iterate lazily with
//! backpressure. Filtering:
//!
//! - only extensions from the accepted list (lowercase, leading dot)
//! - hidden entries (basename starting with `.`) are skipped, except the
//!   root itself
//! - symlinks are followed once; a canonicalized-path guard breaks cycles
//! - an optional max count caps the number of yielded files (0 = unbounded)
//!
//! Errors on individual entries are logged and skipped; an unreadable root
//! fails the enumeration up front. Cancellation closes the output channel
//! promptly and releases all directory handles.

use crate::error::WalkError;
use crate::stream::send_cancellable;
use crate::types::CancelToken;
use crossbeam_channel::{bounded, Receiver};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, warn};

/// Capacity of the walk output channel
const WALK_CHANNEL_CAP: usize = 256;

/// Lazily enumerate files under `root` matching `extensions`
///
/// Returns the receiving side of the path stream. The producer thread exits
/// when the walk completes, the consumer drops the receiver, or `cancel`
/// trips.
pub fn walk_files(
    root: &Path,
    extensions: &[String],
    max: usize,
    cancel: CancelToken,
) -> Result<Receiver<String>, WalkError> {
    // An unreadable root fails the enumeration; everything below it only
    // logs and continues.
    std::fs::read_dir(root).map_err(|e| WalkError::RootFailed {
        path: root.display().to_string(),
        reason: e.to_string(),
    })?;

    let (tx, rx) = bounded(WALK_CHANNEL_CAP);
    let root = root.to_path_buf();
    let extensions = extensions.to_vec();

    thread::Builder::new()
        .name("walker".into())
        .spawn(move || {
            let mut yielded = 0usize;
            let mut visited_dirs: HashSet<PathBuf> = HashSet::new();

            let mut it = walkdir::WalkDir::new(&root)
                .follow_links(true)
                .into_iter();

            loop {
                if cancel.is_cancelled() {
                    debug!(root = %root.display(), "walk cancelled");
                    break;
                }

                let entry = match it.next() {
                    None => break,
                    Some(Ok(entry)) => entry,
                    Some(Err(e)) => {
                        warn!(root = %root.display(), "walk entry error: {}", e);
                        continue;
                    }
                };

                let hidden = entry.depth() > 0
                    && entry
                        .file_name()
                        .to_str()
                        .map(|name| name.starts_with('.'))
                        .unwrap_or(false);

                if entry.file_type().is_dir() {
                    if hidden {
                        it.skip_current_dir();
                        continue;
                    }
                    // Cycle guard for followed symlinks: never descend into
                    // the same real directory twice.
                    match entry.path().canonicalize() {
                        Ok(real) => {
                            if !visited_dirs.insert(real) {
                                it.skip_current_dir();
                            }
                        }
                        Err(e) => {
                            warn!(path = %entry.path().display(), "canonicalize failed: {}", e);
                            it.skip_current_dir();
                        }
                    }
                    continue;
                }

                if hidden || !matches_extension(entry.path(), &extensions) {
                    continue;
                }

                let path = entry.path().to_string_lossy().into_owned();
                if !send_cancellable(&tx, path, &cancel) {
                    // Consumer went away or the token tripped; stop walking.
                    break;
                }

                yielded += 1;
                if max > 0 && yielded >= max {
                    debug!(root = %root.display(), max, "walk reached max count");
                    break;
                }
            }
        })
        .expect("failed to spawn walker thread");

    Ok(rx)
}

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!(".{}", ext.to_lowercase()),
        None => return false,
    };
    extensions.iter().any(|e| *e == ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn exts() -> Vec<String> {
        vec![".jpg".to_string(), ".png".to_string()]
    }

    fn touch(path: &Path) {
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_walk_filters_extensions() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("a.jpg"));
        touch(&dir.path().join("b.PNG"));
        touch(&dir.path().join("c.txt"));

        let rx = walk_files(dir.path(), &exts(), 0, CancelToken::new()).unwrap();
        let mut paths: Vec<String> = rx.iter().collect();
        paths.sort();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("a.jpg"));
        assert!(paths[1].ends_with("b.PNG"));
    }

    #[test]
    fn test_walk_skips_hidden() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join(".hidden.jpg"));
        fs::create_dir(dir.path().join(".cache")).unwrap();
        touch(&dir.path().join(".cache/thumb.jpg"));
        touch(&dir.path().join("visible.jpg"));

        let rx = walk_files(dir.path(), &exts(), 0, CancelToken::new()).unwrap();
        let paths: Vec<String> = rx.iter().collect();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("visible.jpg"));
    }

    #[test]
    fn test_walk_recurses() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        touch(&dir.path().join("a/one.jpg"));
        touch(&dir.path().join("a/b/two.jpg"));

        let rx = walk_files(dir.path(), &exts(), 0, CancelToken::new()).unwrap();
        assert_eq!(rx.iter().count(), 2);
    }

    #[test]
    fn test_walk_max_count() {
        let dir = tempdir().unwrap();
        for i in 0..10 {
            touch(&dir.path().join(format!("img{}.jpg", i)));
        }

        let rx = walk_files(dir.path(), &exts(), 3, CancelToken::new()).unwrap();
        assert_eq!(rx.iter().count(), 3);
    }

    #[test]
    fn test_walk_missing_root_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            walk_files(&missing, &exts(), 0, CancelToken::new()),
            Err(WalkError::RootFailed { .. })
        ));
    }

    #[test]
    fn test_walk_cancellation_closes_stream() {
        let dir = tempdir().unwrap();
        for i in 0..500 {
            touch(&dir.path().join(format!("img{}.jpg", i)));
        }

        let cancel = CancelToken::new();
        let rx = walk_files(dir.path(), &exts(), 0, cancel.clone()).unwrap();
        let _first = rx.recv().unwrap();
        cancel.cancel();

        // The producer stops within bounded time: drain whatever was already
        // buffered and observe the channel close.
        let start = std::time::Instant::now();
        while rx.recv_timeout(std::time::Duration::from_millis(100)).is_ok() {}
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_symlink_cycle_guard() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        touch(&dir.path().join("sub/pic.jpg"));
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/loop")).unwrap();

        let rx = walk_files(dir.path(), &exts(), 0, CancelToken::new()).unwrap();
        // Terminates and yields the file a bounded number of times.
        let count = rx.iter().count();
        assert!(count >= 1 && count < 10);
    }
}
