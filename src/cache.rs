//! Process-wide in-memory caches
//!
//! Three caches back the pipeline:
//! - id -> path and id -> info sharded maps, shared by readers and
//!   invalidated by the writer
//! - a byte-bounded buffer cache in front of the source chain, with a
//!   frequency sketch for admission, frequency-biased eviction and
//!   in-flight coalescing of concurrent fills
//!
//! No lock is held across I/O: fills run outside the cache locks and
//! waiters block on their own completion channel.

use crate::error::{SourceError, SourceResult};
use crate::types::{ImageId, Info, SharedBytes};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

const SHARD_COUNT: usize = 16;

/// Sharded id-keyed map used for the path and info caches
pub struct SharedMap<V> {
    shards: Vec<RwLock<HashMap<u32, V>>>,
}

impl<V: Clone> SharedMap<V> {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: ImageId) -> &RwLock<HashMap<u32, V>> {
        &self.shards[(id.0 as usize) % SHARD_COUNT]
    }

    pub fn get(&self, id: ImageId) -> Option<V> {
        self.shard(id).read().get(&id.0).cloned()
    }

    pub fn set(&self, id: ImageId, value: V) {
        self.shard(id).write().insert(id.0, value);
    }

    pub fn remove(&self, id: ImageId) {
        self.shard(id).write().remove(&id.0);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for SharedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// id -> filesystem path
pub type PathCache = SharedMap<String>;

/// id -> indexed attributes
pub type InfoCache = SharedMap<Info>;

/// Cache key for one rendition of one image from one source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ByteCacheKey {
    pub source: String,
    pub id: ImageId,
    pub size_name: String,
}

impl ByteCacheKey {
    pub fn new(source: &str, id: ImageId, size_name: &str) -> Self {
        Self {
            source: source.to_string(),
            id,
            size_name: size_name.to_string(),
        }
    }

    fn sketch_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

struct Entry {
    data: SharedBytes,
    hits: u32,
}

/// Frequency sketch for admission decisions
///
/// Counters are halved periodically so old popularity decays; the table is
/// cleared outright if it grows past its bound.
struct FreqSketch {
    counts: HashMap<u64, u32>,
    ops: u32,
}

const SKETCH_MAX_ENTRIES: usize = 8192;
const SKETCH_AGE_INTERVAL: u32 = 2048;

impl FreqSketch {
    fn new() -> Self {
        Self {
            counts: HashMap::new(),
            ops: 0,
        }
    }

    fn bump(&mut self, hash: u64) {
        *self.counts.entry(hash).or_insert(0) += 1;
        self.ops += 1;
        if self.ops >= SKETCH_AGE_INTERVAL {
            self.ops = 0;
            self.counts.retain(|_, c| {
                *c /= 2;
                *c > 0
            });
        }
        if self.counts.len() > SKETCH_MAX_ENTRIES {
            self.counts.clear();
        }
    }

    fn estimate(&self, hash: u64) -> u32 {
        self.counts.get(&hash).copied().unwrap_or(0)
    }
}

struct ByteCacheState {
    map: HashMap<ByteCacheKey, Entry>,
    order: VecDeque<ByteCacheKey>,
    used: u64,
    sketch: FreqSketch,
}

/// Statistics about cache operations
#[derive(Debug, Default)]
pub struct ByteCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub rejected: AtomicU64,
    pub coalesced: AtomicU64,
}

impl ByteCacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

type Waiters = Vec<Sender<SourceResult<SharedBytes>>>;

/// Byte-bounded shared buffer cache with in-flight coalescing
pub struct ByteCache {
    max_bytes: u64,
    state: Mutex<ByteCacheState>,
    pending: Mutex<HashMap<ByteCacheKey, Waiters>>,
    stats: ByteCacheStats,
}

impl ByteCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(ByteCacheState {
                map: HashMap::new(),
                order: VecDeque::new(),
                used: 0,
                sketch: FreqSketch::new(),
            }),
            pending: Mutex::new(HashMap::new()),
            stats: ByteCacheStats::default(),
        }
    }

    pub fn stats(&self) -> &ByteCacheStats {
        &self.stats
    }

    /// Bytes currently held
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Look up a cached buffer, recording the access for admission
    pub fn get(&self, key: &ByteCacheKey) -> Option<SharedBytes> {
        let mut state = self.state.lock();
        let hash = key.sketch_hash();
        state.sketch.bump(hash);
        match state.map.get_mut(key) {
            Some(entry) => {
                entry.hits = entry.hits.saturating_add(1);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a buffer, subject to the admission policy
    pub fn insert(&self, key: ByteCacheKey, data: SharedBytes) {
        let len = data.len() as u64;
        if len > self.max_bytes {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut state = self.state.lock();
        if state.map.contains_key(&key) {
            return;
        }

        // Evict until the new entry fits. A victim with remaining hits gets
        // its count halved and a second pass; the incoming key must beat the
        // final victim's sketch estimate to be admitted at all.
        let incoming_freq = state.sketch.estimate(key.sketch_hash());
        while state.used + len > self.max_bytes {
            let victim_key = match state.order.pop_front() {
                Some(k) => k,
                None => break,
            };
            let victim_hits = state.map.get(&victim_key).map(|e| e.hits).unwrap_or(0);
            if victim_hits > 1 {
                if let Some(entry) = state.map.get_mut(&victim_key) {
                    entry.hits /= 2;
                }
                state.order.push_back(victim_key);
                continue;
            }
            let victim_freq = state.sketch.estimate(victim_key.sketch_hash());
            if incoming_freq < victim_freq {
                // The resident entry is more popular; keep it and drop the
                // incoming buffer instead.
                state.order.push_front(victim_key);
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if let Some(entry) = state.map.remove(&victim_key) {
                state.used -= entry.data.len() as u64;
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        state.used += len;
        state.order.push_back(key.clone());
        state.map.insert(key, Entry { data, hits: 0 });
    }

    /// Remove every rendition cached for `id`
    pub fn invalidate_id(&self, id: ImageId) {
        let mut state = self.state.lock();
        let doomed: Vec<ByteCacheKey> = state
            .map
            .keys()
            .filter(|k| k.id == id)
            .cloned()
            .collect();
        for key in doomed {
            if let Some(entry) = state.map.remove(&key) {
                state.used -= entry.data.len() as u64;
            }
            state.order.retain(|k| *k != key);
        }
    }

    /// Read-through with in-flight coalescing
    ///
    /// The first caller for a key runs `fill`; concurrent callers for the
    /// same key block until that single computation completes and all
    /// receive its result. Successful fills are inserted into the cache.
    pub fn get_or_fill<F>(&self, key: &ByteCacheKey, fill: F) -> SourceResult<SharedBytes>
    where
        F: FnOnce() -> SourceResult<SharedBytes>,
    {
        if let Some(data) = self.get(key) {
            return Ok(data);
        }

        // Either become the leader for this key or enqueue as a waiter.
        let waiter = {
            let mut pending = self.pending.lock();
            match pending.get_mut(key) {
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
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            return match rx.recv() {
                Ok(result) => result,
                Err(_) => Err(SourceError::transient(
                    &key.source,
                    "coalesced fill abandoned",
                )),
            };
        }

        // This caller may have missed the cache before a previous fill for
        // the same key landed. Re-check now that it is the leader so the
        // fill runs at most once per cache residency.
        let result = match self.get(key) {
            Some(data) => Ok(data),
            None => fill(),
        };

        if let Ok(data) = &result {
            self.insert(key.clone(), data.clone());
        }

        let waiters = self.pending.lock().remove(key).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(result.clone());
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn bytes(n: usize) -> SharedBytes {
        vec![0u8; n].into()
    }

    #[test]
    fn test_shared_map() {
        let cache = PathCache::new();
        cache.set(ImageId(7), "/p/a.jpg".to_string());
        assert_eq!(cache.get(ImageId(7)).as_deref(), Some("/p/a.jpg"));
        cache.remove(ImageId(7));
        assert!(cache.get(ImageId(7)).is_none());
    }

    #[test]
    fn test_insert_and_get() {
        let cache = ByteCache::new(1024);
        let key = ByteCacheKey::new("sqlite-thumbs", ImageId(1), "S");
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), bytes(100));
        assert_eq!(cache.get(&key).unwrap().len(), 100);
        assert_eq!(cache.used_bytes(), 100);
    }

    #[test]
    fn test_oversized_rejected() {
        let cache = ByteCache::new(64);
        let key = ByteCacheKey::new("decoder", ImageId(1), "L");
        cache.insert(key.clone(), bytes(100));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_eviction_respects_bound() {
        let cache = ByteCache::new(250);
        for i in 0..10 {
            let key = ByteCacheKey::new("s", ImageId(i), "S");
            cache.insert(key, bytes(100));
        }
        assert!(cache.used_bytes() <= 250);
    }

    #[test]
    fn test_frequent_entry_survives_eviction() {
        let cache = ByteCache::new(250);
        let hot = ByteCacheKey::new("s", ImageId(0), "S");
        cache.insert(hot.clone(), bytes(100));
        // Many lookups make the entry frequency-protected.
        for _ in 0..8 {
            cache.get(&hot);
        }
        for i in 1..6 {
            cache.insert(ByteCacheKey::new("s", ImageId(i), "S"), bytes(100));
        }
        assert!(cache.get(&hot).is_some());
    }

    #[test]
    fn test_fill_runs_once() {
        let cache = Arc::new(ByteCache::new(1 << 20));
        let key = ByteCacheKey::new("gen", ImageId(9), "M");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            let calls = Arc::clone(&calls);
            handles.push(std::thread::spawn(move || {
                cache.get_or_fill(&key, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    Ok(bytes(64))
                })
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap().len(), 64);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A later request is served straight from the cache.
        let second = cache.get_or_fill(&key, || {
            calls.fetch_add(100, Ordering::SeqCst);
            Ok(bytes(64))
        });
        assert!(second.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fill_error_propagates_without_insert() {
        let cache = ByteCache::new(1024);
        let key = ByteCacheKey::new("gen", ImageId(3), "S");
        let result = cache.get_or_fill(&key, || Err(SourceError::NotFound));
        assert_eq!(result.unwrap_err(), SourceError::NotFound);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_invalidate_id() {
        let cache = ByteCache::new(1024);
        cache.insert(ByteCacheKey::new("a", ImageId(5), "S"), bytes(10));
        cache.insert(ByteCacheKey::new("b", ImageId(5), "M"), bytes(10));
        cache.insert(ByteCacheKey::new("a", ImageId(6), "S"), bytes(10));
        cache.invalidate_id(ImageId(5));
        assert!(cache.get(&ByteCacheKey::new("a", ImageId(5), "S")).is_none());
        assert!(cache.get(&ByteCacheKey::new("b", ImageId(5), "M")).is_none());
        assert!(cache.get(&ByteCacheKey::new("a", ImageId(6), "S")).is_some());
        assert_eq!(cache.used_bytes(), 10);
    }
}
