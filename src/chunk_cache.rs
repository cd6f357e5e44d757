//! Chunk cache: an LRU-capped key -> bytes store with an access-time index, one per
//! dimension.
//!
//! Two backings are provided, selected by `chunk_caching.path`: [`InMemoryChunkCache`]
//! for `":memory:"`, and [`FileChunkCache`] for a filename prefix (one file per dimension). Both
//! implement the same [`ChunkCache`] trait so the rest of the system is agnostic to the
//! backing store, the same way the proxy's other pluggable concerns (status suppliers, target
//! selection strategies) stay independent of their concrete implementations behind a trait.

use crate::error::CacheError;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Instant;

/// 8 bytes: chunk X and Z as signed 32-bit integers, packed big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey(pub [u8; 8]);

impl ChunkKey {
    /// Packs a `(chunk_x, chunk_z)` pair into a [`ChunkKey`].
    #[must_use]
    pub fn new(chunk_x: i32, chunk_z: i32) -> Self {
        let mut bytes = [0u8; 8];
        bytes[0..4].copy_from_slice(&chunk_x.to_be_bytes());
        bytes[4..8].copy_from_slice(&chunk_z.to_be_bytes());
        Self(bytes)
    }

    /// Unpacks this key back into its `(chunk_x, chunk_z)` pair.
    #[must_use]
    pub fn coords(&self) -> (i32, i32) {
        let x = i32::from_be_bytes(self.0[0..4].try_into().unwrap());
        let z = i32::from_be_bytes(self.0[4..8].try_into().unwrap());
        (x, z)
    }
}

/// A single cache entry: identifier, last-access timestamp, and the cached blob.
/// [`Instant`] is used for `last_access` rather than a wall-clock timestamp since the cache's
/// eviction policy only needs relative ordering, never a persisted point in time.
#[derive(Debug, Clone)]
struct CacheEntry {
    last_access: Instant,
    data: Vec<u8>,
}

/// Operations a chunk cache backing must support.
pub trait ChunkCache: Send {
    /// Inserts a new entry, or overwrites an existing one.
    fn insert(&mut self, key: ChunkKey, data: Vec<u8>);

    /// Overwrites an existing entry's data (used when splicing a block change into a cached
    /// chunk). Equivalent to [`Self::insert`] for these backings, kept as a distinct method name
    /// so call sites stay self-documenting about which kind of write they're doing.
    fn update(&mut self, key: ChunkKey, data: Vec<u8>) {
        self.insert(key, data);
    }

    /// Looks up an entry, refreshing its access time on a hit.
    fn get(&mut self, key: ChunkKey) -> Option<Vec<u8>>;

    /// Removes an entry outright.
    fn destroy(&mut self, key: ChunkKey);

    /// Every key currently stored, in no particular order.
    fn keys(&self) -> Vec<ChunkKey>;

    /// Runs a garbage-collection pass: deletes entries whose access-time rank falls outside the
    /// top `capacity` most-recently-accessed entries.
    fn gc(&mut self);
}

/// In-memory chunk cache: a `HashMap` plus an access-order index.
pub struct InMemoryChunkCache {
    capacity: usize,
    entries: std::collections::HashMap<ChunkKey, CacheEntry>,
}

impl InMemoryChunkCache {
    /// Creates an empty cache capped at `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: std::collections::HashMap::new(),
        }
    }
}

impl ChunkCache for InMemoryChunkCache {
    fn insert(&mut self, key: ChunkKey, data: Vec<u8>) {
        self.entries.insert(
            key,
            CacheEntry {
                last_access: Instant::now(),
                data,
            },
        );
    }

    fn get(&mut self, key: ChunkKey) -> Option<Vec<u8>> {
        let entry = self.entries.get_mut(&key)?;
        entry.last_access = Instant::now();
        Some(entry.data.clone())
    }

    fn destroy(&mut self, key: ChunkKey) {
        self.entries.remove(&key);
    }

    fn keys(&self) -> Vec<ChunkKey> {
        self.entries.keys().copied().collect()
    }

    fn gc(&mut self) {
        if self.entries.len() <= self.capacity {
            return;
        }
        // rank by access time, newest first; keep the top `capacity`, evict the rest.
        let mut by_access: Vec<(ChunkKey, Instant)> = self
            .entries
            .iter()
            .map(|(key, entry)| (*key, entry.last_access))
            .collect();
        by_access.sort_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in by_access.into_iter().skip(self.capacity) {
            self.entries.remove(&key);
        }
    }
}

/// File-backed chunk cache: one append-only file per dimension, compacted on [`ChunkCache::gc`].
/// Record layout: `key(8) ∥ accessed(8, i64 be, monotonic nanoseconds since cache open) ∥
/// len(4, be) ∥ data`. No cross-process locking -- each file is owned by a single process.
pub struct FileChunkCache {
    path: PathBuf,
    capacity: usize,
    opened_at: Instant,
    entries: BTreeMap<ChunkKey, CacheEntry>,
}

impl FileChunkCache {
    /// Opens (creating if absent) a file-backed cache at `path`, loading its existing entries.
    pub fn open(path: PathBuf, capacity: usize) -> Result<Self, CacheError> {
        let mut cache = Self {
            path,
            capacity,
            opened_at: Instant::now(),
            entries: BTreeMap::new(),
        };
        cache.load()?;
        Ok(cache)
    }

    fn load(&mut self) -> Result<(), CacheError> {
        let Ok(mut file) = File::open(&self.path) else {
            return Ok(());
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut pos = 0usize;
        while pos + 20 <= buf.len() {
            let key = ChunkKey(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let accessed_nanos = i64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > buf.len() {
                break;
            }
            let data = buf[pos..pos + len].to_vec();
            pos += len;

            self.entries.insert(
                key,
                CacheEntry {
                    last_access: self.opened_at + std::time::Duration::from_nanos(accessed_nanos.max(0) as u64),
                    data,
                },
            );
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), CacheError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        for (key, entry) in &self.entries {
            let accessed_nanos = entry
                .last_access
                .saturating_duration_since(self.opened_at)
                .as_nanos() as i64;
            file.write_all(&key.0)?;
            file.write_all(&accessed_nanos.to_be_bytes())?;
            file.write_all(&(entry.data.len() as u32).to_be_bytes())?;
            file.write_all(&entry.data)?;
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl ChunkCache for FileChunkCache {
    fn insert(&mut self, key: ChunkKey, data: Vec<u8>) {
        self.entries.insert(
            key,
            CacheEntry {
                last_access: Instant::now(),
                data,
            },
        );
        let _ = self.persist();
    }

    fn get(&mut self, key: ChunkKey) -> Option<Vec<u8>> {
        let entry = self.entries.get_mut(&key)?;
        entry.last_access = Instant::now();
        let data = entry.data.clone();
        let _ = self.persist();
        Some(data)
    }

    fn destroy(&mut self, key: ChunkKey) {
        self.entries.remove(&key);
        let _ = self.persist();
    }

    fn keys(&self) -> Vec<ChunkKey> {
        self.entries.keys().copied().collect()
    }

    fn gc(&mut self) {
        if self.entries.len() <= self.capacity {
            return;
        }
        let mut by_access: Vec<(ChunkKey, Instant)> = self
            .entries
            .iter()
            .map(|(key, entry)| (*key, entry.last_access))
            .collect();
        by_access.sort_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in by_access.into_iter().skip(self.capacity) {
            self.entries.remove(&key);
        }
        let _ = self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_key_roundtrips_negative_coordinates() {
        let key = ChunkKey::new(-5, 12);
        assert_eq!(key.coords(), (-5, 12));
    }

    #[test]
    fn in_memory_cache_refreshes_access_time_on_get() {
        let mut cache = InMemoryChunkCache::new(2);
        let a = ChunkKey::new(0, 0);
        let b = ChunkKey::new(1, 1);
        let c = ChunkKey::new(2, 2);

        cache.insert(a, vec![1]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.insert(b, vec![2]);

        // touch `a` so it outranks `b` in recency
        cache.get(a);
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.insert(c, vec![3]);

        cache.gc();
        let remaining = cache.keys();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&a));
        assert!(remaining.contains(&c));
        assert!(!remaining.contains(&b));
    }

    #[test]
    fn file_cache_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("longhaul-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("overworld.db");

        {
            let mut cache = FileChunkCache::open(path.clone(), 100).unwrap();
            cache.insert(ChunkKey::new(3, -7), vec![9, 9, 9]);
        }

        let mut reopened = FileChunkCache::open(path, 100).unwrap();
        assert_eq!(reopened.get(ChunkKey::new(3, -7)), Some(vec![9, 9, 9]));

        std::fs::remove_dir_all(&dir).ok();
    }
}
