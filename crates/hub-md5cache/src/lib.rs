//! Bounded path -> (size, mtime, digest) cache shared by file transfers and
//! script packaging.
//!
//! Reads are shared; trimming only happens while holding the write lock, so
//! a burst of cache hits during a large script dispatch never blocks on a
//! single writer unless an actual miss needs hashing.

use std::collections::HashMap;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

/// Above this many entries, trim down to `LOW`.
pub const HIGH: usize = 2048;
/// Target size after trimming.
pub const LOW: usize = 1536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheEntry {
    size: u64,
    mtime_ns: i128,
}

#[derive(Debug, Clone)]
struct CachedDigest {
    entry: CacheEntry,
    digest: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Md5CacheError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// (size, mtime-ns) pair describing the observed state of a file, used as
/// the cache-invalidation key.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub mtime_ns: i128,
}

impl FileStat {
    pub fn from_metadata(meta: &std::fs::Metadata) -> std::io::Result<Self> {
        use std::time::UNIX_EPOCH;
        let mtime_ns = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);
        Ok(Self {
            size: meta.len(),
            mtime_ns,
        })
    }
}

#[derive(Debug, Default)]
pub struct Md5Cache {
    entries: RwLock<HashMap<String, CachedDigest>>,
}

impl Md5Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `digest(path, optional stat) -> hex-digest`.
    ///
    /// When `stat` is not supplied, the file is `stat`ed to obtain size and
    /// mtime before deciding whether the cache entry is still valid.
    pub async fn digest(
        &self,
        path: impl AsRef<Path>,
        stat: Option<FileStat>,
    ) -> Result<String, Md5CacheError> {
        let path = path.as_ref();
        let key = path.to_string_lossy().into_owned();

        let stat = match stat {
            Some(s) => s,
            None => {
                let meta = tokio::fs::metadata(path).await.map_err(|e| Md5CacheError::Io {
                    path: key.clone(),
                    source: e,
                })?;
                FileStat::from_metadata(&meta).map_err(|e| Md5CacheError::Io {
                    path: key.clone(),
                    source: e,
                })?
            }
        };
        let entry = CacheEntry {
            size: stat.size,
            mtime_ns: stat.mtime_ns,
        };

        if let Some(cached) = self.entries.read().await.get(&key) {
            if cached.entry == entry {
                return Ok(cached.digest.clone());
            }
        }

        let digest = hash_file(path).await.map_err(|e| Md5CacheError::Io {
            path: key.clone(),
            source: e,
        })?;

        let mut guard = self.entries.write().await;
        guard.insert(
            key,
            CachedDigest {
                entry,
                digest: digest.clone(),
            },
        );
        if guard.len() >= HIGH {
            trim(&mut guard);
        }
        Ok(digest)
    }

    /// Directly records a digest for a path/stat pair without reading the
    /// file, used by the upload endpoint which already computed the digest
    /// while streaming the body to disk.
    pub async fn record(&self, path: impl AsRef<Path>, stat: FileStat, digest: String) {
        let key = path.as_ref().to_string_lossy().into_owned();
        let entry = CacheEntry {
            size: stat.size,
            mtime_ns: stat.mtime_ns,
        };
        let mut guard = self.entries.write().await;
        guard.insert(key, CachedDigest { entry, digest });
        if guard.len() >= HIGH {
            trim(&mut guard);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Evicts arbitrary entries (iteration order of the backing map) until the
/// cache is at or below `LOW`. The spec explicitly allows non-LRU eviction
/// here since the bound, not recency, is what matters.
fn trim(map: &mut HashMap<String, CachedDigest>) {
    let excess = map.len().saturating_sub(LOW);
    let doomed: Vec<String> = map.keys().take(excess).cloned().collect();
    for key in doomed {
        map.remove(&key);
    }
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn digest_matches_fresh_hash_on_first_read() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let cache = Md5Cache::new();
        let digest = cache.digest(tmp.path(), None).await.unwrap();
        assert_eq!(digest, format!("{:x}", md5::compute(b"hello world")));
    }

    #[tokio::test]
    async fn digest_is_cached_when_size_and_mtime_match() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"version one").unwrap();
        let cache = Md5Cache::new();
        let first = cache.digest(tmp.path(), None).await.unwrap();

        // Overwrite the underlying fd without changing length/mtime visibly
        // enough for a stat-based cache to notice within the same instant;
        // instead assert the cache returns the *original* stat-keyed value
        // by supplying the same explicit stat used on first read.
        let stat = FileStat::from_metadata(&std::fs::metadata(tmp.path()).unwrap()).unwrap();
        let second = cache.digest(tmp.path(), Some(stat)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn digest_recomputes_when_stat_changes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"before").unwrap();
        let cache = Md5Cache::new();
        let before = cache.digest(tmp.path(), None).await.unwrap();

        tmp.write_all(b"-after-more-bytes").unwrap();
        tmp.flush().unwrap();
        let after = cache.digest(tmp.path(), None).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn trim_brings_cache_back_to_low_watermark() {
        let cache = Md5Cache::new();
        for i in 0..HIGH {
            cache
                .record(
                    format!("/tmp/file-{i}"),
                    FileStat {
                        size: i as u64,
                        mtime_ns: i as i128,
                    },
                    format!("digest-{i}"),
                )
                .await;
        }
        assert!(cache.len().await <= LOW);
    }
}
