//! Script packaging: walks a script directory (or single file) into a
//! `ScriptPackage` of `FileData` descriptors, cached by content signature.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::sync::Mutex;

/// Files at or below this size are inlined as base64 in `file/put` rather
/// than sent out-of-band via a transfer token.
pub const SMALL_FILE_THRESHOLD: u64 = 128 * 1024;

/// High-water mark for `ScriptPkgCache`; oldest entries (by insertion
/// order) are evicted once exceeded.
pub const PKG_CACHE_HIGH: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileData {
    pub target_path: String,
    pub normalized_path: String,
    pub source_path: PathBuf,
    pub size: u64,
    pub inline_data: Option<String>,
    pub is_main_config: bool,
}

#[derive(Debug, Clone)]
pub struct ScriptPackage {
    pub signature: String,
    pub files: Vec<FileData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PkgCacheKey {
    pub root: PathBuf,
    pub name: String,
    pub is_dir: bool,
    pub is_piled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("script not found: {0}")]
    NotFound(PathBuf),
    #[error("io error packaging {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Cache of packaged scripts keyed by (root, name, is_dir, is_piled) plus a
/// content signature check, so a stale on-disk edit still produces a fresh
/// package even if the cache key collides.
#[derive(Default)]
pub struct ScriptPkgCache {
    entries: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    map: HashMap<PkgCacheKey, ScriptPackage>,
    order: VecDeque<PkgCacheKey>,
}

impl ScriptPkgCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cached package if present and its signature still matches
    /// the freshly computed one, otherwise packages from disk and caches
    /// the result.
    pub async fn get_or_package(
        &self,
        root: &Path,
        name: &str,
    ) -> Result<ScriptPackage, PackagingError> {
        let script_path = root.join(name);
        if !script_path.exists() {
            return Err(PackagingError::NotFound(script_path));
        }
        let is_dir = script_path.is_dir();
        let is_piled = is_dir && is_piled_bundle(&script_path);
        let key = PkgCacheKey {
            root: root.to_path_buf(),
            name: name.to_string(),
            is_dir,
            is_piled,
        };

        let fresh = package_from_disk(&script_path, is_dir).await?;

        let mut guard = self.entries.lock().await;
        if let Some(cached) = guard.map.get(&key) {
            if cached.signature == fresh.signature {
                return Ok(cached.clone_package());
            }
        }
        guard.map.insert(key.clone(), fresh.clone_package());
        guard.order.push_back(key);
        if guard.map.len() > PKG_CACHE_HIGH {
            if let Some(oldest) = guard.order.pop_front() {
                guard.map.remove(&oldest);
            }
        }
        Ok(fresh)
    }
}

impl ScriptPackage {
    fn clone_package(&self) -> Self {
        Self {
            signature: self.signature.clone(),
            files: self.files.clone(),
        }
    }
}

fn is_piled_bundle(dir: &Path) -> bool {
    dir.join("lua/scripts/main.lua").is_file() || dir.join("lua/scripts/main.xxt").is_file()
}

/// Walks `script_path` (a single file or a directory) and produces a
/// `ScriptPackage`. Directory symlinks are not traversed; file symlinks are
/// followed and included as regular files.
async fn package_from_disk(script_path: &Path, is_dir: bool) -> Result<ScriptPackage, PackagingError> {
    let script_path = script_path.to_path_buf();
    tokio::task::spawn_blocking(move || package_from_disk_blocking(&script_path, is_dir))
        .await
        .expect("packaging task panicked")
}

fn package_from_disk_blocking(script_path: &Path, is_dir: bool) -> Result<ScriptPackage, PackagingError> {
    let mut files = Vec::new();
    if is_dir {
        walk_dir(script_path, script_path, &mut files)?;
    } else {
        push_file_entry(script_path, script_path.parent().unwrap_or(script_path), &mut files)?;
    }
    files.sort_by(|a, b| a.normalized_path.cmp(&b.normalized_path));
    let signature = compute_signature(&files);
    Ok(ScriptPackage { signature, files })
}

fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<FileData>) -> Result<(), PackagingError> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| PackagingError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    for entry in read_dir {
        let entry = entry.map_err(|e| PackagingError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| PackagingError::Io {
            path: path.clone(),
            source: e,
        })?;
        if file_type.is_dir() {
            walk_dir(root, &path, out)?;
        } else if file_type.is_symlink() {
            let target_meta = std::fs::metadata(&path);
            match target_meta {
                Ok(meta) if meta.is_dir() => {
                    // Directory symlinks are not traversed.
                }
                Ok(_) => push_file_entry(&path, root, out)?,
                Err(_) => {}
            }
        } else {
            push_file_entry(&path, root, out)?;
        }
    }
    Ok(())
}

fn push_file_entry(path: &Path, root: &Path, out: &mut Vec<FileData>) -> Result<(), PackagingError> {
    let meta = std::fs::metadata(path).map_err(|e| PackagingError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let size = meta.len();
    let rel = path.strip_prefix(root).unwrap_or(path);
    let normalized_path = rel.to_string_lossy().replace('\\', "/");
    let is_main_config = normalized_path == "main.json";

    let inline_data = if size <= SMALL_FILE_THRESHOLD {
        let bytes = std::fs::read(path).map_err(|e| PackagingError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Some(base64::engine::general_purpose::STANDARD.encode(bytes))
    } else {
        None
    };

    out.push(FileData {
        target_path: normalized_path.clone(),
        normalized_path,
        source_path: path.to_path_buf(),
        size,
        inline_data,
        is_main_config,
    });
    Ok(())
}

fn compute_signature(files: &[FileData]) -> String {
    let mut hasher = Sha256::new();
    for f in files {
        hasher.update(f.normalized_path.as_bytes());
        hasher.update(f.size.to_le_bytes());
        if let Ok(meta) = std::fs::metadata(&f.source_path) {
            if let Ok(modified) = meta.modified() {
                if let Ok(dur) = modified.duration_since(UNIX_EPOCH) {
                    hasher.update(dur.as_nanos().to_le_bytes());
                }
            }
        }
    }
    hex::encode(hasher.finalize())
}

/// Shallow overlay of a per-device/group config map under a `Config` key of
/// `main.json`'s parsed contents. Mutates `main_json` in place.
pub fn apply_config_overlay(main_json: &mut serde_json::Value, overlay: &serde_json::Value) {
    let serde_json::Value::Object(overlay_map) = overlay else {
        return;
    };
    if !main_json.is_object() {
        *main_json = serde_json::json!({});
    }
    let obj = main_json.as_object_mut().expect("forced to object above");
    let config_slot = obj
        .entry("Config")
        .or_insert_with(|| serde_json::json!({}));
    if !config_slot.is_object() {
        *config_slot = serde_json::json!({});
    }
    let config_obj = config_slot.as_object_mut().expect("forced to object above");
    for (k, v) in overlay_map {
        config_obj.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn packages_single_small_file_inline() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.lua");
        fs::write(&file, b"print('hi')").unwrap();

        let cache = ScriptPkgCache::new();
        let pkg = cache.get_or_package(dir.path(), "main.lua").await.unwrap();
        assert_eq!(pkg.files.len(), 1);
        assert!(pkg.files[0].inline_data.is_some());
    }

    #[tokio::test]
    async fn large_file_is_not_inlined() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        fs::create_dir_all(bundle.join("assets")).unwrap();
        fs::create_dir_all(bundle.join("lua/scripts")).unwrap();
        fs::write(bundle.join("lua/scripts/main.lua"), b"ok").unwrap();
        let big = vec![0u8; (SMALL_FILE_THRESHOLD + 1) as usize];
        fs::write(bundle.join("assets/blob.bin"), &big).unwrap();

        let cache = ScriptPkgCache::new();
        let pkg = cache.get_or_package(dir.path(), "bundle").await.unwrap();
        let blob = pkg
            .files
            .iter()
            .find(|f| f.normalized_path.ends_with("blob.bin"))
            .unwrap();
        assert!(blob.inline_data.is_none());
        assert_eq!(blob.size, big.len() as u64);
    }

    #[tokio::test]
    async fn directory_symlinks_are_not_traversed() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join("entry.lua"), b"ok").unwrap();

        let escape_target = dir.path().join("escape");
        fs::create_dir_all(&escape_target).unwrap();
        fs::write(escape_target.join("secret.txt"), b"nope").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&escape_target, bundle.join("linked_dir")).unwrap();
        }

        let cache = ScriptPkgCache::new();
        let pkg = cache.get_or_package(dir.path(), "bundle").await.unwrap();
        assert!(!pkg.files.iter().any(|f| f.normalized_path.contains("secret")));
    }

    #[test]
    fn config_overlay_merges_shallowly_under_config_key() {
        let mut main = serde_json::json!({"Config": {"a": 1, "b": 2}});
        let overlay = serde_json::json!({"b": 99, "c": 3});
        apply_config_overlay(&mut main, &overlay);
        assert_eq!(main["Config"]["a"], 1);
        assert_eq!(main["Config"]["b"], 99);
        assert_eq!(main["Config"]["c"], 3);
    }

    #[test]
    fn pkg_cache_key_distinguishes_piled_bundles() {
        let key_a = PkgCacheKey {
            root: PathBuf::from("/scripts"),
            name: "bundle".into(),
            is_dir: true,
            is_piled: true,
        };
        let key_b = PkgCacheKey {
            is_piled: false,
            ..key_a.clone()
        };
        assert_ne!(key_a, key_b);
    }
}
