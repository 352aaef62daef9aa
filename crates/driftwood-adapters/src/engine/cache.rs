//! Named on-disk cache for engine artifacts.
//!
//! Each entry lives under `<cache_dir>/driftwood/<name>/` as a `<hash>.bin`
//! payload next to a `<hash>.meta.json` record. Writers take an exclusive
//! `fs2` lock on `.lock`, readers a shared one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const CACHE_LOCK_FILE: &str = ".lock";
const CACHE_LOCK_TIMEOUT_SECS: u64 = 5;
const CACHE_LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
}

pub(crate) struct CacheLock {
    file: fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ArtifactCache {
    /// Open the named cache under the user cache directory.
    pub fn open(name: &str) -> Result<Self> {
        let base = dirs::cache_dir().context("No cache directory available on this platform")?;
        Ok(Self::open_in(&base.join("driftwood"), name))
    }

    pub fn open_in(root: &Path, name: &str) -> Self {
        Self {
            dir: root.join(name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the cached bytes for `key`, if any.
    pub fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (data_path, meta_path) = self.entry_paths(key);
        if !meta_path.exists() {
            return Ok(None);
        }
        let _lock = self.lock(false)?;
        let Some(meta) = read_meta(&meta_path) else {
            return Ok(None);
        };
        if meta.key != key {
            return Ok(None);
        }
        match fs::read(&data_path) {
            Ok(bytes) if bytes.len() as u64 == meta.size => Ok(Some(bytes)),
            Ok(_) => {
                tracing::debug!(key, "cached artifact size mismatch, ignoring entry");
                Ok(None)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("Failed to read cached artifact"),
        }
    }

    pub fn meta(&self, key: &str) -> Option<EntryMeta> {
        let (_, meta_path) = self.entry_paths(key);
        read_meta(&meta_path).filter(|meta| meta.key == key)
    }

    /// Store `bytes` under `key`, replacing any previous entry.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let _lock = self.lock(true)?;
        let (data_path, meta_path) = self.entry_paths(key);
        write_atomic(&data_path, bytes).context("Failed to write cached artifact")?;

        let meta = EntryMeta {
            key: key.to_string(),
            size: bytes.len() as u64,
            cached_at: Utc::now(),
        };
        let meta_content = serde_json::to_vec_pretty(&meta)?;
        write_atomic(&meta_path, &meta_content).context("Failed to write artifact metadata")?;
        Ok(())
    }

    /// Remove the entry for `key`. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        if !self.dir.exists() {
            return Ok(false);
        }
        let _lock = self.lock(true)?;
        let (data_path, meta_path) = self.entry_paths(key);
        let mut removed = false;
        for path in [&meta_path, &data_path] {
            match fs::remove_file(path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
        }
        Ok(removed)
    }

    fn entry_paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let hash = hash_key(key);
        (
            self.dir.join(format!("{hash}.bin")),
            self.dir.join(format!("{hash}.meta.json")),
        )
    }

    pub(crate) fn lock(&self, exclusive: bool) -> Result<CacheLock> {
        fs::create_dir_all(&self.dir).context("Failed to create cache directory")?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(CACHE_LOCK_FILE))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(CACHE_LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for cache lock ({}s)",
                            CACHE_LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(CACHE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(CacheLock { file })
    }
}

/// Stable file name for a cache key.
fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..16])
}

fn read_meta(path: &Path) -> Option<EntryMeta> {
    let content = fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
