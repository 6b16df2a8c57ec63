//! Filesystem-backed persistent engine
//!
//! Each key maps to `<root>/<hex[0:2]>/<hex[2:4]>/<prefix><sha256(key)>.cache`
//! holding a serialized `Entry`. Writes take an exclusive OS-level file lock
//! so concurrent writers to the same key serialize; expiry is lazy on read,
//! with a periodic tree sweep reclaiming expired and unparseable files.

use crate::config::FileConfig;
use crate::engine::CacheEngine;
use crate::entry::{unix_now, Entry};
use crate::errors::{CacheError, Result};
use async_trait::async_trait;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const CACHE_EXTENSION: &str = "cache";

/// Point-in-time view of the on-disk store
#[derive(Debug, Clone)]
pub struct FileStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub expired_count: usize,
    pub free_disk_bytes: u64,
}

/// Sharded-directory persistent store
#[derive(Debug)]
pub struct FileEngine {
    root: PathBuf,
    prefix: String,
}

impl FileEngine {
    pub fn new(config: &FileConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)
            .map_err(|e| CacheError::io(&config.root, "create cache root", e))?;
        apply_permissions(&config.root, config.permissions)?;

        Ok(FileEngine {
            root: config.root.clone(),
            prefix: config.prefix.clone(),
        })
    }

    /// Shard path for a key: first two hex pairs of the digest become the
    /// directory levels, the full digest the filename
    fn path_for(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root
            .join(&digest[..2])
            .join(&digest[2..4])
            .join(format!("{}{}.{}", self.prefix, digest, CACHE_EXTENSION))
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let entry = match read_entry(&path)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        if entry.is_expired(unix_now()) {
            remove_quietly(&path);
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    pub fn set(&self, key: &str, value: &[u8], ttl: u64) -> Result<()> {
        let now = unix_now();
        let entry = Entry::new(value.to_vec(), key.len(), ttl, now);
        self.write_entry(&self.path_for(key), &entry)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(path, "remove cache file", e)),
        }
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Set-if-absent. Creation races resolve through `create_new`, which is
    /// atomic at the filesystem level; an existing-but-expired file is
    /// re-checked under the exclusive lock before being overwritten.
    pub fn add(&self, key: &str, value: &[u8], ttl: u64) -> Result<bool> {
        let path = self.path_for(key);
        ensure_parent(&path)?;
        let now = unix_now();
        let entry = Entry::new(value.to_vec(), key.len(), ttl, now);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                lock_file(&file, &path)?;
                write_locked(&mut file, &path, &entry)?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| CacheError::io(&path, "open cache file", e))?;
                lock_file(&file, &path)?;

                let existing = parse_entry(&mut file, &path);
                let live = matches!(existing, Some(existing) if !existing.is_expired(now));
                if live {
                    return Ok(false);
                }
                write_locked(&mut file, &path, &entry)?;
                Ok(true)
            }
            Err(e) => Err(CacheError::io(path, "create cache file", e)),
        }
    }

    /// Atomic numeric update under the exclusive file lock
    pub fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let path = self.path_for(key);
        ensure_parent(&path)?;
        let now = unix_now();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| CacheError::io(&path, "open cache file", e))?;
        lock_file(&file, &path)?;

        let existing = parse_entry(&mut file, &path).filter(|e| !e.is_expired(now));
        let (current, created_at, expires_at) = match existing {
            Some(existing) => {
                let text = std::str::from_utf8(&existing.value).map_err(|_| {
                    CacheError::TypeMismatch {
                        key: key.to_string(),
                        detail: "value is not UTF-8".to_string(),
                    }
                })?;
                let parsed: i64 =
                    text.trim()
                        .parse()
                        .map_err(|_| CacheError::TypeMismatch {
                            key: key.to_string(),
                            detail: "value is not an integer".to_string(),
                        })?;
                (parsed, existing.created_at, existing.expires_at)
            }
            None => (0, now, None),
        };

        let updated = current.wrapping_add(delta);
        let mut entry = Entry::new(updated.to_string().into_bytes(), key.len(), 0, now);
        entry.created_at = created_at;
        entry.expires_at = expires_at;
        write_locked(&mut file, &path, &entry)?;
        Ok(updated)
    }

    pub fn touch(&self, key: &str, ttl: u64) -> Result<bool> {
        let path = self.path_for(key);
        let now = unix_now();

        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CacheError::io(path, "open cache file", e)),
        };
        lock_file(&file, &path)?;

        let mut entry = match parse_entry(&mut file, &path) {
            Some(entry) if !entry.is_expired(now) => entry,
            _ => return Ok(false),
        };
        entry.touch(ttl, now);
        write_locked(&mut file, &path, &entry)?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        for shard in read_dirs(&self.root) {
            fs::remove_dir_all(&shard).map_err(|e| CacheError::io(shard, "remove shard", e))?;
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        let now = unix_now();
        self.walk()
            .filter(|path| matches!(read_entry_lenient(path), Some(e) if !e.is_expired(now)))
            .count()
    }

    /// Walk the tree removing expired and unparseable files
    pub fn cleanup(&self) -> usize {
        let now = unix_now();
        let mut reclaimed = 0;
        for path in self.walk() {
            let keep = matches!(read_entry_lenient(&path), Some(e) if !e.is_expired(now));
            if !keep {
                remove_quietly(&path);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            tracing::debug!(reclaimed, root = %self.root.display(), "file cache sweep");
        }
        reclaimed
    }

    pub fn stats(&self) -> FileStats {
        let now = unix_now();
        let mut stats = FileStats {
            file_count: 0,
            total_bytes: 0,
            expired_count: 0,
            free_disk_bytes: fs2::available_space(&self.root).unwrap_or(0),
        };
        for path in self.walk() {
            stats.file_count += 1;
            if let Ok(meta) = fs::metadata(&path) {
                stats.total_bytes += meta.len();
            }
            match read_entry_lenient(&path) {
                Some(entry) if entry.is_expired(now) => stats.expired_count += 1,
                Some(_) => {}
                None => stats.expired_count += 1,
            }
        }
        stats
    }

    fn write_entry(&self, path: &Path, entry: &Entry) -> Result<()> {
        ensure_parent(path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| CacheError::io(path, "open cache file", e))?;
        lock_file(&file, path)?;
        write_locked(&mut file, path, entry)
    }

    /// All cache files under the two shard levels
    fn walk(&self) -> impl Iterator<Item = PathBuf> {
        read_dirs(&self.root)
            .into_iter()
            .flat_map(|level1| read_dirs(&level1))
            .flat_map(|level2| {
                fs::read_dir(level2)
                    .into_iter()
                    .flatten()
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| {
                        p.is_file() && p.extension().is_some_and(|ext| ext == CACHE_EXTENSION)
                    })
                    .collect::<Vec<_>>()
            })
    }
}

#[async_trait]
impl CacheEngine for FileEngine {
    fn name(&self) -> &'static str {
        "file"
    }

    fn performance_level(&self) -> u8 {
        1
    }

    async fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        FileEngine::get(self, key)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: u64) -> Result<()> {
        FileEngine::set(self, key, value, ttl)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        FileEngine::delete(self, key)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        FileEngine::exists(self, key)
    }

    async fn add(&self, key: &str, value: &[u8], ttl: u64) -> Result<bool> {
        FileEngine::add(self, key, value, ttl)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        FileEngine::increment(self, key, delta)
    }

    async fn touch(&self, key: &str, ttl: u64) -> Result<bool> {
        FileEngine::touch(self, key, ttl)
    }

    async fn clear(&self) -> Result<()> {
        FileEngine::clear(self)
    }

    async fn count(&self) -> Result<usize> {
        Ok(FileEngine::count(self))
    }

    async fn cleanup(&self) -> Result<usize> {
        Ok(FileEngine::cleanup(self))
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, "create shard dirs", e))?;
    }
    Ok(())
}

fn lock_file(file: &File, path: &Path) -> Result<()> {
    file.lock_exclusive()
        .map_err(|e| CacheError::io(path, "lock cache file", e))
}

/// Serialize and replace the file body; the caller holds the lock
fn write_locked(file: &mut File, path: &Path, entry: &Entry) -> Result<()> {
    use std::io::Seek;

    let payload = bincode::serialize(entry)
        .map_err(|e| CacheError::serialization(path.display().to_string(), e))?;
    let io_err = |e| CacheError::io(path, "write cache file", e);
    file.set_len(0).map_err(io_err)?;
    file.seek(std::io::SeekFrom::Start(0)).map_err(io_err)?;
    file.write_all(&payload).map_err(io_err)?;
    file.flush().map_err(io_err)
}

/// Read an entry; missing file is `None`, unreadable content surfaces as an
/// error for callers that care, while parse failures read as absent
fn read_entry(path: &Path) -> Result<Option<Entry>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io(path, "read cache file", e)),
    };
    match bincode::deserialize(&bytes) {
        Ok(entry) => Ok(Some(entry)),
        Err(_) => {
            // Truncated or corrupt payload reads as a miss. Removal is
            // left to the cleanup sweep: an unlocked read may be racing a
            // writer that holds the exclusive lock mid-rewrite.
            tracing::warn!(path = %path.display(), "ignoring unparseable cache file");
            Ok(None)
        }
    }
}

/// Best-effort read used by sweeps; any failure reads as absent
fn read_entry_lenient(path: &Path) -> Option<Entry> {
    let bytes = fs::read(path).ok()?;
    bincode::deserialize(&bytes).ok()
}

/// Parse an entry from an already-open (and locked) file
fn parse_entry(file: &mut File, path: &Path) -> Option<Entry> {
    use std::io::Seek;
    if file.seek(std::io::SeekFrom::Start(0)).is_err() {
        return None;
    }
    let mut bytes = Vec::new();
    if file.read_to_end(&mut bytes).is_err() || bytes.is_empty() {
        return None;
    }
    match bincode::deserialize(&bytes) {
        Ok(entry) => Some(entry),
        Err(_) => {
            tracing::warn!(path = %path.display(), "ignoring unparseable cache file");
            None
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

fn read_dirs(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect()
}

#[cfg(unix)]
fn apply_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| CacheError::io(path, "set permissions", e))
}

#[cfg(not(unix))]
fn apply_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
