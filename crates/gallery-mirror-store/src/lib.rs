//! A content-addressed filesystem store with atomic writes and integrity checks.
//!
//! Every write goes to a temp file beside its destination and is promoted
//! into place with a same-directory rename, so a reader never observes a
//! partially written file and a crash mid-download never corrupts an
//! already-published asset.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> gallery_mirror_types::Result<()> {
//! use gallery_mirror_store::FileStore;
//!
//! let store = FileStore::new("/var/lib/gallery-mirror");
//! store.write_all("extensions/ms-python.python/2024.1.0/extension.vsix", b"...").await?;
//! assert!(store.has("extensions/ms-python.python/2024.1.0/extension.vsix", None).await?);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use gallery_mirror_types::{Error, Result};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Optional expectations an asset write must satisfy before it is promoted.
#[derive(Debug, Clone, Default)]
pub struct Expectation {
    pub size: Option<u64>,
    pub hash: Option<String>,
}

/// The outcome of a committed write: what actually landed on disk.
#[derive(Debug, Clone, Copy)]
pub struct CommittedWrite {
    pub size: u64,
}

/// Filesystem-backed content store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn full_path(&self, relpath: &str) -> PathBuf {
        self.root.join(relpath)
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Begin a streaming, atomic write to `relpath`. The file is only
    /// visible at `relpath` once [`PendingWrite::commit`] succeeds.
    pub async fn open_write(&self, relpath: &str) -> Result<PendingWrite> {
        let final_path = self.root.join(relpath);
        let parent = final_path.parent().ok_or_else(|| {
            Error::StoreIo(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path has no parent: {}", final_path.display()),
            ))
        })?;
        tokio::fs::create_dir_all(parent).await?;

        let nonce: u64 = {
            use rand::Rng;
            rand::rng().random()
        };
        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("asset");
        let tmp_path = parent.join(format!(".{file_name}.tmp-{nonce:016x}"));

        let file = tokio::fs::File::create(&tmp_path).await?;

        Ok(PendingWrite {
            tmp_path: Some(tmp_path),
            final_path,
            file,
            hasher: Sha256::new(),
            written: 0,
        })
    }

    /// Write `data` to `relpath` atomically in one shot. For large assets
    /// prefer [`FileStore::open_write`] and stream chunks in.
    pub async fn write_all(&self, relpath: &str, data: &[u8]) -> Result<CommittedWrite> {
        let mut pending = self.open_write(relpath).await?;
        pending.write_chunk(data).await?;
        pending.commit(None).await
    }

    /// Serialize `value` as pretty JSON and write it atomically.
    pub async fn write_json<T: serde::Serialize>(&self, relpath: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::UpstreamMalformed(format!("failed to encode {relpath}: {e}")))?;
        self.write_all(relpath, &bytes).await?;
        Ok(())
    }

    /// Read and parse `relpath` as JSON, returning `Ok(None)` if it doesn't exist.
    pub async fn read_json<T: serde::de::DeserializeOwned>(&self, relpath: &str) -> Result<Option<T>> {
        match self.read(relpath).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::UpstreamMalformed(format!("failed to decode {relpath}: {e}")))?;
                Ok(Some(value))
            }
            Err(Error::StoreIo(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn read(&self, relpath: &str) -> Result<Vec<u8>> {
        let full_path = self.root.join(relpath);
        Ok(tokio::fs::read(&full_path).await?)
    }

    /// Open a handle for streamed reads, e.g. to serve a byte-range request.
    pub async fn open_read(&self, relpath: &str) -> Result<tokio::fs::File> {
        let full_path = self.root.join(relpath);
        Ok(tokio::fs::File::open(&full_path).await?)
    }

    /// Check existence, optionally verifying declared size and/or hash
    /// match what's on disk (used by the synchronizer to decide whether a
    /// work item can be skipped).
    pub async fn has(&self, relpath: &str, expect: Option<&Expectation>) -> Result<bool> {
        let full_path = self.root.join(relpath);
        let metadata = match tokio::fs::metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let Some(expect) = expect else {
            return Ok(true);
        };

        if let Some(size) = expect.size
            && metadata.len() != size
        {
            return Ok(false);
        }

        if let Some(expected_hash) = &expect.hash {
            let mut file = tokio::fs::File::open(&full_path).await?;
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected_hash) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Remove `relpath`, tolerating its absence.
    pub async fn remove(&self, relpath: &str) -> Result<()> {
        let full_path = self.root.join(relpath);
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an empty directory tree at `relpath`, tolerating its absence
    /// and non-emptiness (a concurrent writer may have repopulated it).
    pub async fn remove_dir(&self, relpath: &str) -> Result<()> {
        let full_path = self.root.join(relpath);
        match tokio::fs::remove_dir_all(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List the immediate subdirectory names under `prefix`, tolerating a
    /// missing `prefix` (empty result) and a concurrent writer removing an
    /// entry mid-scan (skipped rather than surfaced as an error).
    pub async fn list_dir_names(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.root.join(prefix);
        let mut names = Vec::new();

        let mut entries = match tokio::fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        loop {
            let next = entries.next_entry().await;
            match next {
                Ok(Some(entry)) => {
                    let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    if is_dir && let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        names.sort();
        Ok(names)
    }

    /// List every file path under `prefix`, relative to the store root.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.root.join(prefix);
        let mut results = Vec::new();

        if tokio::fs::metadata(&base).await.is_err() {
            return Ok(results);
        }

        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root)
                    && let Some(s) = relative.to_str()
                {
                    results.push(s.replace('\\', "/"));
                }
            }
        }

        results.sort();
        Ok(results)
    }
}

/// A write in progress. Drop without calling [`commit`](PendingWrite::commit)
/// or [`abort`](PendingWrite::abort) best-effort removes the temp file.
pub struct PendingWrite {
    tmp_path: Option<PathBuf>,
    final_path: PathBuf,
    file: tokio::fs::File,
    hasher: Sha256,
    written: u64,
}

impl PendingWrite {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Flush, verify against `expect` if given, and atomically promote the
    /// temp file into its final path. On integrity mismatch the temp file
    /// is removed and no partial asset is left behind.
    pub async fn commit(mut self, expect: Option<&Expectation>) -> Result<CommittedWrite> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let tmp_path = self.tmp_path.take().expect("commit called once");
        let hash = hex::encode(self.hasher.clone().finalize());

        if let Some(expect) = expect {
            if let Some(size) = expect.size
                && size != self.written
            {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(Error::AssetIntegrityMismatch {
                    path: self.final_path.display().to_string(),
                    expected_size: expect.size,
                    expected_hash: expect.hash.clone(),
                    actual_size: self.written,
                    actual_hash: Some(hash),
                });
            }
            if let Some(expected_hash) = &expect.hash
                && !expected_hash.eq_ignore_ascii_case(&hash)
            {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(Error::AssetIntegrityMismatch {
                    path: self.final_path.display().to_string(),
                    expected_size: expect.size,
                    expected_hash: expect.hash.clone(),
                    actual_size: self.written,
                    actual_hash: Some(hash),
                });
            }
        }

        tokio::fs::rename(&tmp_path, &self.final_path).await?;
        Ok(CommittedWrite { size: self.written })
    }

    /// Discard the write and remove the temp file.
    pub async fn abort(mut self) -> Result<()> {
        if let Some(tmp_path) = self.tmp_path.take() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        Ok(())
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if let Some(path) = self.tmp_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
