//! Single-writer discipline: only one sync pass may run against a given
//! artifact root at a time, whether that's two CLI invocations racing each
//! other or a `watch` loop overlapping a one-shot `sync`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gallery_mirror_types::{Error, Result};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// An acquired lock, released automatically on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    /// Acquire the lock, failing if it's already held and not stale.
    pub fn acquire(state_dir: &Path, stale_after: Duration) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE);

        if path.exists() {
            match read_lock_info(&path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > stale_after.as_secs() {
                        fs::remove_file(&path)?;
                    } else {
                        return Err(Error::ConfigInvalid(format!(
                            "sync lock held by pid {} on {} since {}",
                            info.pid, info.hostname, info.acquired_at
                        )));
                    }
                }
                Err(_) => fs::remove_file(&path)?,
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        };
        write_lock_info(&path, &info)?;

        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.released && self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_info(path: &Path, info: &LockInfo) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info)
        .map_err(|e| Error::RequestMalformed(e.to_string()))?;
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| Error::RequestMalformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_allows_reacquiring() {
        let td = tempfile::tempdir().unwrap();
        let mut lock = LockFile::acquire(td.path(), Duration::from_secs(3600)).unwrap();
        lock.release().unwrap();
        let _second = LockFile::acquire(td.path(), Duration::from_secs(3600)).unwrap();
    }

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let td = tempfile::tempdir().unwrap();
        let _first = LockFile::acquire(td.path(), Duration::from_secs(3600)).unwrap();
        assert!(LockFile::acquire(td.path(), Duration::from_secs(3600)).is_err());
    }

    #[test]
    fn dropping_a_lock_releases_it() {
        let td = tempfile::tempdir().unwrap();
        {
            let _lock = LockFile::acquire(td.path(), Duration::from_secs(3600)).unwrap();
        }
        let _reacquired = LockFile::acquire(td.path(), Duration::from_secs(3600)).unwrap();
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join(LOCK_FILE);
        let stale = LockInfo {
            pid: 999_999,
            hostname: "stale-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        write_lock_info(&path, &stale).unwrap();

        let _lock = LockFile::acquire(td.path(), Duration::from_secs(60)).unwrap();
    }
}
