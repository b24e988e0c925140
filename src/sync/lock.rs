//! OS-level advisory locking for the sync critical section (§5).
//!
//! `W/.sync.lock` is held exclusively for the duration of one sync. The lock
//! file's contents are the holder's pid, so a later process can tell a dead
//! holder (crashed mid-sync) from a live contender and recover instead of
//! wedging forever.

use crate::error::{BeadsError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = ".sync.lock";

/// A held sync lock; releases on drop.
pub struct SyncLock {
    file: File,
    path: PathBuf,
}

impl SyncLock {
    /// Try to acquire the sync lock in `workspace_dir`.
    ///
    /// # Errors
    ///
    /// Returns `BeadsError::SyncLocked` if another live process holds it,
    /// `BeadsError::MalformedLock` if the file can't be parsed for a pid
    /// check, or an I/O error if the file can't be opened.
    pub fn acquire(workspace_dir: &Path) -> Result<Self> {
        let path = workspace_dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(BeadsError::Io)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                write_pid(&file)?;
                Ok(Self { file, path })
            }
            Err(_) => {
                if let Some(pid) = read_stale_pid(&path)? {
                    if !process_is_alive(pid) {
                        // Dead holder: steal the lock rather than wedge forever.
                        file.try_lock_exclusive().map_err(|_| BeadsError::SyncLocked {
                            path: path.clone(),
                            pid,
                        })?;
                        write_pid(&file)?;
                        return Ok(Self { file, path });
                    }
                    return Err(BeadsError::SyncLocked { path, pid });
                }
                Err(BeadsError::SyncLocked { path, pid: 0 })
            }
        }
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_pid(file: &File) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file;
    file.set_len(0).map_err(BeadsError::Io)?;
    file.seek(SeekFrom::Start(0)).map_err(BeadsError::Io)?;
    write!(file, "{}", std::process::id()).map_err(BeadsError::Io)?;
    Ok(())
}

fn read_stale_pid(path: &Path) -> Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<u32>()
                .map(Some)
                .map_err(|_| BeadsError::MalformedLock {
                    path: path.to_path_buf(),
                })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BeadsError::Io(e)),
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    // No portable liveness check off Unix; assume alive so we never steal a
    // live holder's lock.
    true
}
