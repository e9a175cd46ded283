//! # Pid file — single-instance guard for the arbiter.
//!
//! Claimed once at startup, released at shutdown. A leftover file from a
//! crashed run is reclaimed automatically when its recorded pid is no longer
//! alive.
//!
//! ## Rules
//! - Claiming fails when the recorded pid still exists; two arbiters never
//!   share a pid file.
//! - Release only unlinks a file that still records *our* pid, so a
//!   later claimant is never unlinked by a stale predecessor.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::PidfileError;

/// A claimed pid file; dropping it does **not** release (release is explicit
/// so shutdown controls the ordering).
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
    pid: i32,
}

impl Pidfile {
    /// Claims `path` for the current process.
    ///
    /// An existing file is reclaimed if its pid is gone, rejected with
    /// [`PidfileError::Stale`] if that pid is still alive.
    pub fn claim(path: impl Into<PathBuf>) -> Result<Self, PidfileError> {
        let path = path.into();
        let pid = std::process::id() as i32;

        if let Some(owner) = read_owner(&path)? {
            if owner != pid && process_alive(owner) {
                return Err(PidfileError::Stale {
                    path,
                    owner,
                });
            }
            debug!(path = %path.display(), owner, "reclaiming stale pid file");
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| PidfileError::Io {
                path: path.clone(),
                source,
            })?;
        write!(file, "{pid}").map_err(|source| PidfileError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), pid, "pid file claimed");
        Ok(Self { path, pid })
    }

    /// Path of the claimed file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlinks the file if it still records our pid.
    pub fn release(self) {
        match read_owner(&self.path) {
            Ok(Some(owner)) if owner == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "pid file unlink failed");
                }
            }
            Ok(_) => {
                debug!(path = %self.path.display(), "pid file no longer ours; left in place");
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "pid file read failed"),
        }
    }
}

/// Reads the pid recorded in `path`; `None` when the file is absent.
/// Unparseable content counts as absent (a corrupt file is reclaimable).
fn read_owner(path: &Path) -> Result<Option<i32>, PidfileError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PidfileError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Signal-0 probe. `EPERM` means the pid exists but belongs to someone else,
/// which still counts as alive.
fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_writes_our_pid_and_release_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbiter.pid");

        let pf = Pidfile::claim(&path).unwrap();
        let recorded: i32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id() as i32);

        pf.release();
        assert!(!path.exists());
    }

    #[test]
    fn live_owner_blocks_the_claim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbiter.pid");
        // pid 1 is always alive.
        fs::write(&path, "1").unwrap();

        let err = Pidfile::claim(&path).unwrap_err();
        assert!(matches!(err, PidfileError::Stale { owner: 1, .. }));
        assert!(path.exists(), "the live owner's file is left alone");
    }

    #[test]
    fn dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbiter.pid");
        // Max pid on Linux is far below this; the pid cannot exist.
        fs::write(&path, "999999999").unwrap();

        let pf = Pidfile::claim(&path).unwrap();
        let recorded: i32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id() as i32);
        pf.release();
    }

    #[test]
    fn corrupt_content_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbiter.pid");
        fs::write(&path, "not-a-pid").unwrap();

        let pf = Pidfile::claim(&path).unwrap();
        pf.release();
        assert!(!path.exists());
    }

    #[test]
    fn release_spares_a_file_someone_else_rewrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbiter.pid");

        let pf = Pidfile::claim(&path).unwrap();
        fs::write(&path, "1").unwrap();
        pf.release();
        assert!(path.exists(), "a successor's pid file survives our release");
    }
}
