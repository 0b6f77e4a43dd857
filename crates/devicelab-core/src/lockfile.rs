//! Inter-process advisory lock per device
//!
//! The lock is a text file `.lock` in the device's storage directory with the
//! content `"<0|1>.<pid>"`: a locked flag and the pid of the last writer.
//! Liveness of a foreign holder is checked with a non-blocking snapshot; a
//! lock whose holder has died is reclaimed by the next acquirer.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// File name of the advisory lock inside a device storage directory
const LOCK_FILE_NAME: &str = ".lock";

/// Parsed content of a lock file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
    pub pid: u32,
}

/// Check whether a pid denotes a live process.
///
/// Snapshot semantics: this never blocks on the holder. Signal 0 probes
/// existence without delivering anything.
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Advisory lock file for one device
#[derive(Debug, Clone)]
pub struct LockFile {
    device_id: String,
    path: PathBuf,
    pid: u32,
}

impl LockFile {
    pub fn new(device_id: impl Into<String>, storage_dir: &Path) -> Self {
        LockFile {
            device_id: device_id.into(),
            path: storage_dir.join(LOCK_FILE_NAME),
            pid: std::process::id(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the lock state, creating the file unlocked-by-self if absent
    pub fn read(&self) -> Result<LockStatus> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_lock_content(&content).ok_or_else(|| {
                Error::process(format!(
                    "corrupt lock file {}: {:?}",
                    self.path.display(),
                    content
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let status = LockStatus {
                    locked: false,
                    pid: self.pid,
                };
                self.write(status)?;
                Ok(status)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lock for this process.
    ///
    /// Re-acquisition by the same pid is a no-op. A live foreign holder fails
    /// with `DeviceLocked`; a dead holder is silently reclaimed.
    pub fn acquire(&self) -> Result<()> {
        let status = self.read()?;

        if status.locked {
            if status.pid == self.pid {
                return Ok(());
            }
            if is_pid_alive(status.pid) {
                return Err(Error::device_locked(&self.device_id, status.pid));
            }
            tracing::warn!(
                device = %self.device_id,
                stale_pid = status.pid,
                "reclaiming lock from dead process"
            );
        }

        self.write(LockStatus {
            locked: true,
            pid: self.pid,
        })
    }

    /// Release the lock.
    ///
    /// Fails with `DeviceLocked` if a different live process holds it; a dead
    /// foreign holder is overwritten.
    pub fn release(&self) -> Result<()> {
        let status = self.read()?;

        if status.locked && status.pid != self.pid && is_pid_alive(status.pid) {
            return Err(Error::device_locked(&self.device_id, status.pid));
        }

        self.write(LockStatus {
            locked: false,
            pid: self.pid,
        })
    }

    /// Whether a live process other than this one holds the lock
    pub fn held_by_other(&self) -> Result<bool> {
        let status = self.read()?;
        Ok(status.locked && status.pid != self.pid && is_pid_alive(status.pid))
    }

    /// Whether this process currently holds the lock
    pub fn held_by_self(&self) -> Result<bool> {
        let status = self.read()?;
        Ok(status.locked && status.pid == self.pid)
    }

    fn write(&self, status: LockStatus) -> Result<()> {
        let flag = if status.locked { 1 } else { 0 };
        std::fs::write(&self.path, format!("{}.{}", flag, status.pid))?;
        Ok(())
    }
}

fn parse_lock_content(content: &str) -> Option<LockStatus> {
    let (flag, pid) = content.trim().split_once('.')?;
    let locked = match flag {
        "0" => false,
        "1" => true,
        _ => return None,
    };
    Some(LockStatus {
        locked,
        pid: pid.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // A pid far above any real pid range; guaranteed dead on test hosts
    const DEAD_PID: u32 = 999_999_999;

    fn lock_in(dir: &Path) -> LockFile {
        LockFile::new("UDID-A", dir)
    }

    #[test]
    fn test_read_creates_unlocked_file() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        let status = lock.read().unwrap();
        assert!(!status.locked);
        assert_eq!(status.pid, std::process::id());

        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, format!("0.{}", std::process::id()));
    }

    #[test]
    fn test_acquire_writes_locked_state() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        lock.acquire().unwrap();

        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, format!("1.{}", std::process::id()));
        assert!(lock.held_by_self().unwrap());
    }

    #[test]
    fn test_acquire_same_pid_is_noop() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        lock.acquire().unwrap();
        lock.acquire().unwrap();
        assert!(lock.held_by_self().unwrap());
    }

    #[test]
    #[cfg(unix)]
    fn test_acquire_fails_on_live_foreign_holder() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        // pid 1 is always alive on unix
        std::fs::write(lock.path(), "1.1").unwrap();

        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, Error::DeviceLocked { pid: 1, .. }));
    }

    #[test]
    fn test_acquire_reclaims_dead_holder() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        std::fs::write(lock.path(), format!("1.{}", DEAD_PID)).unwrap();

        lock.acquire().unwrap();
        let status = lock.read().unwrap();
        assert!(status.locked);
        assert_eq!(status.pid, std::process::id());
    }

    #[test]
    fn test_release_then_acquire_round_trip() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        lock.acquire().unwrap();
        lock.release().unwrap();

        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, format!("0.{}", std::process::id()));

        // Re-acquisition after release matches a single acquire
        lock.acquire().unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, format!("1.{}", std::process::id()));
    }

    #[test]
    #[cfg(unix)]
    fn test_release_fails_on_live_foreign_holder() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        std::fs::write(lock.path(), "1.1").unwrap();
        assert!(lock.release().is_err());
    }

    #[test]
    fn test_release_overwrites_dead_holder() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        std::fs::write(lock.path(), format!("1.{}", DEAD_PID)).unwrap();
        lock.release().unwrap();

        let status = lock.read().unwrap();
        assert!(!status.locked);
    }

    #[test]
    fn test_held_by_other_reports_dead_holder_as_free() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        std::fs::write(lock.path(), format!("1.{}", DEAD_PID)).unwrap();
        assert!(!lock.held_by_other().unwrap());
    }

    #[test]
    fn test_corrupt_content_is_an_error() {
        let dir = tempdir().unwrap();
        let lock = lock_in(dir.path());

        std::fs::write(lock.path(), "locked-by-me").unwrap();
        assert!(lock.read().is_err());
    }

    #[test]
    fn test_parse_lock_content() {
        assert_eq!(
            parse_lock_content("1.4242"),
            Some(LockStatus {
                locked: true,
                pid: 4242
            })
        );
        assert_eq!(
            parse_lock_content("0.1\n"),
            Some(LockStatus {
                locked: false,
                pid: 1
            })
        );
        assert_eq!(parse_lock_content("2.1"), None);
        assert_eq!(parse_lock_content("1.not-a-pid"), None);
        assert_eq!(parse_lock_content(""), None);
    }

    #[test]
    fn test_pid_liveness_snapshot() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(DEAD_PID));
    }
}
