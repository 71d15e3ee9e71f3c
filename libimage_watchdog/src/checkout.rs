//! Cross-process mutual exclusion over a single shared file, using the file name as the mutex.
//!
//! Checking a file out renames it to a unique name. Renames are atomic on POSIX and NTFS, so
//! exactly one contender can win; everyone else finds the file missing and waits. Checking the
//! file back in renames it to its original name. While it is checked out the file is absent
//! from its canonical path, and plain readers of that path have to tolerate (and retry) that.
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::Config;
use super::error::CheckoutError;
use super::relocator::rename_no_clobber;

/// What to do at check-in if someone else created the file while we held it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Report a conflict and leave our copy under its checked-out name
    #[default]
    Fail,
    /// Throw our copy away, keeping the other writer's file
    DiscardLocal,
    /// Replace the other writer's file with ours
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    Read,
    ReadWrite,
}

/// Exclusive access to a shared file, swappable for e.g. an advisory lock or a database lease
/// without touching callers.
pub trait Lock {
    type Guard;
    fn acquire(&self, path: &Path) -> Result<Self::Guard, CheckoutError>;
    fn release(&self, guard: Self::Guard) -> Result<(), CheckoutError>;
}

/// A file we currently hold, with its handle opened under the checked-out name
#[derive(Debug)]
pub struct CheckoutToken {
    original_path: PathBuf,
    checked_out_path: PathBuf,
    file: File,
}

impl CheckoutToken {
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn original_path(&self) -> &Path {
        &self.original_path
    }

    pub fn checked_out_path(&self) -> &Path {
        &self.checked_out_path
    }
}

fn checked_out_name(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".checkout-{}", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

#[derive(Debug, Clone, Copy)]
pub struct CheckoutLock {
    mode: CheckoutMode,
    patience: u32,
    retry_interval: Duration,
    conflict_policy: ConflictPolicy,
}

impl CheckoutLock {
    pub fn new(
        mode: CheckoutMode,
        patience: u32,
        retry_interval: Duration,
        conflict_policy: ConflictPolicy,
    ) -> Self {
        Self {
            mode,
            patience,
            retry_interval,
            conflict_policy,
        }
    }

    pub fn from_config(config: &Config, mode: CheckoutMode) -> Self {
        Self::new(
            mode,
            config.checkout_patience,
            Duration::from_secs_f64(config.checkout_retry_secs),
            config.conflict_policy,
        )
    }

    /// Check `path` out and straight back in.
    ///
    /// The two renames make clients of a network share drop their cached view of the file,
    /// so the next plain read sees what other machines wrote.
    pub fn force_refresh(&self, path: &Path) -> Result<(), CheckoutError> {
        let token = self.acquire(path)?;
        self.release(token)?;
        spdlog::debug!("Refreshed {}", path.display());
        Ok(())
    }

    /// Check out `path`, run `f` on it, and check it back in.
    ///
    /// The file is always checked back in, even if `f` fails. If both fail, the error from
    /// `f` wins and the check-in error is logged.
    pub fn with_checkout<T, E, F>(&self, path: &Path, f: F) -> Result<T, E>
    where
        E: From<CheckoutError>,
        F: FnOnce(&mut CheckoutToken) -> Result<T, E>,
    {
        let mut token = self.acquire(path)?;
        let result = f(&mut token);
        match (result, self.release(token)) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(E::from(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(checkin)) => {
                spdlog::error!("Check-in of {} also failed: {checkin}", path.display());
                Err(e)
            }
        }
    }

    fn open(&self, path: &Path) -> std::io::Result<File> {
        match self.mode {
            CheckoutMode::Read => File::open(path),
            CheckoutMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path),
        }
    }

    fn resolve_conflict(&self, checked_out: &Path, original: &Path) -> Result<(), CheckoutError> {
        match self.conflict_policy {
            ConflictPolicy::Fail => Err(CheckoutError::Conflict {
                path: original.to_path_buf(),
                checked_out: checked_out.to_path_buf(),
            }),
            ConflictPolicy::DiscardLocal => {
                spdlog::warn!(
                    "{} was recreated while checked out; discarding our copy",
                    original.display()
                );
                std::fs::remove_file(checked_out)?;
                Ok(())
            }
            ConflictPolicy::Overwrite => {
                spdlog::warn!(
                    "{} was recreated while checked out; overwriting it",
                    original.display()
                );
                std::fs::rename(checked_out, original)?;
                Ok(())
            }
        }
    }
}

impl Lock for CheckoutLock {
    type Guard = CheckoutToken;

    fn acquire(&self, path: &Path) -> Result<CheckoutToken, CheckoutError> {
        let checked_out_path = checked_out_name(path);
        let attempts = self.patience.max(1);
        let mut attempt = 1;
        loop {
            match std::fs::rename(path, &checked_out_path) {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    spdlog::debug!(
                        "{} is held elsewhere (attempt {attempt} of {attempts}): {e}",
                        path.display()
                    );
                    std::thread::sleep(self.retry_interval);
                    attempt += 1;
                }
                Err(source) => {
                    return Err(CheckoutError::Timeout {
                        path: path.to_path_buf(),
                        attempts,
                        source,
                    })
                }
            }
        }

        match self.open(&checked_out_path) {
            Ok(file) => Ok(CheckoutToken {
                original_path: path.to_path_buf(),
                checked_out_path,
                file,
            }),
            Err(e) => {
                // Give the file back before reporting
                if let Err(undo) = rename_no_clobber(&checked_out_path, path) {
                    spdlog::error!(
                        "Could not return {} to {}: {undo}",
                        checked_out_path.display(),
                        path.display()
                    );
                }
                Err(CheckoutError::IOError(e))
            }
        }
    }

    fn release(&self, token: CheckoutToken) -> Result<(), CheckoutError> {
        let CheckoutToken {
            original_path,
            checked_out_path,
            file,
        } = token;
        if self.mode == CheckoutMode::ReadWrite {
            file.sync_all()?;
        }
        drop(file);
        match rename_no_clobber(&checked_out_path, &original_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.resolve_conflict(&checked_out_path, &original_path)
            }
            Err(e) => Err(CheckoutError::IOError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn lock(policy: ConflictPolicy) -> CheckoutLock {
        CheckoutLock::new(
            CheckoutMode::ReadWrite,
            2,
            Duration::from_millis(5),
            policy,
        )
    }

    #[test]
    fn test_checkout_hides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_params_dump.json");
        std::fs::write(&path, b"{}").unwrap();

        let lock = lock(ConflictPolicy::Fail);
        let mut token = lock.acquire(&path).unwrap();
        assert!(!path.exists());
        assert!(token.checked_out_path().exists());
        let mut contents = String::new();
        token.file().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "{}");

        lock.release(token).unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_second_checkout_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");
        std::fs::write(&path, b"{}").unwrap();

        let lock = lock(ConflictPolicy::Fail);
        let token = lock.acquire(&path).unwrap();
        match lock.acquire(&path) {
            Err(CheckoutError::Timeout { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected result {other:?}"),
        }
        lock.release(token).unwrap();
        let token = lock.acquire(&path).unwrap();
        lock.release(token).unwrap();
    }

    fn conflicting_checkin(policy: ConflictPolicy) -> (tempfile::TempDir, Result<(), CheckoutError>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");
        std::fs::write(&path, b"ours").unwrap();

        let lock = lock(policy);
        let mut token = lock.acquire(&path).unwrap();
        token.file().seek(SeekFrom::Start(0)).unwrap();
        token.file().write_all(b"OURS").unwrap();
        std::fs::write(&path, b"theirs").unwrap();
        let result = lock.release(token);
        (dir, result)
    }

    #[test]
    fn test_conflict_fail() {
        let (dir, result) = conflicting_checkin(ConflictPolicy::Fail);
        let path = dir.path().join("shared.json");
        match result {
            Err(CheckoutError::Conflict { checked_out, .. }) => {
                assert_eq!(std::fs::read(&checked_out).unwrap(), b"OURS");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"theirs");
    }

    #[test]
    fn test_conflict_discard_local() {
        let (dir, result) = conflicting_checkin(ConflictPolicy::DiscardLocal);
        result.unwrap();
        let path = dir.path().join("shared.json");
        assert_eq!(std::fs::read(&path).unwrap(), b"theirs");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_conflict_overwrite() {
        let (dir, result) = conflicting_checkin(ConflictPolicy::Overwrite);
        result.unwrap();
        let path = dir.path().join("shared.json");
        assert_eq!(std::fs::read(&path).unwrap(), b"OURS");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_with_checkout_releases_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");
        std::fs::write(&path, b"{}").unwrap();

        let lock = lock(ConflictPolicy::Fail);
        let result: Result<(), CheckoutError> = lock.with_checkout(&path, |_| {
            Err(CheckoutError::IOError(std::io::Error::new(
                ErrorKind::Other,
                "boom",
            )))
        });
        assert!(result.is_err());
        assert!(path.exists());
    }

    #[test]
    fn test_force_refresh_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_params_dump.json");
        std::fs::write(&path, b"{\"1\": {}}").unwrap();
        let lock = CheckoutLock::new(
            CheckoutMode::Read,
            2,
            Duration::from_millis(1),
            ConflictPolicy::Fail,
        );
        lock.force_refresh(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"1\": {}}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let token = lock.acquire(&path).unwrap();
        assert!(matches!(
            lock.force_refresh(&path),
            Err(CheckoutError::Timeout { .. })
        ));
        lock.release(token).unwrap();
        assert!(path.exists());
    }
}
