use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::config::Config;
use super::error::RelocatorError;
use super::retry::Patience;

/// Extension appended to files while they are being written next to their final name.
/// Consumers filter on the exact extension, so a staged file is never mistaken for a result.
pub const PARTIAL_SUFFIX: &str = "partial";

/// The name a file is staged under before it is published at `destination`
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    destination.with_file_name(name)
}

/// Rename `from` to `to`, failing with `AlreadyExists` rather than replacing `to`.
///
/// A hard link is the only portable way to get a no-clobber rename. Some file systems (FAT,
/// several network shares) have no hard links, in which case we fall back to an existence
/// check, which leaves a small window for a concurrent writer.
pub(crate) fn rename_no_clobber(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::hard_link(from, to) {
        Ok(()) => std::fs::remove_file(from),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e),
        Err(_) => {
            if to.exists() {
                Err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("{} already exists", to.display()),
                ))
            } else {
                std::fs::rename(from, to)
            }
        }
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn copy_synced(source: &Path, staging: &Path) -> std::io::Result<u64> {
    let mut reader = File::open(source)?;
    let mut writer = File::create(staging)?;
    let bytes = std::io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    Ok(bytes)
}

fn write_synced(bytes: &[u8], staging: &Path) -> std::io::Result<()> {
    let mut writer = File::create(staging)?;
    writer.write_all(bytes)?;
    writer.sync_all()
}

/// Relocator moves files into their final location with a stage-then-rename protocol.
///
/// Data is first copied next to the destination (so it works across drives) under a
/// `.partial` name, synced, and only then renamed to the final name on the destination volume.
/// Anyone listing the destination sees nothing, the staged file, or the complete file; never a
/// truncated file at the final path.
#[derive(Debug, Clone, Copy)]
pub struct Relocator {
    patience: Patience,
}

impl Relocator {
    pub fn new(patience: Patience) -> Self {
        Self { patience }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.io_patience())
    }

    /// Move `source` to `destination`. Returns the number of bytes moved.
    pub fn relocate(&self, source: &Path, destination: &Path) -> Result<u64, RelocatorError> {
        if !source.exists() {
            return Err(RelocatorError::MissingSource(source.to_path_buf()));
        }
        if destination.exists() {
            return Err(RelocatorError::DestinationExists(destination.to_path_buf()));
        }
        let staging = staging_path(destination);
        let bytes = self
            .patience
            .retry("Staging copy", || copy_synced(source, &staging))?;
        self.publish(&staging, destination)?;
        self.patience
            .retry("Removing relocated source", || remove_if_present(source))?;
        spdlog::info!(
            "Relocated {} to {} ({})",
            source.display(),
            destination.display(),
            human_bytes::human_bytes(bytes as f64)
        );
        Ok(bytes)
    }

    /// Write `bytes` to a new file at `destination` with the same staging protocol
    pub fn stage_bytes(&self, bytes: &[u8], destination: &Path) -> Result<(), RelocatorError> {
        if destination.exists() {
            return Err(RelocatorError::DestinationExists(destination.to_path_buf()));
        }
        let staging = staging_path(destination);
        self.patience
            .retry("Staging write", || write_synced(bytes, &staging))?;
        self.publish(&staging, destination)
    }

    /// Like `stage_bytes`, but an existing file at `destination` is replaced atomically
    pub fn replace_bytes(&self, bytes: &[u8], destination: &Path) -> Result<(), RelocatorError> {
        let staging = staging_path(destination);
        self.patience
            .retry("Staging write", || write_synced(bytes, &staging))?;
        self.patience.retry("Replacing file", || {
            std::fs::rename(&staging, destination)
        })?;
        Ok(())
    }

    fn publish(&self, staging: &Path, destination: &Path) -> Result<(), RelocatorError> {
        let result = match rename_no_clobber(staging, destination) {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(RelocatorError::DestinationExists(destination.to_path_buf()))
            }
            Err(_) => self
                .patience
                .retry("Publishing staged file", || {
                    rename_no_clobber(staging, destination)
                })
                .map_err(RelocatorError::from),
            Ok(()) => Ok(()),
        };
        if result.is_err() {
            let _ = remove_if_present(staging);
        }
        result
    }
}

impl Default for Relocator {
    fn default() -> Self {
        Self::new(Patience::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_staging_path() {
        let staged = staging_path(Path::new("/archive/42_2024-01-01--00-00-00_TopA.fits"));
        assert_eq!(
            staged,
            PathBuf::from("/archive/42_2024-01-01--00-00-00_TopA.fits.partial")
        );
    }

    #[test]
    fn test_relocate() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.fits");
        let destination = dir.path().join("sub").join("b.fits");
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(&source, b"hello").unwrap();

        let bytes = Relocator::default().relocate(&source, &destination).unwrap();
        assert_eq!(bytes, 5);
        assert!(!source.exists());
        assert!(!staging_path(&destination).exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello");
    }

    #[test]
    fn test_relocate_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.fits");
        let destination = dir.path().join("b.fits");
        std::fs::write(&source, b"new").unwrap();
        std::fs::write(&destination, b"old").unwrap();

        match Relocator::default().relocate(&source, &destination) {
            Err(RelocatorError::DestinationExists(p)) => assert_eq!(p, destination),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(source.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"old");
    }

    #[test]
    fn test_relocate_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            Relocator::default().relocate(&dir.path().join("nope"), &dir.path().join("b"));
        assert!(matches!(result, Err(RelocatorError::MissingSource(_))));
    }

    #[test]
    fn test_stage_and_replace_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("params.json");
        let relocator = Relocator::default();
        relocator.stage_bytes(b"{}", &destination).unwrap();
        assert!(relocator.stage_bytes(b"{}", &destination).is_err());
        relocator.replace_bytes(b"{\"a\":1}", &destination).unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn test_reader_never_sees_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..4_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected_len = payload.len() as u64;
        let done = Arc::new(AtomicBool::new(false));

        let mut destinations = Vec::new();
        for idx in 0..5 {
            let source = dir.path().join(format!("src_{idx}.fits"));
            std::fs::write(&source, &payload).unwrap();
            destinations.push((source, dir.path().join(format!("dst_{idx}.fits"))));
        }

        let reader_done = done.clone();
        let watched: Vec<PathBuf> = destinations.iter().map(|(_, d)| d.clone()).collect();
        let reader = std::thread::spawn(move || {
            let mut observations = 0;
            while !reader_done.load(Ordering::SeqCst) {
                for path in watched.iter() {
                    if let Ok(meta) = std::fs::metadata(path) {
                        assert_eq!(meta.len(), expected_len);
                        observations += 1;
                    }
                }
                std::thread::sleep(Duration::from_micros(50));
            }
            observations
        });

        let relocator = Relocator::default();
        for (source, destination) in destinations.iter() {
            relocator.relocate(source, destination).unwrap();
        }
        done.store(true, Ordering::SeqCst);
        reader.join().unwrap();
        for (_, destination) in destinations.iter() {
            assert_eq!(std::fs::read(destination).unwrap(), payload);
        }
    }
}
