use std::path::Path;

use super::error::ScannerError;
use super::filename::FrameFile;

fn has_extension(name: &str, extension: &str) -> bool {
    match Path::new(name).extension() {
        Some(ext) => ext == extension.trim_start_matches('.'),
        None => false,
    }
}

/// List the files in `folder` with the given extension whose names contain at least one of
/// `name_filters` (an empty filter set accepts everything).
///
/// Only the directory listing is read; files are never opened, so a camera still writing a
/// frame is not disturbed. Staged (`.partial`) and checked-out files are skipped because their
/// extension does not match. Returned names are sorted.
pub fn list_candidates<S: AsRef<str>>(
    folder: &Path,
    extension: &str,
    name_filters: &[S],
) -> Result<Vec<String>, ScannerError> {
    if !folder.is_dir() {
        return Err(ScannerError::BadDirectory(folder.to_path_buf()));
    }
    let mut names: Vec<String> = Vec::new();
    for item in folder.read_dir()? {
        let item = item?;
        if !item.file_type()?.is_file() {
            continue;
        }
        let name = match item.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if !has_extension(&name, extension) {
            continue;
        }
        if name_filters.is_empty() || name_filters.iter().any(|f| name.contains(f.as_ref())) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Same as `list_candidates`, but attach each file's modification time.
///
/// Files which vanish between the listing and the metadata read (consumed by someone else)
/// are dropped from the result.
pub fn list_frame_files<S: AsRef<str>>(
    folder: &Path,
    extension: &str,
    name_filters: &[S],
) -> Result<Vec<FrameFile>, ScannerError> {
    let mut frames = Vec::new();
    for name in list_candidates(folder, extension, name_filters)? {
        let path = folder.join(&name);
        let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(ScannerError::IOError(e)),
        };
        frames.push(FrameFile {
            path,
            file_name: name,
            modified,
        });
    }
    Ok(frames)
}
