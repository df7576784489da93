//! Atomic filesystem primitives
//!
//! All persisted artifacts go through [`write_file_atomic`]:
//!
//! 1. create the parent directories,
//! 2. write every byte to `<path>.tmp`,
//! 3. fsync the file (when requested),
//! 4. rename over the destination,
//! 5. fsync the parent directory (when requested).
//!
//! At any instant either the old or the new file is visible, never a torn
//! one. Windows has no usable directory fsync; the rename is still atomic
//! and file-handle flushing is relied upon, matching the documented
//! durability gap on that platform.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use histree_core::{Error, Result};

/// Flush file contents and metadata to stable storage.
pub fn fsync_file(file: &File) -> Result<()> {
    file.sync_all()
        .map_err(|e| Error::io("fsync failed", &e))
}

/// Flush a directory so a completed rename survives power loss.
#[cfg(not(windows))]
pub fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)
        .map_err(|e| Error::io("open directory for fsync failed", &e))?;
    handle
        .sync_all()
        .map_err(|e| Error::io("directory fsync failed", &e))
}

/// Directory fsync is unavailable on Windows; the rename itself is atomic.
#[cfg(windows)]
pub fn fsync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Atomically replace `path` with `data`.
pub fn write_file_atomic(path: &Path, data: &[u8], fsync_data: bool) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io("failed to create directories", &e))?;
    }

    let tmp = tmp_path(path);
    let write_result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|e| Error::io("failed to open temp file", &e))?;
        file.write_all(data)
            .map_err(|e| Error::io("failed to write temp file", &e))?;
        if fsync_data {
            fsync_file(&file)?;
        }
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io("failed to rename temp file", &e));
    }

    if fsync_data {
        if let Some(parent) = parent {
            fsync_dir(parent)?;
        }
    }

    Ok(())
}

/// Read a whole file. A missing file is `NotFound`; everything else maps
/// to `Unknown` with context.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("file not found: {}", path.display())))
        }
        Err(e) => return Err(Error::io("failed to open file", &e)),
    };
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)
        .map_err(|e| Error::io("failed to read file", &e))?;
    Ok(buffer)
}

/// Read a whole file as UTF-8 text.
pub fn read_text_file(path: &Path) -> Result<String> {
    let bytes = read_file(path)?;
    String::from_utf8(bytes)
        .map_err(|_| Error::MalformedInput(format!("file is not UTF-8: {}", path.display())))
}

/// Remove a file, ignoring a missing target.
pub fn remove_path_if_exists(path: &Path) {
    let _ = fs::remove_file(path);
}

/// File size, or zero when the file is absent or unreadable.
pub fn file_size_or_zero(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c.bin");

        write_file_atomic(&target, b"payload", true).unwrap();

        assert_eq!(read_file(&target).unwrap(), b"payload");
        // No stray temp file left behind.
        assert!(!tmp_path(&target).exists());
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("value.bin");

        write_file_atomic(&target, b"old", false).unwrap();
        write_file_atomic(&target, b"new", false).unwrap();

        assert_eq!(read_file(&target).unwrap(), b"new");
    }

    #[test]
    fn test_read_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let result = read_file(&dir.path().join("absent"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_file_size_or_zero() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("sized");
        assert_eq!(file_size_or_zero(&target), 0);
        write_file_atomic(&target, &[0u8; 42], false).unwrap();
        assert_eq!(file_size_or_zero(&target), 42);
    }

    #[test]
    fn test_remove_path_if_exists_is_quiet() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("gone");
        remove_path_if_exists(&target);
        write_file_atomic(&target, b"x", false).unwrap();
        remove_path_if_exists(&target);
        assert!(!target.exists());
    }
}
