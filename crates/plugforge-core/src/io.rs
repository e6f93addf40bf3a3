use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Prevents partial writes from corrupting registry files.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = stage(path, data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Atomically replace several files as one unit.
///
/// Every payload is first written and synced to a tempfile next to its
/// target. Only once all of them are staged are they renamed into place, so
/// a failure while staging leaves every target untouched.
pub fn atomic_write_all(files: &[(&Path, &[u8])]) -> Result<()> {
    let mut staged = Vec::with_capacity(files.len());
    for (path, data) in files {
        staged.push((*path, stage(path, data)?));
    }
    for (path, tmp) in staged {
        tmp.persist(path).map_err(|e| e.error)?;
    }
    Ok(())
}

fn stage(path: &Path, data: &[u8]) -> Result<NamedTempFile> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Append text to a file. The file must already exist.
pub fn append_text(path: &Path, text: &str) -> Result<()> {
    let mut f = std::fs::OpenOptions::new().append(true).open(path)?;
    f.write_all(text.as_bytes())?;
    Ok(())
}

/// Remove a file or directory tree; a missing path is not an error.
/// Returns true when something was removed.
pub fn remove_path(path: &Path) -> Result<bool> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(true)
}
