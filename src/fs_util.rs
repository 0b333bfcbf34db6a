use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;

use crate::error::DispatchError;

/// Directory holding `path`; `.` for bare file names.
pub fn parent_dir(path: &Utf8Path) -> Utf8PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    }
}

/// Replaces `path` with `content` so readers see either the old or the new
/// file. The temp file lives next to the target so the rename never
/// crosses filesystems.
pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), DispatchError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir.as_std_path())
        .map_err(|err| DispatchError::Filesystem(format!("create {dir}: {err}")))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".oryza-state")
        .tempfile_in(dir.as_std_path())
        .map_err(|err| DispatchError::Filesystem(err.to_string()))?;
    write_synced(&mut temp, content)?;
    temp.persist(path.as_std_path())
        .map_err(|err| DispatchError::Filesystem(format!("replace {path}: {}", err.error)))?;
    sync_dir(&dir)
}

fn write_synced(temp: &mut NamedTempFile, content: &[u8]) -> Result<(), DispatchError> {
    temp.write_all(content)
        .map_err(|err| DispatchError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| DispatchError::Filesystem(err.to_string()))
}

#[cfg(unix)]
fn sync_dir(dir: &Utf8Path) -> Result<(), DispatchError> {
    fs::File::open(dir.as_std_path())
        .and_then(|handle| handle.sync_all())
        .map_err(|err| DispatchError::Filesystem(format!("sync {dir}: {err}")))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Utf8Path) -> Result<(), DispatchError> {
    Ok(())
}
