//! Exposes the selected media file to the transcoder's working directory.
//!
//! The working directory must hold exactly one recognized media entry: a
//! symbolic link to the selected file (or the file itself when it already
//! lives there). Everything else with a media extension is removed.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{Error, Result};

/// Whether `path` carries one of `extensions` (lower-case, no dot).
pub fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| ext.to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|allowed| *allowed == ext))
}

async fn create_link(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        tokio::fs::symlink(target, link).await
    }
    #[cfg(windows)]
    {
        tokio::fs::symlink_file(target, link).await
    }
}

/// Whether two paths name the same file once symlinks are resolved.
async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Make `selected` the only media visible in `working_dir`.
///
/// Idempotent: a second call with the same arguments changes nothing.
/// Returns the path the transcoder should read.
pub async fn ensure_linked(
    selected: &Path,
    working_dir: &Path,
    extensions: &[String],
) -> Result<PathBuf> {
    let file_name = selected.file_name().ok_or_else(|| {
        Error::handoff(
            selected,
            io::Error::new(io::ErrorKind::InvalidInput, "media path has no file name"),
        )
    })?;

    tokio::fs::create_dir_all(working_dir)
        .await
        .map_err(|e| Error::handoff(working_dir, e))?;

    remove_stale_entries(working_dir, file_name, extensions).await?;

    let link = working_dir.join(file_name);
    match tokio::fs::symlink_metadata(&link).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            let current = tokio::fs::read_link(&link)
                .await
                .map_err(|e| Error::handoff(&link, e))?;
            if current == selected {
                debug!(link = %link.display(), "Handoff link already points at the selected media");
                return Ok(link);
            }
            tokio::fs::remove_file(&link)
                .await
                .map_err(|e| Error::handoff(&link, e))?;
        }
        Ok(meta) if meta.is_file() => {
            if same_file(&link, selected).await {
                debug!(path = %link.display(), "Selected media already lives in the working directory");
                return Ok(link);
            }
            tokio::fs::remove_file(&link)
                .await
                .map_err(|e| Error::handoff(&link, e))?;
        }
        Ok(_) => {
            return Err(Error::handoff(
                &link,
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "a directory occupies the handoff location",
                ),
            ));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::handoff(&link, e)),
    }

    create_link(selected, &link)
        .await
        .map_err(|e| Error::handoff(&link, e))?;
    info!(target = %selected.display(), link = %link.display(), "Created handoff link");
    Ok(link)
}

/// Remove every recognized media entry except `keep`.
async fn remove_stale_entries(
    working_dir: &Path,
    keep: &OsStr,
    extensions: &[String],
) -> Result<()> {
    let mut entries = tokio::fs::read_dir(working_dir)
        .await
        .map_err(|e| Error::handoff(working_dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::handoff(working_dir, e))?
    {
        let path = entry.path();
        if entry.file_name().as_os_str() == keep || !has_allowed_extension(&path, extensions) {
            continue;
        }

        let file_type = entry
            .file_type()
            .await
            .map_err(|e| Error::handoff(&path, e))?;
        if file_type.is_dir() {
            continue;
        }

        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Error::handoff(&path, e))?;
        if file_type.is_symlink() {
            info!(path = %path.display(), "Removed stale handoff link");
        } else {
            info!(path = %path.display(), "Removed stale media file from working directory");
        }
    }

    Ok(())
}
