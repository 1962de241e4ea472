//! Private directories and crash-safe file replacement

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::Result;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create `dir` (and parents) and restrict it to the owner.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or its permissions
/// cannot be changed.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(dir)?;
        if metadata.permissions().mode() & 0o777 != 0o700 {
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    Ok(())
}

/// Temp path next to `target` so the final rename stays on one filesystem.
fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!(".{name}.tmp.{}.{seq}", std::process::id()))
}

/// Replace `target` with `contents` atomically.
///
/// The data is written to a sibling temp file created with mode 0600,
/// flushed to disk and renamed into place. Readers observe either the old
/// file or the complete new one, never a partial write.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed; the temp
/// file is removed on failure and `target` is left untouched.
pub fn write_private_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    let tmp = temp_path_for(target);

    let result = (|| -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, target)
    })();

    if let Err(e) = result {
        if let Err(cleanup) = std::fs::remove_file(&tmp)
            && cleanup.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp file");
        }
        return Err(e.into());
    }

    Ok(())
}

/// Remove a file, treating "already gone" as success.
///
/// # Errors
///
/// Returns an error for any failure other than `NotFound`.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether a directory entry is one of our in-flight temp files.
#[must_use]
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp.")
}
