#![deny(unsafe_code)]

//! Crash-safe file writes and orphan temp cleanup.
//!
//! Two write disciplines are provided: [`atomic_write`] (temp + rename, for
//! mutable files) and [`atomic_create`] (temp + hardlink, for create-once
//! files). Both name their temp files `<base>.tmp.<pid>.<hex>` so the owning
//! process is discoverable from the name alone.

pub mod process;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use rand::Rng as _;

use crate::error::AutopilotError;

/// Temp file name for a target path: `<name>.tmp.<pid>.<random-hex>`.
#[must_use]
pub fn temp_file_name(path: &Path) -> PathBuf {
    let pid = std::process::id();
    let suffix: u32 = rand::thread_rng().r#gen();
    let name = path.file_name().map_or_else(
        || "file".to_owned(),
        |n| n.to_string_lossy().into_owned(),
    );
    path.with_file_name(format!("{name}.tmp.{pid}.{suffix:08x}"))
}

/// Writes `data` to `path` via temp + rename. No partial file is ever
/// observable at the target path.
pub fn atomic_write(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let tmp = temp_file_name(path);
    if let Err(e) = write_synced(&tmp, data) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e)
            .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()));
    }

    fsync_dir(&dir);
    Ok(())
}

/// Creates `path` exactly once via temp + hardlink. Returns `true` if this
/// call created the file, `false` if it already existed (another process won
/// the race). Filesystems without hardlink support fail loudly; the
/// create-once guarantee must not be silently degraded to rename.
pub fn atomic_create(path: &Path, data: &[u8]) -> anyhow::Result<bool> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let tmp = temp_file_name(path);
    if let Err(e) = write_synced(&tmp, data) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    let link_result = std::fs::hard_link(&tmp, path);
    let _ = std::fs::remove_file(&tmp);

    match link_result {
        Ok(()) => {
            fsync_dir(&dir);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) if link_unsupported(&e) => {
            Err(AutopilotError::HardlinksUnsupported { path: dir }.into())
        }
        Err(e) => Err(e)
            .with_context(|| format!("failed to link {} -> {}", tmp.display(), path.display())),
    }
}

fn write_synced(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    use std::io::Write as _;

    let mut f = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    f.write_all(data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    f.sync_all()
        .with_context(|| format!("failed to fsync {}", path.display()))?;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn link_unsupported(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::Unsupported {
        return true;
    }
    let s = e.to_string();
    s.contains("not supported") || s.contains("not permitted")
}

// Directory entry durability. Failures are ignored: the rename itself has
// already happened and some filesystems reject opening directories.
fn fsync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(d) = std::fs::File::open(dir) {
        let _ = d.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Sweeps orphaned temp files in the given directories.
///
/// Pass 1 deletes temps whose embedded owner PID is no longer alive. Pass 2
/// deletes temps older than 24 hours regardless, as a safety net against PID
/// reuse; atomic writes complete in milliseconds, so a day-old temp is never
/// legitimate. Returns the number of files removed.
pub fn clean_orphan_temps(dirs: &[PathBuf]) -> anyhow::Result<usize> {
    const MAX_TEMP_AGE: Duration = Duration::from_secs(24 * 60 * 60);

    let mut cleaned = 0usize;
    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        for entry in entries {
            let entry = entry?;
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.contains(".tmp.") {
                continue;
            }

            if let Some(pid) = extract_pid(&name)
                && !process::pid_alive(pid)
            {
                let _ = std::fs::remove_file(entry.path());
                cleaned += 1;
                continue;
            }

            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let age = meta.modified().ok().and_then(|m| m.elapsed().ok());
            if age.is_some_and(|a| a > MAX_TEMP_AGE) {
                let _ = std::fs::remove_file(entry.path());
                cleaned += 1;
            }
        }
    }

    Ok(cleaned)
}

/// Extracts the owner PID from a `<base>.tmp.<pid>.<random>` temp file name.
#[must_use]
pub fn extract_pid(name: &str) -> Option<u32> {
    let idx = name.find(".tmp.")?;
    let rest = &name[idx + 5..];
    let pid_part = rest.split('.').next()?;
    pid_part.parse().ok()
}
