#![forbid(unsafe_code)]

//! Durable out-of-band control commands.
//!
//! Non-runner invocations append `retry`/`cancel` intents to
//! `control/commands.jsonl` while a runner holds the lock; the runner drains
//! and truncates the file on its next loop pass. Appends are serialized by an
//! exclusive file lock, so a reader only ever sees complete lines plus at
//! most one torn trailing line (which it skips as malformed).

use std::io::{BufRead as _, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlOp {
    Retry,
    Cancel,
}

impl std::fmt::Display for ControlOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => f.write_str("retry"),
            Self::Cancel => f.write_str("cancel"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlCommand {
    pub op: ControlOp,
    pub task_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

impl ControlCommand {
    #[must_use]
    pub fn new(op: ControlOp, task_id: &str) -> Self {
        Self {
            op,
            task_id: task_id.to_owned(),
            requested_at: OffsetDateTime::now_utc(),
        }
    }
}

fn commands_path(control_dir: &Path) -> PathBuf {
    control_dir.join("commands.jsonl")
}

/// Appends one command as a JSON line, holding an exclusive file lock for the
/// duration of the write so concurrent CLI invocations serialize cleanly.
pub fn append_command(control_dir: &Path, cmd: &ControlCommand) -> anyhow::Result<()> {
    std::fs::create_dir_all(control_dir)
        .with_context(|| format!("failed to create {}", control_dir.display()))?;

    let path = commands_path(control_dir);
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    file.lock_exclusive()
        .with_context(|| format!("failed to lock {}", path.display()))?;

    let result = (|| -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(cmd)?;
        line.push(b'\n');
        file.write_all(&line)
            .with_context(|| format!("failed to write {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync {}", path.display()))?;
        Ok(())
    })();

    let _ = fs2::FileExt::unlock(&file);
    result
}

/// Reads all queued commands. Malformed lines are logged and skipped.
pub fn read_commands(control_dir: &Path) -> anyhow::Result<Vec<ControlCommand>> {
    let path = commands_path(control_dir);
    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open {}", path.display()));
        }
    };

    let mut commands = Vec::new();
    for (line_num, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ControlCommand>(&line) {
            Ok(cmd) => commands.push(cmd),
            Err(e) => {
                tracing::warn!(
                    "skipping malformed control command at {}:{}: {e}",
                    path.display(),
                    line_num + 1
                );
            }
        }
    }

    Ok(commands)
}

/// Truncates the command log after a successful drain pass.
pub fn clear_commands(control_dir: &Path) -> anyhow::Result<()> {
    let path = commands_path(control_dir);
    let file = match std::fs::OpenOptions::new().write(true).truncate(true).open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to truncate {}", path.display()));
        }
    };
    file.sync_all()
        .with_context(|| format!("failed to fsync {}", path.display()))?;
    Ok(())
}
