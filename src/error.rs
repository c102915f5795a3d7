#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown config key '{0}'")]
    UnknownConfigKey(String),

    #[error("invalid task id '{0}': must match [a-z0-9-] and be at most 64 characters")]
    InvalidTaskId(String),

    #[error("Duplicate task ID '{id}' found in {first} and {second}. Remove one.")]
    DuplicateTaskId {
        id: String,
        first: String,
        second: String,
    },

    #[error("another claude-autopilot instance is already running (held by PID {0})")]
    Locked(u32),

    #[error(
        "init file creation failed: filesystem does not support hardlinks at {}. \
         Move the state directory to a local filesystem (ext4, APFS, NTFS)",
        path.display()
    )]
    HardlinksUnsupported { path: PathBuf },

    #[error("invalid transition from {from} to {to} for task '{id}'")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}
