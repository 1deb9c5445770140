use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Errors raised while serving the recovering image.
///
/// Only [`RescueError::DataUnavailable`] is expected during normal operation;
/// every other variant means the tool, the map or the image can no longer be
/// trusted and the mount should be torn down.
#[derive(Error, Debug)]
pub enum RescueError {
    #[error("Malformed map file at line {line}: {reason}")]
    MapFormat { line: usize, reason: String },

    #[error("Failed to start {program}: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Recovery process ({mode}) exited unexpectedly: {status}")]
    RecoveryProcess { mode: String, status: String },

    #[error("Range 0x{offset:x}+0x{size:x} could not be recovered")]
    DataUnavailable { offset: u64, size: u64 },

    #[error("Image file inconsistent at offset {offset}: {reason}")]
    BackingStore { offset: u64, reason: String },

    #[error("Cannot probe device {path:?}: {source}")]
    Device {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RescueError {
    pub(crate) fn map_format(line: usize, reason: impl Into<String>) -> Self {
        Self::MapFormat {
            line,
            reason: reason.into(),
        }
    }

    pub(crate) fn unexpected_exit(mode: impl ToString, status: ExitStatus) -> Self {
        Self::RecoveryProcess {
            mode: mode.to_string(),
            status: status.to_string(),
        }
    }

    /// Whether the error invalidates the whole mount.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::DataUnavailable { .. })
    }

    /// Errno handed back to the filesystem caller.
    pub fn errno(&self) -> libc::c_int {
        libc::EIO
    }
}

pub type Result<T> = std::result::Result<T, RescueError>;
