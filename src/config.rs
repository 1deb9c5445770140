//! Runtime configuration shared by the supervisor, the image file and the mount.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PROGRAM: &str = "ddrescue";
pub const DEFAULT_FILE_NAME: &str = "image";
pub const DEFAULT_FS_NAME: &str = "ddrescuefs";

/// Granularity of the per-range recovery budget.
pub const SECTOR_SIZE: u64 = 512;

/// Extra time granted to the tool for reading and rewriting its map.
pub const DEFAULT_ALLOWANCE: Duration = Duration::from_secs(1);

/// How the external recovery tool is invoked.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub program: OsString,
    pub source: PathBuf,
    pub image: PathBuf,
    pub map: PathBuf,
    /// Forwarded verbatim after the three positional paths.
    pub extra_args: Vec<String>,
}

impl RecoveryConfig {
    pub fn new(
        source: impl Into<PathBuf>,
        image: impl Into<PathBuf>,
        map: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: DEFAULT_PROGRAM.into(),
            source: source.into(),
            image: image.into(),
            map: map.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// Time budget for a targeted recovery, proportional to the range length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub per_sector: Duration,
    pub allowance: Duration,
}

impl TimeoutPolicy {
    pub fn per_sector(per_sector: Duration) -> Self {
        Self {
            per_sector,
            allowance: DEFAULT_ALLOWANCE,
        }
    }

    pub fn with_allowance(mut self, allowance: Duration) -> Self {
        self.allowance = allowance;
        self
    }

    pub fn for_size(&self, size: u64) -> Duration {
        let sectors = size.div_ceil(SECTOR_SIZE);
        let sectors = u32::try_from(sectors).unwrap_or(u32::MAX);
        self.per_sector
            .saturating_mul(sectors)
            .saturating_add(self.allowance)
    }
}

#[derive(Debug, Clone)]
pub struct MountConfig {
    pub mountpoint: PathBuf,
    pub file_name: String,
    pub fs_name: String,
    pub debug_fuse: bool,
}

impl MountConfig {
    pub fn new(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            file_name: DEFAULT_FILE_NAME.to_string(),
            fs_name: DEFAULT_FS_NAME.to_string(),
            debug_fuse: false,
        }
    }
}
