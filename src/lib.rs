//! Expose a partially-rescued disk image as a read-only file, recovering
//! ranges with an external block-recovery tool when they are first read.

pub mod config;
pub mod core;
pub mod fs;
pub mod image_file;
pub mod logging;
pub mod progress_map;
pub mod recovery;

pub use crate::config::{MountConfig, RecoveryConfig, TimeoutPolicy};
pub use crate::core::{DeviceGeometry, RescueError, Result};
pub use crate::image_file::{FileAttributes, RecoveringFile};
pub use crate::progress_map::{Extent, ExtentStatus, ProgressMap};
pub use crate::recovery::{RangeRecovery, RecoveryMode, RecoveryOutcome, RecoverySupervisor};
