//! Control of the external block-recovery tool.

pub mod process;
pub mod supervisor;

pub use process::{RecoveryMode, RecoveryProcess, is_clean_exit};
pub use supervisor::RecoverySupervisor;

use crate::core::error::Result;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The targeted run exited cleanly before its deadline.
    Completed,
    /// The deadline passed first and the run was interrupted.
    TimedOut,
}

/// Something that can be asked to rescue a byte range.
pub trait RangeRecovery: Send + Sync {
    fn recover_range(
        &self,
        pos: u64,
        size: u64,
        timeout: Option<Duration>,
    ) -> Result<RecoveryOutcome>;
}
