use super::process::{RecoveryMode, RecoveryProcess};
use super::{RangeRecovery, RecoveryOutcome};
use crate::config::RecoveryConfig;
use crate::core::error::Result;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Owns the single recovery process.
///
/// A background run scans the whole device whenever nothing else is asked
/// for. A read that misses interrupts it, runs the tool over just the missing
/// range, and puts the background run back before returning. All of that
/// happens under one lock, so at most one child is alive at any time.
pub struct RecoverySupervisor {
    config: RecoveryConfig,
    current: Mutex<Option<RecoveryProcess>>,
}

impl RecoverySupervisor {
    /// Launches background recovery right away.
    pub fn start(config: RecoveryConfig) -> Result<Self> {
        let supervisor = Self {
            config,
            current: Mutex::new(None),
        };
        supervisor.ensure_background_running()?;
        Ok(supervisor)
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Spawns a background run if no process is held.
    pub fn ensure_background_running(&self) -> Result<()> {
        let mut current = self.current.lock();
        if current.is_none() {
            info!("Starting background recovery");
            *current = Some(RecoveryProcess::spawn(&self.config, RecoveryMode::Background)?);
        }
        Ok(())
    }

    /// Rescues `[pos, pos + size)` with a dedicated run of the tool.
    ///
    /// Stops the current process, runs the targeted one until it exits or
    /// `timeout` passes, then restarts background mode for either outcome.
    /// An unclean exit of any of the stopped processes is returned as an
    /// error and background mode is not restarted.
    pub fn recover_range(
        &self,
        pos: u64,
        size: u64,
        timeout: Option<Duration>,
    ) -> Result<RecoveryOutcome> {
        let mut current = self.current.lock();

        if let Some(mut process) = current.take() {
            process.stop()?;
        }

        info!(
            "Starting recovery of 0x{:x}-0x{:x} (timeout after {:?})",
            pos,
            pos.saturating_add(size).saturating_sub(1),
            timeout
        );
        let mut targeted = RecoveryProcess::spawn(&self.config, RecoveryMode::Targeted { pos, size })?;

        let outcome = targeted.wait_for(timeout)?;
        if outcome == RecoveryOutcome::TimedOut {
            info!("Recovery timed out");
            targeted.stop()?;
        }
        drop(targeted);

        info!("Starting background recovery");
        *current = Some(RecoveryProcess::spawn(&self.config, RecoveryMode::Background)?);

        Ok(outcome)
    }

    /// Interrupts and waits for whatever is running. Safe to call repeatedly.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(mut process) = self.current.lock().take() {
            process.stop()?;
        }
        Ok(())
    }

    pub fn current_mode(&self) -> Option<RecoveryMode> {
        self.current.lock().as_ref().map(RecoveryProcess::mode)
    }

    pub fn current_pid(&self) -> Option<u32> {
        self.current.lock().as_ref().map(RecoveryProcess::pid)
    }
}

impl RangeRecovery for RecoverySupervisor {
    fn recover_range(
        &self,
        pos: u64,
        size: u64,
        timeout: Option<Duration>,
    ) -> Result<RecoveryOutcome> {
        RecoverySupervisor::recover_range(self, pos, size, timeout)
    }
}

impl Drop for RecoverySupervisor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Recovery shutdown failed: {}", e);
        }
    }
}
