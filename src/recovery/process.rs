//! One run of the external recovery tool.
//!
//! Each child gets a waiter thread as soon as it is spawned. The waiter owns
//! the `Child`, blocks in `wait()` and posts the exit status to the process's
//! event channel. Deadline timers post to the same channel, so a targeted run
//! is a race between two tagged events with no polling involved.

use super::RecoveryOutcome;
use crate::config::RecoveryConfig;
use crate::core::error::{RescueError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, unbounded};
use rustix::io::Errno;
use rustix::process::{Pid, Signal, kill_process};
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// Which part of the device the tool is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Whole device, retried forever.
    Background,
    /// Exactly `[pos, pos + size)`.
    Targeted { pos: u64, size: u64 },
}

impl RecoveryMode {
    fn args(&self) -> Vec<String> {
        let mut args = vec!["-r".to_string(), "-1".to_string()];
        if let Self::Targeted { pos, size } = *self {
            args.extend([
                "--input-position".to_string(),
                pos.to_string(),
                "--size".to_string(),
                size.to_string(),
            ]);
        }
        args
    }
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Background => write!(f, "background"),
            Self::Targeted { pos, size } => write!(
                f,
                "targeted 0x{:x}-0x{:x}",
                pos,
                pos.saturating_add(size).saturating_sub(1)
            ),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ProcessEvent {
    Exited(io::Result<ExitStatus>),
    TimedOut,
}

impl ProcessEvent {
    /// Lower sorts first: an exit always beats a deadline.
    fn priority(&self) -> u8 {
        match self {
            Self::Exited(_) => 0,
            Self::TimedOut => 1,
        }
    }
}

/// Blocks for the next event. Among the events already queued at that point,
/// an exit is preferred over a timeout, so a run that finishes right at its
/// deadline is reported as completed.
pub(crate) fn next_event(events: &Receiver<ProcessEvent>) -> Option<ProcessEvent> {
    let first = events.recv().ok()?;
    std::iter::once(first)
        .chain(events.try_iter())
        .min_by_key(ProcessEvent::priority)
}

/// Exit by status zero or by our own interrupt.
pub fn is_clean_exit(status: ExitStatus) -> bool {
    status.success() || status.signal() == Some(Signal::INT.as_raw())
}

/// Posts `TimedOut` after a delay unless dropped first.
struct Deadline {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Deadline {
    fn arm(timeout: Duration, events: Sender<ProcessEvent>) -> Result<Self> {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("recovery-deadline".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                    let _ = events.send(ProcessEvent::TimedOut);
                }
            })?;

        Ok(Self {
            cancel: Some(cancel_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// An owned, running recovery child.
///
/// Dropping a process that has not been observed to exit interrupts it and
/// waits, so no child outlives its handle.
pub struct RecoveryProcess {
    mode: RecoveryMode,
    pid: Pid,
    events_tx: Sender<ProcessEvent>,
    events_rx: Receiver<ProcessEvent>,
    waiter: Option<JoinHandle<()>>,
    exit: Option<ExitStatus>,
}

impl RecoveryProcess {
    pub fn spawn(config: &RecoveryConfig, mode: RecoveryMode) -> Result<Self> {
        let launch_err = |source| RescueError::ProcessLaunch {
            program: config.program_name(),
            source,
        };

        let mut child = Command::new(&config.program)
            .arg(&config.source)
            .arg(&config.image)
            .arg(&config.map)
            .args(&config.extra_args)
            .args(mode.args())
            .stdin(Stdio::null())
            .spawn()
            .map_err(launch_err)?;
        let pid = Pid::from_child(&child);

        let (events_tx, events_rx) = unbounded();
        let exit_tx = events_tx.clone();
        let waiter = thread::Builder::new()
            .name("recovery-waiter".to_string())
            .spawn(move || {
                let status = child.wait();
                let _ = exit_tx.send(ProcessEvent::Exited(status));
            })
            .map_err(launch_err)?;

        info!(pid = pid.as_raw_nonzero().get(), "Started {} ({})", config.program_name(), mode);

        Ok(Self {
            mode,
            pid,
            events_tx,
            events_rx,
            waiter: Some(waiter),
            exit: None,
        })
    }

    pub fn mode(&self) -> RecoveryMode {
        self.mode
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw_nonzero().get().unsigned_abs()
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Asks the tool to stop gracefully.
    pub fn interrupt(&self) -> Result<()> {
        match kill_process(self.pid, Signal::INT) {
            Ok(()) | Err(Errno::SRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }

    /// Blocks until the process exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        if self.reaped() {
            return Err(io::Error::other("recovery process status was lost").into());
        }
        loop {
            match next_event(&self.events_rx) {
                Some(ProcessEvent::Exited(status)) => return self.reap(status),
                Some(ProcessEvent::TimedOut) => continue,
                None => return Err(io::Error::other("recovery waiter vanished").into()),
            }
        }
    }

    /// Waits for the process to exit on its own, giving up after `timeout`.
    ///
    /// Without a timeout this blocks until exit. An unclean exit is an error;
    /// a timed-out process is left running for the caller to stop.
    pub fn wait_for(&mut self, timeout: Option<Duration>) -> Result<RecoveryOutcome> {
        let Some(timeout) = timeout else {
            let status = self.wait()?;
            self.check(status)?;
            return Ok(RecoveryOutcome::Completed);
        };

        let deadline = Deadline::arm(timeout, self.events_tx.clone())?;
        let event = next_event(&self.events_rx);
        drop(deadline);

        match event {
            Some(ProcessEvent::Exited(status)) => {
                let status = self.reap(status)?;
                self.check(status)?;
                Ok(RecoveryOutcome::Completed)
            }
            Some(ProcessEvent::TimedOut) => Ok(RecoveryOutcome::TimedOut),
            None => Err(io::Error::other("recovery waiter vanished").into()),
        }
    }

    /// Interrupts the process unless it already exited, waits for it and
    /// validates how it ended.
    pub fn stop(&mut self) -> Result<()> {
        if !self.reaped() && !self.poll_exit()? {
            info!("Interrupting {} recovery", self.mode);
            self.interrupt()?;
        }
        let status = self.wait()?;
        self.check(status)
    }

    fn poll_exit(&mut self) -> Result<bool> {
        loop {
            match self.events_rx.try_recv() {
                Ok(ProcessEvent::Exited(status)) => {
                    self.reap(status)?;
                    return Ok(true);
                }
                Ok(ProcessEvent::TimedOut) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(false),
            }
        }
    }

    /// Whether the waiter has delivered its one event, status or error.
    fn reaped(&self) -> bool {
        self.waiter.is_none()
    }

    fn reap(&mut self, status: io::Result<ExitStatus>) -> Result<ExitStatus> {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.join();
        }
        let status = status?;
        self.exit = Some(status);
        info!("Recovery process ({}) exited: {}", self.mode, status);
        Ok(status)
    }

    fn check(&self, status: ExitStatus) -> Result<()> {
        if is_clean_exit(status) {
            Ok(())
        } else {
            Err(RescueError::unexpected_exit(self.mode, status))
        }
    }
}

impl Drop for RecoveryProcess {
    fn drop(&mut self) {
        if self.reaped() {
            return;
        }
        warn!("Recovery process ({}) still running, interrupting", self.mode);
        if let Err(e) = self.interrupt() {
            warn!("Failed to interrupt recovery process: {}", e);
            return;
        }
        let _ = self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_mode_arguments() {
        assert_eq!(RecoveryMode::Background.args(), vec!["-r", "-1"]);
        assert_eq!(
            RecoveryMode::Targeted {
                pos: 4096,
                size: 1024
            }
            .args(),
            vec!["-r", "-1", "--input-position", "4096", "--size", "1024"]
        );
    }

    #[test]
    fn test_mode_display() {
        let mode = RecoveryMode::Targeted {
            pos: 0x200,
            size: 0x200,
        };
        assert_eq!(mode.to_string(), "targeted 0x200-0x3ff");
        assert_eq!(RecoveryMode::Background.to_string(), "background");
    }

    #[test]
    fn test_exit_beats_timeout_when_both_queued() {
        let (tx, rx) = unbounded();
        tx.send(ProcessEvent::TimedOut).unwrap();
        tx.send(ProcessEvent::Exited(Ok(ExitStatus::from_raw(0))))
            .unwrap();

        let event = next_event(&rx).unwrap();
        assert!(matches!(event, ProcessEvent::Exited(Ok(_))));
    }

    #[test]
    fn test_timeout_alone_is_consumed() {
        let (tx, rx) = unbounded();
        tx.send(ProcessEvent::TimedOut).unwrap();

        assert!(matches!(next_event(&rx), Some(ProcessEvent::TimedOut)));
    }

    #[test]
    fn test_clean_exit_statuses() {
        // Raw wait statuses: exit code in the high byte, signal in the low bits.
        assert!(is_clean_exit(ExitStatus::from_raw(0)));
        assert!(is_clean_exit(ExitStatus::from_raw(libc::SIGINT)));
        assert!(!is_clean_exit(ExitStatus::from_raw(1 << 8)));
        assert!(!is_clean_exit(ExitStatus::from_raw(libc::SIGKILL)));
        assert!(!is_clean_exit(ExitStatus::from_raw(libc::SIGSEGV)));
    }

    #[test]
    fn test_failed_wait_leaves_process_reaped() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        script.write_all(b"sleep 1\n").unwrap();
        let config =
            RecoveryConfig::new(script.path(), "image", "map").with_program("/bin/sh");

        let mut process = RecoveryProcess::spawn(&config, RecoveryMode::Background).unwrap();
        process
            .events_tx
            .send(ProcessEvent::Exited(Err(io::Error::other("wait failed"))))
            .unwrap();

        assert!(matches!(process.wait(), Err(RescueError::Io(_))));
        assert_eq!(process.exit_status(), None);
        // Neither a second wait nor the drop blocks on the gone waiter.
        assert!(process.wait().is_err());
        assert!(process.stop().is_err());
        drop(process);
    }

    #[test]
    fn test_deadline_fires() {
        let (tx, rx) = unbounded();
        let _deadline = Deadline::arm(Duration::from_millis(10), tx).unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)),
            Ok(ProcessEvent::TimedOut)
        ));
    }

    #[test]
    fn test_deadline_cancelled_on_drop() {
        let (tx, rx) = unbounded();
        let deadline = Deadline::arm(Duration::from_secs(60), tx).unwrap();
        drop(deadline);
        assert!(rx.try_recv().is_err());
    }
}
