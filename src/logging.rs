//! Subscriber setup.
//!
//! The recovery tool redraws a status block of a few lines at the bottom of
//! the terminal. With tool-output separation on, every log line is printed
//! above that block instead of through it.

use std::io::{self, Write};
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;

/// Height of the tool's status block.
pub const TOOL_STATUS_LINES: usize = 5;

const CURSOR_UP: &[u8] = b"\x1b[A";
const CLEAR_TO_EOL: &[u8] = b"\x1b[K";

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub debug: bool,
    pub debug_fuse: bool,
    pub separate_tool_output: bool,
}

pub fn init(options: &LogOptions) -> Result<(), TryInitError> {
    let level = if options.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let fuse_level = if options.debug_fuse {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let filter = Targets::new()
        .with_default(level)
        .with_target("fuser", fuse_level);

    let status_lines = if options.separate_tool_output {
        TOOL_STATUS_LINES
    } else {
        0
    };
    let writer = StatusAwareStderr::new(status_lines);
    writer.reserve();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .with(filter)
        .try_init()?;

    tracing::debug!("Debug logging enabled");
    Ok(())
}

/// Stderr writer that keeps log lines clear of the tool's status block.
#[derive(Debug, Clone, Copy)]
pub struct StatusAwareStderr {
    status_lines: usize,
}

impl StatusAwareStderr {
    pub fn new(status_lines: usize) -> Self {
        Self { status_lines }
    }

    /// Leaves room for the status block below the cursor.
    fn reserve(&self) {
        if self.status_lines == 0 {
            return;
        }
        let mut err = io::stderr().lock();
        let _ = err.write_all(&b"\n".repeat(self.status_lines));
        let _ = err.flush();
    }
}

impl<'a> MakeWriter<'a> for StatusAwareStderr {
    type Writer = StatusLineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        StatusLineWriter {
            status_lines: self.status_lines,
            buf: Vec::new(),
        }
    }
}

/// Collects one formatted event and emits it on drop.
pub struct StatusLineWriter {
    status_lines: usize,
    buf: Vec<u8>,
}

impl Write for StatusLineWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for StatusLineWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let framed = frame(&self.buf, self.status_lines);
        let _ = io::stderr().lock().write_all(&framed);
    }
}

/// Moves up over the status block, prints the line, clears what the tool
/// left behind it and moves back down one line further than before.
fn frame(line: &[u8], status_lines: usize) -> Vec<u8> {
    if status_lines == 0 {
        return line.to_vec();
    }
    let line = line.strip_suffix(b"\n").unwrap_or(line);

    let mut out = Vec::with_capacity(line.len() + 4 * status_lines + 8);
    out.push(b'\r');
    for _ in 0..status_lines {
        out.extend_from_slice(CURSOR_UP);
    }
    out.extend_from_slice(line);
    out.extend_from_slice(CLEAR_TO_EOL);
    out.extend(std::iter::repeat_n(b'\n', status_lines + 1));
    out
}
