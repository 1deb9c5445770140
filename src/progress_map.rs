//! Incremental reader for the recovery tool's map file.
//!
//! The map is a text file with one header line followed by one line per
//! extent:
//!
//! ```text
//! # Mapfile. Created by GNU ddrescue version 1.27
//! # current_pos  current_status  current_pass
//! 0x00120000     ?               1
//! #      pos        size  status
//! 0x00000000  0x00100000  +
//! 0x00100000  0x00020000  -
//! ```
//!
//! Extents are trusted to be non-overlapping, sorted and gapless over the
//! whole device. A gap inside a requested range is reported as a format
//! error rather than skipped, so a hole in the map can never be served as
//! rescued data.

use crate::core::error::{RescueError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtentStatus {
    Finished,
    NonTried,
    NonTrimmed,
    NonSplit,
    BadSector,
}

impl ExtentStatus {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Finished),
            '?' => Some(Self::NonTried),
            '*' => Some(Self::NonTrimmed),
            '/' => Some(Self::NonSplit),
            '-' => Some(Self::BadSector),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Finished => '+',
            Self::NonTried => '?',
            Self::NonTrimmed => '*',
            Self::NonSplit => '/',
            Self::BadSector => '-',
        }
    }

    #[inline]
    pub fn is_finished(self) -> bool {
        self == Self::Finished
    }
}

/// One data line of the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
    pub status: ExtentStatus,
}

impl Extent {
    #[inline]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }
}

/// Totals over the whole map, used for startup reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapSummary {
    pub extents: usize,
    pub total_bytes: u64,
    pub finished_bytes: u64,
}

/// Answers whether byte ranges of the image have been rescued.
///
/// Every finished extent met while scanning is remembered in a cache that
/// only grows: the tool never downgrades a finished extent, so once a region
/// is known good the map prefix in front of it is not scanned again.
pub struct ProgressMap {
    path: PathBuf,
    completed: Mutex<BTreeMap<u64, u64>>,
    scans: AtomicU64,
}

impl ProgressMap {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            completed: Mutex::new(BTreeMap::new()),
            scans: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` when every byte of `[pos, pos + size)` is finished.
    ///
    /// A single unfinished extent anywhere in the range makes the whole range
    /// incomplete. Empty ranges are always complete.
    pub fn is_complete(&self, pos: u64, size: u64) -> Result<bool> {
        if size == 0 {
            return Ok(true);
        }
        let end = pos.saturating_add(size);

        debug!(
            "Looking for 0x{:x}-0x{:x} ({} bytes)",
            pos,
            end - 1,
            size
        );

        if self.cached_covers(pos, end) {
            return Ok(true);
        }

        self.scan(pos, end)
    }

    /// Number of full map scans performed so far.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Number of finished extents remembered so far.
    pub fn cached_extents(&self) -> usize {
        self.completed.lock().len()
    }

    /// Reads the whole map once and totals it.
    pub fn summary(&self) -> Result<MapSummary> {
        let mut reader = MapReader::new(BufReader::new(File::open(&self.path)?));
        let mut summary = MapSummary::default();

        while let Some(extent) = reader.next_extent()? {
            summary.extents += 1;
            summary.total_bytes = summary.total_bytes.saturating_add(extent.length);
            if extent.status.is_finished() {
                summary.finished_bytes = summary.finished_bytes.saturating_add(extent.length);
            }
        }

        Ok(summary)
    }

    fn cached_covers(&self, pos: u64, end: u64) -> bool {
        let completed = self.completed.lock();
        // Extents never overlap, so only the last one starting at or before
        // `pos` can contain it.
        completed
            .range(..=pos)
            .next_back()
            .is_some_and(|(&start, &length)| start.saturating_add(length) >= end)
    }

    /// Caches a finished extent. The tool merges neighbouring finished
    /// extents, so a known start may come back longer; the longer length
    /// wins and cached extents it now swallows are dropped, keeping the
    /// cache non-overlapping.
    fn remember(&self, extent: &Extent) {
        if extent.length == 0 {
            return;
        }
        let mut completed = self.completed.lock();
        let known = completed.entry(extent.start).or_insert(0);
        if *known >= extent.length {
            return;
        }
        *known = extent.length;

        let swallowed: Vec<u64> = completed
            .range(extent.start + 1..extent.end())
            .map(|(&start, _)| start)
            .collect();
        for start in swallowed {
            completed.remove(&start);
        }
    }

    fn scan(&self, pos: u64, end: u64) -> Result<bool> {
        self.scans.fetch_add(1, Ordering::Relaxed);

        let file = File::open(&self.path)?;
        let mut reader = MapReader::new(BufReader::new(file));
        // First byte of the range not yet proven finished.
        let mut cursor = pos;

        while let Some(extent) = reader.next_extent()? {
            if extent.status.is_finished() {
                self.remember(&extent);
            }

            if extent.end() <= cursor {
                continue;
            }
            if extent.start > cursor {
                return Err(RescueError::map_format(
                    reader.line_no(),
                    format!(
                        "no extent covers 0x{:x} (next extent starts at 0x{:x})",
                        cursor, extent.start
                    ),
                ));
            }
            if !extent.status.is_finished() {
                debug!(
                    "Incomplete in map: 0x{:x}+0x{:x} {}",
                    extent.start,
                    extent.length,
                    extent.status.as_char()
                );
                return Ok(false);
            }

            let previous = cursor;
            cursor = extent.end().min(end);
            debug!(
                "Got {} bytes in map at 0x{:x} (total {} found)",
                cursor - previous,
                extent.start,
                cursor - pos
            );

            if cursor == end {
                return Ok(true);
            }
        }

        Err(RescueError::map_format(
            reader.line_no(),
            format!("map ends at 0x{:x} before covering 0x{:x}", cursor, end),
        ))
    }
}

/// Streams extents out of a map, one line at a time.
pub struct MapReader<R> {
    inner: R,
    line: String,
    line_no: usize,
    header_seen: bool,
}

impl<R: BufRead> MapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
            line_no: 0,
            header_seen: false,
        }
    }

    /// Line number of the last line read, starting at 1.
    pub fn line_no(&self) -> usize {
        self.line_no
    }

    /// Next data extent, skipping the header, comments and blank lines.
    pub fn next_extent(&mut self) -> Result<Option<Extent>> {
        loop {
            self.line.clear();
            if self.inner.read_line(&mut self.line)? == 0 {
                if !self.header_seen {
                    return Err(RescueError::map_format(self.line_no, "missing header line"));
                }
                return Ok(None);
            }
            self.line_no += 1;

            let content = match self.line.find('#') {
                Some(idx) => &self.line[..idx],
                None => self.line.as_str(),
            };
            let fields: Vec<&str> = content.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }

            if !self.header_seen {
                // Older tools write `pos status`, newer ones append the pass.
                if !(2..=3).contains(&fields.len()) {
                    return Err(RescueError::map_format(
                        self.line_no,
                        format!("header has {} fields, expected 2 or 3", fields.len()),
                    ));
                }
                self.header_seen = true;
                continue;
            }

            return parse_extent(self.line_no, &fields).map(Some);
        }
    }
}

fn parse_extent(line_no: usize, fields: &[&str]) -> Result<Extent> {
    let [start, length, status] = fields else {
        return Err(RescueError::map_format(
            line_no,
            format!("extent has {} fields, expected 3", fields.len()),
        ));
    };

    let start = parse_hex(line_no, "position", start)?;
    let length = parse_hex(line_no, "size", length)?;

    let mut chars = status.chars();
    let status = match (chars.next(), chars.next()) {
        (Some(c), None) => ExtentStatus::from_char(c),
        _ => None,
    }
    .ok_or_else(|| RescueError::map_format(line_no, format!("unknown status {:?}", status)))?;

    Ok(Extent {
        start,
        length,
        status,
    })
}

fn parse_hex(line_no: usize, what: &str, field: &str) -> Result<u64> {
    let digits = field.strip_prefix("0x").ok_or_else(|| {
        RescueError::map_format(line_no, format!("{} {:?} lacks the 0x prefix", what, field))
    })?;

    u64::from_str_radix(digits, 16).map_err(|e| {
        RescueError::map_format(line_no, format!("{} {:?} is not hexadecimal: {}", what, field, e))
    })
}
