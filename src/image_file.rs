//! The recovering image exposed as a single read-only file.

use crate::config::TimeoutPolicy;
use crate::core::device::DeviceGeometry;
use crate::core::error::{RescueError, Result};
use crate::progress_map::ProgressMap;
use crate::recovery::{RangeRecovery, RecoveryOutcome, RecoverySupervisor};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Metadata reported for the virtual file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    /// Size of the source device.
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Serves reads from the image, recovering missing ranges first.
///
/// Reads check the map without any lock. Only a miss goes through the
/// recovery backend, which serializes targeted runs; the image itself is
/// only ever read here, so concurrent `pread`s are fine.
pub struct RecoveringFile<R = RecoverySupervisor> {
    image: PathBuf,
    geometry: DeviceGeometry,
    map: ProgressMap,
    recovery: R,
    timeout: Option<TimeoutPolicy>,
}

impl<R: RangeRecovery> RecoveringFile<R> {
    pub fn new(
        image: impl Into<PathBuf>,
        geometry: DeviceGeometry,
        map: ProgressMap,
        recovery: R,
        timeout: Option<TimeoutPolicy>,
    ) -> Self {
        Self {
            image: image.into(),
            geometry,
            map,
            recovery,
            timeout,
        }
    }

    pub fn image_path(&self) -> &Path {
        &self.image
    }

    pub fn size(&self) -> u64 {
        self.geometry.total_size
    }

    pub fn map(&self) -> &ProgressMap {
        &self.map
    }

    pub fn recovery(&self) -> &R {
        &self.recovery
    }

    /// Attributes of the virtual file: the device's size, with timestamps
    /// and block hints taken from the image file being read.
    pub fn attributes(&self) -> Result<FileAttributes> {
        let meta = fs::metadata(&self.image)?;

        Ok(FileAttributes {
            size: self.geometry.total_size,
            blocks: meta.blocks(),
            blksize: u32::try_from(meta.blksize()).unwrap_or(u32::MAX),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        })
    }

    /// Reads up to `size` bytes at `offset`, never past the end of the device.
    ///
    /// Fails with [`RescueError::DataUnavailable`] when recovery gave up on
    /// the range or left parts of it unrescued.
    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let size = self.geometry.clamp(offset, size);
        if size == 0 {
            return Ok(Vec::new());
        }

        if !self.map.is_complete(offset, size)? {
            let timeout = self.timeout.map(|policy| policy.for_size(size));
            let outcome = self.recovery.recover_range(offset, size, timeout)?;

            // The tool may finish and still leave bad sectors behind, so the
            // map is checked again rather than trusting the exit.
            if outcome == RecoveryOutcome::TimedOut || !self.map.is_complete(offset, size)? {
                info!(
                    "Data unavailable at 0x{:x}-0x{:x} ({:?})",
                    offset,
                    offset + size - 1,
                    outcome
                );
                return Err(RescueError::DataUnavailable { offset, size });
            }
        }

        self.read_image(offset, size)
    }

    fn read_image(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(size).map_err(|_| RescueError::BackingStore {
            offset,
            reason: format!("read of {} bytes does not fit in memory", size),
        })?;

        let file = File::open(&self.image)?;
        let mut data = vec![0u8; len];
        file.read_exact_at(&mut data, offset).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                RescueError::BackingStore {
                    offset,
                    reason: format!("image ends before 0x{:x}", offset + size),
                }
            } else {
                RescueError::Io(e)
            }
        })?;

        debug!("Read {} bytes at 0x{:x} from image", len, offset);
        Ok(data)
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = u32::try_from(nsecs).unwrap_or(0);
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs.unsigned_abs(), nsecs)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::new(0, nsecs)
    }
}
