use super::error::{RescueError, Result};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::path::Path;

/// Size of the source device, probed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub total_size: u64,
}

impl DeviceGeometry {
    pub fn new(total_size: u64) -> Self {
        Self { total_size }
    }

    /// Opens the source read-only, seeks to its end and closes it again.
    ///
    /// Seeking works for both regular image files and block devices, where
    /// the metadata length is reported as zero.
    pub fn probe(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let device_err = |source| RescueError::Device {
            path: path.to_path_buf(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(device_err)?;
        let total_size = file.seek(SeekFrom::End(0)).map_err(device_err)?;

        Ok(Self { total_size })
    }

    /// Length of the largest readable range starting at `offset`, at most `size`.
    pub fn clamp(&self, offset: u64, size: u64) -> u64 {
        self.total_size.saturating_sub(offset).min(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_probe_regular_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&[0u8; 3000]).unwrap();
        temp_file.flush().unwrap();

        let geometry = DeviceGeometry::probe(temp_file.path()).unwrap();
        assert_eq!(geometry.total_size, 3000);
    }

    #[test]
    fn test_probe_missing_device() {
        let err = DeviceGeometry::probe("/nonexistent/path/device").unwrap_err();
        assert!(matches!(err, RescueError::Device { .. }));
    }

    #[test]
    fn test_clamp() {
        let geometry = DeviceGeometry::new(4096);
        assert_eq!(geometry.clamp(0, 1024), 1024);
        assert_eq!(geometry.clamp(4000, 1024), 96);
        assert_eq!(geometry.clamp(4096, 1024), 0);
        assert_eq!(geometry.clamp(9000, 1024), 0);
    }
}
