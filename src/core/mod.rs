pub mod device;
pub mod error;

pub use device::DeviceGeometry;
pub use error::{RescueError, Result};
