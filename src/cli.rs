use anyhow::{Context, Result};
use clap::Parser;
use rescuefs::config::{DEFAULT_FILE_NAME, DEFAULT_PROGRAM};
use rescuefs::logging::LogOptions;
use rescuefs::{MountConfig, RecoveryConfig, TimeoutPolicy};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "rescuefs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mount a partially-rescued image, recovering ranges as they are read", long_about = None)]
pub struct Cli {
    /// Where to mount the file system
    pub mountpoint: PathBuf,

    /// Source device
    #[arg(long)]
    pub source: PathBuf,

    /// Image file
    #[arg(long)]
    pub image: PathBuf,

    /// Map file
    #[arg(long)]
    pub mapfile: PathBuf,

    /// Additional options for ddrescue
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub ddrescue_options: String,

    /// Recovery program to run
    #[arg(long, default_value = DEFAULT_PROGRAM)]
    pub ddrescue_program: PathBuf,

    /// Give up recovery after N seconds per 512 bytes
    #[arg(long, value_name = "SECONDS")]
    pub timeout_recovery: Option<u64>,

    /// Name of the image inside the mount
    #[arg(long, default_value = DEFAULT_FILE_NAME)]
    pub file_name: String,

    /// Enable debugging output
    #[arg(long)]
    pub debug: bool,

    /// Enable FUSE debugging output
    #[arg(long)]
    pub debug_fuse: bool,

    /// Keep log lines above ddrescue's status display
    #[arg(long)]
    pub separate_tool_output: bool,
}

impl Cli {
    pub fn recovery_config(&self) -> Result<RecoveryConfig> {
        let extra_args = shlex::split(&self.ddrescue_options)
            .with_context(|| format!("Cannot split ddrescue options: {:?}", self.ddrescue_options))?;

        Ok(
            RecoveryConfig::new(&self.source, &self.image, &self.mapfile)
                .with_program(&self.ddrescue_program)
                .with_extra_args(extra_args),
        )
    }

    /// Zero means no timeout, like leaving the option out.
    pub fn timeout_policy(&self) -> Option<TimeoutPolicy> {
        self.timeout_recovery
            .filter(|&secs| secs > 0)
            .map(|secs| TimeoutPolicy::per_sector(Duration::from_secs(secs)))
    }

    pub fn mount_config(&self) -> MountConfig {
        let mut config = MountConfig::new(&self.mountpoint);
        config.file_name = self.file_name.clone();
        config.debug_fuse = self.debug_fuse;
        config
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            debug: self.debug,
            debug_fuse: self.debug_fuse,
            separate_tool_output: self.separate_tool_output,
        }
    }
}
