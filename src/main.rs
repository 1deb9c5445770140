//! rescuefs - mount an image that ddrescue is still working on.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select};
use humansize::{BINARY, format_size};
use std::sync::Arc;
use tracing::{info, warn};

use cli::Cli;
use rescuefs::fs::{self, ImageFs};
use rescuefs::{DeviceGeometry, ProgressMap, RecoveringFile, RecoverySupervisor};

fn main() -> Result<()> {
    let cli = Cli::parse();
    rescuefs::logging::init(&cli.log_options()).context("Failed to set up logging")?;

    let recovery = cli.recovery_config()?;
    let mount_config = cli.mount_config();

    let geometry = DeviceGeometry::probe(&recovery.source)
        .with_context(|| format!("Failed to probe source: {:?}", recovery.source))?;
    info!(
        "Source {:?} is {} ({} bytes)",
        recovery.source,
        format_size(geometry.total_size, BINARY),
        geometry.total_size
    );

    let map = ProgressMap::new(&recovery.map);
    match map.summary() {
        Ok(summary) => info!(
            "Map lists {} extents, {} of {} rescued",
            summary.extents,
            format_size(summary.finished_bytes, BINARY),
            format_size(summary.total_bytes, BINARY)
        ),
        Err(e) => warn!("Map not readable yet: {}", e),
    }

    let supervisor =
        RecoverySupervisor::start(recovery.clone()).context("Failed to start ddrescue")?;
    let file = Arc::new(RecoveringFile::new(
        recovery.image.clone(),
        geometry,
        map,
        supervisor,
        cli.timeout_policy(),
    ));

    let (stop_tx, stop_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Failed to set Ctrl+C handler")?;

    let (fatal_tx, fatal_rx) = bounded(1);
    let (unmounted_tx, unmounted_rx) = bounded(1);
    let image_fs = ImageFs::new(Arc::clone(&file), &mount_config.file_name, fatal_tx)
        .with_unmount_signal(unmounted_tx);
    let session = fs::mount(image_fs, &mount_config)
        .with_context(|| format!("Failed to mount on {:?}", mount_config.mountpoint))?;

    // Runs until interrupted, unmounted from outside, or broken.
    let fatal = select! {
        recv(stop_rx) -> _ => None,
        recv(unmounted_rx) -> _ => {
            info!("{:?} was unmounted", mount_config.mountpoint);
            None
        }
        recv(fatal_rx) -> err => err.ok(),
    };

    info!("Unmounting {:?}", mount_config.mountpoint);
    drop(session);
    file.recovery()
        .shutdown()
        .context("Failed to stop ddrescue")?;

    if let Some(err) = fatal {
        return Err(anyhow::Error::new(err).context("Mount aborted"));
    }
    Ok(())
}
