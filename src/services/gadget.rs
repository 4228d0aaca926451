//! USB mass-storage gadget on/off.

use anyhow::Result;
use std::path::Path;

use crate::process::{Cmd, CommandRunner};

pub const GADGET_DRIVER: &str = "g_mass_storage";

/// `modprobe` line exposing `image` to the USB host as a removable disk.
pub fn start_command(image: &Path) -> Cmd {
    Cmd::new("modprobe")
        .arg(GADGET_DRIVER)
        .arg(format!("file={}", image.display()))
        .arg("stall=0")
        .arg("removable=y")
        .error_msg("Failed to load the mass storage gadget")
}

pub fn stop_command() -> Cmd {
    Cmd::new("modprobe")
        .args(["-r", GADGET_DRIVER])
        .error_msg("Failed to unload the mass storage gadget")
}

pub fn start(runner: &dyn CommandRunner, image: &Path) -> Result<()> {
    log::info!("Exposing {} over USB", image.display());
    runner.run(&start_command(image))?;
    Ok(())
}

pub fn stop(runner: &dyn CommandRunner) -> Result<()> {
    log::info!("Removing USB mass storage gadget");
    runner.run(&stop_command())?;
    Ok(())
}
