//! Service commands - entry points of the three systemd units.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::process::SystemRunner;
use crate::services::copy::{CopyPaths, CopyService};
use crate::services::upload::{UploadPaths, UploadService};
use crate::services::{gadget, ServiceSettings};

/// Load or unload the mass-storage gadget.
pub fn cmd_gadget(config: &Config, stop: bool) -> Result<()> {
    let runner = SystemRunner::for_host(config.use_sudo);
    if stop {
        gadget::stop(&runner)
    } else {
        gadget::start(&runner, &config.image)
    }
}

/// Run the copy service until it fails.
pub fn cmd_copy(config: &Config) -> Result<()> {
    log::info!("----STARTED copy service----");
    let settings = load_settings(config)?
        .copy_settings()
        .context("Invalid copy settings")?;

    let runner = SystemRunner::for_host(config.use_sudo);
    let paths = CopyPaths {
        image: config.image.clone(),
        mount_point: config.mount_point.clone(),
        transfer_dir: config.transfer_dir(),
    };
    let mut service = CopyService::new(&runner, paths, settings)?;
    service.run()
}

/// Run the upload service until it fails.
pub fn cmd_upload(config: &Config) -> Result<()> {
    log::info!("----STARTED upload service----");
    let settings = load_settings(config)?;

    // expect/scp run as the service user, never through sudo.
    let runner = SystemRunner::new(false);
    let paths = UploadPaths {
        transfer_dir: config.transfer_dir(),
        scp_script: config.scp_script(),
    };
    let service = UploadService::new(&runner, paths, settings)?;
    service.run()
}

fn load_settings(config: &Config) -> Result<ServiceSettings> {
    let settings = ServiceSettings::load(&config.service_config())?;
    log::info!("Configuration loaded.");
    Ok(settings)
}
