//! Show command - displays information.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::context::HostContext;
use crate::services::{gadget, upload};

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// Show what is provisioned and running
    Status,
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Status => print_status(config)?,
    }
    Ok(())
}

fn print_status(config: &Config) -> Result<()> {
    let ctx = HostContext::from_config(config);

    println!("Status:");
    match std::fs::metadata(&ctx.image) {
        Ok(meta) => println!(
            "  Image:   {} ({} MiB)",
            ctx.image.display(),
            meta.len() / (1024 * 1024)
        ),
        Err(_) => println!("  Image:   not created"),
    }

    let loaded = Path::new("/sys/module").join(gadget::GADGET_DRIVER).exists();
    println!(
        "  Gadget:  {}",
        if loaded { "loaded" } else { "not loaded" }
    );

    for unit in &ctx.units {
        let state = if ctx.installed_unit(unit).is_file() {
            "installed"
        } else if ctx.staged_unit(unit).is_file() {
            "staged"
        } else {
            "missing"
        };
        println!("  {:<26} {}", unit, state);
    }

    let transfer = config.transfer_dir();
    if transfer.is_dir() {
        let pending = upload::batch_folders(&transfer)?.len();
        println!("  Pending upload batches: {}", pending);
    }
    Ok(())
}
