//! piusb - turns a Raspberry Pi into a USB stick that uploads what is
//! written to it.
//!
//! `piusb provision` prepares the host once (boot config, backing image,
//! packages, units); the `gadget`, `copy` and `upload` subcommands are what
//! the installed systemd units run.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::ExitCode;

use piusb::commands;
use piusb::config::Config;
use piusb::error::ProvisionError;

#[derive(Parser)]
#[command(name = "piusb")]
#[command(about = "Raspberry Pi USB mass-storage provisioning and services")]
#[command(
    after_help = "QUICK START:\n  piusb preflight   Check the host\n  piusb             Provision (same as `piusb provision`)\n  piusb show status Show what is installed"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure boot files, create the image, install packages and units
    Provision,

    /// Check whether provisioning can run (changes nothing)
    Preflight {
        /// Exit non-zero if any check fails
        #[arg(long)]
        strict: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Expose the image to the USB host (usbshare.service)
    Gadget {
        /// Remove the gadget instead
        #[arg(long)]
        stop: bool,
    },

    /// Copy new files out of the image (copynewusbfiles.service)
    Copy,

    /// Upload copied files to Dropbox/SCP (uploadnewfiles.service)
    Upload,
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
    /// Show image, gadget and unit status
    Status,
}

fn main() -> ExitCode {
    // Load .env if present
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load();

    match run(cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(cli: Cli, config: &Config) -> Result<()> {
    match cli.command.unwrap_or(Commands::Provision) {
        Commands::Provision => {
            commands::cmd_provision(config)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(config, strict)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Status => commands::show::ShowTarget::Status,
            };
            commands::cmd_show(show_target, config)?;
        }

        Commands::Gadget { stop } => {
            commands::cmd_gadget(config, stop)?;
        }

        Commands::Copy => {
            commands::cmd_copy(config)?;
        }

        Commands::Upload => {
            commands::cmd_upload(config)?;
        }
    }

    Ok(())
}

/// Provisioning failures carry their own exit code; everything else is 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<ProvisionError>()
        .map(ProvisionError::exit_code)
        .unwrap_or(1)
}
