//! Provision command - applies every provisioning step to this host.

use anyhow::Result;

use crate::component::{self, ProvisionReport};
use crate::config::Config;
use crate::context::HostContext;
use crate::process::SystemRunner;
use crate::timing;

/// Execute the provision command.
///
/// Errors come back as [`ProvisionError`](crate::error::ProvisionError)
/// wrapped in `anyhow`, so `main` can recover the exit code.
pub fn cmd_provision(config: &Config) -> Result<ProvisionReport> {
    let ctx = HostContext::from_config(config);
    let runner = SystemRunner::for_host(config.use_sudo);

    if !crate::is_privileged() {
        log::warn!("Not running as root; file edits below /boot and /etc will likely fail");
    }

    let report = component::provision(&ctx, &runner)?;

    print_summary(&report);
    Ok(report)
}

fn print_summary(report: &ProvisionReport) {
    println!();
    println!("=== Provisioning complete ({}) ===", timing::human(report.total_time()));
    for (step, elapsed) in &report.durations {
        println!("  {:<12} {}", step, timing::human(*elapsed));
    }
    if let Some(device) = report.loop_device() {
        println!("  Image attached at {} (left attached)", device);
    }
    for unit in report.installed_units() {
        println!("  ✓ {}", unit);
    }
    for unit in report.missing_units() {
        println!("  ⚠ {} (not staged, skipped)", unit);
    }
    let diagnostics = report.diagnostics();
    if !diagnostics.is_empty() {
        println!("\n{} warning(s):", diagnostics.len());
        for d in diagnostics {
            println!("  {}", d);
        }
    }
    println!("\nReboot to switch the USB controller into gadget mode.");
}
