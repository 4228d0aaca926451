//! Preflight checks for provisioning.
//!
//! Read-only: reports whether `piusb provision` can be expected to succeed
//! on this host without changing anything.
//! Run with `piusb preflight` to check everything is ready.

use anyhow::{bail, Result};
use std::path::Path;

use crate::component::definitions::{CONFLICTING_DIRECTIVE, GADGET_MODULE, OVERLAY_DIRECTIVE};
use crate::common::lines;
use crate::context::HostContext;
use crate::process;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Provisioning will fail.
    Fail,
    /// Provisioning can run, but something will be skipped or needs sudo.
    Warn,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, details: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            details,
        }
    }

    fn pass(name: &str) -> Self {
        Self::new(name, CheckStatus::Pass, None)
    }

    fn pass_with(name: &str, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, Some(details.into()))
    }

    fn fail(name: &str, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, Some(details.into()))
    }

    fn warn(name: &str, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, Some(details.into()))
    }
}

/// Results of all preflight checks.
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if no check failed.
    pub fn all_passed(&self) -> bool {
        self.fail_count() == 0
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn fail_count(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn warn_count(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    /// Look up a check by name.
    pub fn get(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        println!("=== Preflight Check Results ===\n");

        for check in &self.checks {
            let (icon, status_str) = match check.status {
                CheckStatus::Pass => ("✓", "PASS"),
                CheckStatus::Fail => ("✗", "FAIL"),
                CheckStatus::Warn => ("⚠", "WARN"),
            };

            print!("  {} [{}] {}", icon, status_str, check.name);
            match &check.details {
                Some(details) => println!(": {}", details),
                None => println!(),
            }
        }

        println!();
        let total = self.checks.len();
        let passed = self.count(CheckStatus::Pass);
        println!("Summary: {}/{} passed", passed, total);
        if self.fail_count() > 0 {
            println!(
                "         {} FAILED - provisioning will not succeed",
                self.fail_count()
            );
        }
        if self.warn_count() > 0 {
            println!("         {} warnings", self.warn_count());
        }
    }
}

/// Run all preflight checks.
pub fn run_preflight(ctx: &HostContext) -> PreflightReport {
    let mut checks = Vec::new();

    checks.push(check_privileges(crate::is_privileged()));
    checks.extend(check_host_tools());
    checks.push(check_boot_config(&ctx.boot_config));
    checks.push(check_modules_file(&ctx.modules_file));
    checks.push(check_image_absent(&ctx.image));
    checks.extend(check_staged_units(ctx));

    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(ctx: &HostContext) -> Result<()> {
    let report = run_preflight(ctx);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before provisioning.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}

fn check_privileges(root: bool) -> CheckResult {
    if root {
        CheckResult::pass("root privileges")
    } else {
        CheckResult::warn(
            "root privileges",
            "Not running as root. Boot config and unit edits need root; run with sudo.",
        )
    }
}

/// Tools the provisioner shells out to, with the package providing each.
fn check_host_tools() -> Vec<CheckResult> {
    let required = [
        ("dd", "coreutils"),
        ("sfdisk", "fdisk"),
        ("losetup", "mount"),
        ("apt-get", "apt"),
        ("dpkg", "dpkg"),
        ("systemctl", "systemd"),
    ];
    // Installed by provisioning itself when missing.
    let installed_later = [("mkfs.exfat", "exfatprogs"), ("expect", "expect")];

    let mut results = Vec::new();
    for (tool, package) in required {
        results.push(check_tool(tool, package, true));
    }
    for (tool, package) in installed_later {
        results.push(check_tool(tool, package, false));
    }
    results
}

fn check_tool(tool: &str, package: &str, required: bool) -> CheckResult {
    match process::find_program(tool) {
        Some(path) => CheckResult::pass_with(tool, path.display().to_string()),
        None if required => {
            CheckResult::fail(tool, format!("Not found. Install the '{}' package.", package))
        }
        None => CheckResult::warn(
            tool,
            format!("Not found. Provisioning will install '{}'.", package),
        ),
    }
}

fn check_boot_config(path: &Path) -> CheckResult {
    let name = "boot config";
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => return CheckResult::fail(name, format!("{}: {}", path.display(), e)),
    };

    let overlay = lines::contains_line(&content, OVERLAY_DIRECTIVE);
    let conflict = lines::contains_line(&content, CONFLICTING_DIRECTIVE);
    let state = match (overlay, conflict) {
        (true, false) => "already configured".to_string(),
        (_, true) => format!("{} will be commented out", CONFLICTING_DIRECTIVE),
        (false, false) => "overlay will be added".to_string(),
    };
    CheckResult::pass_with(name, format!("{} ({})", path.display(), state))
}

fn check_modules_file(path: &Path) -> CheckResult {
    let name = "module list";
    match std::fs::read_to_string(path) {
        Ok(content) if lines::contains_line(&content, GADGET_MODULE) => {
            CheckResult::pass_with(name, format!("{} already loads {}", path.display(), GADGET_MODULE))
        }
        Ok(_) => CheckResult::pass_with(name, path.display().to_string()),
        Err(e) => CheckResult::fail(name, format!("{}: {}", path.display(), e)),
    }
}

fn check_image_absent(path: &Path) -> CheckResult {
    let name = "backing image";
    if path.symlink_metadata().is_ok() {
        CheckResult::fail(
            name,
            format!(
                "{} already exists. Provisioning refuses to overwrite it; move it away first.",
                path.display()
            ),
        )
    } else {
        CheckResult::pass_with(name, format!("{} will be created", path.display()))
    }
}

fn check_staged_units(ctx: &HostContext) -> Vec<CheckResult> {
    ctx.units
        .iter()
        .map(|unit| {
            let staged = ctx.staged_unit(unit);
            if staged.is_file() {
                CheckResult::pass(unit)
            } else {
                CheckResult::warn(
                    unit,
                    format!("Not staged at {}; it will be skipped", staged.display()),
                )
            }
        })
        .collect()
}
