//! Preflight command - runs preflight checks.

use anyhow::Result;

use crate::config::Config;
use crate::context::HostContext;
use crate::preflight;

/// Execute the preflight command.
pub fn cmd_preflight(config: &Config, strict: bool) -> Result<()> {
    let ctx = HostContext::from_config(config);
    if strict {
        preflight::run_preflight_or_fail(&ctx)?;
    } else {
        let report = preflight::run_preflight(&ctx);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to exit non-zero.");
        }
    }
    Ok(())
}
