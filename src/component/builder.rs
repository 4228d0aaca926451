//! Provisioning driver - runs every component in phase order.
//!
//! Policy: the first error aborts the run and leaves the host exactly as
//! far as it got (no rollback, the loop device stays attached). Non-fatal
//! diagnostics from a component are collected and the run continues.

use std::time::Duration;

use super::definitions;
use super::executor::{self, Session};
use super::Outcome;
use crate::context::HostContext;
use crate::error::ProvisionResult;
use crate::process::CommandRunner;
use crate::timing::Timer;

/// Per-component outcomes of a finished run.
#[derive(Debug, Default)]
pub struct ProvisionReport {
    pub outcomes: Vec<(&'static str, Outcome)>,
    /// Wall time of each component, in run order.
    pub durations: Vec<(&'static str, Duration)>,
}

impl ProvisionReport {
    /// All diagnostics, prefixed with the component that raised them.
    pub fn diagnostics(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .flat_map(|(name, o)| o.diagnostics.iter().map(move |d| format!("{}: {}", name, d)))
            .collect()
    }

    /// Loop device the image ended up attached to.
    pub fn loop_device(&self) -> Option<&str> {
        self.outcomes
            .iter()
            .find_map(|(_, o)| o.loop_device.as_deref())
    }

    pub fn installed_units(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .flat_map(|(_, o)| o.installed_units.iter().map(String::as_str))
            .collect()
    }

    pub fn missing_units(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .flat_map(|(_, o)| o.missing_units.iter().map(String::as_str))
            .collect()
    }

    pub fn total_time(&self) -> Duration {
        self.durations.iter().map(|(_, d)| *d).sum()
    }
}

/// Provision the host.
///
/// Phases:
/// 1. BootConfig - comment out otg_mode=1, add dtoverlay=dwc2
/// 2. Modules - add dwc2 to the module list
/// 3. Image - create, partition, attach and format the backing file
/// 4. Packages - expect and the Dropbox client library
/// 5. Services - install and enable the three units
pub fn provision(ctx: &HostContext, runner: &dyn CommandRunner) -> ProvisionResult<ProvisionReport> {
    let mut session = Session::default();
    let mut report = ProvisionReport::default();

    for component in definitions::all(ctx) {
        let timer = Timer::start(component.name);
        let outcome = executor::execute(ctx, runner, &mut session, &component)?;
        report.durations.push((component.name, timer.finish()));
        report.outcomes.push((component.name, outcome));
    }

    Ok(report)
}
