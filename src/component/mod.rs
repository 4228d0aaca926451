//! Declarative provisioning steps.
//!
//! Each step is a [`Component`]: a name, a phase, and the list of [`Op`]s
//! that bring the host into the wanted state. The executor interprets ops
//! against a [`HostContext`](crate::context::HostContext) and a
//! [`CommandRunner`](crate::process::CommandRunner); the builder runs the
//! components in phase order and decides abort versus continue.
//!
//! ```text
//! Component Definition (DATA)          Executor (LOGIC)
//! ─────────────────────────────        ─────────────────
//! BOOT_CONFIG = Component {            for op in component.ops {
//!   ops: [                               execute_op(ctx, runner, op)?;
//!     CommentOut(config.txt, ..),      }
//!     EnsureLine(config.txt, ..),
//!   ]
//! }
//! ```

pub mod builder;
pub mod definitions;
pub mod executor;

pub use builder::{provision, ProvisionReport};

use std::path::PathBuf;

/// One provisioning step.
#[derive(Debug, Clone)]
pub struct Component {
    /// Human-readable name for logging.
    pub name: &'static str,
    /// Phase (determines ordering).
    pub phase: Phase,
    /// Operations to perform.
    pub ops: Vec<Op>,
}

/// Provisioning phases, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    /// Firmware config.txt edits.
    BootConfig = 1,
    /// Kernel modules loaded at boot.
    Modules = 2,
    /// Backing image, partition table, loop device, filesystem.
    Image = 3,
    /// OS packages and the cloud client library.
    Packages = 4,
    /// systemd unit installation.
    Services = 5,
}

/// Operations a component can perform.
///
/// File edits happen in-process; everything else goes through the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    // ─────────────────────────────────────────────────────────────────────
    // Text file edits
    // ─────────────────────────────────────────────────────────────────────
    /// Comment out every uncommented line equal to the directive.
    CommentOut { file: PathBuf, directive: String },

    /// Append the line unless it is already present.
    EnsureLine { file: PathBuf, line: String },

    // ─────────────────────────────────────────────────────────────────────
    // Image operations
    // ─────────────────────────────────────────────────────────────────────
    /// Abort the whole run if the path already exists.
    RefuseExisting(PathBuf),

    /// Allocate a zero-filled file of the given size with `dd`.
    ZeroFill { path: PathBuf, size_mib: u64 },

    /// Write a partition table with one primary partition of `type_code`.
    PartitionTable { path: PathBuf, type_code: String },

    /// Attach the image as a loop device with partition scanning.
    AttachLoop(PathBuf),

    /// Format partition 1 of the attached loop device as exFAT.
    FormatExfat { label: String },

    /// Create a directory and its parents (no error if it exists).
    Dir(PathBuf),

    // ─────────────────────────────────────────────────────────────────────
    // Packages
    // ─────────────────────────────────────────────────────────────────────
    /// Install an OS package unless `dpkg` already knows it.
    Package(String),

    /// Install a library from the OS archive, falling back to a language
    /// package installer when the archive does not carry it.
    PackageWithFallback(FallbackInstall),

    // ─────────────────────────────────────────────────────────────────────
    // Services
    // ─────────────────────────────────────────────────────────────────────
    /// Move a staged unit into the unit directory, chmod it, enable it.
    /// A missing staged file is reported and skipped.
    InstallUnit { name: String, mode: u32 },
}

/// Two-tier installation of a library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackInstall {
    /// OS package providing the library.
    pub os_package: String,
    /// OS package providing the fallback installer.
    pub installer_package: String,
    /// Fallback installer program.
    pub installer: String,
    /// Arguments passed to the installer before the library name.
    pub installer_args: Vec<String>,
    /// Library name as the fallback installer knows it.
    pub library: String,
}

/// What a finished component reports back to the builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Non-fatal problems (e.g. unit files that were not staged).
    pub diagnostics: Vec<String>,
    /// Units that were installed and enabled.
    pub installed_units: Vec<String>,
    /// Units skipped because their staged file was absent.
    pub missing_units: Vec<String>,
    /// Loop device the image was attached to.
    pub loop_device: Option<String>,
}

impl Outcome {
    /// True if the component did everything it was asked to.
    pub fn complete(&self) -> bool {
        self.diagnostics.is_empty()
    }
}
