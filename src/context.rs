//! Host context shared by all provisioning steps.
//!
//! Holds every path and option the steps touch, so nothing reads ambient
//! state and tests can point the whole run at a scratch directory.

use std::path::{Path, PathBuf};

use crate::config::Config;

/// Unit files installed by the service step, in installation order.
pub const SERVICE_UNITS: [&str; 3] = [
    "usbshare.service",
    "copynewusbfiles.service",
    "uploadnewfiles.service",
];

/// Paths and options for one provisioning run.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub boot_config: PathBuf,
    pub modules_file: PathBuf,
    pub image: PathBuf,
    pub image_size_mib: u64,
    pub volume_label: String,
    pub mount_point: PathBuf,
    /// Where unit files are staged before installation.
    pub staging_dir: PathBuf,
    /// systemd unit directory.
    pub unit_dir: PathBuf,
    pub units: Vec<String>,
    /// pip arguments for the cloud client fallback install.
    pub pip_args: Vec<String>,
}

impl HostContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            boot_config: config.boot_config.clone(),
            modules_file: config.modules_file.clone(),
            image: config.image.clone(),
            image_size_mib: config.image_size_mib,
            volume_label: config.volume_label.clone(),
            mount_point: config.mount_point.clone(),
            staging_dir: config.staging_dir(),
            unit_dir: config.unit_dir.clone(),
            units: SERVICE_UNITS.iter().map(|u| u.to_string()).collect(),
            pip_args: config.pip_args.clone(),
        }
    }

    /// Context rooted at `root`, mirroring the host layout below it.
    ///
    /// Nothing is created; tests set up whichever files they need.
    #[doc(hidden)]
    pub fn for_testing(root: &Path) -> Self {
        Self {
            boot_config: root.join("boot/firmware/config.txt"),
            modules_file: root.join("etc/modules"),
            image: root.join("piusb.bin"),
            image_size_mib: crate::config::DEFAULT_IMAGE_SIZE_MIB,
            volume_label: crate::config::DEFAULT_VOLUME_LABEL.to_string(),
            mount_point: root.join("mnt/usb_share"),
            staging_dir: root.join("opt/piusb/units"),
            unit_dir: root.join("etc/systemd/system"),
            units: SERVICE_UNITS.iter().map(|u| u.to_string()).collect(),
            pip_args: vec![crate::config::DEFAULT_PIP_ARGS.to_string()],
        }
    }

    /// Staged location of a unit file.
    pub fn staged_unit(&self, name: &str) -> PathBuf {
        self.staging_dir.join(name)
    }

    /// Installed location of a unit file.
    pub fn installed_unit(&self, name: &str) -> PathBuf {
        self.unit_dir.join(name)
    }
}
