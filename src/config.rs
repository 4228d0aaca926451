//! Configuration management for piusb.
//!
//! Reads configuration from a .env file and environment variables.
//! Environment variables take precedence over the .env file (dotenvy never
//! overrides variables that are already set).

use std::path::{Path, PathBuf};

/// Default install location of piusb: unit files, service config and the
/// transfer directory live below it.
pub const DEFAULT_BASE_DIR: &str = "/opt/piusb";

/// Bookworm and later keep the firmware config here.
pub const FIRMWARE_BOOT_CONFIG: &str = "/boot/firmware/config.txt";
/// Location on older Raspberry Pi OS releases.
pub const LEGACY_BOOT_CONFIG: &str = "/boot/config.txt";

pub const DEFAULT_MODULES_FILE: &str = "/etc/modules";
pub const DEFAULT_IMAGE: &str = "/piusb.bin";
pub const DEFAULT_IMAGE_SIZE_MIB: u64 = 3072;
pub const DEFAULT_VOLUME_LABEL: &str = "PIUSB";
pub const DEFAULT_MOUNT_POINT: &str = "/mnt/usb_share";
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";
/// pip arguments placed before the library name.
pub const DEFAULT_PIP_ARGS: &str = "install";

/// piusb configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Install directory (PIUSB_BASE_DIR)
    pub base_dir: PathBuf,
    /// Raspberry Pi firmware config (PIUSB_BOOT_CONFIG)
    pub boot_config: PathBuf,
    /// Kernel modules loaded at boot (PIUSB_MODULES_FILE)
    pub modules_file: PathBuf,
    /// Backing file of the mass-storage gadget (PIUSB_IMAGE)
    pub image: PathBuf,
    /// Size of the backing file in MiB (PIUSB_IMAGE_SIZE_MIB)
    pub image_size_mib: u64,
    /// exFAT volume label (PIUSB_LABEL)
    pub volume_label: String,
    /// Where the services mount the image partition (PIUSB_MOUNT_POINT)
    pub mount_point: PathBuf,
    /// systemd unit directory (PIUSB_UNIT_DIR)
    pub unit_dir: PathBuf,
    /// Prefix external commands with sudo when not root (PIUSB_SUDO)
    pub use_sudo: bool,
    /// pip arguments for the cloud client fallback, whitespace separated
    /// (PIUSB_PIP_ARGS), e.g. `install --break-system-packages` on Bookworm
    pub pip_args: Vec<String>,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// `.env` in the working directory is merged in first by `main`.
    pub fn load() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base_dir = get("PIUSB_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));

        let boot_config = get("PIUSB_BOOT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(default_boot_config);

        let modules_file = get("PIUSB_MODULES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODULES_FILE));

        let image = get("PIUSB_IMAGE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE));

        let image_size_mib = match get("PIUSB_IMAGE_SIZE_MIB") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(size) if size > 0 => size,
                _ => {
                    log::warn!(
                        "ignoring invalid PIUSB_IMAGE_SIZE_MIB={:?}, using {}",
                        raw,
                        DEFAULT_IMAGE_SIZE_MIB
                    );
                    DEFAULT_IMAGE_SIZE_MIB
                }
            },
            None => DEFAULT_IMAGE_SIZE_MIB,
        };

        let volume_label = get("PIUSB_LABEL").unwrap_or_else(|| DEFAULT_VOLUME_LABEL.to_string());

        let mount_point = get("PIUSB_MOUNT_POINT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_POINT));

        let unit_dir = get("PIUSB_UNIT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UNIT_DIR));

        let use_sudo = get("PIUSB_SUDO")
            .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);

        let pip_args = get("PIUSB_PIP_ARGS")
            .unwrap_or_else(|| DEFAULT_PIP_ARGS.to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Self {
            base_dir,
            boot_config,
            modules_file,
            image,
            image_size_mib,
            volume_label,
            mount_point,
            unit_dir,
            use_sudo,
            pip_args,
        }
    }

    /// Where the unit files wait to be installed.
    pub fn staging_dir(&self) -> PathBuf {
        self.base_dir.join("units")
    }

    /// JSON settings shared by the copy and upload services.
    pub fn service_config(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Hand-off directory between the copy and upload services.
    pub fn transfer_dir(&self) -> PathBuf {
        self.base_dir.join("transfer")
    }

    /// `expect` script the upload service drives scp with.
    pub fn scp_script(&self) -> PathBuf {
        self.base_dir.join("scp-copy.exp")
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  PIUSB_BASE_DIR:       {}", self.base_dir.display());
        println!("  PIUSB_BOOT_CONFIG:    {}", self.boot_config.display());
        println!("  PIUSB_MODULES_FILE:   {}", self.modules_file.display());
        println!("  PIUSB_IMAGE:          {}", self.image.display());
        println!("  PIUSB_IMAGE_SIZE_MIB: {}", self.image_size_mib);
        println!("  PIUSB_LABEL:          {}", self.volume_label);
        println!("  PIUSB_MOUNT_POINT:    {}", self.mount_point.display());
        println!("  PIUSB_UNIT_DIR:       {}", self.unit_dir.display());
        println!("  PIUSB_SUDO:           {}", self.use_sudo);
        println!("  PIUSB_PIP_ARGS:       {}", self.pip_args.join(" "));
        println!("Derived:");
        println!("  units staged in:      {}", self.staging_dir().display());
        println!("  service config:       {}", self.service_config().display());
        println!("  transfer directory:   {}", self.transfer_dir().display());
        if self.image.exists() {
            println!("  Image: PRESENT (provisioning will refuse to run)");
        } else {
            println!("  Image: NOT CREATED");
        }
    }
}

fn default_boot_config() -> PathBuf {
    if Path::new(FIRMWARE_BOOT_CONFIG).exists() {
        PathBuf::from(FIRMWARE_BOOT_CONFIG)
    } else {
        PathBuf::from(LEGACY_BOOT_CONFIG)
    }
}
