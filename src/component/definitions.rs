//! Component definitions - WHAT gets provisioned.
//!
//! Each function returns one step as data. The executor does the work.

use super::{Component, FallbackInstall, Op, Phase};
use crate::context::HostContext;

/// Raspberry Pi OS enables host-mode OTG on some boards with this line,
/// which keeps the dwc2 gadget driver from binding.
pub const CONFLICTING_DIRECTIVE: &str = "otg_mode=1";
/// Device-tree overlay that switches the USB controller to dwc2.
pub const OVERLAY_DIRECTIVE: &str = "dtoverlay=dwc2";
/// Kernel module that must load at boot.
pub const GADGET_MODULE: &str = "dwc2";

/// MBR partition type 0x07 (HPFS/NTFS/exFAT).
pub const PARTITION_TYPE: &str = "7";
/// Provides mkfs.exfat.
pub const EXFAT_PACKAGE: &str = "exfatprogs";

/// Drives scp for the upload service.
pub const AUTOMATION_PACKAGE: &str = "expect";
pub const CLOUD_CLIENT_PACKAGE: &str = "python3-dropbox";
pub const PIP_PACKAGE: &str = "python3-pip";
pub const PIP: &str = "pip3";
pub const CLOUD_CLIENT_LIBRARY: &str = "dropbox";

/// rw-r--r--
pub const UNIT_MODE: u32 = 0o644;

/// Boot config: neutralize the conflicting OTG setting, enable the overlay.
pub fn boot_config(ctx: &HostContext) -> Component {
    Component {
        name: "boot-config",
        phase: Phase::BootConfig,
        ops: vec![
            Op::CommentOut {
                file: ctx.boot_config.clone(),
                directive: CONFLICTING_DIRECTIVE.to_string(),
            },
            Op::EnsureLine {
                file: ctx.boot_config.clone(),
                line: OVERLAY_DIRECTIVE.to_string(),
            },
        ],
    }
}

/// Module list: load dwc2 at boot.
pub fn modules(ctx: &HostContext) -> Component {
    Component {
        name: "modules",
        phase: Phase::Modules,
        ops: vec![Op::EnsureLine {
            file: ctx.modules_file.clone(),
            line: GADGET_MODULE.to_string(),
        }],
    }
}

/// Backing image: create, partition, attach and format it.
pub fn image(ctx: &HostContext) -> Component {
    Component {
        name: "image",
        phase: Phase::Image,
        ops: vec![
            Op::RefuseExisting(ctx.image.clone()),
            Op::ZeroFill {
                path: ctx.image.clone(),
                size_mib: ctx.image_size_mib,
            },
            Op::PartitionTable {
                path: ctx.image.clone(),
                type_code: PARTITION_TYPE.to_string(),
            },
            Op::AttachLoop(ctx.image.clone()),
            Op::Package(EXFAT_PACKAGE.to_string()),
            Op::FormatExfat {
                label: ctx.volume_label.clone(),
            },
            Op::Dir(ctx.mount_point.clone()),
        ],
    }
}

/// Packages: tools the services need at runtime.
pub fn packages(ctx: &HostContext) -> Component {
    Component {
        name: "packages",
        phase: Phase::Packages,
        ops: vec![
            Op::Package(AUTOMATION_PACKAGE.to_string()),
            Op::PackageWithFallback(FallbackInstall {
                os_package: CLOUD_CLIENT_PACKAGE.to_string(),
                installer_package: PIP_PACKAGE.to_string(),
                installer: PIP.to_string(),
                installer_args: ctx.pip_args.clone(),
                library: CLOUD_CLIENT_LIBRARY.to_string(),
            }),
        ],
    }
}

/// Services: move the staged units into place and enable them.
pub fn services(ctx: &HostContext) -> Component {
    Component {
        name: "services",
        phase: Phase::Services,
        ops: ctx
            .units
            .iter()
            .map(|name| Op::InstallUnit {
                name: name.clone(),
                mode: UNIT_MODE,
            })
            .collect(),
    }
}

/// Every step, in phase order.
pub fn all(ctx: &HostContext) -> Vec<Component> {
    let mut components = vec![
        boot_config(ctx),
        modules(ctx),
        image(ctx),
        packages(ctx),
        services(ctx),
    ];
    components.sort_by_key(|c| c.phase);
    components
}
