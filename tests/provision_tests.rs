//! Provisioning runs against a fake host with a scripted command runner.

mod helpers;

use helpers::{count_lines, TestHost};
use piusb::component::{self, definitions, executor};
use piusb::error::ProvisionError;
use piusb::process::ScriptedRunner;
use std::fs;
use std::os::unix::fs::PermissionsExt;

fn attaching_runner() -> ScriptedRunner {
    ScriptedRunner::new().respond("losetup -fP --show", "/dev/loop0\n")
}

// =============================================================================
// Boot config and module list
// =============================================================================

#[test]
fn test_boot_config_comments_conflict_and_adds_overlay_once() {
    let host = TestHost::new();
    helpers::write(
        &host.ctx.boot_config,
        "[cm4]\notg_mode=1\n\n[all]\narm_64bit=1\n",
    );
    let runner = ScriptedRunner::new();
    let mut session = executor::Session::default();
    let step = definitions::boot_config(&host.ctx);

    executor::execute(&host.ctx, &runner, &mut session, &step).unwrap();
    executor::execute(&host.ctx, &runner, &mut session, &step).unwrap();

    let content = host.boot_config();
    assert_eq!(count_lines(&content, "#otg_mode=1"), 1);
    assert_eq!(count_lines(&content, "otg_mode=1"), 0);
    assert_eq!(count_lines(&content, "dtoverlay=dwc2"), 1);
    assert!(content.starts_with("[cm4]\n#otg_mode=1\n"));
    assert!(runner.lines().is_empty());
}

#[test]
fn test_module_registered_once() {
    let host = TestHost::new();
    helpers::write(&host.ctx.modules_file, "i2c-dev");
    let runner = ScriptedRunner::new();
    let mut session = executor::Session::default();
    let step = definitions::modules(&host.ctx);

    executor::execute(&host.ctx, &runner, &mut session, &step).unwrap();
    executor::execute(&host.ctx, &runner, &mut session, &step).unwrap();

    assert_eq!(host.modules(), "i2c-dev\ndwc2\n");
}

#[test]
fn test_duplicate_overlay_and_module_are_collapsed() {
    let host = TestHost::new();
    helpers::write(
        &host.ctx.boot_config,
        "dtoverlay=dwc2\n[all]\ndtoverlay=dwc2\n",
    );
    helpers::write(&host.ctx.modules_file, "dwc2\ni2c-dev\ndwc2\n");
    let runner = ScriptedRunner::new();
    let mut session = executor::Session::default();

    executor::execute(&host.ctx, &runner, &mut session, &definitions::boot_config(&host.ctx)).unwrap();
    executor::execute(&host.ctx, &runner, &mut session, &definitions::modules(&host.ctx)).unwrap();

    assert_eq!(count_lines(&host.boot_config(), "dtoverlay=dwc2"), 1);
    assert_eq!(host.boot_config(), "dtoverlay=dwc2\n[all]\n");
    assert_eq!(host.modules(), "dwc2\ni2c-dev\n");
}

#[test]
fn test_missing_boot_config_is_io_error() {
    let host = TestHost::new();
    fs::remove_file(&host.ctx.boot_config).unwrap();
    let runner = attaching_runner();

    let err = component::provision(&host.ctx, &runner).unwrap_err();
    assert!(matches!(err, ProvisionError::Io { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(runner.lines().is_empty());
}

// =============================================================================
// Image guard and loop attach
// =============================================================================

#[test]
fn test_existing_image_aborts_before_any_image_command() {
    let host = TestHost::new();
    helpers::write(&host.ctx.image, "user data");
    host.stage_all_units();
    let runner = attaching_runner();

    let err = component::provision(&host.ctx, &runner).unwrap_err();

    assert!(matches!(err, ProvisionError::ImageExists(_)));
    assert_eq!(err.exit_code(), 1);
    assert!(runner.lines().is_empty(), "ran: {:?}", runner.lines());
    assert_eq!(fs::read_to_string(&host.ctx.image).unwrap(), "user data");
    // Later steps never ran.
    assert!(host.ctx.staged_unit("usbshare.service").exists());
    assert!(!host.ctx.mount_point.exists());
}

#[test]
fn test_loop_attach_failure_aborts_before_format() {
    let host = TestHost::new();
    host.stage_all_units();
    let runner = ScriptedRunner::new().fail("losetup", 1, "losetup: cannot find an unused loop device");

    let err = component::provision(&host.ctx, &runner).unwrap_err();

    assert!(matches!(err, ProvisionError::LoopAttach { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(runner.ran("dd if=/dev/zero"));
    assert!(runner.ran("sfdisk"));
    assert!(!runner.ran("mkfs.exfat"));
    assert!(!runner.ran("systemctl"));
    assert!(!host.ctx.mount_point.exists());
}

#[test]
fn test_failing_tool_propagates_its_exit_code() {
    let host = TestHost::new();
    let runner = attaching_runner()
        .fail("dpkg -s expect", 1, "")
        .fail("apt-get install -y expect", 100, "E: Unable to locate package expect");

    let err = component::provision(&host.ctx, &runner).unwrap_err();
    assert_eq!(err.exit_code(), 100);
    assert!(!runner.ran("systemctl"));
}

#[test]
fn test_pip_fallback_passes_configured_args() {
    let mut host = TestHost::new();
    host.ctx.pip_args = vec!["install".into(), "--break-system-packages".into()];
    host.stage_all_units();
    let runner = attaching_runner()
        .fail("dpkg -s python3-dropbox", 1, "")
        .fail("apt-get install -y python3-dropbox", 100, "E: Unable to locate package");

    let report = component::provision(&host.ctx, &runner).unwrap();

    assert!(runner.ran("pip3 install --break-system-packages dropbox"));
    assert_eq!(report.installed_units().len(), 3);
}

// =============================================================================
// Services
// =============================================================================

#[test]
fn test_missing_unit_does_not_stop_the_others() {
    let host = TestHost::new();
    host.stage_unit("usbshare.service");
    host.stage_unit("uploadnewfiles.service");
    let runner = attaching_runner();

    let report = component::provision(&host.ctx, &runner).unwrap();

    assert_eq!(report.missing_units(), vec!["copynewusbfiles.service"]);
    assert_eq!(
        report.installed_units(),
        vec!["usbshare.service", "uploadnewfiles.service"]
    );
    let diagnostics = report.diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert!(diagnostics[0].contains("copynewusbfiles.service"));
    assert!(runner.ran("systemctl enable uploadnewfiles.service"));
}

// =============================================================================
// End to end
// =============================================================================

#[test]
fn test_full_provisioning_run() {
    let host = TestHost::new();
    host.stage_all_units();
    let runner = attaching_runner();

    let report = component::provision(&host.ctx, &runner).unwrap();

    // Boot files
    assert_eq!(count_lines(&host.boot_config(), "dtoverlay=dwc2"), 1);
    assert_eq!(count_lines(&host.modules(), "dwc2"), 1);

    // Image
    let image = host.ctx.image.display().to_string();
    let lines = runner.lines();
    assert!(lines.contains(&format!(
        "dd if=/dev/zero of={} bs=1M count=3072 status=progress",
        image
    )));
    assert!(lines.contains(&format!("sfdisk {}", image)));
    assert!(lines.contains(&format!("losetup -fP --show {}", image)));
    assert!(lines.contains(&"mkfs.exfat -L PIUSB /dev/loop0p1".to_string()));
    assert_eq!(report.loop_device(), Some("/dev/loop0"));
    assert!(host.ctx.mount_point.is_dir());

    let sfdisk = runner
        .calls()
        .iter()
        .position(|c| c[0] == "sfdisk")
        .unwrap();
    assert_eq!(runner.inputs()[sfdisk].as_deref(), Some("type=7\n"));

    // Order: partition, attach, format
    let pos = |prefix: &str| lines.iter().position(|l| l.starts_with(prefix)).unwrap();
    assert!(pos("dd ") < pos("sfdisk"));
    assert!(pos("sfdisk") < pos("losetup"));
    assert!(pos("losetup") < pos("mkfs.exfat"));

    // Units
    for unit in &host.ctx.units {
        let installed = host.ctx.installed_unit(unit);
        assert!(installed.is_file(), "{} not installed", unit);
        assert!(!host.ctx.staged_unit(unit).exists());
        let mode = fs::metadata(&installed).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        assert!(lines.contains(&format!("systemctl enable {}", unit)));
    }
    assert!(report.diagnostics().is_empty());
    let steps: Vec<&str> = report.durations.iter().map(|(name, _)| *name).collect();
    assert_eq!(steps, vec!["boot-config", "modules", "image", "packages", "services"]);
}

#[test]
fn test_mount_point_may_already_exist() {
    let host = TestHost::new();
    fs::create_dir_all(&host.ctx.mount_point).unwrap();
    let runner = attaching_runner();
    assert!(component::provision(&host.ctx, &runner).is_ok());
}
