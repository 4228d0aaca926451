//! Loop device and mount plumbing for the services.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::process::{Cmd, CommandRunner};

/// Time the kernel gets after mount/umount before files are touched.
const SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct LosetupList {
    #[serde(default)]
    loopdevices: Vec<LoopDevice>,
}

/// One entry of `losetup -l -J`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoopDevice {
    pub name: String,
    #[serde(rename = "back-file")]
    pub back_file: Option<String>,
}

/// Parse `losetup -l -J` output. No attached devices prints nothing.
pub fn parse_loop_devices(json: &str) -> Result<Vec<LoopDevice>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let list: LosetupList =
        serde_json::from_str(json).context("Failed to parse losetup JSON output")?;
    Ok(list.loopdevices)
}

/// Device whose backing file is `image`, if any.
pub fn find_attached<'a>(devices: &'a [LoopDevice], image: &Path) -> Option<&'a str> {
    devices
        .iter()
        .find(|d| d.back_file.as_deref().map(Path::new) == Some(image))
        .map(|d| d.name.as_str())
}

/// Reuse the loop device already backed by `image`, or attach a new one.
pub fn resolve_loop_device(runner: &dyn CommandRunner, image: &Path) -> Result<String> {
    let listing = runner.run(&Cmd::new("losetup").args(["-l", "-J"]))?;
    let devices = parse_loop_devices(&listing.stdout)?;
    if let Some(name) = find_attached(&devices, image) {
        return Ok(name.to_string());
    }

    let attach = Cmd::new("losetup")
        .args(["-fP", "--show"])
        .arg_path(image)
        .error_msg(format!("Failed to set up loop device for {}", image.display()));
    let result = runner.run(&attach)?;
    let device = result.stdout_trimmed();
    if device.is_empty() {
        bail!("losetup reported no device for {}", image.display());
    }
    Ok(device.to_string())
}

/// Partition `n` of a partition-scanned loop device.
pub fn partition(device: &str, n: u32) -> String {
    format!("{}p{}", device, n)
}

pub fn mount_exfat(runner: &dyn CommandRunner, device: &str, dir: &Path) -> Result<()> {
    let cmd = Cmd::new("mount")
        .args(["-t", "exfat", device])
        .arg_path(dir)
        .error_msg(format!("Failed to mount {} at {}", device, dir.display()));
    runner.run(&cmd)?;
    thread::sleep(SETTLE);
    Ok(())
}

pub fn unmount(runner: &dyn CommandRunner, dir: &Path) -> Result<()> {
    let cmd = Cmd::new("umount")
        .arg("-f")
        .arg_path(dir)
        .error_msg(format!("Failed to unmount {}", dir.display()));
    runner.run(&cmd)?;
    thread::sleep(SETTLE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ScriptedRunner;

    const LISTING: &str = r#"{
       "loopdevices": [
          {"name":"/dev/loop0", "sizelimit":0, "offset":0, "autoclear":false, "ro":false, "back-file":"/var/lib/snap.img", "dio":false, "log-sec":512},
          {"name":"/dev/loop1", "sizelimit":0, "offset":0, "autoclear":false, "ro":false, "back-file":"/piusb.bin", "dio":false, "log-sec":512}
       ]
    }"#;

    #[test]
    fn test_find_attached_matches_backing_file() {
        let devices = parse_loop_devices(LISTING).unwrap();
        assert_eq!(find_attached(&devices, Path::new("/piusb.bin")), Some("/dev/loop1"));
        assert_eq!(find_attached(&devices, Path::new("/other.bin")), None);
    }

    #[test]
    fn test_empty_listing() {
        assert!(parse_loop_devices("").unwrap().is_empty());
        assert!(parse_loop_devices("{}").unwrap().is_empty());
    }

    #[test]
    fn test_resolve_reuses_attached_device() {
        let runner = ScriptedRunner::new().respond("losetup -l -J", LISTING);
        let device = resolve_loop_device(&runner, Path::new("/piusb.bin")).unwrap();
        assert_eq!(device, "/dev/loop1");
        assert!(!runner.ran("losetup -fP"));
    }

    #[test]
    fn test_resolve_attaches_when_missing() {
        let runner = ScriptedRunner::new()
            .respond("losetup -l -J", "")
            .respond("losetup -fP --show", "/dev/loop4\n");
        let device = resolve_loop_device(&runner, Path::new("/piusb.bin")).unwrap();
        assert_eq!(device, "/dev/loop4");
        assert_eq!(partition(&device, 1), "/dev/loop4p1");
    }

    #[test]
    fn test_resolve_attach_failure() {
        let runner = ScriptedRunner::new()
            .respond("losetup -l -J", "")
            .fail("losetup -fP", 1, "losetup: /piusb.bin: failed to set up loop device");
        let err = resolve_loop_device(&runner, Path::new("/piusb.bin")).unwrap_err();
        assert!(err.to_string().contains("Failed to set up loop device"));
    }
}
