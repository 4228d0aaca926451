//! Component executor - interprets Op variants and performs actual operations.
//!
//! This is the single place where provisioning operations are implemented.
//! External tools run through the [`CommandRunner`]; a non-zero exit becomes
//! [`ProvisionError::CommandFailed`] carrying the tool's own exit code.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::{Component, FallbackInstall, Op, Outcome};
use crate::common::lines;
use crate::context::HostContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::process::{Cmd, CommandResult, CommandRunner};

/// State carried from one op to the next within a run.
#[derive(Debug, Default)]
pub struct Session {
    /// Device path reported by `losetup --show`.
    pub loop_device: Option<String>,
}

/// Execute all operations of a component.
pub fn execute(
    ctx: &HostContext,
    runner: &dyn CommandRunner,
    session: &mut Session,
    component: &Component,
) -> ProvisionResult<Outcome> {
    log::info!("Provisioning {}...", component.name);

    let mut outcome = Outcome::default();
    for op in &component.ops {
        execute_op(ctx, runner, session, op, &mut outcome)?;
    }
    outcome.loop_device = session.loop_device.clone();
    Ok(outcome)
}

/// Execute a single operation.
fn execute_op(
    ctx: &HostContext,
    runner: &dyn CommandRunner,
    session: &mut Session,
    op: &Op,
    outcome: &mut Outcome,
) -> ProvisionResult<()> {
    match op {
        // ─────────────────────────────────────────────────────────────────
        // Text file edits
        // ─────────────────────────────────────────────────────────────────
        Op::CommentOut { file, directive } => {
            let changed = lines::comment_out_in_file(file, directive)
                .map_err(|e| ProvisionError::io(file, e))?;
            if changed > 0 {
                log::info!("  commented out '{}' in {}", directive, file.display());
            }
        }

        Op::EnsureLine { file, line } => {
            let rewritten = lines::ensure_line_in_file(file, line)
                .map_err(|e| ProvisionError::io(file, e))?;
            if rewritten {
                log::info!("  '{}' now appears once in {}", line, file.display());
            } else {
                log::info!("  '{}' already in {}", line, file.display());
            }
        }

        // ─────────────────────────────────────────────────────────────────
        // Image operations
        // ─────────────────────────────────────────────────────────────────
        Op::RefuseExisting(path) => {
            if path.symlink_metadata().is_ok() {
                return Err(ProvisionError::ImageExists(path.clone()));
            }
        }

        Op::ZeroFill { path, size_mib } => {
            log::info!(
                "  allocating {} MiB at {} (this takes a few minutes)",
                size_mib,
                path.display()
            );
            let cmd = Cmd::new("dd")
                .arg("if=/dev/zero")
                .arg(format!("of={}", path.display()))
                .arg("bs=1M")
                .arg(format!("count={}", size_mib))
                .arg("status=progress")
                .interactive();
            run_checked(runner, &cmd)?;
        }

        Op::PartitionTable { path, type_code } => {
            let cmd = Cmd::new("sfdisk")
                .arg_path(path)
                .input(format!("type={}\n", type_code));
            run_checked(runner, &cmd)?;
        }

        Op::AttachLoop(image) => {
            let device = attach_loop(runner, image)?;
            log::info!("  attached {} as {}", image.display(), device);
            session.loop_device = Some(device);
        }

        Op::FormatExfat { label } => {
            let device = session.loop_device.as_deref().ok_or_else(|| {
                ProvisionError::Other(anyhow::anyhow!("no loop device attached to format"))
            })?;
            let partition = format!("{}p1", device);
            log::info!("  formatting {} as exFAT ({})", partition, label);
            let cmd = Cmd::new("mkfs.exfat").args(["-L", label.as_str(), partition.as_str()]);
            run_checked(runner, &cmd)?;
        }

        Op::Dir(path) => {
            fs::create_dir_all(path).map_err(|e| ProvisionError::io(path, e))?;
        }

        // ─────────────────────────────────────────────────────────────────
        // Packages
        // ─────────────────────────────────────────────────────────────────
        Op::Package(name) => {
            ensure_package(runner, name)?;
        }

        Op::PackageWithFallback(install) => {
            install_with_fallback(runner, install)?;
        }

        // ─────────────────────────────────────────────────────────────────
        // Services
        // ─────────────────────────────────────────────────────────────────
        Op::InstallUnit { name, mode } => {
            let staged = ctx.staged_unit(name);
            if !staged.is_file() {
                log::warn!(
                    "  {} not found in {}, skipping",
                    name,
                    ctx.staging_dir.display()
                );
                outcome
                    .diagnostics
                    .push(format!("{} is not staged at {}", name, staged.display()));
                outcome.missing_units.push(name.clone());
                return Ok(());
            }

            fs::create_dir_all(&ctx.unit_dir)
                .map_err(|e| ProvisionError::io(&ctx.unit_dir, e))?;
            let installed = ctx.installed_unit(name);
            move_file(&staged, &installed)?;
            fs::set_permissions(&installed, fs::Permissions::from_mode(*mode))
                .map_err(|e| ProvisionError::io(&installed, e))?;
            run_checked(runner, &Cmd::new("systemctl").args(["enable", name.as_str()]))?;

            log::info!("  installed and enabled {}", name);
            outcome.installed_units.push(name.clone());
        }
    }

    Ok(())
}

/// Run a command and turn a non-zero exit into `CommandFailed`.
fn run_checked(runner: &dyn CommandRunner, cmd: &Cmd) -> ProvisionResult<CommandResult> {
    let result = runner.execute(cmd)?;
    if !result.success() {
        return Err(ProvisionError::CommandFailed {
            command: cmd.display(),
            code: result.code(),
            stderr: result.stderr,
        });
    }
    Ok(result)
}

/// `losetup -fP --show`, with every failure mapped to `LoopAttach`.
fn attach_loop(runner: &dyn CommandRunner, image: &Path) -> ProvisionResult<String> {
    let cmd = Cmd::new("losetup").args(["-fP", "--show"]).arg_path(image);
    let attach_error = |reason: String| ProvisionError::LoopAttach {
        image: image.to_path_buf(),
        reason,
    };

    let result = runner.execute(&cmd).map_err(|e| attach_error(format!("{:#}", e)))?;
    if !result.success() {
        let stderr = result.stderr_trimmed();
        return Err(attach_error(if stderr.is_empty() {
            format!("losetup exited with code {}", result.code())
        } else {
            stderr.to_string()
        }));
    }

    let device = result.stdout_trimmed();
    if device.is_empty() {
        return Err(attach_error("losetup reported no device".to_string()));
    }
    Ok(device.to_string())
}

/// True if `dpkg` reports the package as known.
fn package_installed(runner: &dyn CommandRunner, name: &str) -> ProvisionResult<bool> {
    let result = runner.execute(&Cmd::new("dpkg").args(["-s", name]))?;
    Ok(result.success())
}

fn apt_install(name: &str) -> Cmd {
    Cmd::new("apt-get").args(["install", "-y", name])
}

/// Install `name` with apt unless it is already present.
fn ensure_package(runner: &dyn CommandRunner, name: &str) -> ProvisionResult<()> {
    if package_installed(runner, name)? {
        log::info!("  {} already installed", name);
        return Ok(());
    }
    log::info!("  installing {}", name);
    run_checked(runner, &apt_install(name))?;
    Ok(())
}

fn install_with_fallback(
    runner: &dyn CommandRunner,
    install: &FallbackInstall,
) -> ProvisionResult<()> {
    if package_installed(runner, &install.os_package)? {
        log::info!("  {} already installed", install.os_package);
        return Ok(());
    }

    log::info!("  installing {}", install.os_package);
    let result = runner.execute(&apt_install(&install.os_package))?;
    if result.success() {
        return Ok(());
    }

    // Newer releases dropped the package from the archive.
    log::warn!(
        "  {} not available from apt, installing {} with {}",
        install.os_package,
        install.library,
        install.installer
    );
    ensure_package(runner, &install.installer_package)?;
    let cmd = Cmd::new(&install.installer)
        .args(&install.installer_args)
        .arg(&install.library);
    run_checked(runner, &cmd)?;
    Ok(())
}

/// Rename, falling back to copy-and-delete across filesystems.
fn move_file(from: &Path, to: &Path) -> ProvisionResult<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(from, to).map_err(|e| ProvisionError::io(to, e))?;
            fs::remove_file(from).map_err(|e| ProvisionError::io(from, e))
        }
        Err(e) => Err(ProvisionError::io(from, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::definitions;
    use crate::process::ScriptedRunner;
    use tempfile::TempDir;

    fn setup() -> (TempDir, HostContext) {
        let dir = TempDir::new().unwrap();
        let ctx = HostContext::for_testing(dir.path());
        (dir, ctx)
    }

    #[test]
    fn test_attach_failure_is_loop_attach() {
        let runner = ScriptedRunner::new().fail("losetup", 1, "losetup: cannot find an unused loop device");
        let err = attach_loop(&runner, Path::new("/piusb.bin")).unwrap_err();
        match err {
            ProvisionError::LoopAttach { reason, .. } => {
                assert!(reason.contains("unused loop device"))
            }
            other => panic!("expected LoopAttach, got {:?}", other),
        }
    }

    #[test]
    fn test_attach_without_device_is_loop_attach() {
        let runner = ScriptedRunner::new().respond("losetup", "\n");
        let err = attach_loop(&runner, Path::new("/piusb.bin")).unwrap_err();
        assert!(matches!(err, ProvisionError::LoopAttach { .. }));
    }

    #[test]
    fn test_format_requires_attached_device() {
        let (_dir, ctx) = setup();
        let runner = ScriptedRunner::new();
        let mut session = Session::default();
        let mut outcome = Outcome::default();
        let err = execute_op(
            &ctx,
            &runner,
            &mut session,
            &Op::FormatExfat {
                label: "PIUSB".into(),
            },
            &mut outcome,
        )
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Other(_)));
        assert!(runner.lines().is_empty());
    }

    #[test]
    fn test_package_skipped_when_installed() {
        let runner = ScriptedRunner::new();
        ensure_package(&runner, "expect").unwrap();
        assert_eq!(runner.lines(), vec!["dpkg -s expect"]);
    }

    #[test]
    fn test_package_installed_when_missing() {
        let runner = ScriptedRunner::new().fail("dpkg -s expect", 1, "");
        ensure_package(&runner, "expect").unwrap();
        assert_eq!(
            runner.lines(),
            vec!["dpkg -s expect", "apt-get install -y expect"]
        );
    }

    #[test]
    fn test_apt_failure_carries_exit_code() {
        let runner = ScriptedRunner::new()
            .fail("dpkg -s", 1, "")
            .fail("apt-get", 100, "E: Unable to locate package expect");
        let err = ensure_package(&runner, "expect").unwrap_err();
        assert_eq!(err.exit_code(), 100);
    }

    #[test]
    fn test_fallback_not_used_when_apt_has_package() {
        let runner = ScriptedRunner::new().fail("dpkg -s python3-dropbox", 1, "");
        let (_dir, ctx) = setup();
        let component = definitions::packages(&ctx);
        let Op::PackageWithFallback(install) = &component.ops[1] else {
            panic!("expected fallback install op");
        };
        install_with_fallback(&runner, install).unwrap();
        assert!(runner.ran("apt-get install -y python3-dropbox"));
        assert!(!runner.ran("pip3"));
    }

    #[test]
    fn test_fallback_uses_pip_when_apt_fails() {
        let runner = ScriptedRunner::new()
            .fail("dpkg -s", 1, "")
            .fail("apt-get install -y python3-dropbox", 100, "E: Unable to locate package");
        let (_dir, ctx) = setup();
        let component = definitions::packages(&ctx);
        let Op::PackageWithFallback(install) = &component.ops[1] else {
            panic!("expected fallback install op");
        };
        install_with_fallback(&runner, install).unwrap();
        assert_eq!(
            runner.lines(),
            vec![
                "dpkg -s python3-dropbox",
                "apt-get install -y python3-dropbox",
                "dpkg -s python3-pip",
                "apt-get install -y python3-pip",
                "pip3 install dropbox",
            ]
        );
    }

    #[test]
    fn test_missing_unit_is_diagnostic() {
        let (_dir, ctx) = setup();
        let runner = ScriptedRunner::new();
        let mut session = Session::default();
        let outcome = execute(&ctx, &runner, &mut session, &definitions::services(&ctx)).unwrap();
        assert_eq!(outcome.missing_units.len(), 3);
        assert!(!outcome.complete());
        assert!(runner.lines().is_empty());
    }

    #[test]
    fn test_install_unit_moves_and_enables() {
        let (_dir, ctx) = setup();
        fs::create_dir_all(&ctx.staging_dir).unwrap();
        fs::write(ctx.staged_unit("usbshare.service"), "[Unit]\n").unwrap();

        let runner = ScriptedRunner::new();
        let mut session = Session::default();
        let mut outcome = Outcome::default();
        execute_op(
            &ctx,
            &runner,
            &mut session,
            &Op::InstallUnit {
                name: "usbshare.service".into(),
                mode: 0o644,
            },
            &mut outcome,
        )
        .unwrap();

        let installed = ctx.installed_unit("usbshare.service");
        assert!(installed.is_file());
        assert!(!ctx.staged_unit("usbshare.service").exists());
        let mode = fs::metadata(&installed).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        assert_eq!(runner.lines(), vec!["systemctl enable usbshare.service"]);
        assert_eq!(outcome.installed_units, vec!["usbshare.service"]);
    }
}
