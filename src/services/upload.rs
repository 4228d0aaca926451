//! Upload service: drains batch folders from the transfer directory to
//! Dropbox and/or an SCP target, then deletes them.
//!
//! Transfer failures are logged and the batch is still deleted; the
//! service keeps no retry queue.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

use super::copy::COPYING_ACTIVE;
use super::dropbox::DropboxClient;
use super::settings::{DropboxCredentials, ServiceSettings};
use crate::process::{Cmd, CommandRunner};

/// Pause between scans of the transfer directory.
pub const SCAN_INTERVAL: Duration = Duration::from_millis(4500);
/// Polls of the copy marker before a batch is uploaded anyway.
pub const MARKER_MAX_POLLS: u32 = 30;
const MARKER_POLL: Duration = Duration::from_secs(1);

/// Batch folders waiting in `transfer_dir`, oldest name first.
pub fn batch_folders(transfer_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut folders = Vec::new();
    for entry in fs::read_dir(transfer_dir)
        .with_context(|| format!("Failed to read {}", transfer_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            folders.push(entry.path());
        }
    }
    folders.sort();
    Ok(folders)
}

/// Wait while `marker` exists. Returns false if it was still there after
/// `max_polls` polls.
pub fn wait_until_idle(marker: &Path, poll: Duration, max_polls: u32) -> bool {
    let mut polls = 0;
    while marker.is_file() {
        if polls >= max_polls {
            log::warn!("Timed out waiting for copying to finish.");
            return false;
        }
        thread::sleep(poll);
        polls += 1;
    }
    true
}

/// All files below `folder`, sorted.
pub fn files_in(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(folder).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", folder.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Dropbox path of `file` (below `folder`) under the configured root.
pub fn dropbox_path(root: &str, folder: &Path, file: &Path) -> Result<String> {
    let relative = file
        .strip_prefix(folder)
        .with_context(|| format!("{} is not below {}", file.display(), folder.display()))?;
    let relative: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    let root = root.trim_matches('/');
    let mut path = String::from("/");
    if !root.is_empty() {
        path.push_str(root);
        path.push('/');
    }
    path.push_str(&relative.join("/"));
    Ok(path)
}

/// `expect` invocation pushing the contents of `folder` to `target`.
pub fn scp_command(script: &Path, folder: &Path, target: &str) -> Result<Cmd> {
    let mut entries: Vec<PathBuf> = fs::read_dir(folder)
        .with_context(|| format!("Failed to read {}", folder.display()))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    let mut cmd = Cmd::new("expect").arg("-f").arg_path(script);
    for entry in &entries {
        cmd = cmd.arg_path(entry);
    }
    Ok(cmd.arg(target))
}

/// Upload every file of `folder`; returns how many made it.
pub async fn upload_folder(
    credentials: &DropboxCredentials,
    root: &str,
    folder: &Path,
) -> Result<usize> {
    let client = DropboxClient::connect(credentials).await?;
    let mut uploaded = 0;

    for file in files_in(folder)? {
        let destination = dropbox_path(root, folder, &file)?;
        log::info!("STARTING Dropbox upload to: {}", destination);

        let data = match tokio::fs::read(&file).await {
            Ok(data) => data,
            Err(e) => {
                log::error!("Failed to read {}: {}", file.display(), e);
                continue;
            }
        };
        match client.upload(data, &destination).await {
            Ok(meta) => {
                log::info!("FINISHED Dropbox upload: {} ({} bytes)", meta.path_display, meta.size);
                uploaded += 1;
            }
            Err(e) => log::error!("Failed to upload file {} to Dropbox: {:#}", file.display(), e),
        }
    }
    Ok(uploaded)
}

/// Paths the upload service works with.
#[derive(Debug, Clone)]
pub struct UploadPaths {
    pub transfer_dir: PathBuf,
    pub scp_script: PathBuf,
}

pub struct UploadService<'a> {
    runner: &'a dyn CommandRunner,
    paths: UploadPaths,
    settings: ServiceSettings,
    runtime: tokio::runtime::Runtime,
}

impl<'a> UploadService<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        paths: UploadPaths,
        settings: ServiceSettings,
    ) -> Result<Self> {
        // Fail at startup rather than on the first batch.
        if settings.activate_dropbox_sync {
            settings.dropbox_credentials()?;
        }
        if settings.activate_scp_sync {
            settings.scp_target()?;
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;

        fs::create_dir_all(&paths.transfer_dir)
            .with_context(|| format!("Failed to create {}", paths.transfer_dir.display()))?;

        Ok(Self {
            runner,
            paths,
            settings,
            runtime,
        })
    }

    /// Run forever. Returns only on error.
    pub fn run(&self) -> Result<()> {
        loop {
            self.process_pending()?;
            thread::sleep(SCAN_INTERVAL);
        }
    }

    /// Transfer and delete every batch currently waiting.
    pub fn process_pending(&self) -> Result<usize> {
        let folders = batch_folders(&self.paths.transfer_dir)?;
        if folders.is_empty() {
            return Ok(0);
        }

        wait_until_idle(
            &self.paths.transfer_dir.join(COPYING_ACTIVE),
            MARKER_POLL,
            MARKER_MAX_POLLS,
        );

        for folder in &folders {
            if self.settings.activate_dropbox_sync {
                self.transfer_to_dropbox(folder);
            }
            if self.settings.activate_scp_sync {
                self.transfer_via_scp(folder);
            }
            fs::remove_dir_all(folder)
                .with_context(|| format!("Failed to remove {}", folder.display()))?;
        }
        Ok(folders.len())
    }

    fn transfer_to_dropbox(&self, folder: &Path) {
        let result = self.settings.dropbox_credentials().and_then(|credentials| {
            self.runtime.block_on(upload_folder(
                &credentials,
                self.settings.dropbox_root(),
                folder,
            ))
        });
        if let Err(e) = result {
            log::error!("Dropbox transfer of {} failed: {:#}", folder.display(), e);
        }
    }

    fn transfer_via_scp(&self, folder: &Path) {
        let result = self
            .settings
            .scp_target()
            .and_then(|target| scp_command(&self.paths.scp_script, folder, target))
            .and_then(|cmd| self.runner.execute(&cmd));
        match result {
            Ok(out) if out.success() => {
                log::info!("SCP transfer successful: {}", out.stdout_trimmed())
            }
            Ok(out) => log::error!("SCP transfer failed: {}", out.stderr_trimmed()),
            Err(e) => log::error!("Failed to execute SCP transfer: {:#}", e),
        }
    }
}
