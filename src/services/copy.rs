//! Copy service: pulls new files out of the USB image into the transfer
//! directory and keeps the USB side from filling up.
//!
//! The USB host writes into the backing image while it is exposed through
//! the gadget. Every cycle the image's mtime is compared with the last one
//! seen; when it moved, the partition is mounted and everything changed
//! since then is copied into `transfer/<mtime>/`. The `copyingActive`
//! marker tells the upload service a batch is still being written.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use super::blockdev;
use super::settings::CopySettings;
use crate::process::CommandRunner;

/// Marker file present in the transfer directory while a batch is copied.
pub const COPYING_ACTIVE: &str = "copyingActive";

/// Directories descended into per level when looking for new files.
/// Dashcams and cameras write into the newest folder, so older ones are
/// not rescanned.
pub const NEWEST_DIR_COUNT: usize = 2;

/// A file found on the USB side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
}

fn ctime(meta: &fs::Metadata) -> SystemTime {
    UNIX_EPOCH + Duration::new(meta.ctime().max(0) as u64, meta.ctime_nsec().max(0) as u32)
}

/// Latest of mtime and ctime (a copy onto FAT can keep an old mtime).
fn changed_at(meta: &fs::Metadata) -> Result<SystemTime> {
    Ok(meta.modified()?.max(ctime(meta)))
}

/// Files below `dir` changed after `since`.
///
/// Files at every visited level are checked; below each level only the
/// `newest_dir_count` most recently modified directories are visited.
pub fn files_since(dir: &Path, since: SystemTime, newest_dir_count: usize) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();

    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::metadata(&path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if meta.is_file() {
            if changed_at(&meta)? > since {
                files.push(path);
            }
        } else if meta.is_dir() {
            dirs.push((meta.modified()?, path));
        }
    }
    files.sort();

    dirs.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, sub) in dirs.into_iter().take(newest_dir_count) {
        files.extend(files_since(&sub, since, newest_dir_count)?);
    }
    Ok(files)
}

/// Every file below `root`, removing directories that are (or become)
/// empty along the way. `root` itself is kept.
pub fn collect_files_prune_empty(root: &Path) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let path = entry.path();
        if entry.file_type().is_file() {
            let modified = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", path.display()))?
                .modified()?;
            files.push(FileEntry {
                path: path.to_path_buf(),
                modified,
            });
        } else if entry.file_type().is_dir() && is_empty_dir(path)? {
            log::info!("Deleting empty directory: {}", path.display());
            fs::remove_dir(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    Ok(files)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// The oldest entries beyond `keep`, oldest first.
pub fn surplus(mut entries: Vec<FileEntry>, keep: usize) -> Vec<FileEntry> {
    if entries.len() <= keep {
        return Vec::new();
    }
    entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    let excess = entries.len() - keep;
    entries.truncate(excess);
    entries
}

/// Copy `file` (below `base`) to the same relative place below
/// `dest_base`, keeping its mtime.
pub fn copy_preserving(base: &Path, file: &Path, dest_base: &Path) -> Result<PathBuf> {
    let relative = file
        .strip_prefix(base)
        .with_context(|| format!("{} is not below {}", file.display(), base.display()))?;
    let dest = dest_base.join(relative);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    log::info!("Copy {} to {}", file.display(), dest.display());
    fs::copy(file, &dest)
        .with_context(|| format!("Failed to copy {} to {}", file.display(), dest.display()))?;

    let modified = fs::metadata(file)?.modified()?;
    fs::File::options()
        .write(true)
        .open(&dest)
        .and_then(|f| f.set_modified(modified))
        .with_context(|| format!("Failed to set mtime of {}", dest.display()))?;
    Ok(dest)
}

/// Batch folder name for an image mtime: whole seconds since the epoch.
pub fn batch_name(mtime: SystemTime) -> String {
    mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}

fn image_mtime(image: &Path) -> Result<SystemTime> {
    Ok(fs::metadata(image)
        .with_context(|| format!("Failed to stat {}", image.display()))?
        .modified()?)
}

/// Paths the copy service works with.
#[derive(Debug, Clone)]
pub struct CopyPaths {
    pub image: PathBuf,
    pub mount_point: PathBuf,
    pub transfer_dir: PathBuf,
}

impl CopyPaths {
    pub fn marker(&self) -> PathBuf {
        self.transfer_dir.join(COPYING_ACTIVE)
    }
}

pub struct CopyService<'a> {
    runner: &'a dyn CommandRunner,
    paths: CopyPaths,
    settings: CopySettings,
    partition: String,
    last_seen: SystemTime,
    cycles: u64,
}

impl<'a> CopyService<'a> {
    /// Resolve the loop device and remember the image's current mtime, so
    /// only writes made after startup are picked up.
    pub fn new(
        runner: &'a dyn CommandRunner,
        paths: CopyPaths,
        settings: CopySettings,
    ) -> Result<Self> {
        let last_seen = image_mtime(&paths.image)?;
        let device = blockdev::resolve_loop_device(runner, &paths.image)?;
        let partition = blockdev::partition(&device, 1);
        log::info!("Loop Device: {}", partition);

        Ok(Self {
            runner,
            paths,
            settings,
            partition,
            last_seen,
            cycles: 0,
        })
    }

    /// Run forever. Returns only on error.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.prune_if_due()?;
            self.copy_new_files()?;
            thread::sleep(self.settings.check_interval);
        }
    }

    /// Mount, run `f` against the mount point, unmount even if `f` failed.
    fn with_mounted<T>(&self, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        blockdev::mount_exfat(self.runner, &self.partition, &self.paths.mount_point)?;
        let result = f(&self.paths.mount_point);
        let unmounted = blockdev::unmount(self.runner, &self.paths.mount_point);
        let value = result?;
        unmounted?;
        Ok(value)
    }

    /// Every `DeleteOnUSBCycleTime / CopyCheckCycleTime` cycles, delete the
    /// oldest files beyond `KeepMaxFilesOnUSB`.
    pub fn prune_if_due(&mut self) -> Result<()> {
        self.cycles += 1;
        if (self.cycles as f64) <= self.settings.cycles_per_prune() {
            return Ok(());
        }
        log::info!("Perform usb deletion check. Counter: {}", self.cycles);

        let keep = self.settings.keep_max_files;
        self.with_mounted(|root| {
            let entries = collect_files_prune_empty(root)?;
            let doomed = surplus(entries, keep);
            log::info!("Files over limit: {}", doomed.len());
            for entry in doomed {
                match fs::remove_file(&entry.path) {
                    Ok(()) => log::info!("Deleted file: {}", entry.path.display()),
                    Err(e) => log::error!("Failed to delete file {}: {}", entry.path.display(), e),
                }
            }
            Ok(())
        })?;

        self.cycles = 0;
        Ok(())
    }

    /// Copy everything changed since the last seen image mtime.
    pub fn copy_new_files(&mut self) -> Result<()> {
        let current = image_mtime(&self.paths.image)?;
        if current <= self.last_seen {
            return Ok(());
        }

        let since = self.last_seen;
        let dest = self.paths.transfer_dir.join(batch_name(current));
        let marker = self.paths.marker();

        self.with_mounted(|root| {
            let new_files = files_since(root, since, NEWEST_DIR_COUNT)?;

            fs::create_dir_all(&self.paths.transfer_dir)?;
            if marker.is_file() {
                log::warn!("{} already exists. Removing it to continue.", marker.display());
                fs::remove_file(&marker)?;
            }
            fs::File::create(&marker)
                .with_context(|| format!("Failed to create {}", marker.display()))?;

            let copied = new_files
                .iter()
                .try_for_each(|file| copy_preserving(root, file, &dest).map(|_| ()));

            if marker.is_file() {
                fs::remove_file(&marker)?;
            }
            copied
        })?;

        // Unmounting can touch the image again.
        self.last_seen = image_mtime(&self.paths.image)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path, mtime: SystemTime) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"x").unwrap();
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_surplus_picks_oldest() {
        let entries = vec![
            FileEntry { path: "c".into(), modified: at(30) },
            FileEntry { path: "a".into(), modified: at(10) },
            FileEntry { path: "b".into(), modified: at(20) },
        ];
        let doomed = surplus(entries, 1);
        let names: Vec<_> = doomed.iter().map(|e| e.path.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn test_surplus_within_limit_is_empty() {
        let entries = vec![FileEntry { path: "a".into(), modified: at(10) }];
        assert!(surplus(entries, 5).is_empty());
    }

    #[test]
    fn test_collect_prunes_empty_dirs_but_keeps_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("empty/nested")).unwrap();
        touch(&root.join("DCIM/100/img.jpg"), at(100));

        let files = collect_files_prune_empty(root).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].modified, at(100));
        assert!(!root.join("empty").exists());
        assert!(root.join("DCIM/100").is_dir());
        assert!(root.exists());
    }

    #[test]
    fn test_files_since_skips_old_dirs_beyond_newest_two() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        // ctime is always "now", so `since` must be in the future for the
        // old files to be excluded; use directory choice instead.
        touch(&root.join("d1/a.mp4"), at(100));
        touch(&root.join("d2/b.mp4"), at(100));
        touch(&root.join("d3/c.mp4"), at(100));
        for (name, secs) in [("d1", 1000), ("d2", 3000), ("d3", 2000)] {
            fs::File::open(root.join(name))
                .unwrap()
                .set_modified(at(secs))
                .unwrap();
        }

        let files = files_since(root, at(0), NEWEST_DIR_COUNT).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.mp4", "c.mp4"]);
    }

    #[test]
    fn test_files_since_excludes_unchanged() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("old.mp4"), at(100));
        let later = SystemTime::now() + Duration::from_secs(3600);
        assert!(files_since(dir.path(), later, NEWEST_DIR_COUNT).unwrap().is_empty());
    }

    #[test]
    fn test_copy_preserving_keeps_structure_and_mtime() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let file = src.path().join("TeslaCam/Recent/front.mp4");
        touch(&file, at(12345));

        let dest = copy_preserving(src.path(), &file, &dst.path().join("1700000000")).unwrap();
        assert_eq!(dest, dst.path().join("1700000000/TeslaCam/Recent/front.mp4"));
        assert_eq!(fs::metadata(&dest).unwrap().modified().unwrap(), at(12345));
    }

    #[test]
    fn test_batch_name_is_whole_seconds() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_750);
        assert_eq!(batch_name(t), "1700000000");
    }
}
