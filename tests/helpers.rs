//! Shared test utilities for piusb tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

use piusb::context::HostContext;

/// A fake host: a temp directory laid out like the real filesystem and a
/// context pointing into it.
pub struct TestHost {
    /// Temporary directory (kept alive for lifetime of TestHost)
    pub _temp_dir: TempDir,
    pub ctx: HostContext,
}

impl TestHost {
    /// Host with empty boot config and module list, nothing staged.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = HostContext::for_testing(temp_dir.path());

        write(&ctx.boot_config, "");
        write(&ctx.modules_file, "");

        Self {
            _temp_dir: temp_dir,
            ctx,
        }
    }

    pub fn root(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Stage every unit the service step installs.
    pub fn stage_all_units(&self) {
        for unit in self.ctx.units.clone() {
            self.stage_unit(&unit);
        }
    }

    pub fn stage_unit(&self, name: &str) {
        write(
            &self.ctx.staged_unit(name),
            &format!("[Unit]\nDescription={}\n", name),
        );
    }

    pub fn boot_config(&self) -> String {
        fs::read_to_string(&self.ctx.boot_config).expect("Failed to read boot config")
    }

    pub fn modules(&self) -> String {
        fs::read_to_string(&self.ctx.modules_file).expect("Failed to read module list")
    }
}

/// Write a file, creating parent directories.
pub fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(path, content).expect("Failed to write file");
}

/// Set a file's mtime.
pub fn set_mtime(path: &Path, mtime: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(mtime))
        .expect("Failed to set mtime");
}

pub fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Number of lines exactly equal to `line`.
pub fn count_lines(content: &str, line: &str) -> usize {
    content.lines().filter(|l| l.trim() == line).count()
}
