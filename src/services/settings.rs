//! `config.json` shared by the copy and upload services.
//!
//! Key names match the JSON the operator already maintains. Settings that
//! only one service needs are optional here and validated by the accessor
//! that service calls, so the other service still starts.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSettings {
    /// Seconds between copy cycles.
    #[serde(rename = "CopyCheckCycleTime")]
    pub copy_check_cycle_time: Option<f64>,
    /// Seconds between prune passes on the USB side.
    #[serde(rename = "DeleteOnUSBCycleTime")]
    pub delete_on_usb_cycle_time: Option<f64>,
    /// Files kept on the USB side after a prune pass.
    #[serde(rename = "KeepMaxFilesOnUSB")]
    pub keep_max_files_on_usb: Option<usize>,

    #[serde(rename = "ActivateDropboxSync", default)]
    pub activate_dropbox_sync: bool,
    #[serde(rename = "ActivateScpSync", default)]
    pub activate_scp_sync: bool,

    #[serde(rename = "ScpPath")]
    pub scp_path: Option<String>,
    #[serde(rename = "DropBoxPath")]
    pub dropbox_path: Option<String>,
    #[serde(rename = "DropBoxRefreshToken")]
    pub dropbox_refresh_token: Option<String>,
    #[serde(rename = "DropboxAppKey")]
    pub dropbox_app_key: Option<String>,
    #[serde(rename = "DropboxAppSecret")]
    pub dropbox_app_secret: Option<String>,
}

/// Validated settings of the copy service.
#[derive(Debug, Clone, PartialEq)]
pub struct CopySettings {
    pub check_interval: Duration,
    pub delete_interval: Duration,
    pub keep_max_files: usize,
}

impl CopySettings {
    /// Copy cycles between two prune passes.
    pub fn cycles_per_prune(&self) -> f64 {
        self.delete_interval.as_secs_f64() / self.check_interval.as_secs_f64()
    }
}

/// Credentials for the Dropbox refresh-token flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropboxCredentials {
    pub refresh_token: String,
    pub app_key: String,
    pub app_secret: String,
}

impl ServiceSettings {
    /// Load and parse `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Config file not found: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to decode config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn copy_settings(&self) -> Result<CopySettings> {
        let check = required(self.copy_check_cycle_time, "CopyCheckCycleTime")?;
        let delete = required(self.delete_on_usb_cycle_time, "DeleteOnUSBCycleTime")?;
        let keep_max_files = required(self.keep_max_files_on_usb, "KeepMaxFilesOnUSB")?;
        Ok(CopySettings {
            check_interval: positive_seconds(check, "CopyCheckCycleTime")?,
            delete_interval: positive_seconds(delete, "DeleteOnUSBCycleTime")?,
            keep_max_files,
        })
    }

    pub fn dropbox_credentials(&self) -> Result<DropboxCredentials> {
        Ok(DropboxCredentials {
            refresh_token: required_str(&self.dropbox_refresh_token, "DropBoxRefreshToken")?,
            app_key: required_str(&self.dropbox_app_key, "DropboxAppKey")?,
            app_secret: required_str(&self.dropbox_app_secret, "DropboxAppSecret")?,
        })
    }

    /// Folder in Dropbox that batches are uploaded below.
    pub fn dropbox_root(&self) -> &str {
        self.dropbox_path.as_deref().unwrap_or("")
    }

    pub fn scp_target(&self) -> Result<&str> {
        match self.scp_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Ok(path),
            _ => bail!("ScpPath is required when ActivateScpSync is enabled"),
        }
    }
}

fn required<T: Copy>(value: Option<T>, key: &str) -> Result<T> {
    value.with_context(|| format!("{} is missing from config.json", key))
}

fn required_str(value: &Option<String>, key: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => bail!("{} is required when ActivateDropboxSync is enabled", key),
    }
}

fn positive_seconds(secs: f64, key: &str) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        bail!("{} must be a positive number of seconds (got {})", key, secs);
    }
    Ok(Duration::from_secs_f64(secs))
}
