//! Failure taxonomy for the provisioning run.
//!
//! Every variant aborts the run. Missing staged unit files are not errors;
//! they are reported as diagnostics on the step outcome instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The backing image is already there; creating it again would wipe
    /// whatever the USB host stored on it.
    #[error("image {} already exists, refusing to overwrite it", .0.display())]
    ImageExists(PathBuf),

    #[error("failed to attach {} as a loop device: {reason}", .image.display())]
    LoopAttach { image: PathBuf, reason: String },

    #[error("'{command}' failed (exit code {code}){}", stderr_suffix(.stderr))]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{}", stderr)
    }
}

impl ProvisionError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this failure.
    ///
    /// The two guard failures exit 1. A failing external command hands its
    /// own exit code through (signals and out-of-range codes become 1).
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ImageExists(_) | Self::LoopAttach { .. } => 1,
            Self::CommandFailed { code, .. } => u8::try_from(*code)
                .ok()
                .filter(|c| *c != 0)
                .unwrap_or(1),
            Self::Io { .. } | Self::Other(_) => 1,
        }
    }
}

pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;
