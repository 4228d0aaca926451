//! piusb library exports.
//!
//! The binary is a thin clap layer over these modules; integration tests
//! drive them directly.

pub mod commands;
pub mod common;
pub mod component;
pub mod config;
pub mod context;
pub mod error;
pub mod preflight;
pub mod process;
pub mod services;
pub mod timing;

/// True when running with an effective uid of 0.
pub fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}
