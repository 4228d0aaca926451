//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `provision` - Configure the host and install the services
//! - `preflight` - Check the host without changing it
//! - `show` - Display configuration and status
//! - `service` - Run the gadget, copy and upload services

mod preflight;
pub mod provision;
pub mod service;
pub mod show;

pub use preflight::cmd_preflight;
pub use provision::cmd_provision;
pub use service::{cmd_copy, cmd_gadget, cmd_upload};
pub use show::cmd_show;
