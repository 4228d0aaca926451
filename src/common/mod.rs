//! Shared utilities across piusb modules.

pub mod lines;
