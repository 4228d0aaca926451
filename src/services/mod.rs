//! The three long-running services the provisioner installs.
//!
//! - `gadget` - exposes the backing image over USB (usbshare.service)
//! - `copy` - copies new files out of the image (copynewusbfiles.service)
//! - `upload` - ships copied batches to Dropbox/SCP (uploadnewfiles.service)

pub mod blockdev;
pub mod copy;
pub mod dropbox;
pub mod gadget;
pub mod settings;
pub mod upload;

pub use settings::ServiceSettings;
