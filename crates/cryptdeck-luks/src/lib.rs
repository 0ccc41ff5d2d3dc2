#![forbid(unsafe_code)]

//! Process-backed volume operations.
//!
//! Integrates with the host via:
//! - `cryptsetup` (luksOpen/luksClose)
//! - `mount` / `umount`
//! - the sysfs `device/delete` trigger for ejecting a disk

mod command;
mod system;

pub use system::SystemVolumeOps;
