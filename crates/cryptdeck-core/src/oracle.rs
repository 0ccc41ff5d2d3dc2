//! Lifecycle classification for a single volume.

use crate::tables::LiveMountSet;
use std::fmt;
use std::path::Path;

/// Where a volume sits in its lifecycle, ordered from least to most active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VolumeState {
    /// Backing device is not present.
    Disconnected,
    /// Backing device present, container locked.
    Connected,
    /// Mapped device exists but is not mounted.
    Unlocked,
    /// Mapped device appears in the live mount list.
    Mounted,
}

impl VolumeState {
    pub fn label(self) -> &'static str {
        match self {
            VolumeState::Disconnected => "disconnected",
            VolumeState::Connected => "connected",
            VolumeState::Unlocked => "unlocked",
            VolumeState::Mounted => "mounted",
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classifies volumes against the filesystem and a live mount snapshot.
///
/// Nothing is cached: each call reflects the filesystem at that instant and
/// the mount list as of the snapshot it was built from.
#[derive(Debug, Clone, Copy)]
pub struct StateOracle<'a> {
    mapper_prefix: &'a str,
    live_mounts: &'a LiveMountSet,
}

impl<'a> StateOracle<'a> {
    pub fn new(mapper_prefix: &'a str, live_mounts: &'a LiveMountSet) -> Self {
        Self {
            mapper_prefix,
            live_mounts,
        }
    }

    /// Mapped device path for `name` (`/dev/mapper/<name>` by default).
    pub fn mapped_path(&self, name: &str) -> String {
        mapped_path(self.mapper_prefix, name)
    }

    /// Derive the state of the volume `name` backed by `backing_device`.
    ///
    /// Each stage is only reached through the previous one, so `Mounted`
    /// always implies the mapped node and the backing device both exist.
    pub fn state(&self, backing_device: &Path, name: &str) -> VolumeState {
        if !backing_device.exists() {
            return VolumeState::Disconnected;
        }

        let mapped = self.mapped_path(name);
        if !Path::new(&mapped).exists() {
            return VolumeState::Connected;
        }

        if self.live_mounts.contains(&mapped) {
            VolumeState::Mounted
        } else {
            VolumeState::Unlocked
        }
    }
}

pub(crate) fn mapped_path(mapper_prefix: &str, name: &str) -> String {
    format!("{mapper_prefix}{name}")
}
