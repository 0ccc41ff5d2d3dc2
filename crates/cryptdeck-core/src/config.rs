//! Configuration model: where the system tables live, how device paths are
//! shaped, and which privileged tools carry out transitions.

use crate::error::{CryptdeckError, CryptdeckResult};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cryptdeck.toml";
pub const CONFIG_PATH_ENV: &str = "CRYPTDECK_CONFIG";

/// Locations of the three system tables the engine reads on every refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablesCfg {
    #[serde(default = "default_volume_table")]
    pub volume_table: PathBuf,

    #[serde(default = "default_mount_table")]
    pub mount_table: PathBuf,

    #[serde(default = "default_live_mounts")]
    pub live_mounts: PathBuf,
}

fn default_volume_table() -> PathBuf {
    PathBuf::from("/etc/crypttab")
}

fn default_mount_table() -> PathBuf {
    PathBuf::from("/etc/fstab")
}

fn default_live_mounts() -> PathBuf {
    PathBuf::from("/proc/mounts")
}

impl Default for TablesCfg {
    fn default() -> Self {
        Self {
            volume_table: default_volume_table(),
            mount_table: default_mount_table(),
            live_mounts: default_live_mounts(),
        }
    }
}

/// Device-path conventions used for state checks and physical removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicesCfg {
    /// Prepended verbatim to a volume name to form its mapped path.
    #[serde(default = "default_mapper_prefix")]
    pub mapper_prefix: String,

    /// Canonical backing devices must live directly under this root to be ejected.
    #[serde(default = "default_device_root")]
    pub device_root: String,

    #[serde(default = "default_sysfs_block_root")]
    pub sysfs_block_root: PathBuf,

    /// Root of the `by-uuid` / `by-label` symlink farms.
    #[serde(default = "default_disk_by_root")]
    pub disk_by_root: PathBuf,
}

fn default_mapper_prefix() -> String {
    "/dev/mapper/".to_string()
}

fn default_device_root() -> String {
    "/dev/".to_string()
}

fn default_sysfs_block_root() -> PathBuf {
    PathBuf::from("/sys/block/")
}

fn default_disk_by_root() -> PathBuf {
    PathBuf::from("/dev/disk")
}

impl Default for DevicesCfg {
    fn default() -> Self {
        Self {
            mapper_prefix: default_mapper_prefix(),
            device_root: default_device_root(),
            sysfs_block_root: default_sysfs_block_root(),
            disk_by_root: default_disk_by_root(),
        }
    }
}

/// External programs invoked for transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsCfg {
    /// Prefix for every privileged invocation; blank runs tools directly.
    #[serde(default = "default_privilege_wrapper")]
    pub privilege_wrapper: String,

    #[serde(default = "default_cryptsetup")]
    pub cryptsetup: PathBuf,

    #[serde(default = "default_mount")]
    pub mount: PathBuf,

    #[serde(default = "default_unmount")]
    pub unmount: PathBuf,

    #[serde(default = "default_shell")]
    pub shell: PathBuf,

    /// Passed to `cryptsetup -T`.
    #[serde(default = "default_unlock_tries")]
    pub unlock_tries: u32,
}

fn default_privilege_wrapper() -> String {
    "/usr/bin/sudo".to_string()
}

fn default_cryptsetup() -> PathBuf {
    PathBuf::from("/sbin/cryptsetup")
}

fn default_mount() -> PathBuf {
    PathBuf::from("/bin/mount")
}

fn default_unmount() -> PathBuf {
    PathBuf::from("/bin/umount")
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/bash")
}

fn default_unlock_tries() -> u32 {
    1
}

impl Default for ToolsCfg {
    fn default() -> Self {
        Self {
            privilege_wrapper: default_privilege_wrapper(),
            cryptsetup: default_cryptsetup(),
            mount: default_mount(),
            unmount: default_unmount(),
            shell: default_shell(),
            unlock_tries: default_unlock_tries(),
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptdeckConfig {
    #[serde(default)]
    pub tables: TablesCfg,

    #[serde(default)]
    pub devices: DevicesCfg,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl CryptdeckConfig {
    /// Read and parse a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> CryptdeckResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            CryptdeckError::InvalidConfig(format!("unable to read {}: {err}", path.display()))
        })?;
        let mut cfg: Self = toml::from_str(&contents)?;
        cfg.path = path.to_path_buf();
        Ok(cfg)
    }

    /// Load `path` when present, otherwise fall back to built-in defaults.
    ///
    /// A workstation without a cryptdeck config is a normal setup: the system
    /// tables and tool locations are standard.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> CryptdeckResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        info!(
            "no configuration at {}; using built-in defaults",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            ..Self::default()
        })
    }

    /// Wrapper program to prefix privileged invocations with, if any.
    pub fn privilege_wrapper(&self) -> Option<&str> {
        let trimmed = self.tools.privilege_wrapper.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Best-effort validation pass returning human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for (key, path) in [
            ("tables.volume_table", &self.tables.volume_table),
            ("tables.mount_table", &self.tables.mount_table),
            ("tables.live_mounts", &self.tables.live_mounts),
        ] {
            if path.as_os_str().is_empty() {
                issues.push(format!("{key} must not be empty"));
            }
        }

        for (key, value) in [
            ("devices.mapper_prefix", self.devices.mapper_prefix.as_str()),
            ("devices.device_root", self.devices.device_root.as_str()),
        ] {
            if !value.starts_with('/') || !value.ends_with('/') {
                issues.push(format!(
                    "{key} must be an absolute path ending in `/` (got `{value}`)"
                ));
            }
        }

        if !self.devices.sysfs_block_root.is_absolute() {
            issues.push(format!(
                "devices.sysfs_block_root must be absolute (got `{}`)",
                self.devices.sysfs_block_root.display()
            ));
        }

        for (key, path) in [
            ("tools.cryptsetup", &self.tools.cryptsetup),
            ("tools.mount", &self.tools.mount),
            ("tools.unmount", &self.tools.unmount),
            ("tools.shell", &self.tools.shell),
        ] {
            if path.as_os_str().is_empty() {
                issues.push(format!("{key} must not be empty"));
            } else if !path.exists() {
                issues.push(format!("{key} not found at {}", path.display()));
            }
        }

        if let Some(wrapper) = self.privilege_wrapper() {
            if !Path::new(wrapper).exists() {
                issues.push(format!("tools.privilege_wrapper not found at {wrapper}"));
            }
        }

        if self.tools.unlock_tries == 0 {
            issues.push("tools.unlock_tries must be at least 1".to_string());
        }

        issues
    }
}
