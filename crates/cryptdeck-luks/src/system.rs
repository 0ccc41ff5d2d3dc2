//! System-backed [`VolumeOps`] implementation.
//!
//! Shells out to `cryptsetup`, `mount`, `umount`, and a shell writing the
//! sysfs delete trigger, each prefixed with the configured privilege wrapper.

use crate::command::{classify_open_failure, Output, PrivilegedCommand};
use cryptdeck_core::config::CryptdeckConfig;
use cryptdeck_core::provider::{OpKind, OpOutcome, UnlockKey, VolumeOps};
use log::{info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Runs each volume operation as a blocking subprocess.
#[derive(Debug, Clone)]
pub struct SystemVolumeOps {
    cryptsetup: PrivilegedCommand,
    mount: PrivilegedCommand,
    unmount: PrivilegedCommand,
    shell: PrivilegedCommand,
    unlock_tries: u32,
    sysfs_block_root: PathBuf,
}

impl SystemVolumeOps {
    pub fn from_config(config: &CryptdeckConfig) -> Self {
        let wrapper = config.privilege_wrapper();
        let tools = &config.tools;
        Self {
            cryptsetup: PrivilegedCommand::new(wrapper, &tools.cryptsetup),
            mount: PrivilegedCommand::new(wrapper, &tools.mount),
            unmount: PrivilegedCommand::new(wrapper, &tools.unmount),
            shell: PrivilegedCommand::new(wrapper, &tools.shell),
            unlock_tries: tools.unlock_tries.max(1),
            sysfs_block_root: config.devices.sysfs_block_root.clone(),
        }
    }

    /// Shell snippet that asks the kernel to drop `sysfs_device`.
    fn delete_trigger(&self, sysfs_device: &str) -> String {
        let target = self
            .sysfs_block_root
            .join(sysfs_device)
            .join("device")
            .join("delete");
        format!("echo 1 > {}", shell_quote(&target.to_string_lossy()))
    }
}

/// Single-quote `word` for `sh -c`, closing and reopening around embedded quotes.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

impl VolumeOps for SystemVolumeOps {
    fn mount(&self, mount_point: &Path) -> OpOutcome {
        let out = self.mount.run(OpKind::Mount, &[mount_point], None);
        report(&out, || format!("mount {}", mount_point.display()))
    }

    fn unmount(&self, mount_point: &Path) -> OpOutcome {
        let out = self.unmount.run(OpKind::Unmount, &[mount_point], None);
        report(&out, || format!("unmount {}", mount_point.display()))
    }

    fn unlock(&self, name: &str, backing_device: &Path, key: &UnlockKey) -> OpOutcome {
        let mut args: Vec<OsString> = vec![
            "-T".into(),
            self.unlock_tries.to_string().into(),
            "luksOpen".into(),
            backing_device.into(),
            name.into(),
        ];

        let out = match key {
            UnlockKey::Passphrase(secret) => {
                self.cryptsetup
                    .run(OpKind::Unlock, &args, Some(secret.as_bytes()))
            }
            UnlockKey::KeyFile(path) => {
                args.push("--key-file".into());
                args.push(path.into());
                self.cryptsetup.run(OpKind::Unlock, &args, None)
            }
        };

        if out.outcome.success() {
            info!("opened `{name}` from {}", backing_device.display());
        } else if out.outcome.spawn_failure().is_none() {
            warn!(
                "{} ({})",
                classify_open_failure(name, backing_device, out.diagnostic()),
                out.outcome
            );
        }
        out.outcome
    }

    fn lock(&self, name: &str) -> OpOutcome {
        let out = self.cryptsetup.run(OpKind::Lock, &["luksClose", name], None);
        report(&out, || format!("close `{name}`"))
    }

    fn disconnect(&self, sysfs_device: &str) -> OpOutcome {
        let trigger = self.delete_trigger(sysfs_device);
        let out = self.shell.run(OpKind::Disconnect, &["-c", trigger.as_str()], None);
        report(&out, || format!("disconnect {sysfs_device}"))
    }
}

fn report(out: &Output, action: impl FnOnce() -> String) -> OpOutcome {
    if out.outcome.success() {
        info!("{} succeeded", action());
    } else if out.outcome.spawn_failure().is_none() {
        let diagnostic = out.diagnostic();
        if diagnostic.is_empty() {
            warn!("{} failed: {}", action(), out.outcome);
        } else {
            warn!("{} failed: {} ({diagnostic})", action(), out.outcome);
        }
    }
    out.outcome.clone()
}
