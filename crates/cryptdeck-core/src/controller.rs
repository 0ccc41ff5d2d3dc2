//! Volume transition orchestration.
//!
//! Every transition re-reads the system tables, classifies the volume, and
//! runs the matching sequence of privileged operations:
//!
//! | state        | mount              | unmount            | disconnect |
//! |--------------|--------------------|--------------------|------------|
//! | disconnected | refused            | no-op              | no-op      |
//! | connected    | unlock, then mount | no-op              | eject      |
//! | unlocked     | mount              | lock               | no-op      |
//! | mounted      | no-op              | unmount, then lock | refused    |
//!
//! User input and notices go through the [`PresentationLink`]; the controller
//! never calls presentation code directly.

use crate::config::{CryptdeckConfig, DevicesCfg};
use crate::error::{CryptdeckError, CryptdeckResult};
use crate::interaction::{NoticeLevel, PresentationEvent, PresentationLink};
use crate::oracle::{mapped_path, StateOracle, VolumeState};
use crate::provider::{OpOutcome, UnlockKey, VolumeOps};
use crate::tables::{ConfigStore, KeySource, Snapshot, VolumeDefinition};
use log::{error, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Transition a caller can request for one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Mount,
    Unmount,
    Disconnect,
    /// Unmount a mounted volume, mount anything connected or unlocked.
    Toggle,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transition::Mount => "mount",
            Transition::Unmount => "unmount",
            Transition::Disconnect => "disconnect",
            Transition::Toggle => "toggle",
        })
    }
}

/// How a transition request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The privileged sequence ran and succeeded.
    Applied,
    /// Nothing to do from the current state.
    Unchanged,
    /// The passphrase prompt was dismissed.
    Cancelled,
    /// The request does not apply to this volume; a notice was shown.
    Refused(String),
    /// A step failed; a notice was shown.
    Failed(String),
}

/// One row of the volume overview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStatus {
    pub name: String,
    pub backing_device: PathBuf,
    pub mount_point: Option<PathBuf>,
    pub key_source: KeySource,
    pub state: VolumeState,
}

/// Why a backing device cannot be ejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EjectPathError {
    Unresolvable(String),
    Unsupported(String),
}

/// Drives volume transitions against a [`VolumeOps`] implementation.
///
/// At most one transition runs per controller; every entry point claims the
/// same [`TransitionSlot`].
pub struct VolumeController<O> {
    store: ConfigStore,
    devices: DevicesCfg,
    ops: O,
    link: PresentationLink,
    snapshot: RwLock<Arc<Snapshot>>,
    in_flight: Arc<AtomicBool>,
}

/// Claim on a controller's single transition slot, released on drop.
#[derive(Debug)]
pub struct TransitionSlot {
    in_flight: Arc<AtomicBool>,
}

impl Drop for TransitionSlot {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

impl<O: VolumeOps> VolumeController<O> {
    pub fn new(config: &CryptdeckConfig, ops: O, link: PresentationLink) -> Self {
        Self {
            store: ConfigStore::from_config(config),
            devices: config.devices.clone(),
            ops,
            link,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while a transition holds the slot.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the transition slot, failing if another transition holds it.
    pub fn claim(&self) -> CryptdeckResult<TransitionSlot> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CryptdeckError::TransitionInFlight)?;
        Ok(TransitionSlot {
            in_flight: self.in_flight.clone(),
        })
    }

    /// Snapshot taken at the last refresh.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read all tables and swap in the new snapshot.
    pub fn refresh(&self) -> Arc<Snapshot> {
        let fresh = Arc::new(self.store.refresh());
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        self.link.publish(PresentationEvent::Refreshed(fresh.summary()));
        fresh
    }

    /// State of `name` according to the current snapshot.
    pub fn state_of(&self, name: &str) -> CryptdeckResult<VolumeState> {
        let snapshot = self.snapshot();
        let volume = snapshot
            .volume(name)
            .ok_or_else(|| CryptdeckError::VolumeNotConfigured(name.to_string()))?;
        Ok(self.oracle(&snapshot).state(&volume.backing_device, &volume.name))
    }

    /// One status row per configured volume, ordered by name.
    pub fn overview(&self) -> Vec<VolumeStatus> {
        let snapshot = self.snapshot();
        let oracle = self.oracle(&snapshot);
        snapshot
            .volumes()
            .map(|volume| VolumeStatus {
                name: volume.name.clone(),
                backing_device: volume.backing_device.clone(),
                mount_point: self.mount_point(&snapshot, &volume.name),
                key_source: volume.key_source.clone(),
                state: oracle.state(&volume.backing_device, &volume.name),
            })
            .collect()
    }

    /// Refresh, classify `volume`, and run `transition` to completion.
    ///
    /// Blocks for the duration of every privileged call and every interaction.
    /// Fails with [`CryptdeckError::TransitionInFlight`] while another
    /// transition holds the slot.
    pub fn transition(
        &self,
        volume: &str,
        transition: Transition,
    ) -> CryptdeckResult<TransitionOutcome> {
        let slot = self.claim()?;
        Ok(self.transition_claimed(&slot, volume, transition))
    }

    /// Run `transition` under a slot already claimed from this controller.
    pub(crate) fn transition_claimed(
        &self,
        slot: &TransitionSlot,
        volume: &str,
        transition: Transition,
    ) -> TransitionOutcome {
        debug_assert!(Arc::ptr_eq(&slot.in_flight, &self.in_flight));
        let snapshot = self.refresh();
        let outcome = match snapshot.volume(volume) {
            Some(definition) => {
                let state = self
                    .oracle(&snapshot)
                    .state(&definition.backing_device, &definition.name);
                info!("{transition} requested for `{volume}` (currently {state})");
                self.drive(&snapshot, definition, state, transition)
            }
            None => self.refuse(
                "Unknown volume",
                format!("`{volume}` is not listed in the volume table"),
            ),
        };

        let after = self.refresh();
        let state = after.volume(volume).map(|definition| {
            self.oracle(&after)
                .state(&definition.backing_device, &definition.name)
        });
        info!(
            "{transition} of `{volume}` finished: {outcome:?} (now {})",
            state.map(VolumeState::label).unwrap_or("unknown")
        );
        self.link.publish(PresentationEvent::TransitionComplete {
            volume: volume.to_string(),
            state,
            outcome: outcome.clone(),
        });
        outcome
    }

    fn drive(
        &self,
        snapshot: &Snapshot,
        volume: &VolumeDefinition,
        state: VolumeState,
        transition: Transition,
    ) -> TransitionOutcome {
        use Transition::*;
        use VolumeState::*;

        match (transition, state) {
            (Mount, Disconnected) => self.refuse(
                "Fail to mount",
                "You can't mount a disconnected drive. Please connect it first.",
            ),
            (Mount | Toggle, Connected) => self.unlock_and_mount(snapshot, volume),
            (Mount | Toggle, Unlocked) => match self.require_mount_point(snapshot, volume) {
                Ok(mount_point) => self.mount(&mount_point),
                Err(outcome) => outcome,
            },
            (Unmount | Toggle, Mounted) => self.unmount_and_lock(snapshot, volume),
            (Unmount, Unlocked) => self.lock(volume),
            (Disconnect, Connected) => self.eject(volume),
            (Disconnect, Mounted) => self.refuse(
                "Fail to disconnect",
                "You can only disconnect an unused volume. Unmount it first.",
            ),
            _ => {
                info!("nothing to do: `{}` is {state}", volume.name);
                TransitionOutcome::Unchanged
            }
        }
    }

    fn unlock_and_mount(
        &self,
        snapshot: &Snapshot,
        volume: &VolumeDefinition,
    ) -> TransitionOutcome {
        let mount_point = match self.require_mount_point(snapshot, volume) {
            Ok(mount_point) => mount_point,
            Err(outcome) => return outcome,
        };

        let key = match &volume.key_source {
            KeySource::KeyFile(path) => UnlockKey::KeyFile(path.clone()),
            KeySource::Interactive => match self.link.ask_passphrase(&volume.name) {
                Ok(Some(secret)) if !secret.is_empty() => UnlockKey::Passphrase(secret),
                Ok(_) => {
                    info!("passphrase prompt for `{}` cancelled", volume.name);
                    return TransitionOutcome::Cancelled;
                }
                Err(err) => {
                    warn!("unable to collect passphrase for `{}`: {err}", volume.name);
                    return TransitionOutcome::Failed(err.to_string());
                }
            },
        };

        let outcome = self.ops.unlock(&volume.name, &volume.backing_device, &key);
        if !outcome.success() {
            let message = match &key {
                UnlockKey::Passphrase(_) => "Wrong password".to_string(),
                UnlockKey::KeyFile(path) => format!("Key file {} was rejected", path.display()),
            };
            return self.op_failed("Fail to mount", &outcome, message);
        }
        drop(key);

        self.mount(&mount_point)
    }

    fn mount(&self, mount_point: &Path) -> TransitionOutcome {
        let outcome = self.ops.mount(mount_point);
        if outcome.success() {
            return TransitionOutcome::Applied;
        }
        self.op_failed(
            "Fail to mount",
            &outcome,
            format!("Unable to mount {}", mount_point.display()),
        )
    }

    fn unmount_and_lock(
        &self,
        snapshot: &Snapshot,
        volume: &VolumeDefinition,
    ) -> TransitionOutcome {
        let mount_point = match self.require_mount_point(snapshot, volume) {
            Ok(mount_point) => mount_point,
            Err(outcome) => return outcome,
        };

        let outcome = self.ops.unmount(&mount_point);
        if !outcome.success() {
            return self.op_failed(
                "Fail to unmount",
                &outcome,
                format!(
                    "Unable to unmount {}. Is it still in use?",
                    mount_point.display()
                ),
            );
        }

        self.lock(volume)
    }

    fn lock(&self, volume: &VolumeDefinition) -> TransitionOutcome {
        let outcome = self.ops.lock(&volume.name);
        if outcome.success() {
            return TransitionOutcome::Applied;
        }
        self.op_failed(
            "Fail to lock",
            &outcome,
            format!("Unable to lock `{}`", volume.name),
        )
    }

    fn eject(&self, volume: &VolumeDefinition) -> TransitionOutcome {
        let device = match eject_device_name(
            &volume.backing_device,
            &self.devices.device_root,
            &self.devices.sysfs_block_root,
        ) {
            Ok(device) => device,
            Err(EjectPathError::Unresolvable(reason)) => {
                return self.fail(
                    "Fail to disconnect",
                    format!(
                        "Unable to resolve {}: {reason}",
                        volume.backing_device.display()
                    ),
                )
            }
            Err(EjectPathError::Unsupported(reason)) => {
                return self.refuse(
                    "Fail to disconnect",
                    format!("Unsupported device path: {reason}"),
                )
            }
        };

        info!("ejecting `{}` via block device {device}", volume.name);
        let outcome = self.ops.disconnect(&device);
        if outcome.success() {
            return TransitionOutcome::Applied;
        }
        self.op_failed(
            "Fail to disconnect",
            &outcome,
            format!("Unable to disconnect {device}"),
        )
    }

    fn require_mount_point(
        &self,
        snapshot: &Snapshot,
        volume: &VolumeDefinition,
    ) -> Result<PathBuf, TransitionOutcome> {
        self.mount_point(snapshot, &volume.name).ok_or_else(|| {
            self.refuse(
                "No mount point",
                format!(
                    "{} has no entry in the mount table",
                    mapped_path(&self.devices.mapper_prefix, &volume.name)
                ),
            )
        })
    }

    fn mount_point(&self, snapshot: &Snapshot, name: &str) -> Option<PathBuf> {
        snapshot
            .mount_point(&mapped_path(&self.devices.mapper_prefix, name))
            .map(Path::to_path_buf)
    }

    fn oracle<'a>(&'a self, snapshot: &'a Snapshot) -> StateOracle<'a> {
        StateOracle::new(&self.devices.mapper_prefix, snapshot.live_mounts())
    }

    fn op_failed(
        &self,
        title: &str,
        outcome: &OpOutcome,
        message: impl Into<String>,
    ) -> TransitionOutcome {
        match outcome.spawn_failure() {
            Some(reason) => {
                error!("{outcome}");
                self.fail(
                    title,
                    format!("Could not run the {} tool: {reason}", outcome.op),
                )
            }
            None => {
                warn!("{outcome}");
                self.fail(title, message)
            }
        }
    }

    fn fail(&self, title: &str, message: impl Into<String>) -> TransitionOutcome {
        let message = message.into();
        self.notify(NoticeLevel::Error, title, &message);
        TransitionOutcome::Failed(message)
    }

    fn refuse(&self, title: &str, message: impl Into<String>) -> TransitionOutcome {
        let message = message.into();
        self.notify(NoticeLevel::Warning, title, &message);
        TransitionOutcome::Refused(message)
    }

    fn notify(&self, level: NoticeLevel, title: &str, message: &str) {
        if let Err(err) = self.link.notify(level, title, message) {
            warn!("notice `{title}: {message}` not delivered: {err}");
        }
    }
}

/// Resolve a backing device to the sysfs block device that owns it.
///
/// `/dev/sdb1` canonicalises under `device_root`, loses its partition digits,
/// and must name an entry of `sysfs_block_root` (`/sys/block/sdb`).
pub(crate) fn eject_device_name(
    backing_device: &Path,
    device_root: &str,
    sysfs_block_root: &Path,
) -> Result<String, EjectPathError> {
    let canonical = fs::canonicalize(backing_device)
        .map_err(|err| EjectPathError::Unresolvable(err.to_string()))?;
    let canonical = canonical.to_string_lossy();

    let raw = canonical.strip_prefix(device_root).ok_or_else(|| {
        EjectPathError::Unsupported(format!("{canonical} is not under {device_root}"))
    })?;
    if raw.is_empty() || raw.contains('/') {
        return Err(EjectPathError::Unsupported(format!(
            "{canonical} is not a direct child of {device_root}"
        )));
    }

    let disk = raw.trim_end_matches(|ch: char| ch.is_ascii_digit());
    if !disk.ends_with(|ch: char| ch.is_ascii_lowercase()) {
        return Err(EjectPathError::Unsupported(format!(
            "cannot derive a disk name from {canonical}"
        )));
    }

    if !sysfs_block_root.join(disk).is_dir() {
        return Err(EjectPathError::Unsupported(format!(
            "{} does not exist",
            sysfs_block_root.join(disk).display()
        )));
    }

    Ok(disk.to_string())
}

#[cfg(test)]
mod tests;
