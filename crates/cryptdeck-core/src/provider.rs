//! Contract for the privileged operations that move a volume between states.
//!
//! The concrete process-backed implementation lives in `cryptdeck-luks`; the
//! controller only sees this trait so workflows stay testable with mocks.

use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// The five privileged operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Mount,
    Unmount,
    Unlock,
    Lock,
    Disconnect,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::Mount => "mount",
            OpKind::Unmount => "unmount",
            OpKind::Unlock => "unlock",
            OpKind::Lock => "lock",
            OpKind::Disconnect => "disconnect",
        })
    }
}

/// How a privileged subprocess ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    /// Process ran to completion with this exit code.
    Exited(i32),
    /// Process was terminated by a signal.
    Signalled,
    /// Process could not be started at all.
    SpawnFailed(String),
}

/// Result of one privileged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpOutcome {
    pub op: OpKind,
    pub status: OpStatus,
}

impl OpOutcome {
    pub fn exited(op: OpKind, code: i32) -> Self {
        Self {
            op,
            status: OpStatus::Exited(code),
        }
    }

    pub fn spawn_failed(op: OpKind, reason: impl Into<String>) -> Self {
        Self {
            op,
            status: OpStatus::SpawnFailed(reason.into()),
        }
    }

    /// Exit code zero.
    pub fn success(&self) -> bool {
        matches!(self.status, OpStatus::Exited(0))
    }

    /// Raw exit code, when the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            OpStatus::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn spawn_failure(&self) -> Option<&str> {
        match &self.status {
            OpStatus::SpawnFailed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for OpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            OpStatus::Exited(code) => write!(f, "{} exited with code {code}", self.op),
            OpStatus::Signalled => write!(f, "{} was terminated by a signal", self.op),
            OpStatus::SpawnFailed(reason) => {
                write!(f, "{} could not be started: {reason}", self.op)
            }
        }
    }
}

/// Secret material handed to the unlock tool.
pub enum UnlockKey {
    /// Written to the tool's stdin, then stdin is closed.
    Passphrase(Zeroizing<String>),
    /// Passed as `--key-file <path>`; nothing is written to stdin.
    KeyFile(PathBuf),
}

impl fmt::Debug for UnlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockKey::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
            UnlockKey::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

/// Blocking privileged operations.
///
/// Every call waits for its subprocess to exit before returning; a process
/// that cannot be started is reported as [`OpStatus::SpawnFailed`].
pub trait VolumeOps {
    fn mount(&self, mount_point: &Path) -> OpOutcome;

    fn unmount(&self, mount_point: &Path) -> OpOutcome;

    fn unlock(&self, name: &str, backing_device: &Path, key: &UnlockKey) -> OpOutcome;

    fn lock(&self, name: &str) -> OpOutcome;

    /// Request physical removal of the block device `sysfs_device` (e.g. `sdb`).
    fn disconnect(&self, sysfs_device: &str) -> OpOutcome;
}

impl<T: VolumeOps + ?Sized> VolumeOps for std::sync::Arc<T> {
    fn mount(&self, mount_point: &Path) -> OpOutcome {
        (**self).mount(mount_point)
    }

    fn unmount(&self, mount_point: &Path) -> OpOutcome {
        (**self).unmount(mount_point)
    }

    fn unlock(&self, name: &str, backing_device: &Path, key: &UnlockKey) -> OpOutcome {
        (**self).unlock(name, backing_device, key)
    }

    fn lock(&self, name: &str) -> OpOutcome {
        (**self).lock(name)
    }

    fn disconnect(&self, sysfs_device: &str) -> OpOutcome {
        (**self).disconnect(sysfs_device)
    }
}
