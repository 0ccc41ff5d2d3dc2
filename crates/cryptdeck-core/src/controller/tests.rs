use super::*;
use crate::config::{CryptdeckConfig, TablesCfg};
use crate::interaction::{dispatch, presentation_channel, Presenter};
use crate::provider::{OpKind, OpStatus};
use crate::tables::SnapshotSummary;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tempfile::{tempdir, TempDir};
use zeroize::Zeroizing;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Mount(PathBuf),
    Unmount(PathBuf),
    Unlock {
        name: String,
        backing: PathBuf,
        key: String,
    },
    Lock(String),
    Disconnect(String),
}

/// Records every call and mimics its effect on the fake `/dev/mapper` and
/// live mount list so post-transition state checks see real changes.
#[derive(Clone)]
struct MockOps {
    root: PathBuf,
    calls: Arc<Mutex<Vec<Call>>>,
    statuses: Arc<Mutex<HashMap<OpKind, OpStatus>>>,
}

impl MockOps {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            calls: Arc::new(Mutex::new(Vec::new())),
            statuses: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn fail_with(&self, op: OpKind, status: OpStatus) {
        self.statuses.lock().unwrap().insert(op, status);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn finish(&self, op: OpKind, call: Call) -> OpOutcome {
        self.calls.lock().unwrap().push(call);
        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(&op)
            .cloned()
            .unwrap_or(OpStatus::Exited(0));
        OpOutcome { op, status }
    }

    fn mounts_file(&self) -> PathBuf {
        self.root.join("mounts")
    }
}

impl VolumeOps for MockOps {
    fn mount(&self, mount_point: &Path) -> OpOutcome {
        let outcome = self.finish(OpKind::Mount, Call::Mount(mount_point.to_path_buf()));
        if outcome.success() {
            let name = mount_point.file_name().unwrap().to_string_lossy();
            let mut file = OpenOptions::new()
                .append(true)
                .open(self.mounts_file())
                .unwrap();
            writeln!(
                file,
                "{}/mapper/{name} {} ext4 rw 0 0",
                self.root.display(),
                mount_point.display()
            )
            .unwrap();
        }
        outcome
    }

    fn unmount(&self, mount_point: &Path) -> OpOutcome {
        let outcome = self.finish(OpKind::Unmount, Call::Unmount(mount_point.to_path_buf()));
        if outcome.success() {
            let needle = format!(" {} ", mount_point.display());
            let remaining: String = fs::read_to_string(self.mounts_file())
                .unwrap()
                .lines()
                .filter(|line| !line.contains(&needle))
                .map(|line| format!("{line}\n"))
                .collect();
            fs::write(self.mounts_file(), remaining).unwrap();
        }
        outcome
    }

    fn unlock(&self, name: &str, backing_device: &Path, key: &UnlockKey) -> OpOutcome {
        let key = match key {
            UnlockKey::Passphrase(secret) => format!("passphrase:{}", secret.as_str()),
            UnlockKey::KeyFile(path) => format!("keyfile:{}", path.display()),
        };
        let outcome = self.finish(
            OpKind::Unlock,
            Call::Unlock {
                name: name.to_string(),
                backing: backing_device.to_path_buf(),
                key,
            },
        );
        if outcome.success() {
            fs::write(self.root.join("mapper").join(name), b"").unwrap();
        }
        outcome
    }

    fn lock(&self, name: &str) -> OpOutcome {
        let outcome = self.finish(OpKind::Lock, Call::Lock(name.to_string()));
        if outcome.success() {
            fs::remove_file(self.root.join("mapper").join(name)).unwrap();
        }
        outcome
    }

    fn disconnect(&self, sysfs_device: &str) -> OpOutcome {
        self.finish(OpKind::Disconnect, Call::Disconnect(sysfs_device.to_string()))
    }
}

#[derive(Default)]
struct Record {
    prompts: Vec<String>,
    notices: Vec<(NoticeLevel, String)>,
    completions: Vec<(String, Option<VolumeState>, TransitionOutcome)>,
    refreshes: Vec<SnapshotSummary>,
}

struct RecordingPresenter {
    answer: Option<&'static str>,
    record: Arc<Mutex<Record>>,
}

impl Presenter for RecordingPresenter {
    fn passphrase(
        &mut self,
        volume: &str,
        _title: &str,
        _prompt: &str,
    ) -> Option<Zeroizing<String>> {
        self.record.lock().unwrap().prompts.push(volume.to_string());
        self.answer.map(|answer| Zeroizing::new(answer.to_string()))
    }

    fn notice(&mut self, level: NoticeLevel, _title: &str, message: &str) {
        self.record
            .lock()
            .unwrap()
            .notices
            .push((level, message.to_string()));
    }

    fn refreshed(&mut self, summary: SnapshotSummary) {
        self.record.lock().unwrap().refreshes.push(summary);
    }

    fn transition_complete(
        &mut self,
        volume: &str,
        state: Option<VolumeState>,
        outcome: &TransitionOutcome,
    ) {
        self.record
            .lock()
            .unwrap()
            .completions
            .push((volume.to_string(), state, outcome.clone()));
    }
}

/// Temporary root holding fake tables, device nodes, mapper nodes, and sysfs.
struct Harness {
    _dir: TempDir,
    root: PathBuf,
    ops: MockOps,
    controller: VolumeController<MockOps>,
    record: Arc<Mutex<Record>>,
    presenter: JoinHandle<()>,
}

impl Harness {
    /// `volumes` are `(name, device, key)` triples; every volume gets a
    /// mount-table entry at `<root>/mnt/<name>`.
    fn new(volumes: &[(&str, &str, &str)], answer: Option<&'static str>) -> Self {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        for sub in ["dev", "mapper", "mnt", "sys/block"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }

        let mut crypttab = String::from("# <name> <device> <key>\n");
        let mut fstab = String::new();
        for (name, device, key) in volumes {
            crypttab.push_str(&format!("{name} {}/dev/{device} {key}\n", root.display()));
            fstab.push_str(&format!(
                "{root}/mapper/{name} {root}/mnt/{name} ext4 defaults 0 0\n",
                root = root.display()
            ));
        }
        fs::write(root.join("crypttab"), crypttab).unwrap();
        fs::write(root.join("fstab"), fstab).unwrap();
        fs::write(root.join("mounts"), "").unwrap();

        let mut config = CryptdeckConfig {
            tables: TablesCfg {
                volume_table: root.join("crypttab"),
                mount_table: root.join("fstab"),
                live_mounts: root.join("mounts"),
            },
            ..CryptdeckConfig::default()
        };
        config.devices.mapper_prefix = format!("{}/mapper/", root.display());
        config.devices.device_root = format!("{}/dev/", root.display());
        config.devices.sysfs_block_root = root.join("sys/block");

        let (link, events) = presentation_channel();
        let record = Arc::new(Mutex::new(Record::default()));
        let mut presenter = RecordingPresenter {
            answer,
            record: record.clone(),
        };
        let presenter = thread::spawn(move || {
            for event in events {
                dispatch(event, &mut presenter);
            }
        });

        let ops = MockOps::new(&root);
        let controller = VolumeController::new(&config, ops.clone(), link);

        Self {
            _dir: dir,
            root,
            ops,
            controller,
            record,
            presenter,
        }
    }

    fn connect(&self, device: &str) -> &Self {
        fs::write(self.root.join("dev").join(device), b"").unwrap();
        self
    }

    fn unlock(&self, name: &str) -> &Self {
        fs::write(self.root.join("mapper").join(name), b"").unwrap();
        self
    }

    fn mount(&self, name: &str) -> &Self {
        fs::write(
            self.root.join("mounts"),
            format!(
                "{root}/mapper/{name} {root}/mnt/{name} ext4 rw 0 0\n",
                root = self.root.display()
            ),
        )
        .unwrap();
        self
    }

    fn mount_point(&self, name: &str) -> PathBuf {
        self.root.join("mnt").join(name)
    }

    fn run(&self, volume: &str, transition: Transition) -> TransitionOutcome {
        self.controller.transition(volume, transition).unwrap()
    }

    fn state(&self, name: &str) -> VolumeState {
        self.controller.refresh();
        self.controller.state_of(name).unwrap()
    }

    fn notices(&self) -> Vec<String> {
        self.record
            .lock()
            .unwrap()
            .notices
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    fn prompts(&self) -> usize {
        self.record.lock().unwrap().prompts.len()
    }

    /// Drop the controller so the presentation loop drains and exits.
    fn finish(self) -> Record {
        let Harness {
            controller,
            presenter,
            record,
            ..
        } = self;
        drop(controller);
        presenter.join().unwrap();
        Arc::try_unwrap(record)
            .ok()
            .expect("presenter released the record")
            .into_inner()
            .unwrap()
    }
}

#[test]
fn mount_on_disconnected_volume_only_notifies() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("secret"));

    let outcome = harness.run("vault", Transition::Mount);

    assert!(matches!(outcome, TransitionOutcome::Refused(_)));
    assert!(harness.ops.calls().is_empty());
    assert_eq!(harness.notices().len(), 1);
    assert_eq!(harness.prompts(), 0);
}

#[test]
fn scenario_volume_reports_connected_when_only_backing_exists() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], None);
    harness.connect("sdb1");
    assert_eq!(harness.state("vault"), VolumeState::Connected);
}

#[test]
fn correct_passphrase_unlocks_then_mounts() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("s3cret"));
    harness.connect("sdb1");

    let outcome = harness.run("vault", Transition::Mount);

    assert_eq!(outcome, TransitionOutcome::Applied);
    assert_eq!(
        harness.ops.calls(),
        vec![
            Call::Unlock {
                name: "vault".into(),
                backing: harness.root.join("dev/sdb1"),
                key: "passphrase:s3cret".into(),
            },
            Call::Mount(harness.mount_point("vault")),
        ]
    );
    assert_eq!(harness.prompts(), 1);
    assert!(harness.notices().is_empty());
    assert_eq!(harness.state("vault"), VolumeState::Mounted);
}

#[test]
fn wrong_passphrase_skips_mount_and_reports_once() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("guess"));
    harness.connect("sdb1");
    harness.ops.fail_with(OpKind::Unlock, OpStatus::Exited(2));

    let outcome = harness.run("vault", Transition::Mount);

    assert_eq!(outcome, TransitionOutcome::Failed("Wrong password".into()));
    assert_eq!(harness.ops.calls().len(), 1);
    assert!(matches!(harness.ops.calls()[0], Call::Unlock { .. }));
    assert_eq!(harness.notices(), vec!["Wrong password".to_string()]);
    assert_eq!(harness.state("vault"), VolumeState::Connected);
}

#[test]
fn failed_mount_after_unlock_leaves_the_mapping_open() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("s3cret"));
    harness.connect("sdb1");
    harness.ops.fail_with(OpKind::Mount, OpStatus::Exited(32));

    let outcome = harness.run("vault", Transition::Mount);

    let mount_point = harness.mount_point("vault");
    let message = format!("Unable to mount {}", mount_point.display());
    assert_eq!(outcome, TransitionOutcome::Failed(message.clone()));
    assert_eq!(
        harness.ops.calls(),
        vec![
            Call::Unlock {
                name: "vault".into(),
                backing: harness.root.join("dev/sdb1"),
                key: "passphrase:s3cret".into(),
            },
            Call::Mount(mount_point),
        ]
    );
    assert_eq!(harness.notices(), vec![message]);
    assert_eq!(harness.state("vault"), VolumeState::Unlocked);
}

#[test]
fn held_slot_rejects_direct_transitions() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("s3cret"));
    harness.connect("sdb1");

    let slot = harness.controller.claim().unwrap();
    assert!(harness.controller.is_busy());
    assert!(matches!(
        harness.controller.transition("vault", Transition::Mount),
        Err(CryptdeckError::TransitionInFlight)
    ));
    assert!(harness.ops.calls().is_empty());
    assert_eq!(harness.prompts(), 0);

    drop(slot);
    assert!(!harness.controller.is_busy());
    assert_eq!(
        harness.run("vault", Transition::Mount),
        TransitionOutcome::Applied
    );
}

#[test]
fn dismissed_prompt_cancels_without_privileged_calls() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], None);
    harness.connect("sdb1");

    assert_eq!(
        harness.run("vault", Transition::Mount),
        TransitionOutcome::Cancelled
    );
    assert!(harness.ops.calls().is_empty());
    assert!(harness.notices().is_empty());
}

#[test]
fn empty_passphrase_counts_as_cancelled() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some(""));
    harness.connect("sdb1");

    assert_eq!(
        harness.run("vault", Transition::Mount),
        TransitionOutcome::Cancelled
    );
    assert!(harness.ops.calls().is_empty());
}

#[test]
fn key_file_volumes_unlock_without_prompting() {
    let harness = Harness::new(&[("backup", "sdc1", "/etc/keys/backup.key")], None);
    harness.connect("sdc1");

    let outcome = harness.run("backup", Transition::Mount);

    assert_eq!(outcome, TransitionOutcome::Applied);
    assert_eq!(harness.prompts(), 0);
    assert_eq!(
        harness.ops.calls()[0],
        Call::Unlock {
            name: "backup".into(),
            backing: harness.root.join("dev/sdc1"),
            key: "keyfile:/etc/keys/backup.key".into(),
        }
    );
}

#[test]
fn unlock_tool_that_cannot_start_is_not_a_wrong_password() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("s3cret"));
    harness.connect("sdb1");
    harness.ops.fail_with(
        OpKind::Unlock,
        OpStatus::SpawnFailed("No such file or directory".into()),
    );

    let outcome = harness.run("vault", Transition::Mount);

    let notices = harness.notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].starts_with("Could not run the unlock tool"));
    assert!(matches!(outcome, TransitionOutcome::Failed(message) if message != "Wrong password"));
}

#[test]
fn mount_without_mount_table_entry_is_refused_before_prompting() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("s3cret"));
    harness.connect("sdb1");
    fs::write(harness.root.join("fstab"), "").unwrap();

    let outcome = harness.run("vault", Transition::Mount);

    assert!(matches!(outcome, TransitionOutcome::Refused(_)));
    assert_eq!(harness.prompts(), 0);
    assert!(harness.ops.calls().is_empty());
}

#[test]
fn unlocked_volume_mounts_directly() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("unused"));
    harness.connect("sdb1").unlock("vault");

    assert_eq!(harness.run("vault", Transition::Mount), TransitionOutcome::Applied);
    assert_eq!(
        harness.ops.calls(),
        vec![Call::Mount(harness.mount_point("vault"))]
    );
    assert_eq!(harness.prompts(), 0);
}

#[test]
fn mounted_volume_mount_is_a_no_op() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], None);
    harness.connect("sdb1").unlock("vault").mount("vault");

    assert_eq!(
        harness.run("vault", Transition::Mount),
        TransitionOutcome::Unchanged
    );
    assert!(harness.ops.calls().is_empty());
}

#[test]
fn unmount_then_lock_on_success() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], None);
    harness.connect("sdb1").unlock("vault").mount("vault");

    assert_eq!(
        harness.run("vault", Transition::Unmount),
        TransitionOutcome::Applied
    );
    assert_eq!(
        harness.ops.calls(),
        vec![
            Call::Unmount(harness.mount_point("vault")),
            Call::Lock("vault".into()),
        ]
    );
    assert_eq!(harness.state("vault"), VolumeState::Connected);
}

#[test]
fn failed_unmount_never_locks() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], None);
    harness.connect("sdb1").unlock("vault").mount("vault");
    harness.ops.fail_with(OpKind::Unmount, OpStatus::Exited(32));

    let outcome = harness.run("vault", Transition::Unmount);

    assert!(matches!(outcome, TransitionOutcome::Failed(_)));
    assert_eq!(
        harness.ops.calls(),
        vec![Call::Unmount(harness.mount_point("vault"))]
    );
    assert_eq!(harness.notices().len(), 1);
    assert_eq!(harness.state("vault"), VolumeState::Mounted);
}

#[test]
fn unmount_of_unlocked_volume_only_locks() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], None);
    harness.connect("sdb1").unlock("vault");

    assert_eq!(
        harness.run("vault", Transition::Unmount),
        TransitionOutcome::Applied
    );
    assert_eq!(harness.ops.calls(), vec![Call::Lock("vault".into())]);
}

#[test]
fn unmount_of_connected_or_disconnected_volume_is_a_no_op() {
    let harness = Harness::new(&[("vault", "sdb1", "none"), ("spare", "sdc1", "none")], None);
    harness.connect("sdb1");

    assert_eq!(
        harness.run("vault", Transition::Unmount),
        TransitionOutcome::Unchanged
    );
    assert_eq!(
        harness.run("spare", Transition::Unmount),
        TransitionOutcome::Unchanged
    );
    assert!(harness.ops.calls().is_empty());
    assert!(harness.notices().is_empty());
}

#[test]
fn disconnect_of_mounted_volume_is_refused() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], None);
    harness.connect("sdb1").unlock("vault").mount("vault");

    let outcome = harness.run("vault", Transition::Disconnect);

    assert!(matches!(outcome, TransitionOutcome::Refused(_)));
    assert!(harness.ops.calls().is_empty());
    assert_eq!(harness.notices().len(), 1);
}

#[test]
fn disconnect_of_connected_volume_ejects_parent_disk() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], None);
    harness.connect("sdb1");
    fs::create_dir_all(harness.root.join("sys/block/sdb")).unwrap();

    assert_eq!(
        harness.run("vault", Transition::Disconnect),
        TransitionOutcome::Applied
    );
    assert_eq!(harness.ops.calls(), vec![Call::Disconnect("sdb".into())]);
}

#[cfg(unix)]
#[test]
fn disconnect_follows_links_and_refuses_disks_without_sysfs_entry() {
    let harness = Harness::new(&[("vault", "by-id", "none")], None);
    fs::write(harness.root.join("dev/sdz1"), b"").unwrap();
    std::os::unix::fs::symlink(harness.root.join("dev/sdz1"), harness.root.join("dev/by-id"))
        .unwrap();

    let outcome = harness.run("vault", Transition::Disconnect);

    assert!(matches!(
        outcome,
        TransitionOutcome::Refused(message) if message.contains("sys/block/sdz")
    ));
    assert!(harness.ops.calls().is_empty());
    assert_eq!(harness.notices().len(), 1);
}

#[test]
fn unresolvable_backing_device_cannot_be_ejected() {
    let dir = tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();

    let err = eject_device_name(
        &root.join("dev/missing"),
        &format!("{}/dev/", root.display()),
        &root.join("sys/block"),
    )
    .unwrap_err();

    assert!(matches!(err, EjectPathError::Unresolvable(_)));
}

#[test]
fn eject_path_shape_is_validated() {
    let dir = tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    fs::create_dir_all(root.join("dev/nested")).unwrap();
    fs::create_dir_all(root.join("sys/block/sdb")).unwrap();
    fs::write(root.join("dev/sdb1"), b"").unwrap();
    fs::write(root.join("dev/nested/sdb2"), b"").unwrap();
    fs::write(root.join("dev/1234"), b"").unwrap();
    let device_root = format!("{}/dev/", root.display());
    let sysfs = root.join("sys/block");

    assert_eq!(
        eject_device_name(&root.join("dev/sdb1"), &device_root, &sysfs),
        Ok("sdb".to_string())
    );
    assert!(matches!(
        eject_device_name(&root.join("dev/nested/sdb2"), &device_root, &sysfs),
        Err(EjectPathError::Unsupported(_))
    ));
    assert!(matches!(
        eject_device_name(&root.join("dev/1234"), &device_root, &sysfs),
        Err(EjectPathError::Unsupported(_))
    ));
    assert!(matches!(
        eject_device_name(&root.join("dev/sdb1"), "/elsewhere/", &sysfs),
        Err(EjectPathError::Unsupported(_))
    ));
}

#[test]
fn unknown_volume_is_reported_not_fatal() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], None);

    let outcome = harness.run("ghost", Transition::Mount);

    assert!(matches!(outcome, TransitionOutcome::Refused(_)));
    assert!(harness.ops.calls().is_empty());
    assert_eq!(harness.notices().len(), 1);
    assert!(matches!(
        harness.controller.state_of("ghost"),
        Err(CryptdeckError::VolumeNotConfigured(_))
    ));
}

#[test]
fn toggle_follows_the_current_state() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("s3cret"));
    harness.connect("sdb1");

    assert_eq!(harness.run("vault", Transition::Toggle), TransitionOutcome::Applied);
    assert_eq!(harness.state("vault"), VolumeState::Mounted);

    assert_eq!(harness.run("vault", Transition::Toggle), TransitionOutcome::Applied);
    assert_eq!(harness.state("vault"), VolumeState::Connected);
    assert_eq!(harness.ops.calls().len(), 4);
}

#[test]
fn overview_lists_every_volume_with_its_state() {
    let harness = Harness::new(&[("vault", "sdb1", "none"), ("backup", "sdc1", "none")], None);
    harness.connect("sdb1").unlock("vault");
    fs::write(harness.root.join("fstab"), "").unwrap();
    harness.controller.refresh();

    let rows = harness.controller.overview();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].name, "backup");
    assert_eq!(rows[0].state, VolumeState::Disconnected);
    assert_eq!(rows[0].mount_point, None);
    assert_eq!(rows[1].name, "vault");
    assert_eq!(rows[1].state, VolumeState::Unlocked);
}

#[test]
fn completion_is_published_with_final_state() {
    let harness = Harness::new(&[("vault", "sdb1", "none")], Some("s3cret"));
    harness.connect("sdb1");
    harness.run("vault", Transition::Mount);

    let record = harness.finish();
    assert_eq!(
        record.completions,
        vec![(
            "vault".to_string(),
            Some(VolumeState::Mounted),
            TransitionOutcome::Applied
        )]
    );
    assert_eq!(record.refreshes.len(), 2);
    assert_eq!(record.refreshes[0].volumes, 1);
}
