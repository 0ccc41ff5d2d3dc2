//! Snapshots of the three system tables the engine derives state from.
//!
//! - the volume table (`/etc/crypttab`): which encrypted volumes exist
//! - the mount table (`/etc/fstab`): where each mapped device gets mounted
//! - the live mount list (`/proc/mounts`): what is mounted right now
//!
//! Every refresh builds a brand-new [`Snapshot`]; nothing is patched in place.
//! A missing table is an empty table, and a malformed line only costs that line.

use crate::config::{CryptdeckConfig, TablesCfg};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// How the unlock secret for a volume is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Passphrase must be collected from the user.
    Interactive,
    /// Key material is read by the unlock tool from this file.
    KeyFile(PathBuf),
}

/// One entry of the volume table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDefinition {
    pub name: String,
    /// Source field exactly as written (`/dev/sdb1`, `UUID=…`).
    pub source: String,
    /// Filesystem path the source resolves to.
    pub backing_device: PathBuf,
    pub key_source: KeySource,
    pub options: Vec<String>,
}

/// Which table a diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSource {
    VolumeTable,
    MountTable,
    LiveMounts,
}

impl fmt::Display for TableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableSource::VolumeTable => "volume table",
            TableSource::MountTable => "mount table",
            TableSource::LiveMounts => "live mount list",
        })
    }
}

/// A line dropped while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    pub source: TableSource,
    /// 1-based line number.
    pub line: usize,
    pub reason: String,
}

/// Device paths the kernel currently reports as mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveMountSet {
    devices: BTreeSet<String>,
}

impl LiveMountSet {
    pub fn contains(&self, device: &str) -> bool {
        self.devices.contains(device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for LiveMountSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            devices: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Counts published to the presentation layer after each refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub volumes: usize,
    pub mount_points: usize,
    pub live_mounts: usize,
    pub skipped_lines: usize,
}

/// Immutable view of all three tables taken at one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    volumes: BTreeMap<String, VolumeDefinition>,
    mount_points: BTreeMap<String, PathBuf>,
    live_mounts: LiveMountSet,
    skipped: Vec<SkippedLine>,
}

impl Snapshot {
    /// Look up a volume by its logical name.
    pub fn volume(&self, name: &str) -> Option<&VolumeDefinition> {
        self.volumes.get(name)
    }

    /// All volumes, ordered by name.
    pub fn volumes(&self) -> impl Iterator<Item = &VolumeDefinition> {
        self.volumes.values()
    }

    /// Mount point recorded in the mount table for `device`, if any.
    pub fn mount_point(&self, device: &str) -> Option<&Path> {
        self.mount_points.get(device).map(PathBuf::as_path)
    }

    pub fn live_mounts(&self) -> &LiveMountSet {
        &self.live_mounts
    }

    pub fn skipped(&self) -> &[SkippedLine] {
        &self.skipped
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            volumes: self.volumes.len(),
            mount_points: self.mount_points.len(),
            live_mounts: self.live_mounts.len(),
            skipped_lines: self.skipped.len(),
        }
    }
}

/// Reads the three tables from their configured locations.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    tables: TablesCfg,
    disk_by_root: PathBuf,
}

impl ConfigStore {
    pub fn new(tables: TablesCfg, disk_by_root: impl Into<PathBuf>) -> Self {
        Self {
            tables,
            disk_by_root: disk_by_root.into(),
        }
    }

    pub fn from_config(config: &CryptdeckConfig) -> Self {
        Self::new(config.tables.clone(), config.devices.disk_by_root.clone())
    }

    /// Parse all three tables into a fresh snapshot.
    pub fn refresh(&self) -> Snapshot {
        let mut skipped = Vec::new();

        let volumes = read_table(&self.tables.volume_table)
            .map(|bytes| decode_table(&bytes, TableSource::VolumeTable, &mut skipped))
            .map(|contents| parse_volume_table(&contents, &self.disk_by_root, &mut skipped))
            .unwrap_or_default();
        let mount_points = read_table(&self.tables.mount_table)
            .map(|bytes| decode_table(&bytes, TableSource::MountTable, &mut skipped))
            .map(|contents| parse_mount_table(&contents, &mut skipped))
            .unwrap_or_default();
        let live_mounts = read_table(&self.tables.live_mounts)
            .map(|bytes| decode_table(&bytes, TableSource::LiveMounts, &mut skipped))
            .map(|contents| parse_live_mounts(&contents, &mut skipped))
            .unwrap_or_default();

        for entry in &skipped {
            warn!(
                "skipped {} line {}: {}",
                entry.source, entry.line, entry.reason
            );
        }

        Snapshot {
            volumes,
            mount_points,
            live_mounts,
            skipped,
        }
    }
}

fn read_table(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(contents) => Some(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("{} not present; treating as empty", path.display());
            None
        }
        Err(err) => {
            warn!("unable to read {}: {err}; treating as empty", path.display());
            None
        }
    }
}

/// Decode a table line by line.
///
/// Comment lines with stray non-UTF-8 bytes are kept lossily. Any other line
/// that is not valid UTF-8 is recorded as skipped and blanked, so later line
/// numbers stay accurate.
fn decode_table(bytes: &[u8], source: TableSource, skipped: &mut Vec<SkippedLine>) -> String {
    let mut contents = String::with_capacity(bytes.len());

    for (idx, raw) in bytes.split(|byte| *byte == b'\n').enumerate() {
        match std::str::from_utf8(raw) {
            Ok(line) => contents.push_str(line),
            Err(_) => {
                let lossy = String::from_utf8_lossy(raw);
                if lossy.trim_start().starts_with('#') {
                    contents.push_str(&lossy);
                } else {
                    skipped.push(SkippedLine {
                        source,
                        line: idx + 1,
                        reason: "line is not valid UTF-8".to_string(),
                    });
                }
            }
        }
        contents.push('\n');
    }

    contents
}

/// Yield `(line_number, fields)` for every non-blank, non-comment line.
fn data_lines<'a>(contents: &'a str) -> impl Iterator<Item = (usize, Vec<&'a str>)> + 'a {
    contents.lines().enumerate().filter_map(|(idx, line)| {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        Some((idx + 1, trimmed.split_whitespace().collect()))
    })
}

pub(crate) fn parse_volume_table(
    contents: &str,
    disk_by_root: &Path,
    skipped: &mut Vec<SkippedLine>,
) -> BTreeMap<String, VolumeDefinition> {
    let mut volumes = BTreeMap::new();

    for (line, fields) in data_lines(contents) {
        if fields.len() < 2 {
            skipped.push(SkippedLine {
                source: TableSource::VolumeTable,
                line,
                reason: format!(
                    "expected `name source [key [options]]`, got {} field(s)",
                    fields.len()
                ),
            });
            continue;
        }

        let name = fields[0].to_string();
        let source = fields[1].to_string();
        let key_source = match fields.get(2).copied() {
            None | Some("none") | Some("-") => KeySource::Interactive,
            Some(path) => KeySource::KeyFile(PathBuf::from(path)),
        };
        let options = fields
            .get(3)
            .map(|raw| {
                raw.split(',')
                    .filter(|opt| !opt.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let definition = VolumeDefinition {
            backing_device: resolve_source_device(&source, disk_by_root),
            name: name.clone(),
            source,
            key_source,
            options,
        };
        if volumes.insert(name.clone(), definition).is_some() {
            debug!("volume table line {line} redefines `{name}`; keeping the later entry");
        }
    }

    volumes
}

pub(crate) fn parse_mount_table(
    contents: &str,
    skipped: &mut Vec<SkippedLine>,
) -> BTreeMap<String, PathBuf> {
    let mut mount_points = BTreeMap::new();

    for (line, fields) in data_lines(contents) {
        if fields.len() < 2 {
            skipped.push(SkippedLine {
                source: TableSource::MountTable,
                line,
                reason: "expected at least `device mountpoint`".to_string(),
            });
            continue;
        }
        mount_points.insert(
            unescape_mount_field(fields[0]),
            PathBuf::from(unescape_mount_field(fields[1])),
        );
    }

    mount_points
}

pub(crate) fn parse_live_mounts(contents: &str, skipped: &mut Vec<SkippedLine>) -> LiveMountSet {
    let mut devices = BTreeSet::new();

    for (line, fields) in data_lines(contents) {
        if fields.len() < 2 {
            skipped.push(SkippedLine {
                source: TableSource::LiveMounts,
                line,
                reason: "expected `device mountpoint …`".to_string(),
            });
            continue;
        }
        devices.insert(unescape_mount_field(fields[0]));
    }

    LiveMountSet { devices }
}

/// Map `UUID=` / `LABEL=` / `PARTUUID=` sources onto their `/dev/disk/by-*` links.
///
/// The link is returned whether or not it exists yet: an absent link simply
/// means the device is not plugged in.
pub(crate) fn resolve_source_device(source: &str, disk_by_root: &Path) -> PathBuf {
    let trimmed = source.trim();
    for (prefix, dir) in [
        ("UUID=", "by-uuid"),
        ("PARTUUID=", "by-partuuid"),
        ("LABEL=", "by-label"),
    ] {
        if let Some(value) = strip_prefix_case_insensitive(trimmed, prefix) {
            let value = value.trim();
            if !value.is_empty() {
                return disk_by_root.join(dir).join(value);
            }
        }
    }
    PathBuf::from(trimmed)
}

fn strip_prefix_case_insensitive<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    value
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .and_then(|_| value.get(prefix.len()..))
}

/// Decode the octal escapes (`\040` for space) used in mount tables.
///
/// Escapes are decoded to bytes, so a UTF-8 name written as `\303\251`
/// comes back as `é`.
fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output: Vec<u8> = Vec::with_capacity(input.len());
    let mut utf8 = [0u8; 4];

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => output.push(value),
            _ => {
                output.push(b'\\');
                output.extend_from_slice(oct.as_bytes());
            }
        }
    }

    String::from_utf8_lossy(&output).into_owned()
}
