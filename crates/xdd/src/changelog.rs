//! The on-disk event log, snapshot store, and load protocol.
//!
//! Everything lives under `<root>/01-specs/`:
//!
//! - `changelog.yaml` — the authoritative, append-only event log plus its
//!   metadata header (current version, last snapshot stamp, events since it).
//! - `specification.yaml` — the materialized current state. A convenience
//!   view regenerated on every commit; never consulted unless the log and
//!   snapshots are both absent (migration path).
//! - `snapshots/<stamp>.yaml` — full-state snapshots named by a colon-free,
//!   second-precision UTC stamp so filenames sort by creation time.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::Reporter;
use crate::replay::replay;
use crate::types::{ChangelogEvent, Specification};

pub const SPECS_DIR: &str = "01-specs";
pub const SPECIFICATION_FILE: &str = "specification.yaml";
pub const CHANGELOG_FILE: &str = "changelog.yaml";
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Filesystem-safe stamp format used for snapshot filenames and the
/// `last_snapshot` field: `YYYY-MM-DDTHH-MM-SS`.
pub const SNAPSHOT_STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

pub fn specs_dir(root: &Path) -> PathBuf {
    root.join(SPECS_DIR)
}

pub fn specification_path(root: &Path) -> PathBuf {
    specs_dir(root).join(SPECIFICATION_FILE)
}

pub fn changelog_path(root: &Path) -> PathBuf {
    specs_dir(root).join(CHANGELOG_FILE)
}

pub fn snapshots_dir(root: &Path) -> PathBuf {
    specs_dir(root).join(SNAPSHOTS_DIR)
}

/// Relative paths within the artifact root, for staging writes through a
/// transaction.
pub fn specification_rel() -> PathBuf {
    Path::new(SPECS_DIR).join(SPECIFICATION_FILE)
}

pub fn changelog_rel() -> PathBuf {
    Path::new(SPECS_DIR).join(CHANGELOG_FILE)
}

pub fn snapshot_rel(stamp: &str) -> PathBuf {
    Path::new(SPECS_DIR)
        .join(SNAPSHOTS_DIR)
        .join(format!("{stamp}.yaml"))
}

/// Render a snapshot stamp for an instant (UTC, second precision, floor).
pub fn format_snapshot_stamp(at: DateTime<Utc>) -> String {
    at.format(SNAPSHOT_STAMP_FORMAT).to_string()
}

/// Parse a bare snapshot stamp (no `.yaml` suffix).
pub fn parse_snapshot_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(stamp, SNAPSHOT_STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// The changelog file: ordered events plus the snapshot bookkeeping header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changelog {
    /// Current semantic version of the specification.
    pub version: Version,
    /// Stamp of the most recent snapshot, or empty if none exists.
    #[serde(default)]
    pub last_snapshot: String,
    /// Events appended since the most recent snapshot.
    pub events_since_snapshot: u64,
    pub events: Vec<ChangelogEvent>,
}

impl Changelog {
    pub fn empty(version: Version) -> Self {
        Self {
            version,
            last_snapshot: String::new(),
            events_since_snapshot: 0,
            events: Vec::new(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize changelog YAML")
    }

    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes).context("failed to parse changelog YAML")
    }
}

/// Serialize a specification for `specification.yaml` or a snapshot file.
pub fn specification_to_yaml(spec: &Specification) -> Result<String> {
    serde_yaml::to_string(spec).context("failed to serialize specification YAML")
}

/// Read and parse `changelog.yaml`, or `None` if absent.
pub fn load_changelog(root: &Path) -> Result<Option<Changelog>> {
    let path = changelog_path(root);
    let content = match fs::read(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read changelog {}", path.display()));
        }
    };
    Changelog::from_yaml(&content)
        .with_context(|| format!("failed to load changelog {}", path.display()))
        .map(Some)
}

/// The newest snapshot on disk, already deserialized.
#[derive(Debug)]
pub struct LoadedSnapshot {
    /// Instant parsed from the filename (second precision).
    pub taken_at: DateTime<Utc>,
    pub state: Specification,
    pub path: PathBuf,
}

/// Locate and load the lexicographically greatest snapshot.
///
/// Files that do not parse as a snapshot stamp are ignored. A snapshot whose
/// contents fail to deserialize is reported and treated as absent, which
/// sends the caller down the full-replay path.
pub fn latest_snapshot(root: &Path, reporter: &mut dyn Reporter) -> Result<Option<LoadedSnapshot>> {
    let dir = snapshots_dir(root);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to list snapshots dir {}", dir.display()));
        }
    };

    let mut best: Option<(String, DateTime<Utc>)> = None;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to list snapshots dir {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = name.strip_suffix(".yaml") else {
            continue;
        };
        let Some(taken_at) = parse_snapshot_stamp(stem) else {
            continue;
        };
        // Stamps sort lexicographically in time order, so max name == newest.
        if best.as_ref().is_none_or(|(n, _)| name > *n) {
            best = Some((name, taken_at));
        }
    }

    let Some((name, taken_at)) = best else {
        return Ok(None);
    };
    let path = dir.join(&name);
    let content = fs::read(&path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    match serde_yaml::from_slice::<Specification>(&content) {
        Ok(state) => Ok(Some(LoadedSnapshot {
            taken_at,
            state,
            path,
        })),
        Err(e) => {
            reporter.warn(&format!(
                "snapshot {} is corrupt ({e}); falling back to full replay",
                path.display()
            ));
            Ok(None)
        }
    }
}

/// Instants covered by a snapshot stamp: the stamp's whole second.
///
/// A second-precision stamp is the upper bound of what the snapshot
/// contains, so only events from the following second onward are replayed
/// on top of it. Events inside the stamp's own second are ambiguous; they
/// are treated as contained and reported.
fn snapshot_covers(taken_at: DateTime<Utc>, event_ts: DateTime<Utc>) -> bool {
    event_ts < taken_at + TimeDelta::seconds(1)
}

/// Reconstruct the current specification per the load protocol:
/// newest snapshot plus the events after it, or a full replay, or the bare
/// view file for preexisting projects, or the empty state.
pub fn load_current(root: &Path, reporter: &mut dyn Reporter) -> Result<Specification> {
    let snapshot = latest_snapshot(root, reporter)?;
    let log = load_changelog(root)?;

    if let Some(snapshot) = snapshot {
        let events = log.map(|l| l.events).unwrap_or_default();
        let mut selected = Vec::new();
        let mut ties = 0usize;
        for event in events {
            if snapshot_covers(snapshot.taken_at, event.timestamp) {
                if event.timestamp >= snapshot.taken_at {
                    ties += 1;
                }
            } else {
                selected.push(event);
            }
        }
        if ties > 0 {
            reporter.warn(&format!(
                "{ties} event(s) share the snapshot second {}; treating them as contained in {}",
                format_snapshot_stamp(snapshot.taken_at),
                snapshot.path.display()
            ));
        }
        return replay(snapshot.state, &selected)
            .with_context(|| format!("failed to replay events onto {}", snapshot.path.display()));
    }

    if let Some(log) = log {
        return replay(Specification::empty(), &log.events)
            .context("failed to replay changelog from the empty state");
    }

    // Migration path: a bare specification.yaml written by an earlier layout.
    let view = specification_path(root);
    match fs::read(&view) {
        Ok(content) => {
            let mut spec: Specification = serde_yaml::from_slice(&content)
                .with_context(|| format!("failed to parse specification {}", view.display()))?;
            spec.rebuild_explicit_from_view();
            Ok(spec)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Specification::empty()),
        Err(e) => Err(e).with_context(|| format!("failed to read specification {}", view.display())),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::tempdir;

    use super::*;
    use crate::types::{EventKind, ProjectMetadata};
    use crate::{NullReporter, ident};

    #[derive(Default)]
    struct CollectingReporter {
        warnings: Vec<String>,
    }

    impl Reporter for CollectingReporter {
        fn info(&mut self, _msg: &str) {}
        fn warn(&mut self, msg: &str) {
            self.warnings.push(msg.to_string());
        }
        fn error(&mut self, _msg: &str) {}
    }

    fn base_time() -> DateTime<Utc> {
        "2026-01-01T12:00:00Z".parse().expect("timestamp")
    }

    fn metadata_event(offset_secs: i64, name: &str) -> ChangelogEvent {
        ChangelogEvent {
            event_id: ident::new_event_id(),
            timestamp: base_time() + Duration::seconds(offset_secs),
            kind: EventKind::ProjectMetadataUpdated {
                old_metadata: ProjectMetadata::unset(),
                new_metadata: ProjectMetadata {
                    name: name.to_string(),
                    description: "A project exercised by the store tests".to_string(),
                    version: Version::new(0, 1, 0),
                    created_at: base_time(),
                    updated_at: base_time(),
                },
            },
        }
    }

    fn write_changelog(root: &Path, log: &Changelog) {
        let path = changelog_path(root);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, log.to_yaml().expect("yaml")).expect("write");
    }

    fn write_snapshot(root: &Path, stamp: &str, spec: &Specification) {
        let dir = snapshots_dir(root);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(
            dir.join(format!("{stamp}.yaml")),
            specification_to_yaml(spec).expect("yaml"),
        )
        .expect("write");
    }

    #[test]
    fn stamp_roundtrips_and_sorts() {
        let at = base_time();
        let stamp = format_snapshot_stamp(at);
        assert_eq!(stamp, "2026-01-01T12-00-00");
        assert_eq!(parse_snapshot_stamp(&stamp), Some(at));

        let later = format_snapshot_stamp(at + Duration::seconds(61));
        assert!(later > stamp);
    }

    #[test]
    fn changelog_yaml_roundtrips() {
        let mut log = Changelog::empty(Version::new(0, 1, 0));
        log.events.push(metadata_event(0, "demo"));
        log.events_since_snapshot = 1;

        let yaml = log.to_yaml().expect("yaml");
        assert!(yaml.contains("event_type: ProjectMetadataUpdated"));
        assert!(yaml.contains("events_since_snapshot: 1"));
        assert!(yaml.contains("last_snapshot: ''"));

        let parsed = Changelog::from_yaml(yaml.as_bytes()).expect("parse");
        assert_eq!(parsed, log);
    }

    #[test]
    fn load_current_returns_empty_for_missing_root() {
        let td = tempdir().expect("tempdir");
        let spec =
            load_current(&td.path().join(".xdd"), &mut NullReporter).expect("load");
        assert_eq!(spec, Specification::empty());
    }

    #[test]
    fn load_current_replays_full_log_without_snapshot() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join(".xdd");
        let mut log = Changelog::empty(Version::new(0, 1, 0));
        log.events.push(metadata_event(0, "demo"));
        log.events_since_snapshot = 1;
        write_changelog(&root, &log);

        let spec = load_current(&root, &mut NullReporter).expect("load");
        assert_eq!(spec.metadata.name, "demo");
    }

    #[test]
    fn load_current_replays_only_events_after_snapshot() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join(".xdd");

        // Snapshot taken after the first event; a later event supersedes it.
        let first = metadata_event(0, "old-name");
        let second = metadata_event(120, "new-name");
        let snap_state = replay(Specification::empty(), std::slice::from_ref(&first))
            .expect("snapshot state");
        write_snapshot(&root, &format_snapshot_stamp(base_time() + Duration::seconds(60)), &snap_state);

        let mut log = Changelog::empty(Version::new(0, 1, 0));
        log.events = vec![first, second];
        log.last_snapshot = format_snapshot_stamp(base_time() + Duration::seconds(60));
        log.events_since_snapshot = 1;
        write_changelog(&root, &log);

        let spec = load_current(&root, &mut NullReporter).expect("load");
        assert_eq!(spec.metadata.name, "new-name");
    }

    #[test]
    fn load_current_picks_newest_snapshot() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join(".xdd");

        let older = replay(
            Specification::empty(),
            std::slice::from_ref(&metadata_event(0, "older")),
        )
        .expect("older state");
        let newer = replay(
            Specification::empty(),
            std::slice::from_ref(&metadata_event(0, "newer")),
        )
        .expect("newer state");
        write_snapshot(&root, &format_snapshot_stamp(base_time()), &older);
        write_snapshot(
            &root,
            &format_snapshot_stamp(base_time() + Duration::minutes(5)),
            &newer,
        );
        write_changelog(&root, &Changelog::empty(Version::new(0, 1, 0)));

        let spec = load_current(&root, &mut NullReporter).expect("load");
        assert_eq!(spec.metadata.name, "newer");
    }

    #[test]
    fn events_inside_snapshot_second_are_skipped_with_a_warning() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join(".xdd");

        // Event 500ms after the stamp instant: same second, contained.
        let tied = ChangelogEvent {
            timestamp: base_time() + Duration::milliseconds(500),
            ..metadata_event(0, "tied")
        };
        let snap_state = replay(Specification::empty(), std::slice::from_ref(&tied))
            .expect("snapshot state");
        write_snapshot(&root, &format_snapshot_stamp(base_time()), &snap_state);

        let mut log = Changelog::empty(Version::new(0, 1, 0));
        log.events = vec![tied];
        log.last_snapshot = format_snapshot_stamp(base_time());
        write_changelog(&root, &log);

        let mut reporter = CollectingReporter::default();
        let spec = load_current(&root, &mut reporter).expect("load");
        assert_eq!(spec.metadata.name, "tied");
        assert!(
            reporter.warnings.iter().any(|w| w.contains("snapshot second")),
            "expected a tie warning, got {:?}",
            reporter.warnings
        );
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_full_replay() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join(".xdd");

        let dir = snapshots_dir(&root);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("2026-01-01T11-00-00.yaml"), "{not yaml").expect("write");

        let mut log = Changelog::empty(Version::new(0, 1, 0));
        log.events.push(metadata_event(0, "from-log"));
        write_changelog(&root, &log);

        let mut reporter = CollectingReporter::default();
        let spec = load_current(&root, &mut reporter).expect("load");
        assert_eq!(spec.metadata.name, "from-log");
        assert!(reporter.warnings.iter().any(|w| w.contains("corrupt")));
    }

    #[test]
    fn non_snapshot_filenames_are_ignored() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join(".xdd");
        let dir = snapshots_dir(&root);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("README.md"), "not a snapshot").expect("write");
        fs::write(dir.join("notes.yaml"), "also not one").expect("write");

        let mut log = Changelog::empty(Version::new(0, 1, 0));
        log.events.push(metadata_event(0, "demo"));
        write_changelog(&root, &log);

        let spec = load_current(&root, &mut NullReporter).expect("load");
        assert_eq!(spec.metadata.name, "demo");
    }

    #[test]
    fn bare_view_file_is_loaded_as_migration_path() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join(".xdd");
        let mut spec = Specification::empty();
        spec.metadata.name = "legacy".to_string();
        spec.metadata.description = "Imported from an older layout".to_string();
        spec.categories = vec!["LEGACY".to_string()];

        let path = specification_path(&root);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, specification_to_yaml(&spec).expect("yaml")).expect("write");

        let loaded = load_current(&root, &mut NullReporter).expect("load");
        assert_eq!(loaded.metadata.name, "legacy");
        // Listed-but-unreferenced categories get pinned as explicit.
        assert!(loaded.explicit_categories.contains("LEGACY"));
    }

    #[test]
    fn malformed_changelog_is_an_error() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join(".xdd");
        let path = changelog_path(&root);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "version: [not, a, version]").expect("write");

        let err = load_current(&root, &mut NullReporter).expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to load changelog"));
    }
}
