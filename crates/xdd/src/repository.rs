//! The repository façade: compose lock, transaction, store, and reducer into
//! the two public operations plus a scoped convenience wrapper.
//!
//! Reads do not take the lock (a reader that needs a consistent
//! read-modify-write window holds the lock itself); writes require it and are
//! published atomically through a copy-on-write transaction.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::Reporter;
use crate::changelog::{
    self, Changelog, changelog_rel, format_snapshot_stamp, parse_snapshot_stamp, snapshot_rel,
    specification_rel, specification_to_yaml,
};
use crate::lock::{self, LockInterface, LockOptions, RootLock};
use crate::txn::CowTransaction;
use crate::types::{ChangelogEvent, Specification};

/// Number of appended events that triggers a snapshot.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 100;

#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    pub snapshot_threshold: u64,
    pub lock: LockOptions,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            lock: LockOptions::default(),
        }
    }
}

/// Handle on one artifact root. Cheap to construct; holds no open resources.
#[derive(Debug, Clone)]
pub struct SpecsRepository {
    root: PathBuf,
    opts: RepositoryOptions,
}

impl SpecsRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_options(root, RepositoryOptions::default())
    }

    pub fn with_options(root: impl Into<PathBuf>, opts: RepositoryOptions) -> Self {
        Self {
            root: root.into(),
            opts,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reconstruct the current specification from disk (snapshot + replay).
    ///
    /// Lockless: may run concurrently with a writer and will observe some
    /// committed state, never a torn one.
    pub fn read_specification(&self, reporter: &mut dyn Reporter) -> Result<Specification> {
        changelog::load_current(&self.root, reporter)
    }

    /// Acquire the artifact lock for a read-modify-write window.
    pub fn lock(
        &self,
        interface: LockInterface,
        reporter: &mut dyn Reporter,
    ) -> Result<RootLock> {
        RootLock::acquire(&self.root, interface, &self.opts.lock, reporter)
            .context("failed to acquire artifact lock")
    }

    /// Unconditionally remove the lock file. Operator tooling only.
    pub fn force_unlock(&self, reporter: &mut dyn Reporter) -> Result<()> {
        lock::force_release(&self.root, reporter).context("failed to force-release artifact lock")
    }

    /// Stage a committed state plus its explaining events into an open
    /// transaction: the regenerated view file, the appended changelog, and a
    /// snapshot when the threshold is crossed.
    pub fn stage(
        &self,
        txn: &mut CowTransaction,
        spec: &Specification,
        events: &[ChangelogEvent],
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let spec_yaml = specification_to_yaml(spec)?;
        txn.write_file(specification_rel(), spec_yaml.as_bytes())
            .context("failed to stage specification view")?;

        let mut log = if txn.exists(changelog_rel()) {
            let bytes = txn
                .read_file(changelog_rel())
                .context("failed to read staged changelog")?;
            Changelog::from_yaml(&bytes)?
        } else {
            Changelog::empty(spec.metadata.version.clone())
        };

        if !log.last_snapshot.is_empty()
            && let Some(snap_at) = parse_snapshot_stamp(&log.last_snapshot)
        {
            for event in events {
                if event.timestamp < snap_at + chrono::TimeDelta::seconds(1) {
                    reporter.warn(&format!(
                        "event {} predates the last snapshot stamp {}; it will not replay from that snapshot",
                        event.event_id, log.last_snapshot
                    ));
                }
            }
        }

        log.events.extend(events.iter().cloned());
        log.events_since_snapshot += events.len() as u64;
        log.version = spec.metadata.version.clone();

        if log.events_since_snapshot >= self.opts.snapshot_threshold {
            // Stamp with the newest event the snapshot contains, not the wall
            // clock: the load protocol replays everything after the stamp's
            // second, so the stamp must not outrun the log.
            let newest = log
                .events
                .iter()
                .map(|e| e.timestamp)
                .max()
                .unwrap_or_else(Utc::now);
            let stamp = format_snapshot_stamp(newest);
            txn.write_file(snapshot_rel(&stamp), spec_yaml.as_bytes())
                .context("failed to stage snapshot")?;
            log.last_snapshot = stamp;
            log.events_since_snapshot = 0;
        }

        txn.write_file(changelog_rel(), log.to_yaml()?.as_bytes())
            .context("failed to stage changelog")?;
        Ok(())
    }

    /// Commit a new state and its events in one transaction.
    ///
    /// The caller must hold the artifact lock; this method does not check
    /// (see [`SpecsRepository::safe_operation`] for the guarded wrapper).
    pub fn write_specification_and_changelog(
        &self,
        spec: &Specification,
        events: &[ChangelogEvent],
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let mut txn = CowTransaction::begin(&self.root).context("failed to open transaction")?;
        self.stage(&mut txn, spec, events, reporter)?;
        txn.commit(reporter).context("failed to commit transaction")?;
        Ok(())
    }

    /// Run `action` with the lock held and a transaction open: commit on
    /// `Ok`, roll back on `Err`, release the lock on every path.
    pub fn safe_operation<T>(
        &self,
        interface: LockInterface,
        reporter: &mut dyn Reporter,
        action: impl FnOnce(&mut CowTransaction, &mut dyn Reporter) -> Result<T>,
    ) -> Result<T> {
        let mut held = self.lock(interface, reporter)?;

        let outcome = (|| {
            let mut txn = CowTransaction::begin(&self.root).context("failed to open transaction")?;
            match action(&mut txn, reporter) {
                Ok(value) => {
                    txn.commit(reporter).context("failed to commit transaction")?;
                    Ok(value)
                }
                Err(e) => {
                    // Rollback failures must not mask the action's error.
                    if let Err(rb) = txn.rollback() {
                        reporter.error(&format!("rollback failed: {rb}"));
                    }
                    Err(e)
                }
            }
        })();

        let released = held.release();
        match outcome {
            Ok(value) => {
                released.context("failed to release artifact lock")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rel) = released {
                    reporter.error(&format!("lock release failed: {rel}"));
                }
                Err(e)
            }
        }
    }
}
