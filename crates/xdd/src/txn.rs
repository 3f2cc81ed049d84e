//! Copy-on-write transactions over the artifact directory.
//!
//! A transaction deep-copies the live tree into a sibling staging directory,
//! takes all writes there, and publishes the result by renaming the staging
//! directory over the live one (with a backup rename in between). Readers of
//! the live tree never observe a partial commit; rollback is a plain removal
//! of the staging directory.
//!
//! The copy is a true byte copy: staging and live must never share inodes,
//! or staged writes would leak into the live tree and rollback would be
//! meaningless.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use crate::Reporter;
use crate::lock::LOCK_FILE;

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("failed to {action} {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "commit left the store inconsistent: live root {} is missing; the new state is staged at {}, the prior state at {}",
        live.display(),
        staging.display(),
        backup.display()
    )]
    DoubleFailure {
        live: PathBuf,
        staging: PathBuf,
        backup: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(action: &'static str, path: &Path, source: std::io::Error) -> TxnError {
    TxnError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Best-effort fsync of the parent directory after a rename, ensuring the
/// directory entry update is durable on crash. Errors are ignored because
/// not every platform supports opening a directory for sync.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

/// An open copy-on-write transaction.
///
/// Consuming `commit` / `rollback` make post-commit writes and post-commit
/// rollbacks unrepresentable. Dropping an open transaction removes the
/// staging directory (best effort).
#[derive(Debug)]
pub struct CowTransaction {
    live: PathBuf,
    staging: PathBuf,
    backup: PathBuf,
    /// Set once the staging directory no longer belongs to this handle
    /// (committed, rolled back, or intentionally preserved for inspection).
    defused: bool,
}

impl CowTransaction {
    /// Open a transaction rooted at `live`.
    ///
    /// If the live tree exists its contents are deep-copied into the staging
    /// sibling; otherwise staging starts empty. The lock file is not copied:
    /// it belongs to the holder's descriptor, not to the versioned state.
    pub fn begin(live: &Path) -> Result<Self, TxnError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string();
        let name = live
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let staging = live.with_file_name(format!("{name}.tmp.{stamp}"));
        let backup = live.with_file_name(format!("{name}.backup.{stamp}"));

        fs::create_dir(&staging).map_err(|e| io_err("create staging dir", &staging, e))?;

        if live.is_dir() {
            if let Err(e) = copy_tree(live, &staging, true) {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
        }

        Ok(Self {
            live: live.to_path_buf(),
            staging,
            backup,
            defused: false,
        })
    }

    /// Path of the staging directory (useful for diagnostics and tests).
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Path of the live tree this transaction will replace on commit.
    pub fn live_path(&self) -> &Path {
        &self.live
    }

    /// Stage a file write at `relative`, creating parent directories as
    /// needed. Contents are flushed to disk so the later rename publishes
    /// durable bytes.
    pub fn write_file(&mut self, relative: impl AsRef<Path>, bytes: &[u8]) -> Result<(), TxnError> {
        let path = self.staging.join(relative.as_ref());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("create staging subdir", parent, e))?;
        }
        let mut f = File::create(&path).map_err(|e| io_err("create staged file", &path, e))?;
        f.write_all(bytes)
            .map_err(|e| io_err("write staged file", &path, e))?;
        f.sync_all()
            .map_err(|e| io_err("sync staged file", &path, e))?;
        Ok(())
    }

    /// Read a staged file.
    pub fn read_file(&self, relative: impl AsRef<Path>) -> Result<Vec<u8>, TxnError> {
        let path = self.staging.join(relative.as_ref());
        fs::read(&path).map_err(|e| io_err("read staged file", &path, e))
    }

    /// Whether a staged file exists at `relative`.
    pub fn exists(&self, relative: impl AsRef<Path>) -> bool {
        self.staging.join(relative.as_ref()).exists()
    }

    /// Publish the staging directory as the new live tree.
    ///
    /// The prior live tree is renamed aside first; if publishing then fails,
    /// the backup is renamed back. A failure of that restore too is the
    /// double-failure case: the error names both directories so an operator
    /// can repair by hand, and nothing is deleted.
    pub fn commit(mut self, reporter: &mut dyn Reporter) -> Result<(), TxnError> {
        let had_live = self.live.exists();
        if had_live {
            fs::rename(&self.live, &self.backup)
                .map_err(|e| io_err("rename live tree to backup", &self.live, e))?;
        }

        if let Err(forward) = fs::rename(&self.staging, &self.live) {
            if had_live {
                if let Err(restore) = fs::rename(&self.backup, &self.live) {
                    // Leave both directories in place for the operator.
                    self.defused = true;
                    return Err(TxnError::DoubleFailure {
                        live: self.live.clone(),
                        staging: self.staging.clone(),
                        backup: self.backup.clone(),
                        source: restore,
                    });
                }
            }
            return Err(io_err("publish staging dir", &self.staging, forward));
        }

        self.defused = true;
        fsync_parent_dir(&self.live);

        if had_live && let Err(e) = fs::remove_dir_all(&self.backup) {
            reporter.warn(&format!(
                "failed to remove backup dir {}: {e}",
                self.backup.display()
            ));
        }
        Ok(())
    }

    /// Abandon the transaction, removing the staging directory.
    pub fn rollback(mut self) -> Result<(), TxnError> {
        self.defused = true;
        fs::remove_dir_all(&self.staging)
            .map_err(|e| io_err("remove staging dir", &self.staging, e))
    }
}

impl Drop for CowTransaction {
    fn drop(&mut self) {
        if !self.defused {
            let _ = fs::remove_dir_all(&self.staging);
        }
    }
}

/// Recursively byte-copy `src` into `dst`, preserving directory modes.
/// `fs::copy` writes fresh bytes into a new inode, which is exactly the
/// isolation the transaction depends on; hard links are never created.
fn copy_tree(src: &Path, dst: &Path, skip_lock_file: bool) -> Result<(), TxnError> {
    let meta = fs::metadata(src).map_err(|e| io_err("stat dir", src, e))?;
    let _ = fs::set_permissions(dst, meta.permissions());

    let entries = fs::read_dir(src).map_err(|e| io_err("list dir", src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err("list dir", src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if skip_lock_file && entry.file_name() == LOCK_FILE {
            continue;
        }
        let ty = entry
            .file_type()
            .map_err(|e| io_err("stat entry", &from, e))?;
        if ty.is_dir() {
            fs::create_dir(&to).map_err(|e| io_err("create dir", &to, e))?;
            copy_tree(&from, &to, false)?;
        } else {
            fs::copy(&from, &to).map_err(|e| io_err("copy file", &from, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::NullReporter;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, contents).expect("write");
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).expect("read")
    }

    #[test]
    fn begin_on_missing_root_starts_empty() {
        let td = tempdir().expect("tempdir");
        let live = td.path().join(".xdd");

        let mut txn = CowTransaction::begin(&live).expect("begin");
        txn.write_file("01-specs/specification.yaml", b"metadata: {}\n")
            .expect("stage");
        txn.commit(&mut NullReporter).expect("commit");

        assert_eq!(read(&live.join("01-specs/specification.yaml")), "metadata: {}\n");
    }

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let td = tempdir().expect("tempdir");
        let live = td.path().join(".xdd");
        let target = live.join("01-specs/specification.yaml");
        write(&target, "v1");

        let mut txn = CowTransaction::begin(&live).expect("begin");
        txn.write_file("01-specs/specification.yaml", b"v2")
            .expect("stage");

        // Live tree still serves the pre-transaction bytes.
        assert_eq!(read(&target), "v1");
        assert_eq!(
            txn.read_file("01-specs/specification.yaml").expect("read staged"),
            b"v2"
        );

        txn.commit(&mut NullReporter).expect("commit");
        assert_eq!(read(&target), "v2");
    }

    #[test]
    fn rollback_leaves_live_tree_untouched() {
        let td = tempdir().expect("tempdir");
        let live = td.path().join(".xdd");
        let target = live.join("01-specs/specification.yaml");
        write(&target, "v1");
        write(&live.join("01-specs/changelog.yaml"), "events: []\n");

        let mut txn = CowTransaction::begin(&live).expect("begin");
        txn.write_file("01-specs/specification.yaml", b"v2")
            .expect("stage");
        txn.write_file("fresh.yaml", b"new file").expect("stage");
        let staging = txn.staging_path().to_path_buf();
        txn.rollback().expect("rollback");

        assert_eq!(read(&target), "v1");
        assert_eq!(read(&live.join("01-specs/changelog.yaml")), "events: []\n");
        assert!(!live.join("fresh.yaml").exists());
        assert!(!staging.exists());
    }

    #[test]
    fn staging_is_physically_independent_of_live() {
        let td = tempdir().expect("tempdir");
        let live = td.path().join(".xdd");
        let target = live.join("01-specs/specification.yaml");
        write(&target, "original");

        let mut txn = CowTransaction::begin(&live).expect("begin");
        // Mutating the staged copy through its own path must not reach the
        // live tree; shared inodes would break this.
        let staged = txn.staging_path().join("01-specs/specification.yaml");
        fs::write(&staged, "scribbled").expect("write staged copy");
        assert_eq!(read(&target), "original");

        txn.rollback().expect("rollback");
        assert_eq!(read(&target), "original");
    }

    #[test]
    fn lock_file_is_not_carried_into_staging() {
        let td = tempdir().expect("tempdir");
        let live = td.path().join(".xdd");
        write(&live.join(LOCK_FILE), "{}");
        write(&live.join("01-specs/changelog.yaml"), "events: []\n");

        let txn = CowTransaction::begin(&live).expect("begin");
        assert!(!txn.exists(LOCK_FILE));
        assert!(txn.exists("01-specs/changelog.yaml"));
        txn.commit(&mut NullReporter).expect("commit");

        assert!(!live.join(LOCK_FILE).exists());
        assert!(live.join("01-specs/changelog.yaml").exists());
    }

    #[test]
    fn commit_removes_staging_and_backup() {
        let td = tempdir().expect("tempdir");
        let live = td.path().join(".xdd");
        write(&live.join("a.yaml"), "a");

        let mut txn = CowTransaction::begin(&live).expect("begin");
        txn.write_file("b.yaml", b"b").expect("stage");
        let staging = txn.staging_path().to_path_buf();
        txn.commit(&mut NullReporter).expect("commit");

        assert!(!staging.exists());
        let stray: Vec<_> = fs::read_dir(td.path())
            .expect("list")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .filter(|n| n.contains(".backup.") || n.contains(".tmp."))
            .collect();
        assert!(stray.is_empty(), "leftover dirs: {stray:?}");
        assert_eq!(read(&live.join("a.yaml")), "a");
        assert_eq!(read(&live.join("b.yaml")), "b");
    }

    #[test]
    fn drop_without_commit_cleans_staging() {
        let td = tempdir().expect("tempdir");
        let live = td.path().join(".xdd");
        write(&live.join("a.yaml"), "a");

        let staging = {
            let mut txn = CowTransaction::begin(&live).expect("begin");
            txn.write_file("b.yaml", b"b").expect("stage");
            txn.staging_path().to_path_buf()
        };
        assert!(!staging.exists());
        assert!(!live.join("b.yaml").exists());
    }

    #[test]
    fn nested_directories_survive_the_copy() {
        let td = tempdir().expect("tempdir");
        let live = td.path().join(".xdd");
        write(&live.join("01-specs/snapshots/2026-01-01T00-00-00.yaml"), "snap");
        write(&live.join("01-specs/changelog.yaml"), "events: []\n");

        let mut txn = CowTransaction::begin(&live).expect("begin");
        txn.write_file("01-specs/changelog.yaml", b"events: [x]\n")
            .expect("stage");
        txn.commit(&mut NullReporter).expect("commit");

        assert_eq!(
            read(&live.join("01-specs/snapshots/2026-01-01T00-00-00.yaml")),
            "snap"
        );
        assert_eq!(read(&live.join("01-specs/changelog.yaml")), "events: [x]\n");
    }

    #[test]
    fn commit_surfaces_publish_failure_and_restores_backup() {
        let td = tempdir().expect("tempdir");
        let live = td.path().join(".xdd");
        write(&live.join("a.yaml"), "a");

        let mut txn = CowTransaction::begin(&live).expect("begin");
        txn.write_file("b.yaml", b"b").expect("stage");
        // Sabotage the forward rename by removing staging out from under the
        // transaction.
        fs::remove_dir_all(txn.staging_path()).expect("sabotage");

        let err = txn.commit(&mut NullReporter).expect_err("commit must fail");
        assert!(matches!(err, TxnError::Io { .. }));

        // The prior live tree was restored.
        assert_eq!(read(&live.join("a.yaml")), "a");
    }
}
