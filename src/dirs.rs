//! Per-rule store directory management.
//!
//! Every rule owns one sub-directory under the configured root, named by the
//! rule's UUID, holding that rule's embedded database file. Directories are
//! created lazily on first use and are only ever deleted by the external
//! maintenance job, guided by [`StoreDirManager::reconcile`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// File name of the embedded database inside a store directory.
const DB_FILE_NAME: &str = "store.redb";

/// The on-disk location of one rule's duplicate-check data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDir {
    path: PathBuf,
}

impl StoreDir {
    /// Creates a handle from an existing directory path.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The embedded database file inside this directory.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.path.join(DB_FILE_NAME)
    }

    /// Returns true if the database file exists.
    #[must_use]
    pub fn db_exists(&self) -> bool {
        self.db_path().is_file()
    }
}

/// Maps rule UUIDs to store directories under a configured root.
#[derive(Debug, Clone)]
pub struct StoreDirManager {
    root: PathBuf,
}

impl StoreDirManager {
    /// Creates a manager, creating the root directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::OperationFailed {
            operation: "create_store_root".to_string(),
            cause: format!("{}: {e}", root.display()),
        })?;
        Ok(Self { root })
    }

    /// The root directory all rule directories live under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the store directory for a rule, creating it if needed.
    ///
    /// Idempotent: repeated calls for the same rule return the same path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    #[instrument(skip(self), fields(operation = "get_store_dir"))]
    pub fn dir(&self, rule_uuid: Uuid) -> Result<StoreDir> {
        let path = self.root.join(rule_uuid.to_string());
        fs::create_dir_all(&path).map_err(|e| Error::OperationFailed {
            operation: "create_store_dir".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        Ok(StoreDir::new(path))
    }

    /// Returns the store directory for a rule without creating it.
    ///
    /// Used by read-only paths that must not leave an empty directory behind
    /// for a rule that never stored anything.
    #[must_use]
    pub fn existing_dir(&self, rule_uuid: Uuid) -> Option<StoreDir> {
        let path = self.root.join(rule_uuid.to_string());
        path.is_dir().then(|| StoreDir::new(path))
    }

    /// Lists the rule UUIDs that currently have a store directory.
    ///
    /// Directory entries whose names do not parse as UUIDs are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be read.
    #[instrument(skip(self), fields(operation = "list_store_dirs"))]
    pub fn list(&self) -> Result<Vec<Uuid>> {
        let entries = fs::read_dir(&self.root).map_err(|e| Error::OperationFailed {
            operation: "list_store_dirs".to_string(),
            cause: format!("{}: {e}", self.root.display()),
        })?;

        let mut uuids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::OperationFailed {
                operation: "list_store_dirs".to_string(),
                cause: e.to_string(),
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            match entry.file_name().to_string_lossy().parse::<Uuid>() {
                Ok(uuid) => uuids.push(uuid),
                Err(_) => {
                    debug!(
                        name = %entry.file_name().to_string_lossy(),
                        "Skipping non-UUID entry under store root"
                    );
                },
            }
        }
        Ok(uuids)
    }

    /// Computes which store directories no longer belong to a live rule.
    ///
    /// With `Some(live_rules)` the result is the set difference
    /// `existing - live_rules`. With `None` the live rule set is unknown and
    /// every existing directory is reported as orphaned; callers must treat
    /// an unknown rule set as dangerous and only pass `None` deliberately.
    ///
    /// Pure computation: nothing is deleted here. The external maintenance
    /// job deletes the reported directories via [`Self::delete`].
    #[must_use]
    pub fn reconcile(existing: &[Uuid], live_rules: Option<&[Uuid]>) -> Vec<Uuid> {
        match live_rules {
            Some(live) => {
                let live: HashSet<Uuid> = live.iter().copied().collect();
                existing
                    .iter()
                    .copied()
                    .filter(|uuid| !live.contains(uuid))
                    .collect()
            },
            None => {
                warn!(
                    count = existing.len(),
                    "Live rule set unknown; reporting every store directory as orphaned"
                );
                existing.to_vec()
            },
        }
    }

    /// Deletes a rule's store directory and everything in it.
    ///
    /// Missing directories are treated as already deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    #[instrument(skip(self), fields(operation = "delete_store_dir"))]
    pub fn delete(&self, rule_uuid: Uuid) -> Result<()> {
        let path = self.root.join(rule_uuid.to_string());
        if !path.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&path).map_err(|e| Error::OperationFailed {
            operation: "delete_store_dir".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        debug!(rule_uuid = %rule_uuid, "Deleted store directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dir_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let manager = StoreDirManager::new(tmp.path()).unwrap();
        let uuid = Uuid::new_v4();

        let a = manager.dir(uuid).unwrap();
        let b = manager.dir(uuid).unwrap();
        assert_eq!(a, b);
        assert!(a.path().is_dir());
    }

    #[test]
    fn test_existing_dir_does_not_create() {
        let tmp = TempDir::new().unwrap();
        let manager = StoreDirManager::new(tmp.path()).unwrap();
        let uuid = Uuid::new_v4();

        assert!(manager.existing_dir(uuid).is_none());
        manager.dir(uuid).unwrap();
        assert!(manager.existing_dir(uuid).is_some());
    }

    #[test]
    fn test_list_skips_non_uuid_entries() {
        let tmp = TempDir::new().unwrap();
        let manager = StoreDirManager::new(tmp.path()).unwrap();
        let uuid = Uuid::new_v4();
        manager.dir(uuid).unwrap();
        fs::create_dir(tmp.path().join("not-a-uuid")).unwrap();

        let listed = manager.list().unwrap();
        assert_eq!(listed, vec![uuid]);
    }

    #[test]
    fn test_reconcile_set_difference() {
        let uuid1 = Uuid::new_v4();
        let uuid2 = Uuid::new_v4();
        let uuid3 = Uuid::new_v4();
        let uuid4 = Uuid::new_v4();
        let uuid5 = Uuid::new_v4();

        let existing = vec![uuid1, uuid2, uuid3, uuid4];
        let live = vec![uuid2, uuid4, uuid5];

        let orphans = StoreDirManager::reconcile(&existing, Some(&live));
        assert_eq!(orphans, vec![uuid1, uuid3]);
    }

    #[test]
    fn test_reconcile_unknown_live_rules_reports_everything() {
        let existing = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let orphans = StoreDirManager::reconcile(&existing, None);
        assert_eq!(orphans, existing);
    }

    #[test]
    fn test_reconcile_all_live() {
        let existing = vec![Uuid::new_v4(), Uuid::new_v4()];
        let orphans = StoreDirManager::reconcile(&existing, Some(&existing));
        assert!(orphans.is_empty());
    }

    #[test]
    fn test_delete_removes_directory() {
        let tmp = TempDir::new().unwrap();
        let manager = StoreDirManager::new(tmp.path()).unwrap();
        let uuid = Uuid::new_v4();
        let dir = manager.dir(uuid).unwrap();
        fs::write(dir.db_path(), b"data").unwrap();

        manager.delete(uuid).unwrap();
        assert!(!dir.path().exists());

        // Deleting again is fine
        manager.delete(uuid).unwrap();
    }
}
