use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{error, info};
use tempfile::TempDir;

use super::progress::UpgradeProgress;
use super::{UpgradeParams, UpgradeRecord};
use crate::db::{Database, MetaKey};
use crate::error::HoardError;
use crate::hash::Hash;

/// Temporary full copy of the database taken right before a unit runs.
///
/// Lives in its own temporary directory, which is removed when the backup is
/// dropped unless [`UpgradeBackup::keep`] is called.
pub struct UpgradeBackup {
    dir: TempDir,
    file_name: String,
}

impl UpgradeBackup {
    /// `<unix_ts>_<dbname>_v<from_version>.backup`, where `dbname` is the
    /// database file name with dots replaced by underscores.
    pub fn file_name(db_path: &Path, timestamp: i64, from_version: u32) -> String {
        let db_name = db_path
            .file_name()
            .map(|name| name.to_string_lossy().replace('.', "_"))
            .unwrap_or_else(|| "database".to_string());
        format!("{}_{}_v{}.backup", timestamp, db_name, from_version)
    }

    /// Copies the live database into a fresh temporary directory and checks
    /// the copy hashes the same as the original.
    pub fn create(db_path: &Path, from_version: u32) -> Result<Self, HoardError> {
        Self::create_at(db_path, from_version, Utc::now().timestamp())
    }

    pub fn create_at(db_path: &Path, from_version: u32, timestamp: i64) -> Result<Self, HoardError> {
        let dir = TempDir::new()?;
        let file_name = Self::file_name(db_path, timestamp, from_version);
        let backup = Self { dir, file_name };

        fs::copy(db_path, backup.path())?;
        if !Hash::same_contents(db_path, &backup.path())? {
            return Err(HoardError::Error(format!(
                "Backup copy of {} does not match the original",
                db_path.display()
            )));
        }
        Ok(backup)
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join(&self.file_name)
    }

    /// Copies the backup next to the live database, where it stays after the
    /// temporary directory is gone.
    pub fn archive(&self, db_path: &Path) -> Result<PathBuf, HoardError> {
        let parent = db_path.parent().unwrap_or_else(|| Path::new("."));
        let archive_path = parent.join(&self.file_name);
        fs::copy(self.path(), &archive_path)?;
        Ok(archive_path)
    }

    /// Overwrites the live database with the backup and verifies the result.
    pub fn restore(&self, db: &mut Database) -> Result<(), HoardError> {
        db.restore_from(&self.path())?;
        if !Hash::same_contents(db.path(), &self.path())? {
            return Err(HoardError::Error(
                "Restored database does not match the backup".to_string(),
            ));
        }
        Ok(())
    }

    /// Disowns the temporary directory so the backup survives, returning the
    /// backup file's path.
    pub fn keep(self) -> PathBuf {
        let dir = self.dir.keep();
        dir.join(&self.file_name)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs the unit and the bookkeeping that must succeed with it: the ongoing
/// marker write before, and the archive copy and marker removal after.
fn run_unit(
    db: &Database,
    record: &UpgradeRecord,
    progress: &mut UpgradeProgress,
    backup: &UpgradeBackup,
) -> Result<PathBuf, HoardError> {
    let from_version = record.from_version;

    Database::immediate_transaction(db.conn(), |c| {
        Database::set_meta_value_locked(c, MetaKey::OngoingUpgrade.as_ref(), &from_version.to_string())
    })?;

    let empty = UpgradeParams::new();
    let params = record.params.as_ref().unwrap_or(&empty);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        (record.function)(db.conn(), progress, params)
    }));
    match outcome {
        Ok(result) => result?,
        Err(payload) => {
            return Err(HoardError::Error(format!(
                "migration unit '{}' panicked: {}",
                record.name,
                panic_message(payload.as_ref())
            )))
        }
    }

    let archive_path = backup.archive(db.path())?;

    Database::immediate_transaction(db.conn(), |c| {
        Database::delete_meta_locked(c, MetaKey::OngoingUpgrade.as_ref())
    })?;

    Ok(archive_path)
}

/// Executes one migration unit with a full-file backup around it.
///
/// On success the pre-upgrade copy is archived next to the database and the
/// ongoing marker is removed; the caller still has to commit the new schema
/// version. On failure the live file is restored from the backup before the
/// error is returned.
pub fn execute_guarded(
    db: &mut Database,
    record: &UpgradeRecord,
    progress: &mut UpgradeProgress,
) -> Result<PathBuf, HoardError> {
    let from_version = record.from_version;
    let to_version = record.to_version();
    let wrap = |cause: HoardError| HoardError::DatabaseUpgradeError {
        from_version,
        to_version,
        cause: Box::new(cause),
    };

    let backup = UpgradeBackup::create(db.path(), from_version).map_err(wrap)?;

    match run_unit(db, record, progress, &backup) {
        Ok(archive_path) => {
            info!(
                "Upgrade v{} -> v{} done, previous database kept at {}",
                from_version,
                to_version,
                archive_path.display()
            );
            Ok(archive_path)
        }
        Err(cause) => {
            error!(
                "Failed at database upgrade from version {} to {}: {:?}",
                from_version, to_version, cause
            );
            match backup.restore(db) {
                Ok(()) => {
                    info!("Database restored to its v{} state", from_version);
                    Err(wrap(cause))
                }
                Err(restore_error) => {
                    let backup_path = backup.keep();
                    error!(
                        "Restoring {} from {} failed: {}",
                        db.path().display(),
                        backup_path.display(),
                        restore_error
                    );
                    Err(HoardError::BackupRestoreFailure {
                        from_version,
                        to_version,
                        backup_path,
                        cause: Box::new(cause),
                        restore_error: Box::new(restore_error),
                    })
                }
            }
        }
    }
}
