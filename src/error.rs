use rusqlite::Error as RusqliteError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HoardError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Error: {0}")]
    Error(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(
        "Your database was last opened by a very old version of hoard (schema version {version}). \
         The oldest schema this release can upgrade is {min_supported}. Open the database with an \
         intermediate release first, then use this one."
    )]
    UnsupportedLegacyVersion { version: u32, min_supported: u32 },

    #[error(
        "Your database schema version ({version}) is newer than the version this executable \
         supports ({supported}). Downgrading is not supported; please use the latest release."
    )]
    DowngradeNotAllowed { version: u32, supported: u32 },

    #[error("Failed upgrading from V{from_version} to V{to_version}: {cause}")]
    DatabaseUpgradeError {
        from_version: u32,
        to_version: u32,
        #[source]
        cause: Box<HoardError>,
    },

    #[error(
        "Failed upgrading from V{from_version} to V{to_version}: {cause}. Restoring the backup also \
         failed ({restore_error}); the database may be corrupt. The pre-upgrade copy was kept at {}",
        .backup_path.display()
    )]
    BackupRestoreFailure {
        from_version: u32,
        to_version: u32,
        backup_path: PathBuf,
        #[source]
        cause: Box<HoardError>,
        restore_error: Box<HoardError>,
    },

    #[error("Invalid upgrade chain: {0}")]
    InvalidUpgradeChain(String),
}
