use rusqlite::Connection;

use crate::db::Database;
use crate::error::HoardError;

/// What the persisted schema version says about the upcoming run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// No version recorded: a new database, nothing to upgrade.
    FreshDatabase,
    /// Version within the supported range, upgrades start from here.
    Upgradable(u32),
}

/// Checks the stored schema version against `[min_supported, current]`.
///
/// Runs under a read-only transaction before anything is written.
pub fn check_version(
    conn: &Connection,
    min_supported: u32,
    current: u32,
) -> Result<GateOutcome, HoardError> {
    let stored = Database::read_transaction(conn, Database::schema_version)?;

    match stored {
        None => Ok(GateOutcome::FreshDatabase),
        Some(version) if version < min_supported => Err(HoardError::UnsupportedLegacyVersion {
            version,
            min_supported,
        }),
        Some(version) if version > current => Err(HoardError::DowngradeNotAllowed {
            version,
            supported: current,
        }),
        Some(version) => Ok(GateOutcome::Upgradable(version)),
    }
}
