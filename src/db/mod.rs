pub mod migration;
pub mod schema;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use strum::{AsRefStr, Display};

use crate::error::HoardError;
use migration::{NotificationSink, UpgradeChain, UpgradeManager};
use schema::CREATE_SCHEMA_SQL;

pub const DB_FILENAME: &str = "hoard.db";

/// Keys of the `meta` settings table that the upgrade machinery owns.
#[derive(AsRefStr, Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    #[strum(serialize = "schema_version")]
    SchemaVersion,
    #[strum(serialize = "ongoing_upgrade_from_version")]
    OngoingUpgrade,
}

/// Handle to the single-file database.
///
/// The connection can be swapped out underneath the handle while a backup is
/// copied over the live file, so callers borrow it through [`Database::conn`]
/// instead of holding on to it.
pub struct Database {
    path: PathBuf,
    conn: Connection,
}

impl Database {
    /// Opens the database in `data_dir`, brings its schema up to date and
    /// creates the current schema when the database is fresh.
    pub fn connect(data_dir: &Path, sink: Arc<dyn NotificationSink>) -> Result<Self, HoardError> {
        if !data_dir.exists() {
            fs::create_dir_all(data_dir)?;
        } else if !data_dir.is_dir() {
            return Err(HoardError::Error(format!(
                "Database folder '{}' is not a directory",
                data_dir.display()
            )));
        }

        let mut db = Self::open(&data_dir.join(DB_FILENAME))?;
        info!("Database opened at: {}", db.path.display());

        let chain = UpgradeChain::builtin()?;
        let is_fresh = UpgradeManager::new(&mut db, &chain, sink).run_upgrades()?;
        if is_fresh {
            info!("Fresh database, creating schema");
            db.create_schema()?;
        }

        Ok(db)
    }

    /// Opens the database file without touching its schema.
    pub fn open(path: &Path) -> Result<Self, HoardError> {
        let conn = Self::open_connection(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    fn open_connection(path: &Path) -> Result<Connection, HoardError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create_schema(&self) -> Result<(), HoardError> {
        self.conn.execute_batch(CREATE_SCHEMA_SQL)?;
        Ok(())
    }

    /// Replaces the live database file with `backup`.
    ///
    /// The connection is closed first so no open transaction or page cache
    /// survives the copy, then reopened on the restored file.
    pub fn restore_from(&mut self, backup: &Path) -> Result<(), HoardError> {
        let placeholder = Connection::open_in_memory()?;
        let conn = std::mem::replace(&mut self.conn, placeholder);
        if let Err((conn, e)) = conn.close() {
            warn!("Closing connection before restore failed: {}", e);
            drop(conn);
        }

        fs::copy(backup, &self.path)?;
        self.conn = Self::open_connection(&self.path)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Runs `f` inside `BEGIN IMMEDIATE` and commits, or rolls back if `f` fails.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, HoardError>
    where
        F: FnOnce(&Connection) -> Result<T, HoardError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    warn!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Runs `f` inside a deferred transaction that is always rolled back.
    pub fn read_transaction<T, F>(conn: &Connection, f: F) -> Result<T, HoardError>
    where
        F: FnOnce(&Connection) -> Result<T, HoardError>,
    {
        conn.execute_batch("BEGIN DEFERRED")?;
        let result = f(conn);
        conn.execute_batch("ROLLBACK")?;
        result
    }

    // ------------------------------------------------------------------
    // Settings (meta table)
    // ------------------------------------------------------------------

    fn meta_table_exists(conn: &Connection) -> Result<bool, HoardError> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Reads a meta value. A missing row or a missing meta table both read as `None`.
    pub fn get_meta_value_locked(conn: &Connection, key: &str) -> Result<Option<String>, HoardError> {
        if !Self::meta_table_exists(conn)? {
            return Ok(None);
        }
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_meta_value_locked(conn: &Connection, key: &str, value: &str) -> Result<(), HoardError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_meta_locked(conn: &Connection, key: &str) -> Result<(), HoardError> {
        if Self::meta_table_exists(conn)? {
            conn.execute("DELETE FROM meta WHERE key = ?", [key])?;
        }
        Ok(())
    }

    fn get_meta_version(conn: &Connection, key: MetaKey) -> Result<Option<u32>, HoardError> {
        match Self::get_meta_value_locked(conn, key.as_ref())? {
            Some(raw) => raw.trim().parse::<u32>().map(Some).map_err(|_| {
                HoardError::Error(format!("Invalid value '{}' stored for meta key '{}'", raw, key))
            }),
            None => Ok(None),
        }
    }

    pub fn schema_version(conn: &Connection) -> Result<Option<u32>, HoardError> {
        Self::get_meta_version(conn, MetaKey::SchemaVersion)
    }

    pub fn set_schema_version(conn: &Connection, version: u32) -> Result<(), HoardError> {
        Self::set_meta_value_locked(conn, MetaKey::SchemaVersion.as_ref(), &version.to_string())
    }

    /// The `from_version` of an upgrade that started and was never confirmed.
    pub fn ongoing_upgrade(conn: &Connection) -> Result<Option<u32>, HoardError> {
        Self::get_meta_version(conn, MetaKey::OngoingUpgrade)
    }
}
