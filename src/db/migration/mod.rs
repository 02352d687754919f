pub mod backup;
pub mod gate;
pub mod progress;
pub mod sink;

use std::sync::Arc;

use log::{info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;

use crate::db::schema::{builtin_upgrades, CURRENT_DB_VERSION, MIN_SUPPORTED_DB_VERSION};
use crate::db::Database;
use crate::error::HoardError;

pub use gate::GateOutcome;
pub use progress::{UpgradeMessage, UpgradeProgress};
pub use sink::{BroadcastSink, ConsoleSink, NotificationSink};

/// Extra arguments handed to a migration unit.
pub type UpgradeParams = serde_json::Map<String, serde_json::Value>;

/// A migration unit: upgrades the database by exactly one schema version.
///
/// Units own their transactions and must report their step count through the
/// progress reporter (`set_total_steps` once, then `new_step` that many times).
pub type UpgradeFn =
    fn(&Connection, &mut UpgradeProgress, &UpgradeParams) -> Result<(), HoardError>;

/// Immutable descriptor tying a migration unit to the version it upgrades from.
#[derive(Clone)]
pub struct UpgradeRecord {
    pub name: &'static str,
    pub from_version: u32,
    pub function: UpgradeFn,
    pub params: Option<UpgradeParams>,
}

impl UpgradeRecord {
    pub fn new(name: &'static str, from_version: u32, function: UpgradeFn) -> Self {
        Self {
            name,
            from_version,
            function,
            params: None,
        }
    }

    pub fn with_params(mut self, params: UpgradeParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn to_version(&self) -> u32 {
        self.from_version + 1
    }
}

impl std::fmt::Debug for UpgradeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeRecord")
            .field("name", &self.name)
            .field("from_version", &self.from_version)
            .field("params", &self.params)
            .finish()
    }
}

/// Ordered, validated list of upgrade records and the version range it serves.
#[derive(Debug, Clone)]
pub struct UpgradeChain {
    min_supported: u32,
    target: u32,
    records: Vec<UpgradeRecord>,
}

impl UpgradeChain {
    /// Builds a chain, rejecting records that are out of order, repeated, or
    /// outside `[min_supported, target)`.
    pub fn new(
        min_supported: u32,
        target: u32,
        records: Vec<UpgradeRecord>,
    ) -> Result<Self, HoardError> {
        if min_supported > target {
            return Err(HoardError::InvalidUpgradeChain(format!(
                "minimum supported version {} is above target {}",
                min_supported, target
            )));
        }

        let mut previous: Option<u32> = None;
        for record in &records {
            if record.from_version < min_supported || record.from_version >= target {
                return Err(HoardError::InvalidUpgradeChain(format!(
                    "'{}' upgrades from v{}, outside the supported range v{}..v{}",
                    record.name, record.from_version, min_supported, target
                )));
            }
            if let Some(prev) = previous {
                if record.from_version <= prev {
                    return Err(HoardError::InvalidUpgradeChain(format!(
                        "'{}' upgrades from v{} after an upgrade from v{}",
                        record.name, record.from_version, prev
                    )));
                }
            }
            previous = Some(record.from_version);
        }

        Ok(Self {
            min_supported,
            target,
            records,
        })
    }

    /// The application's own upgrade chain.
    pub fn builtin() -> Result<Self, HoardError> {
        Self::new(MIN_SUPPORTED_DB_VERSION, CURRENT_DB_VERSION, builtin_upgrades())
    }

    pub fn min_supported(&self) -> u32 {
        self.min_supported
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn records(&self) -> &[UpgradeRecord] {
        &self.records
    }
}

/// Drives a database through an upgrade chain.
pub struct UpgradeManager<'a> {
    db: &'a mut Database,
    chain: &'a UpgradeChain,
    sink: Arc<dyn NotificationSink>,
}

impl<'a> UpgradeManager<'a> {
    pub fn new(db: &'a mut Database, chain: &'a UpgradeChain, sink: Arc<dyn NotificationSink>) -> Self {
        Self { db, chain, sink }
    }

    /// Runs every upgrade the database needs.
    ///
    /// Returns true for a fresh database (nothing recorded, nothing run) and
    /// false otherwise. Any failure leaves the database as it was before the
    /// failing unit started.
    pub fn run_upgrades(&mut self) -> Result<bool, HoardError> {
        let start_version = match gate::check_version(
            self.db.conn(),
            self.chain.min_supported(),
            self.chain.target(),
        )? {
            GateOutcome::FreshDatabase => return Ok(true),
            GateOutcome::Upgradable(version) => version,
        };

        if let Some(interrupted) = Database::ongoing_upgrade(self.db.conn())? {
            warn!(
                "A previous upgrade from v{} did not complete. Archived backups next to {} hold earlier copies.",
                interrupted,
                self.db.path().display()
            );
        }

        if start_version < self.chain.target() {
            info!(
                "Upgrading database from v{} to v{}",
                start_version,
                self.chain.target()
            );
        }

        let chain = self.chain;
        let target = chain.target();
        let mut progress = UpgradeProgress::new(self.sink.clone(), start_version, target);
        for record in chain.records() {
            self.perform_single_upgrade(record, &mut progress)?;
        }

        // Always leave the target version behind, even if the chain has a gap
        Database::immediate_transaction(self.db.conn(), |c| Database::set_schema_version(c, target))?;
        Ok(false)
    }

    /// Applies `record` if the database currently sits at its `from_version`.
    fn perform_single_upgrade(
        &mut self,
        record: &UpgradeRecord,
        progress: &mut UpgradeProgress,
    ) -> Result<(), HoardError> {
        let current = Database::read_transaction(self.db.conn(), Database::schema_version)?;
        if current != Some(record.from_version) {
            return Ok(());
        }

        let to_version = record.to_version();
        let _tmr = timer!(Level::Debug; "perform_single_upgrade", "{} v{} -> v{}", record.name, record.from_version, to_version);
        info!("Running upgrade '{}' (v{} -> v{})", record.name, record.from_version, to_version);

        progress.new_round(to_version);
        backup::execute_guarded(&mut *self.db, record, progress)?;

        Database::immediate_transaction(self.db.conn(), |c| Database::set_schema_version(c, to_version))
            .map_err(|cause| HoardError::DatabaseUpgradeError {
                from_version: record.from_version,
                to_version,
                cause: Box::new(cause),
            })
    }
}
