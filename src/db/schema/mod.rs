mod base;
mod v1_to_v2;
mod v2_to_v3;

use crate::db::migration::UpgradeRecord;

pub use base::CREATE_SCHEMA_SQL;
use v1_to_v2::upgrade_v1_to_v2;
use v2_to_v3::{default_params as v2_to_v3_params, upgrade_v2_to_v3};

/// Oldest schema version this release can still upgrade.
pub const MIN_SUPPORTED_DB_VERSION: u32 = 1;

/// Schema version written by this release.
pub const CURRENT_DB_VERSION: u32 = 3;

/// The application's upgrade records, one per version transition, ascending.
pub fn builtin_upgrades() -> Vec<UpgradeRecord> {
    vec![
        UpgradeRecord::new("add_lookup_indexes", 1, upgrade_v1_to_v2),
        UpgradeRecord::new("cleanup_extra_delegation_txs", 2, upgrade_v2_to_v3)
            .with_params(v2_to_v3_params()),
    ]
}
