use rusqlite::Connection;

use crate::db::migration::{UpgradeParams, UpgradeProgress};
use crate::db::Database;
use crate::error::HoardError;

/// Schema Upgrade: Version 1 → 2
///
/// Adds the lookup indexes used when matching receipt logs by address and
/// topic and when joining decoded events back to their transaction.
pub const UPGRADE_1_TO_2_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_receipt_log_topics_topic ON evmtx_receipt_log_topics (topic_index, topic);
CREATE INDEX IF NOT EXISTS idx_receipt_logs_address ON evmtx_receipt_logs (address);
CREATE INDEX IF NOT EXISTS idx_evm_events_info_tx_hash ON evm_events_info (tx_hash);
"#;

pub fn upgrade_v1_to_v2(
    conn: &Connection,
    progress: &mut UpgradeProgress,
    _params: &UpgradeParams,
) -> Result<(), HoardError> {
    progress.set_total_steps(1);
    Database::immediate_transaction(conn, |c| {
        c.execute_batch(UPGRADE_1_TO_2_SQL)?;
        Ok(())
    })?;
    progress.new_step();
    Ok(())
}
