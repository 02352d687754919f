use std::collections::BTreeSet;

use log::info;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::db::migration::{UpgradeParams, UpgradeProgress};
use crate::db::Database;
use crate::error::HoardError;

// ============================================================================
// Schema Upgrade: Version 2 → 3 (transaction cleanup)
//
// Older releases stored every transaction returned by the delegation
// contract queries, including ones that never involved a tracked account.
// This removes the transactions that only touched the delegation contract,
// were never decoded into events, and carry no delegation log naming a
// tracked account (or a delegator one of them approved).
//
// Topics are stored as raw 32-byte blobs, so addresses are compared in their
// left-padded 32-byte form.
// ============================================================================

pub const DEFAULT_DELEGATION_CONTRACT: &str = "0xF55041E37E12cD407ad00CE2910B8269B01263b9";
const CONTRACT_PARAM: &str = "contract";
const CPT_THEGRAPH: &str = "thegraph";

const DELEGATION_TRANSFERRED_TO_L2: &str =
    "231E5CFEFF7759A468241D939AB04A60D603B17E359057ABBB8F52AFC3E4986B";
const STAKE_DELEGATION_WITHDRAWN: &str =
    "1B2E7737E043C5CF1B587CEB4DAEB7AE00148B9BDA8F79F1093EEAD08F141952";
const STAKE_DELEGATED: &str = "CD0366DCE5247D874FFC60A762AA7ABBB82C1695BBB171609C1B8861E279EB73";
const STAKE_DELEGATED_LOCKED: &str =
    "0430183F84D9C4502386D499DA806543DEE1D9DE83C08B01E39A6D2116C43B25";

fn topic_bytes(topic: &str) -> Result<Vec<u8>, HoardError> {
    hex::decode(topic).map_err(|e| HoardError::Error(format!("Invalid topic {}: {}", topic, e)))
}

/// 20-byte hex address → 32-byte topic value (left-padded with zeros).
pub fn address_to_bytes32(address: &str) -> Result<Vec<u8>, HoardError> {
    let raw = address.strip_prefix("0x").unwrap_or(address);
    let bytes = hex::decode(raw)
        .map_err(|e| HoardError::Error(format!("Invalid address {}: {}", address, e)))?;
    if bytes.len() != 20 {
        return Err(HoardError::Error(format!(
            "Invalid address {}: expected 20 bytes, got {}",
            address,
            bytes.len()
        )));
    }
    let mut padded = vec![0u8; 12];
    padded.extend_from_slice(&bytes);
    Ok(padded)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

fn query_strings(conn: &Connection, sql: &str, bindings: Vec<Value>) -> Result<Vec<String>, HoardError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(bindings), |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn tracked_eth_accounts(conn: &Connection) -> Result<Vec<String>, HoardError> {
    query_strings(
        conn,
        "SELECT account FROM blockchain_accounts WHERE blockchain = 'ETH' ORDER BY account",
        Vec::new(),
    )
}

/// Delegators that one of the tracked accounts approved through the contract.
fn approved_delegators(conn: &Connection, tracked: &[String]) -> Result<BTreeSet<String>, HoardError> {
    let sql = format!(
        "SELECT DISTINCT ei.address FROM history_events he
         JOIN evm_events_info ei ON he.identifier = ei.identifier
         WHERE ei.counterparty = ? AND he.location = 'ethereum'
           AND he.type = 'informational' AND he.subtype = 'approve'
           AND ei.address IS NOT NULL
           AND he.location_label IN ({})",
        placeholders(tracked.len())
    );
    let mut bindings = vec![Value::Text(CPT_THEGRAPH.to_string())];
    bindings.extend(tracked.iter().cloned().map(Value::Text));
    Ok(query_strings(conn, &sql, bindings)?.into_iter().collect())
}

fn blobs(addresses: &[String]) -> Result<Vec<Value>, HoardError> {
    addresses
        .iter()
        .map(|a| address_to_bytes32(a).map(Value::Blob))
        .collect()
}

/// Hashes of contract transactions whose delegation logs name one of our accounts.
fn hashes_to_keep(
    conn: &Connection,
    contract: &str,
    tracked: &[String],
    delegators: &[String],
) -> Result<Vec<Vec<u8>>, HoardError> {
    let all: Vec<String> = tracked.iter().chain(delegators.iter()).cloned().collect();
    let tracked_blobs = blobs(tracked)?;
    let all_blobs = blobs(&all)?;

    let mut sql = format!(
        "SELECT DISTINCT et.tx_hash FROM evm_transactions et
         JOIN evmtx_receipts er ON et.identifier = er.tx_id
         JOIN evmtx_receipt_logs erl ON er.tx_id = erl.tx_id
         JOIN evmtx_receipt_log_topics erlt0 ON erl.identifier = erlt0.log AND erlt0.topic_index = 0
         JOIN evmtx_receipt_log_topics erlt ON erl.identifier = erlt.log
         WHERE erl.address = ? AND (
           (erlt0.topic = ? AND ((erlt.topic_index = 2 AND erlt.topic IN ({}))",
        placeholders(tracked_blobs.len())
    );
    let mut bindings = vec![
        Value::Text(contract.to_string()),
        Value::Blob(topic_bytes(DELEGATION_TRANSFERRED_TO_L2)?),
    ];
    bindings.extend(tracked_blobs);

    if !delegators.is_empty() {
        let delegator_blobs = blobs(delegators)?;
        sql.push_str(&format!(
            " OR (erlt.topic_index = 1 AND erlt.topic IN ({}))",
            placeholders(delegator_blobs.len())
        ));
        bindings.extend(delegator_blobs);
    }
    sql.push_str("))");

    for event_topic in [STAKE_DELEGATION_WITHDRAWN, STAKE_DELEGATED, STAKE_DELEGATED_LOCKED] {
        sql.push_str(&format!(
            " OR (erlt0.topic = ? AND erlt.topic_index = 2 AND erlt.topic IN ({}))",
            placeholders(all_blobs.len())
        ));
        bindings.push(Value::Blob(topic_bytes(event_topic)?));
        bindings.extend(all_blobs.iter().cloned());
    }
    sql.push(')');

    let mut stmt = conn.prepare(&sql)?;
    let hashes = stmt
        .query_map(params_from_iter(bindings), |row| row.get::<_, Vec<u8>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hashes)
}

/// Deletes the unrelated contract transactions. Returns how many were removed.
fn cleanup_extra_delegation_txs(conn: &Connection, contract: &str) -> Result<usize, HoardError> {
    let tracked = tracked_eth_accounts(conn)?;
    if tracked.is_empty() {
        return Ok(0);
    }

    let delegators: Vec<String> = approved_delegators(conn, &tracked)?.into_iter().collect();
    let keep = hashes_to_keep(conn, contract, &tracked, &delegators)?;

    let mut sql = String::from(
        "DELETE FROM evm_transactions
         WHERE identifier IN (
             SELECT DISTINCT et.identifier FROM evm_transactions et
             JOIN evmtx_receipts er ON et.identifier = er.tx_id
             JOIN evmtx_receipt_logs erl ON er.tx_id = erl.tx_id
             WHERE erl.address = ?
         ) AND tx_hash NOT IN (SELECT tx_hash FROM evm_events_info)",
    );
    let mut bindings = vec![Value::Text(contract.to_string())];
    if !keep.is_empty() {
        sql.push_str(&format!(" AND tx_hash NOT IN ({})", placeholders(keep.len())));
        bindings.extend(keep.into_iter().map(Value::Blob));
    }

    Ok(conn.execute(&sql, params_from_iter(bindings))?)
}

/// Params the built-in chain passes to this unit.
pub fn default_params() -> UpgradeParams {
    let mut params = UpgradeParams::new();
    params.insert(
        CONTRACT_PARAM.to_string(),
        serde_json::Value::String(DEFAULT_DELEGATION_CONTRACT.to_string()),
    );
    params
}

pub fn upgrade_v2_to_v3(
    conn: &Connection,
    progress: &mut UpgradeProgress,
    params: &UpgradeParams,
) -> Result<(), HoardError> {
    let contract = match params.get(CONTRACT_PARAM) {
        Some(value) => value.as_str().ok_or_else(|| {
            HoardError::Error(format!("'{}' parameter must be a string", CONTRACT_PARAM))
        })?,
        None => DEFAULT_DELEGATION_CONTRACT,
    };

    progress.set_total_steps(2);

    let deleted = Database::immediate_transaction(conn, |c| cleanup_extra_delegation_txs(c, contract))?;
    info!("Migration 2→3: removed {} unrelated delegation transactions", deleted);
    progress.new_step();

    // VACUUM cannot run inside a transaction
    if deleted > 0 {
        conn.execute_batch("VACUUM;")?;
    }
    progress.new_step();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rusqlite::params;
    use tempfile::TempDir;

    use crate::db::migration::BroadcastSink;

    const TRACKED: &str = "0x1111111111111111111111111111111111111111";
    const DELEGATOR: &str = "0x2222222222222222222222222222222222222222";
    const STRANGER: &str = "0x3333333333333333333333333333333333333333";

    fn v2_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("hoard.db")).unwrap();
        db.create_schema().unwrap();
        Database::set_schema_version(db.conn(), 2).unwrap();
        (dir, db)
    }

    /// Inserts a contract transaction with one log: (topic0, topic_index, topic).
    fn add_contract_tx(conn: &Connection, hash_byte: u8, event: &str, topic_index: i64, address: &str) {
        let tx_hash = vec![hash_byte; 32];
        conn.execute(
            "INSERT INTO evm_transactions (tx_hash, chain_id, timestamp, from_address, to_address)
             VALUES (?, 1, 1700000000, ?, ?)",
            params![tx_hash, STRANGER, DEFAULT_DELEGATION_CONTRACT],
        )
        .unwrap();
        let tx_id = conn.last_insert_rowid();
        conn.execute("INSERT INTO evmtx_receipts (tx_id, status) VALUES (?, 1)", [tx_id])
            .unwrap();
        conn.execute(
            "INSERT INTO evmtx_receipt_logs (tx_id, log_index, data, address) VALUES (?, 0, x'', ?)",
            params![tx_id, DEFAULT_DELEGATION_CONTRACT],
        )
        .unwrap();
        let log_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO evmtx_receipt_log_topics (log, topic, topic_index) VALUES (?, ?, 0)",
            params![log_id, topic_bytes(event).unwrap()],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO evmtx_receipt_log_topics (log, topic, topic_index) VALUES (?, ?, ?)",
            params![log_id, address_to_bytes32(address).unwrap(), topic_index],
        )
        .unwrap();
    }

    fn add_decoded_event(conn: &Connection, hash_byte: u8, subtype: &str, address: &str) {
        conn.execute(
            "INSERT INTO history_events
             (event_identifier, sequence_index, timestamp, location, location_label, asset, amount, type, subtype)
             VALUES (?, 0, 1700000000, 'ethereum', ?, 'ETH', '0', 'informational', ?)",
            params![format!("evt{}", hash_byte), TRACKED, subtype],
        )
        .unwrap();
        let event_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO evm_events_info (identifier, tx_hash, counterparty, address) VALUES (?, ?, 'thegraph', ?)",
            params![event_id, vec![hash_byte; 32], address],
        )
        .unwrap();
    }

    fn remaining_hashes(conn: &Connection) -> Vec<u8> {
        let mut stmt = conn
            .prepare("SELECT tx_hash FROM evm_transactions ORDER BY identifier")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))
            .unwrap()
            .map(|h| h.unwrap()[0])
            .collect()
    }

    fn run(conn: &Connection, params: &UpgradeParams) -> Result<UpgradeProgress, HoardError> {
        let mut progress = UpgradeProgress::new(Arc::new(BroadcastSink::new()), 2, 3);
        upgrade_v2_to_v3(conn, &mut progress, params)?;
        Ok(progress)
    }

    #[test]
    fn test_address_to_bytes32() {
        let padded = address_to_bytes32(TRACKED).unwrap();
        assert_eq!(padded.len(), 32);
        assert_eq!(&padded[..12], &[0u8; 12]);
        assert_eq!(&padded[12..], &[0x11u8; 20]);

        assert!(address_to_bytes32("0x1234").is_err());
        assert!(address_to_bytes32("0xZZ11111111111111111111111111111111111111").is_err());
    }

    #[test]
    fn test_no_tracked_accounts_keeps_everything() {
        let (_dir, db) = v2_db();
        add_contract_tx(db.conn(), 1, STAKE_DELEGATED, 2, STRANGER);

        let progress = run(db.conn(), &UpgradeParams::new()).unwrap();

        assert_eq!(remaining_hashes(db.conn()), vec![1]);
        assert_eq!(progress.snapshot().current.current_step, 2);
        assert_eq!(progress.snapshot().current.total_steps, 2);
    }

    #[test]
    fn test_removes_only_unrelated_transactions() {
        let (_dir, db) = v2_db();
        let conn = db.conn();
        conn.execute(
            "INSERT INTO blockchain_accounts (blockchain, account) VALUES ('ETH', ?)",
            [TRACKED],
        )
        .unwrap();

        add_contract_tx(conn, 1, STAKE_DELEGATED, 2, TRACKED); // ours, by topic 2
        add_contract_tx(conn, 2, STAKE_DELEGATED, 2, STRANGER); // unrelated
        add_contract_tx(conn, 3, DELEGATION_TRANSFERRED_TO_L2, 1, DELEGATOR); // approved delegator
        add_contract_tx(conn, 4, DELEGATION_TRANSFERRED_TO_L2, 1, STRANGER); // unrelated delegator
        add_contract_tx(conn, 5, STAKE_DELEGATION_WITHDRAWN, 2, DELEGATOR); // delegator by topic 2
        add_contract_tx(conn, 6, STAKE_DELEGATED_LOCKED, 2, STRANGER); // unrelated but decoded
        add_decoded_event(conn, 6, "deposit", STRANGER);
        add_decoded_event(conn, 7, "approve", DELEGATOR);

        run(conn, &UpgradeParams::new()).unwrap();

        assert_eq!(remaining_hashes(conn), vec![1, 3, 5, 6]);
        let orphan_topics: i64 = conn
            .query_row(
                "SELECT count(*) FROM evmtx_receipt_log_topics t
                 LEFT JOIN evmtx_receipt_logs l ON t.log = l.identifier
                 WHERE l.identifier IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphan_topics, 0);
    }

    #[test]
    fn test_contract_param_overrides_default() {
        let (_dir, db) = v2_db();
        let conn = db.conn();
        conn.execute(
            "INSERT INTO blockchain_accounts (blockchain, account) VALUES ('ETH', ?)",
            [TRACKED],
        )
        .unwrap();
        add_contract_tx(conn, 1, STAKE_DELEGATED, 2, STRANGER);

        let mut params = UpgradeParams::new();
        params.insert(
            "contract".to_string(),
            serde_json::json!("0x9999999999999999999999999999999999999999"),
        );
        run(conn, &params).unwrap();

        // The stored logs belong to the default contract, so nothing matches
        assert_eq!(remaining_hashes(conn), vec![1]);
    }

    #[test]
    fn test_non_string_contract_param_is_error() {
        let (_dir, db) = v2_db();
        let mut params = UpgradeParams::new();
        params.insert("contract".to_string(), serde_json::json!(42));
        assert!(matches!(run(db.conn(), &params), Err(HoardError::Error(_))));
    }
}
