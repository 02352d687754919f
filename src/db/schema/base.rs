/// Schema of a freshly created database, at `CURRENT_DB_VERSION`.
pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '3');

-- Accounts the user tracks, per chain ('ETH', 'OPTIMISM', ...)
CREATE TABLE IF NOT EXISTS blockchain_accounts (
    blockchain TEXT NOT NULL,
    account TEXT NOT NULL,
    label TEXT DEFAULT NULL,
    PRIMARY KEY (blockchain, account)
);

CREATE TABLE IF NOT EXISTS evm_transactions (
    identifier INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_hash BLOB NOT NULL,
    chain_id INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    from_address TEXT NOT NULL,
    to_address TEXT,
    UNIQUE (tx_hash, chain_id)
);

CREATE TABLE IF NOT EXISTS evmtx_receipts (
    tx_id INTEGER PRIMARY KEY,
    contract_address TEXT,
    status INTEGER NOT NULL CHECK (status IN (0, 1)),
    FOREIGN KEY (tx_id) REFERENCES evm_transactions(identifier) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS evmtx_receipt_logs (
    identifier INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id INTEGER NOT NULL,
    log_index INTEGER NOT NULL,
    data BLOB NOT NULL,
    address TEXT NOT NULL,
    FOREIGN KEY (tx_id) REFERENCES evmtx_receipts(tx_id) ON DELETE CASCADE,
    UNIQUE (tx_id, log_index)
);

-- Topics are raw 32-byte values, topic_index 0 is the event signature
CREATE TABLE IF NOT EXISTS evmtx_receipt_log_topics (
    log INTEGER NOT NULL,
    topic BLOB NOT NULL,
    topic_index INTEGER NOT NULL,
    FOREIGN KEY (log) REFERENCES evmtx_receipt_logs(identifier) ON DELETE CASCADE,
    PRIMARY KEY (log, topic_index)
);

CREATE TABLE IF NOT EXISTS history_events (
    identifier INTEGER PRIMARY KEY AUTOINCREMENT,
    event_identifier TEXT NOT NULL,
    sequence_index INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    location TEXT NOT NULL,
    location_label TEXT,
    asset TEXT NOT NULL,
    amount TEXT NOT NULL,
    type TEXT NOT NULL,
    subtype TEXT NOT NULL,
    UNIQUE (event_identifier, sequence_index)
);

-- Extra data for history events decoded from evm transactions
CREATE TABLE IF NOT EXISTS evm_events_info (
    identifier INTEGER PRIMARY KEY,
    tx_hash BLOB NOT NULL,
    counterparty TEXT,
    address TEXT,
    FOREIGN KEY (identifier) REFERENCES history_events(identifier) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_receipt_log_topics_topic ON evmtx_receipt_log_topics (topic_index, topic);
CREATE INDEX IF NOT EXISTS idx_receipt_logs_address ON evmtx_receipt_logs (address);
CREATE INDEX IF NOT EXISTS idx_evm_events_info_tx_hash ON evm_events_info (tx_hash);

COMMIT;
"#;
