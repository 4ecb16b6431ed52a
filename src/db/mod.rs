pub mod address;
pub mod connection;
pub mod migration;
pub mod paybutton;
pub mod price;
pub mod transaction;
pub mod trigger;

pub const INIT_SCHEMA: &str = r#"
-- Watched addresses, one row per (network, address)
CREATE TABLE IF NOT EXISTS addresses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL,
    network_id INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    last_synced INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE (network_id, address)
);

-- Amounts are stored as decimal strings
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL,
    amount TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    confirmed INTEGER NOT NULL DEFAULT 0,
    op_return TEXT,
    address_id INTEGER NOT NULL,
    FOREIGN KEY (address_id) REFERENCES addresses(id),
    UNIQUE (hash, address_id)
);

-- Day-flattened coin prices
CREATE TABLE IF NOT EXISTS prices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network_id INTEGER NOT NULL,
    quote TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    value TEXT NOT NULL,
    UNIQUE (network_id, quote, timestamp)
);

CREATE TABLE IF NOT EXISTS paybuttons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    provider_user_id TEXT NOT NULL,
    owner_email TEXT
);

CREATE TABLE IF NOT EXISTS paybutton_addresses (
    paybutton_id INTEGER NOT NULL,
    address_id INTEGER NOT NULL,
    PRIMARY KEY (paybutton_id, address_id),
    FOREIGN KEY (paybutton_id) REFERENCES paybuttons(id),
    FOREIGN KEY (address_id) REFERENCES addresses(id)
);

CREATE TABLE IF NOT EXISTS paybutton_triggers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    paybutton_id INTEGER NOT NULL,
    send_email INTEGER NOT NULL DEFAULT 0,
    post_url TEXT NOT NULL DEFAULT '',
    post_data TEXT NOT NULL DEFAULT '',
    FOREIGN KEY (paybutton_id) REFERENCES paybuttons(id)
);

CREATE TABLE IF NOT EXISTS trigger_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trigger_id INTEGER NOT NULL,
    action TEXT NOT NULL,
    is_error INTEGER NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    FOREIGN KEY (trigger_id) REFERENCES paybutton_triggers(id)
);
"#;

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn decode_error(msg: impl Into<String>) -> sqlx::Error {
    sqlx::Error::Decode(msg.into().into())
}
