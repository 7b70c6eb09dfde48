//! SQL DDL for the credential database.

/// Stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 1;

/// One row per slot; the client only ever uses the default slot.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    slot TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    updated_at TEXT NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
