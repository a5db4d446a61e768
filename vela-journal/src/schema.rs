/// Journal schema version; a mismatch at open time rebuilds the journal and
/// forces full rediscovery on the next run.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL schema for the sync journal
pub const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

-- One row per item that was successfully synchronized at least once.
-- item_id is remote-issued identity; path is a secondary index only.
CREATE TABLE IF NOT EXISTS items (
    item_id TEXT PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    parent_id TEXT,
    etag TEXT NOT NULL,
    size INTEGER NOT NULL,
    mtime TEXT NOT NULL,
    permissions INTEGER NOT NULL,
    checksum TEXT,
    kind TEXT NOT NULL CHECK (kind IN ('file', 'dir')),
    pin_state TEXT NOT NULL DEFAULT 'inherited'
        CHECK (pin_state IN ('always_local', 'online_only', 'inherited')),
    in_conflict INTEGER NOT NULL DEFAULT 0,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_items_path ON items(path);
CREATE INDEX IF NOT EXISTS idx_items_parent ON items(parent_id);
"#;

/// Statements that tear the journal down for a schema rebuild.
pub const DROP_ALL: &str = r#"
DROP TABLE IF EXISTS items;
DROP TABLE IF EXISTS schema_version;
"#;
