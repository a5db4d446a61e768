//! Durable store of the last-known-synchronized state per item.
//!
//! The journal is the only mutable resource shared across discovery and
//! propagation. It is opened exclusively for the duration of a run; a second
//! open against the same file fails fast with [`JournalError::AlreadyLocked`]
//! instead of interleaving two runs.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};

use crate::errors::{JournalError, Result};
use crate::schema::{DROP_ALL, SCHEMA, SCHEMA_VERSION};
use crate::types::{
    Checksum, ItemId, ItemKind, JournalMutation, JournalRecord, Permissions, PinState, RelPath,
};

/// Sync journal backed by a single SQLite file per sync root.
///
/// All methods take `&self`; the connection is serialized behind a mutex so
/// the journal can be shared across the discovery and propagation tasks of
/// one run. Mutations go through [`Journal::apply`], one transaction each;
/// that commit is the durability point that makes a run crash-resumable.
#[derive(Debug)]
pub struct Journal {
    conn: Mutex<Connection>,
    rebuilt: bool,
}

impl Journal {
    /// Open or create the journal at `path`, taking the run lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// In-memory journal for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // Hold the file exclusively for the whole run; a concurrent run sees
        // SQLITE_BUSY immediately instead of waiting.
        conn.busy_timeout(std::time::Duration::from_millis(0))?;
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")
            .map_err(map_busy)?;

        let mut journal = Self {
            conn: Mutex::new(conn),
            rebuilt: false,
        };
        journal.initialize()?;
        Ok(journal)
    }

    fn initialize(&mut self) -> Result<()> {
        let conn = self.conn.lock().expect("journal mutex poisoned");

        let version: Option<u32> = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();

        match version {
            None => {
                info!("Initializing new journal schema");
                conn.execute_batch(SCHEMA).map_err(map_busy)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )
                .map_err(map_busy)?;
            }
            Some(v) if v != SCHEMA_VERSION => {
                // A version mismatch is not fatal: rebuild and let the next
                // run rediscover everything from scratch.
                warn!(
                    "Journal schema version {} does not match {}, rebuilding",
                    v, SCHEMA_VERSION
                );
                conn.execute_batch(DROP_ALL)?;
                conn.execute_batch(SCHEMA)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
                self.rebuilt = true;
            }
            Some(_) => {
                debug!("Journal schema up to date (version {})", SCHEMA_VERSION);
                // Still need the run lock: probe with an immediate write txn.
                conn.execute_batch("BEGIN IMMEDIATE; COMMIT;")
                    .map_err(map_busy)?;
            }
        }

        Ok(())
    }

    /// True when the schema was rebuilt at open time; every item will then
    /// classify as new on both sides and rediscovery runs from scratch.
    pub fn was_rebuilt(&self) -> bool {
        self.rebuilt
    }

    /// Look up a record by its stable remote identity.
    pub fn get(&self, item_id: &ItemId) -> Result<Option<JournalRecord>> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        conn.query_row(
            &format!("{SELECT_RECORD} WHERE item_id = ?1"),
            params![item_id.as_str()],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Look up a record by path (secondary index).
    pub fn get_by_path(&self, path: &RelPath) -> Result<Option<JournalRecord>> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        conn.query_row(
            &format!("{SELECT_RECORD} WHERE path = ?1"),
            params![path.as_str()],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// All records, ordered by path.
    pub fn all_records(&self) -> Result<Vec<JournalRecord>> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        let mut stmt = conn.prepare(&format!("{SELECT_RECORD} ORDER BY path"))?;
        let rows = stmt.query_map([], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Records at or beneath `prefix`, ordered by path.
    pub fn records_under(&self, prefix: &RelPath) -> Result<Vec<JournalRecord>> {
        if prefix.is_root() {
            return self.all_records();
        }
        let conn = self.conn.lock().expect("journal mutex poisoned");
        let mut stmt =
            conn.prepare(&format!("{SELECT_RECORD} WHERE path = ?1 OR path LIKE ?2 ORDER BY path"))?;
        let like = format!("{}/%", prefix.as_str());
        let rows = stmt.query_map(params![prefix.as_str(), like], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Direct children of a directory record.
    pub fn children_of(&self, parent: &ItemId) -> Result<Vec<JournalRecord>> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        let mut stmt = conn.prepare(&format!("{SELECT_RECORD} WHERE parent_id = ?1 ORDER BY path"))?;
        let rows = stmt.query_map(params![parent.as_str()], row_to_record)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn len(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .map_err(Into::into)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Commit one mutation in its own transaction.
    ///
    /// Propagation calls this exactly once per successfully applied job,
    /// before any dependent job is released.
    pub fn apply(&self, mutation: &JournalMutation) -> Result<()> {
        let mut conn = self.conn.lock().expect("journal mutex poisoned");
        let tx = conn.transaction()?;

        match mutation {
            JournalMutation::Upsert(record) => {
                // A restored or re-created item takes over its path under a
                // fresh remote identity; the superseded row goes with it.
                tx.execute(
                    "DELETE FROM items WHERE path = ?1 AND item_id != ?2",
                    params![record.path.as_str(), record.item_id.as_str()],
                )?;
                tx.execute(
                    r#"
                    INSERT INTO items
                        (item_id, path, parent_id, etag, size, mtime,
                         permissions, checksum, kind, pin_state, in_conflict)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    ON CONFLICT(item_id) DO UPDATE SET
                        path = excluded.path,
                        parent_id = excluded.parent_id,
                        etag = excluded.etag,
                        size = excluded.size,
                        mtime = excluded.mtime,
                        permissions = excluded.permissions,
                        checksum = excluded.checksum,
                        kind = excluded.kind,
                        pin_state = excluded.pin_state,
                        in_conflict = excluded.in_conflict,
                        updated_at = CURRENT_TIMESTAMP
                    "#,
                    params![
                        record.item_id.as_str(),
                        record.path.as_str(),
                        record.parent_id.as_ref().map(|p| p.as_str()),
                        record.etag,
                        record.size as i64,
                        record.mtime.to_rfc3339(),
                        record.permissions.0,
                        record.checksum.as_ref().map(|c| c.to_string()),
                        kind_to_sql(record.kind),
                        pin_to_sql(record.pin_state),
                        record.in_conflict,
                    ],
                )?;
            }
            JournalMutation::Delete(item_id) => {
                tx.execute("DELETE FROM items WHERE item_id = ?1", params![item_id.as_str()])?;
            }
            JournalMutation::Rename { item_id, to } => {
                let old_path: Option<String> = tx
                    .query_row(
                        "SELECT path FROM items WHERE item_id = ?1",
                        params![item_id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let old_path = old_path.ok_or_else(|| {
                    JournalError::Corrupt(format!("rename of unknown item {item_id}"))
                })?;

                tx.execute(
                    "DELETE FROM items WHERE path = ?1 AND item_id != ?2",
                    params![to.as_str(), item_id.as_str()],
                )?;
                tx.execute(
                    "UPDATE items SET path = ?1, updated_at = CURRENT_TIMESTAMP WHERE item_id = ?2",
                    params![to.as_str(), item_id.as_str()],
                )?;
                // A directory rename moves every recorded descendant with it.
                tx.execute(
                    "UPDATE items
                     SET path = ?1 || substr(path, ?2), updated_at = CURRENT_TIMESTAMP
                     WHERE path LIKE ?3",
                    params![
                        to.as_str(),
                        old_path.len() as i64 + 1,
                        format!("{}/%", old_path),
                    ],
                )?;
            }
            JournalMutation::SetConflict { item_id, flag } => {
                tx.execute(
                    "UPDATE items SET in_conflict = ?1, updated_at = CURRENT_TIMESTAMP
                     WHERE item_id = ?2",
                    params![flag, item_id.as_str()],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Reclaim space after large delete batches.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        conn.execute("VACUUM", [])?;
        Ok(())
    }
}

const SELECT_RECORD: &str = "SELECT item_id, path, parent_id, etag, size, mtime, \
     permissions, checksum, kind, pin_state, in_conflict FROM items";

fn map_busy(err: rusqlite::Error) -> JournalError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == ErrorCode::DatabaseBusy || code.code == ErrorCode::DatabaseLocked =>
        {
            JournalError::AlreadyLocked
        }
        _ => JournalError::Database(err),
    }
}

fn kind_to_sql(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::File => "file",
        ItemKind::Directory => "dir",
    }
}

fn pin_to_sql(pin: PinState) -> &'static str {
    match pin {
        PinState::AlwaysLocal => "always_local",
        PinState::OnlineOnly => "online_only",
        PinState::Inherited => "inherited",
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalRecord> {
    let mtime_raw: String = row.get(5)?;
    let mtime = DateTime::parse_from_rfc3339(&mtime_raw)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    let kind = match row.get::<_, String>(8)?.as_str() {
        "dir" => ItemKind::Directory,
        _ => ItemKind::File,
    };
    let pin_state = match row.get::<_, String>(9)?.as_str() {
        "always_local" => PinState::AlwaysLocal,
        "online_only" => PinState::OnlineOnly,
        _ => PinState::Inherited,
    };

    Ok(JournalRecord {
        item_id: ItemId::new(row.get::<_, String>(0)?),
        path: RelPath::new(row.get::<_, String>(1)?),
        parent_id: row.get::<_, Option<String>>(2)?.map(ItemId::new),
        etag: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        mtime,
        permissions: Permissions(row.get(6)?),
        checksum: row
            .get::<_, Option<String>>(7)?
            .map(|raw| Checksum::parse(&raw)),
        kind,
        pin_state,
        in_conflict: row.get(10)?,
    })
}
