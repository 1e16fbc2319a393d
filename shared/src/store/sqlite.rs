use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, info};

use super::{
    apply_transition, check_discard, check_transition, new_entry, MessageStore, StatusChange,
    StoreError,
};
use crate::model::{
    ClientId, ConversationId, MessageBody, OutgoingMessage, QueuedMessage, SyncStatus,
    UnixTimeMs, UserId,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS queued_messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        client_id TEXT NOT NULL UNIQUE,
        conversation_id TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        sync_status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_queued_conversation ON queued_messages(conversation_id, seq);
    CREATE INDEX IF NOT EXISTS idx_queued_status ON queued_messages(sync_status);
"#;

const COLUMNS: &str = "seq, client_id, conversation_id, sender_id, body, created_at, \
                       updated_at, sync_status, attempts, last_error";

/// SQLite-backed store; every mutation is committed before the call returns.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(storage)?;
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(storage)?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(storage)?;
        info!(path = %path.display(), journal_mode = %journal_mode, "opened message queue");
        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::with_schema(conn)
    }

    fn with_schema(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut conn)
    }
}

fn storage(e: rusqlite::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

struct RawRow {
    seq: i64,
    client_id: String,
    conversation_id: String,
    sender_id: String,
    body: String,
    created_at: i64,
    updated_at: i64,
    sync_status: String,
    attempts: i64,
    last_error: Option<String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        seq: row.get(0)?,
        client_id: row.get(1)?,
        conversation_id: row.get(2)?,
        sender_id: row.get(3)?,
        body: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        sync_status: row.get(7)?,
        attempts: row.get(8)?,
        last_error: row.get(9)?,
    })
}

impl RawRow {
    fn decode(self) -> Result<QueuedMessage, StoreError> {
        let body: MessageBody =
            serde_json::from_str(&self.body).map_err(|e| StoreError::Corrupted {
                client_id: self.client_id.clone(),
                reason: e.to_string(),
            })?;
        let sync_status =
            SyncStatus::parse(&self.sync_status).ok_or_else(|| StoreError::Corrupted {
                client_id: self.client_id.clone(),
                reason: format!("unknown sync status {:?}", self.sync_status),
            })?;

        Ok(QueuedMessage {
            client_id: ClientId(self.client_id),
            conversation_id: ConversationId(self.conversation_id),
            sender_id: UserId(self.sender_id),
            body,
            created_at: UnixTimeMs(self.created_at as u64),
            updated_at: UnixTimeMs(self.updated_at as u64),
            sync_status,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            seq: self.seq as u64,
        })
    }
}

fn select_one(conn: &Connection, client_id: &ClientId) -> Result<Option<QueuedMessage>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM queued_messages WHERE client_id = ?1");
    conn.query_row(&sql, params![client_id.as_str()], read_row)
        .optional()
        .map_err(storage)?
        .map(RawRow::decode)
        .transpose()
}

#[async_trait::async_trait]
impl MessageStore for SqliteStore {
    async fn enqueue(
        &self,
        draft: OutgoingMessage,
        now: UnixTimeMs,
    ) -> Result<QueuedMessage, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage)?;
            let mut entry = new_entry(draft, 0, now);
            if select_one(&tx, &entry.client_id)?.is_some() {
                return Err(StoreError::Duplicate(entry.client_id));
            }

            let body = serde_json::to_string(&entry.body)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            tx.execute(
                "INSERT INTO queued_messages
                    (client_id, conversation_id, sender_id, body, created_at, updated_at, sync_status, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    entry.client_id.as_str(),
                    entry.conversation_id.as_str(),
                    entry.sender_id.as_str(),
                    body,
                    entry.created_at.0 as i64,
                    entry.updated_at.0 as i64,
                    entry.sync_status.as_str(),
                ],
            )
            .map_err(storage)?;
            entry.seq = tx.last_insert_rowid() as u64;
            tx.commit().map_err(storage)?;
            Ok(entry)
        })
    }

    async fn get(&self, client_id: &ClientId) -> Result<Option<QueuedMessage>, StoreError> {
        self.with_conn(|conn| select_one(conn, client_id))
    }

    async fn list_pending(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        self.with_conn(|conn| {
            let rows = match conversation_id {
                Some(conversation_id) => {
                    let sql = format!(
                        "SELECT {COLUMNS} FROM queued_messages
                         WHERE sync_status != 'synced' AND conversation_id = ?1
                         ORDER BY seq ASC"
                    );
                    let mut stmt = conn.prepare(&sql).map_err(storage)?;
                    let rows = stmt
                        .query_map(params![conversation_id.as_str()], read_row)
                        .map_err(storage)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(storage)?;
                    rows
                }
                None => {
                    let sql = format!(
                        "SELECT {COLUMNS} FROM queued_messages
                         WHERE sync_status != 'synced'
                         ORDER BY seq ASC"
                    );
                    let mut stmt = conn.prepare(&sql).map_err(storage)?;
                    let rows = stmt
                        .query_map([], read_row)
                        .map_err(storage)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(storage)?;
                    rows
                }
            };
            // One unreadable row must not hold back the rest of the queue.
            Ok(rows
                .into_iter()
                .filter_map(|row| match row.decode() {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        error!("skipping unreadable queued message: {}", e);
                        None
                    }
                })
                .collect())
        })
    }

    async fn count_pending(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = match conversation_id {
                Some(conversation_id) => conn.query_row(
                    "SELECT COUNT(*) FROM queued_messages
                     WHERE sync_status != 'synced' AND conversation_id = ?1",
                    params![conversation_id.as_str()],
                    |row| row.get(0),
                ),
                None => conn.query_row(
                    "SELECT COUNT(*) FROM queued_messages WHERE sync_status != 'synced'",
                    [],
                    |row| row.get(0),
                ),
            }
            .map_err(storage)?;
            Ok(count as usize)
        })
    }

    async fn mark_status(
        &self,
        client_id: &ClientId,
        status: SyncStatus,
        error: Option<&str>,
        now: UnixTimeMs,
    ) -> Result<StatusChange, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage)?;
            let mut entry = select_one(&tx, client_id)?
                .ok_or_else(|| StoreError::NotFound(client_id.clone()))?;

            let from = entry.sync_status;
            if !check_transition(client_id, from, status)? {
                return Ok(StatusChange::Unchanged(from));
            }
            apply_transition(&mut entry, status, error, now);

            tx.execute(
                "UPDATE queued_messages
                 SET sync_status = ?1, updated_at = ?2, attempts = ?3, last_error = ?4
                 WHERE client_id = ?5",
                params![
                    entry.sync_status.as_str(),
                    entry.updated_at.0 as i64,
                    entry.attempts as i64,
                    entry.last_error.as_deref(),
                    client_id.as_str(),
                ],
            )
            .map_err(storage)?;
            tx.commit().map_err(storage)?;
            Ok(StatusChange::Applied { from, to: status })
        })
    }

    async fn remove(&self, client_id: &ClientId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage)?;
            let removed = match select_one(&tx, client_id)? {
                None => false,
                Some(entry) if entry.sync_status != SyncStatus::Synced => {
                    return Err(StoreError::NotSynced(client_id.clone()));
                }
                Some(_) => {
                    tx.execute(
                        "DELETE FROM queued_messages WHERE client_id = ?1",
                        params![client_id.as_str()],
                    )
                    .map_err(storage)?
                        > 0
                }
            };
            tx.commit().map_err(storage)?;
            Ok(removed)
        })
    }

    async fn discard(&self, client_id: &ClientId) -> Result<QueuedMessage, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage)?;
            let entry = select_one(&tx, client_id)?
                .ok_or_else(|| StoreError::NotFound(client_id.clone()))?;
            check_discard(&entry)?;
            tx.execute(
                "DELETE FROM queued_messages WHERE client_id = ?1",
                params![client_id.as_str()],
            )
            .map_err(storage)?;
            tx.commit().map_err(storage)?;
            Ok(entry)
        })
    }

    async fn prune_synced(&self, older_than: UnixTimeMs) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM queued_messages WHERE sync_status = 'synced' AND updated_at < ?1",
                params![older_than.0 as i64],
            )
            .map_err(storage)
        })
    }
}
