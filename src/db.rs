//! Repository: persistence for threads and messages.
//!
//! Every blocking `rusqlite` call is wrapped in `tokio::task::spawn_blocking`
//! so the connection mutex is never held across an `.await` — the teacher
//! calls `rusqlite` directly from async fns without this, which would stall
//! the runtime once many chat streams are persisting concurrently.

mod pagination;
mod schema;

pub use pagination::{Cursor, Page};
pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::agents::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transient failure, retries exhausted: {0}")]
    Transient(String),
    #[error("blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type DbResult<T> = Result<T, DbError>;

/// `SQLITE_BUSY`/`SQLITE_LOCKED` indicate the write didn't happen at all —
/// safe to retry. Everything else (including other `rusqlite::Error`
/// variants) is permanent.
fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Every successful write returns an opaque session token alongside the
/// entity it wrote. This backend serves every request off one shared
/// connection, so read-your-writes is already guaranteed and the token is a
/// constant; a distributed backend would mint a real causal token here.
const SESSION_TOKEN: &str = "sqlite-single-conn";

#[derive(Debug, Clone)]
pub struct Written<T> {
    pub value: T,
    pub session_token: String,
}

impl<T> Written<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            session_token: SESSION_TOKEN.to_string(),
        }
    }
}

/// Optimistic-concurrency precondition for a mutating call.
#[derive(Debug, Clone, Default)]
pub enum IfMatch {
    /// No precondition; overwrite unconditionally.
    #[default]
    Any,
    /// Fail with `Conflict` unless the current ETag equals this value.
    Tag(String),
}

/// Thread-safe database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    async fn blocking<F, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            f(&guard)
        })
        .await?
    }

    /// Like `blocking`, but re-invokes `make` (a factory for a fresh
    /// single-shot closure) with `RetryPolicy`-style backoff whenever the
    /// prior attempt failed with a transient `SQLITE_BUSY`/`SQLITE_LOCKED`.
    /// `NotFound`/`Conflict`/`Invalid` and any non-transient `Sqlite` error
    /// are permanent and returned on the first attempt.
    async fn blocking_retrying<Make, F, T>(&self, make: Make) -> DbResult<T>
    where
        Make: Fn() -> F,
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let policy = RetryPolicy::default();
        let mut attempt = 0u32;
        loop {
            match self.blocking(make()).await {
                Ok(value) => return Ok(value),
                Err(DbError::Sqlite(e)) if is_transient(&e) => {
                    if attempt + 1 >= policy.max_attempts {
                        return Err(DbError::Transient(e.to_string()));
                    }
                    attempt += 1;
                    tokio::time::sleep(policy.calculate_delay(attempt)).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    // ==================== Thread operations ====================

    pub async fn create_thread(
        &self,
        id: String,
        user_id: String,
        title: Option<String>,
        metadata: serde_json::Value,
        trace_id: Option<String>,
    ) -> DbResult<Written<Thread>> {
        self.blocking_retrying(|| {
            let id = id.clone();
            let user_id = user_id.clone();
            let title = title.clone();
            let metadata = metadata.clone();
            let trace_id = trace_id.clone();
            move |conn: &Connection| {
                let now = Utc::now();
                let etag = new_etag();
                let metadata_str = serde_json::to_string(&metadata).unwrap_or_default();
                conn.execute(
                    "INSERT INTO threads (id, user_id, title, is_bookmarked, metadata, trace_id, created_at, last_modified_at, is_deleted, etag, version)
                     VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?6, 0, ?7, 1)",
                    params![id, user_id, title, metadata_str, trace_id, now.to_rfc3339(), etag],
                )?;
                Ok(Thread {
                    id,
                    user_id,
                    title,
                    is_bookmarked: false,
                    metadata,
                    trace_id,
                    created_at: now,
                    last_modified_at: now,
                    is_deleted: false,
                    etag,
                    version: 1,
                })
            }
        })
        .await
        .map(Written::new)
    }

    pub async fn get_thread(&self, id: String) -> DbResult<Option<Thread>> {
        self.blocking(move |conn| {
            let result = conn.query_row(
                "SELECT id, user_id, title, is_bookmarked, metadata, trace_id, created_at, last_modified_at, is_deleted, etag, version
                 FROM threads WHERE id = ?1",
                params![id],
                row_to_thread,
            );
            match result {
                Ok(thread) => Ok(Some(thread)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(DbError::from(e)),
            }
        })
        .await
    }

    /// Apply `mutate` to the current thread and write it back, honoring
    /// `if_match`. On `Conflict` and `retry_once = true`, refetches once and
    /// reapplies `mutate` before giving up.
    pub async fn update_thread<F>(
        &self,
        id: String,
        if_match: IfMatch,
        retry_once: bool,
        mutate: F,
    ) -> DbResult<Written<Thread>>
    where
        F: Fn(&mut Thread) + Clone + Send + 'static,
    {
        self.blocking_retrying(|| {
            let id = id.clone();
            let if_match = if_match.clone();
            let mutate = mutate.clone();
            move |conn: &Connection| {
            let attempt = |conn: &Connection, if_match: &IfMatch| -> DbResult<Thread> {
                let mut thread = match conn.query_row(
                    "SELECT id, user_id, title, is_bookmarked, metadata, trace_id, created_at, last_modified_at, is_deleted, etag, version
                     FROM threads WHERE id = ?1",
                    params![id],
                    row_to_thread,
                ) {
                    Ok(t) => t,
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        return Err(DbError::NotFound(id.clone()))
                    }
                    Err(e) => return Err(DbError::from(e)),
                };
                if let IfMatch::Tag(expected) = if_match {
                    if &thread.etag != expected {
                        return Err(DbError::Conflict(format!(
                            "thread {id} etag mismatch"
                        )));
                    }
                }
                mutate(&mut thread);
                thread.last_modified_at = Utc::now();
                thread.etag = new_etag();
                thread.version += 1;
                let metadata_str = serde_json::to_string(&thread.metadata).unwrap_or_default();
                conn.execute(
                    "UPDATE threads SET title = ?1, is_bookmarked = ?2, metadata = ?3, last_modified_at = ?4, etag = ?5, version = ?6
                     WHERE id = ?7",
                    params![
                        thread.title,
                        thread.is_bookmarked,
                        metadata_str,
                        thread.last_modified_at.to_rfc3339(),
                        thread.etag,
                        thread.version,
                        thread.id,
                    ],
                )?;
                Ok(thread)
            };

            match attempt(conn, &if_match) {
                Err(DbError::Conflict(_)) if retry_once => attempt(conn, &IfMatch::Any),
                other => other,
            }
            }
        })
        .await
        .map(Written::new)
    }

    pub async fn touch_thread(&self, id: String) -> DbResult<Written<()>> {
        self.blocking_retrying(|| {
            let id = id.clone();
            move |conn: &Connection| {
                let now = Utc::now().to_rfc3339();
                let updated = conn.execute(
                    "UPDATE threads SET last_modified_at = ?1, etag = ?2 WHERE id = ?3 AND is_deleted = 0",
                    params![now, new_etag(), id],
                )?;
                if updated == 0 {
                    return Err(DbError::NotFound(id));
                }
                Ok(())
            }
        })
        .await
        .map(Written::new)
    }

    pub async fn soft_delete_thread(&self, id: String, if_match: IfMatch) -> DbResult<Written<()>> {
        self.blocking_retrying(|| {
            let id = id.clone();
            let if_match = if_match.clone();
            move |conn: &Connection| {
                if let IfMatch::Tag(expected) = &if_match {
                    let current: String = conn
                        .query_row("SELECT etag FROM threads WHERE id = ?1", params![id], |r| {
                            r.get(0)
                        })
                        .map_err(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(id.clone()),
                            other => DbError::from(other),
                        })?;
                    if &current != expected {
                        return Err(DbError::Conflict(format!("thread {id} etag mismatch")));
                    }
                }
                let updated = conn.execute(
                    "UPDATE threads SET is_deleted = 1, last_modified_at = ?1, etag = ?2 WHERE id = ?3",
                    params![Utc::now().to_rfc3339(), new_etag(), id],
                )?;
                if updated == 0 {
                    return Err(DbError::NotFound(id));
                }
                Ok(())
            }
        })
        .await
        .map(Written::new)
    }

    pub async fn restore_thread(&self, id: String) -> DbResult<Written<()>> {
        self.blocking_retrying(|| {
            let id = id.clone();
            move |conn: &Connection| {
                let updated = conn.execute(
                    "UPDATE threads SET is_deleted = 0, last_modified_at = ?1, etag = ?2 WHERE id = ?3",
                    params![Utc::now().to_rfc3339(), new_etag(), id],
                )?;
                if updated == 0 {
                    return Err(DbError::NotFound(id));
                }
                Ok(())
            }
        })
        .await
        .map(Written::new)
    }

    pub async fn hard_delete_thread(&self, id: String) -> DbResult<Written<()>> {
        self.blocking_retrying(|| {
            let id = id.clone();
            move |conn: &Connection| {
                let deleted = conn.execute("DELETE FROM threads WHERE id = ?1", params![id])?;
                if deleted == 0 {
                    return Err(DbError::NotFound(id));
                }
                Ok(())
            }
        })
        .await
        .map(Written::new)
    }

    pub async fn list_threads(
        &self,
        user_id: String,
        limit: usize,
        cursor: Option<String>,
        include_deleted: bool,
    ) -> DbResult<Page<Thread>> {
        let limit = limit.clamp(1, 50);
        self.blocking(move |conn| {
            let after: Option<(String, String)> = match cursor {
                Some(token) => {
                    let c = Cursor::decode(&token).map_err(DbError::Invalid)?;
                    Some((c.last_sort_value, c.last_key))
                }
                None => None,
            };

            let deleted_clause = if include_deleted { "" } else { "AND is_deleted = 0" };
            let sql = format!(
                "SELECT id, user_id, title, is_bookmarked, metadata, trace_id, created_at, last_modified_at, is_deleted, etag, version
                 FROM threads
                 WHERE user_id = ?1 {deleted_clause}
                   AND (?2 IS NULL OR (last_modified_at, id) < (?2, ?3))
                 ORDER BY last_modified_at DESC, id DESC
                 LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let (last_sort, last_key) = match &after {
                Some((s, k)) => (Some(s.clone()), Some(k.clone())),
                None => (None, None),
            };
            let rows = stmt.query_map(
                params![user_id, last_sort, last_key, (limit + 1) as i64],
                row_to_thread,
            )?;
            let mut items: Vec<Thread> = rows.collect::<Result<Vec<_>, _>>()?;

            let has_more = items.len() > limit;
            items.truncate(limit);
            let continuation_token = if has_more {
                items.last().map(|t| {
                    Cursor {
                        last_key: t.id.clone(),
                        last_sort_value: t.last_modified_at.to_rfc3339(),
                    }
                    .encode()
                })
            } else {
                None
            };
            Ok(Page {
                items,
                continuation_token,
                has_more,
            })
        })
        .await
    }

    // ==================== Message operations ====================

    /// Insert or overwrite a message by id (upsert). Used both for the
    /// initial user-turn write and for the coordinator's periodic partial
    /// persistence of an in-progress assistant message.
    pub async fn upsert_message(
        &self,
        id: String,
        thread_id: String,
        user_id: String,
        role: Role,
        content: String,
        metadata: serde_json::Value,
        if_match: IfMatch,
    ) -> DbResult<Written<Message>> {
        self.blocking_retrying(|| {
            let id = id.clone();
            let thread_id = thread_id.clone();
            let user_id = user_id.clone();
            let content = content.clone();
            let metadata = metadata.clone();
            let if_match = if_match.clone();
            move |conn: &Connection| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT etag FROM messages WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(DbError::from(other)),
                    })?;

                if let (Some(current), IfMatch::Tag(expected)) = (&existing, &if_match) {
                    if current != expected {
                        return Err(DbError::Conflict(format!("message {id} etag mismatch")));
                    }
                }

                let now = Utc::now();
                let etag = new_etag();
                let metadata_str = serde_json::to_string(&metadata).unwrap_or_default();
                let version = if existing.is_some() {
                    let v: i64 = conn.query_row(
                        "SELECT version FROM messages WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )?;
                    v + 1
                } else {
                    1
                };
                let created_at = if existing.is_some() {
                    conn.query_row(
                        "SELECT created_at FROM messages WHERE id = ?1",
                        params![id],
                        |r| r.get::<_, String>(0),
                    )
                    .map(|s| parse_datetime(&s))?
                } else {
                    now
                };

                conn.execute(
                    "INSERT INTO messages (id, thread_id, user_id, role, content, metadata, created_at, last_modified_at, is_deleted, etag, version)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                         content = excluded.content,
                         metadata = excluded.metadata,
                         last_modified_at = excluded.last_modified_at,
                         etag = excluded.etag,
                         version = excluded.version",
                    params![
                        id,
                        thread_id,
                        user_id,
                        role.to_string(),
                        content,
                        metadata_str,
                        created_at.to_rfc3339(),
                        now.to_rfc3339(),
                        etag,
                        version,
                    ],
                )?;

                conn.execute(
                    "UPDATE threads SET last_modified_at = ?1, etag = ?2 WHERE id = ?3",
                    params![now.to_rfc3339(), new_etag(), thread_id],
                )?;

                Ok(Message {
                    id,
                    thread_id,
                    user_id,
                    role,
                    content,
                    metadata,
                    created_at,
                    last_modified_at: now,
                    is_deleted: false,
                    etag,
                    version,
                })
            }
        })
        .await
        .map(Written::new)
    }

    pub async fn get_message(&self, id: String) -> DbResult<Option<Message>> {
        self.blocking(move |conn| {
            let result = conn.query_row(
                "SELECT id, thread_id, user_id, role, content, metadata, created_at, last_modified_at, is_deleted, etag, version
                 FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            );
            match result {
                Ok(m) => Ok(Some(m)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(DbError::from(e)),
            }
        })
        .await
    }

    pub async fn list_messages(
        &self,
        thread_id: String,
        limit: usize,
        cursor: Option<String>,
    ) -> DbResult<Page<Message>> {
        let limit = limit.clamp(1, 100);
        self.blocking(move |conn| {
            let after: Option<(String, String)> = match cursor {
                Some(token) => {
                    let c = Cursor::decode(&token).map_err(DbError::Invalid)?;
                    Some((c.last_sort_value, c.last_key))
                }
                None => None,
            };
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, user_id, role, content, metadata, created_at, last_modified_at, is_deleted, etag, version
                 FROM messages
                 WHERE thread_id = ?1 AND is_deleted = 0
                   AND (?2 IS NULL OR (created_at, id) > (?2, ?3))
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?4",
            )?;
            let (last_sort, last_key) = match &after {
                Some((s, k)) => (Some(s.clone()), Some(k.clone())),
                None => (None, None),
            };
            let rows = stmt.query_map(
                params![thread_id, last_sort, last_key, (limit + 1) as i64],
                row_to_message,
            )?;
            let mut items: Vec<Message> = rows.collect::<Result<Vec<_>, _>>()?;
            let has_more = items.len() > limit;
            items.truncate(limit);
            let continuation_token = if has_more {
                items.last().map(|m| {
                    Cursor {
                        last_key: m.id.clone(),
                        last_sort_value: m.created_at.to_rfc3339(),
                    }
                    .encode()
                })
            } else {
                None
            };
            Ok(Page {
                items,
                continuation_token,
                has_more,
            })
        })
        .await
    }

    pub async fn soft_delete_message(&self, id: String) -> DbResult<Written<()>> {
        self.blocking_retrying(|| {
            let id = id.clone();
            move |conn: &Connection| {
                let updated = conn.execute(
                    "UPDATE messages SET is_deleted = 1, last_modified_at = ?1, etag = ?2 WHERE id = ?3",
                    params![Utc::now().to_rfc3339(), new_etag(), id],
                )?;
                if updated == 0 {
                    return Err(DbError::NotFound(id));
                }
                Ok(())
            }
        })
        .await
        .map(Written::new)
    }

    pub async fn hard_delete_message(&self, id: String) -> DbResult<Written<()>> {
        self.blocking_retrying(|| {
            let id = id.clone();
            move |conn: &Connection| {
                let deleted = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                if deleted == 0 {
                    return Err(DbError::NotFound(id));
                }
                Ok(())
            }
        })
        .await
        .map(Written::new)
    }

    /// Apply `mutate` to the current message and write it back, honoring
    /// `if_match`. Mirrors `update_thread`'s single-retry shape.
    pub async fn update_message<F>(
        &self,
        id: String,
        if_match: IfMatch,
        retry_once: bool,
        mutate: F,
    ) -> DbResult<Written<Message>>
    where
        F: Fn(&mut Message) + Clone + Send + 'static,
    {
        self.blocking_retrying(|| {
            let id = id.clone();
            let if_match = if_match.clone();
            let mutate = mutate.clone();
            move |conn: &Connection| {
                let attempt = |conn: &Connection, if_match: &IfMatch| -> DbResult<Message> {
                    let mut message = match conn.query_row(
                        "SELECT id, thread_id, user_id, role, content, metadata, created_at, last_modified_at, is_deleted, etag, version
                         FROM messages WHERE id = ?1",
                        params![id],
                        row_to_message,
                    ) {
                        Ok(m) => m,
                        Err(rusqlite::Error::QueryReturnedNoRows) => {
                            return Err(DbError::NotFound(id.clone()))
                        }
                        Err(e) => return Err(DbError::from(e)),
                    };
                    if let IfMatch::Tag(expected) = if_match {
                        if &message.etag != expected {
                            return Err(DbError::Conflict(format!("message {id} etag mismatch")));
                        }
                    }
                    mutate(&mut message);
                    message.last_modified_at = Utc::now();
                    message.etag = new_etag();
                    message.version += 1;
                    let metadata_str = serde_json::to_string(&message.metadata).unwrap_or_default();
                    conn.execute(
                        "UPDATE messages SET content = ?1, metadata = ?2, last_modified_at = ?3, etag = ?4, version = ?5
                         WHERE id = ?6",
                        params![
                            message.content,
                            metadata_str,
                            message.last_modified_at.to_rfc3339(),
                            message.etag,
                            message.version,
                            message.id,
                        ],
                    )?;
                    Ok(message)
                };

                match attempt(conn, &if_match) {
                    Err(DbError::Conflict(_)) if retry_once => attempt(conn, &IfMatch::Any),
                    other => other,
                }
            }
        })
        .await
        .map(Written::new)
    }

    pub async fn count_messages(&self, thread_id: String) -> DbResult<usize> {
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE thread_id = ?1 AND is_deleted = 0",
                params![thread_id],
                |r| r.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    pub async fn get_last_message(&self, thread_id: String) -> DbResult<Option<Message>> {
        self.blocking(move |conn| {
            let result = conn.query_row(
                "SELECT id, thread_id, user_id, role, content, metadata, created_at, last_modified_at, is_deleted, etag, version
                 FROM messages WHERE thread_id = ?1 AND is_deleted = 0
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![thread_id],
                row_to_message,
            );
            match result {
                Ok(m) => Ok(Some(m)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(DbError::from(e)),
            }
        })
        .await
    }

    /// Upsert many messages in one transaction; used by bulk-import paths
    /// rather than the per-event streaming path, which calls `upsert_message`
    /// once per partial flush.
    pub async fn bulk_upsert_messages(&self, messages: Vec<NewMessage>) -> DbResult<Written<Vec<Message>>> {
        self.blocking_retrying(|| {
            let messages = messages.clone();
            move |conn: &Connection| {
            let tx = conn.unchecked_transaction()?;
            let mut written = Vec::with_capacity(messages.len());
            for m in messages {
                let existing: Option<(String, i64, String)> = tx
                    .query_row(
                        "SELECT etag, version, created_at FROM messages WHERE id = ?1",
                        params![m.id],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(DbError::from(other)),
                    })?;

                let now = Utc::now();
                let etag = new_etag();
                let metadata_str = serde_json::to_string(&m.metadata).unwrap_or_default();
                let (version, created_at) = match &existing {
                    Some((_, v, created)) => (v + 1, parse_datetime(created)),
                    None => (1, now),
                };

                tx.execute(
                    "INSERT INTO messages (id, thread_id, user_id, role, content, metadata, created_at, last_modified_at, is_deleted, etag, version)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                         content = excluded.content,
                         metadata = excluded.metadata,
                         last_modified_at = excluded.last_modified_at,
                         etag = excluded.etag,
                         version = excluded.version",
                    params![
                        m.id,
                        m.thread_id,
                        m.user_id,
                        m.role.to_string(),
                        m.content,
                        metadata_str,
                        created_at.to_rfc3339(),
                        now.to_rfc3339(),
                        etag,
                        version,
                    ],
                )?;

                written.push(Message {
                    id: m.id,
                    thread_id: m.thread_id,
                    user_id: m.user_id,
                    role: m.role,
                    content: m.content,
                    metadata: m.metadata,
                    created_at,
                    last_modified_at: now,
                    is_deleted: false,
                    etag,
                    version,
                });
            }
            tx.commit()?;
            Ok(written)
            }
        })
        .await
        .map(Written::new)
    }

    /// Soft-delete many messages in one transaction. Missing ids are
    /// skipped rather than failing the whole batch, matching the
    /// best-effort shape of the rest of the bulk surface.
    pub async fn bulk_delete_messages(&self, ids: Vec<String>) -> DbResult<Written<usize>> {
        self.blocking_retrying(|| {
            let ids = ids.clone();
            move |conn: &Connection| {
                let tx = conn.unchecked_transaction()?;
                let mut deleted = 0usize;
                for id in ids {
                    let updated = tx.execute(
                        "UPDATE messages SET is_deleted = 1, last_modified_at = ?1, etag = ?2 WHERE id = ?3",
                        params![Utc::now().to_rfc3339(), new_etag(), id],
                    )?;
                    deleted += updated;
                }
                tx.commit()?;
                Ok(deleted)
            }
        })
        .await
        .map(Written::new)
    }
}

/// Input to `Database::bulk_upsert_messages`; bundles the same fields
/// `upsert_message` takes positionally, since a `Vec` of 6-tuples reads
/// poorly at call sites.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub thread_id: String,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: serde_json::Value,
}

fn row_to_thread(row: &rusqlite::Row) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        is_bookmarked: row.get(3)?,
        metadata: row
            .get::<_, Option<String>>(4)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        trace_id: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        last_modified_at: parse_datetime(&row.get::<_, String>(7)?),
        is_deleted: row.get(8)?,
        etag: row.get(9)?,
        version: row.get(10)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role_str: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        user_id: row.get(2)?,
        role: role_str.parse().unwrap_or(Role::System),
        content: row.get(4)?,
        metadata: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        last_modified_at: parse_datetime(&row.get::<_, String>(7)?),
        is_deleted: row.get(8)?,
        etag: row.get(9)?,
        version: row.get(10)?,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_thread() {
        let db = Database::open_in_memory().unwrap();
        let thread = db
            .create_thread(
                "t1".into(),
                "u1".into(),
                Some("Hello".into()),
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(thread.value.version, 1);

        let fetched = db.get_thread("t1".into()).await.unwrap().unwrap();
        assert_eq!(fetched.id, "t1");
        assert_eq!(fetched.user_id, "u1");
    }

    #[tokio::test]
    async fn get_missing_thread_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_thread("missing".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn etag_conflict_on_stale_if_match() {
        let db = Database::open_in_memory().unwrap();
        let thread = db
            .create_thread("t1".into(), "u1".into(), None, serde_json::json!({}), None)
            .await
            .unwrap();

        // First update with the correct etag succeeds.
        let updated = db
            .update_thread(
                "t1".into(),
                IfMatch::Tag(thread.value.etag.clone()),
                false,
                |t| t.title = Some("A".into()),
            )
            .await
            .unwrap();
        assert_eq!(updated.value.title.as_deref(), Some("A"));

        // Second update with the now-stale etag conflicts.
        let result = db
            .update_thread(
                "t1".into(),
                IfMatch::Tag(thread.value.etag),
                false,
                |t| t.title = Some("B".into()),
            )
            .await;
        assert!(matches!(result, Err(DbError::Conflict(_))));

        let current = db.get_thread("t1".into()).await.unwrap().unwrap();
        assert_eq!(current.title.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn soft_delete_hides_then_restore_reveals() {
        let db = Database::open_in_memory().unwrap();
        db.create_thread("t1".into(), "u1".into(), None, serde_json::json!({}), None)
            .await
            .unwrap();

        db.soft_delete_thread("t1".into(), IfMatch::Any).await.unwrap();
        let page = db
            .list_threads("u1".into(), 10, None, false)
            .await
            .unwrap();
        assert!(page.items.is_empty());

        db.restore_thread("t1".into()).await.unwrap();
        let page = db
            .list_threads("u1".into(), 10, None, false)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn message_upsert_is_idempotent_by_id() {
        let db = Database::open_in_memory().unwrap();
        db.create_thread("t1".into(), "u1".into(), None, serde_json::json!({}), None)
            .await
            .unwrap();

        let m1 = db
            .upsert_message(
                "m1".into(),
                "t1".into(),
                "u1".into(),
                Role::Assistant,
                "partial".into(),
                serde_json::json!({}),
                IfMatch::Any,
            )
            .await
            .unwrap();
        assert_eq!(m1.value.version, 1);

        let m2 = db
            .upsert_message(
                "m1".into(),
                "t1".into(),
                "u1".into(),
                Role::Assistant,
                "partial and more".into(),
                serde_json::json!({}),
                IfMatch::Any,
            )
            .await
            .unwrap();
        assert_eq!(m2.value.version, 2);
        assert_eq!(m2.value.created_at, m1.value.created_at);

        let page = db.list_messages("t1".into(), 10, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].content, "partial and more");
    }

    #[tokio::test]
    async fn message_pagination_is_complete() {
        let db = Database::open_in_memory().unwrap();
        db.create_thread("t1".into(), "u1".into(), None, serde_json::json!({}), None)
            .await
            .unwrap();
        for i in 0..5 {
            db.upsert_message(
                format!("m{i}"),
                "t1".into(),
                "u1".into(),
                Role::User,
                format!("message {i}"),
                serde_json::json!({}),
                IfMatch::Any,
            )
            .await
            .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = db
                .list_messages("t1".into(), 2, cursor.clone())
                .await
                .unwrap();
            seen.extend(page.items.into_iter().map(|m| m.id));
            if !page.has_more {
                break;
            }
            cursor = page.continuation_token;
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn update_message_bumps_version_and_etag() {
        let db = Database::open_in_memory().unwrap();
        db.create_thread("t1".into(), "u1".into(), None, serde_json::json!({}), None)
            .await
            .unwrap();
        let created = db
            .upsert_message(
                "m1".into(),
                "t1".into(),
                "u1".into(),
                Role::User,
                "hello".into(),
                serde_json::json!({}),
                IfMatch::Any,
            )
            .await
            .unwrap();

        let updated = db
            .update_message("m1".into(), IfMatch::Any, false, |m| {
                m.content = "hello, edited".into();
            })
            .await
            .unwrap();

        assert_eq!(updated.value.content, "hello, edited");
        assert_eq!(updated.value.version, 2);
        assert_ne!(updated.value.etag, created.value.etag);
    }

    #[tokio::test]
    async fn count_and_get_last_message_reflect_thread_state() {
        let db = Database::open_in_memory().unwrap();
        db.create_thread("t1".into(), "u1".into(), None, serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(db.count_messages("t1".into()).await.unwrap(), 0);
        assert!(db.get_last_message("t1".into()).await.unwrap().is_none());

        for i in 0..3 {
            db.upsert_message(
                format!("m{i}"),
                "t1".into(),
                "u1".into(),
                Role::User,
                format!("message {i}"),
                serde_json::json!({}),
                IfMatch::Any,
            )
            .await
            .unwrap();
        }

        assert_eq!(db.count_messages("t1".into()).await.unwrap(), 3);
        let last = db.get_last_message("t1".into()).await.unwrap().unwrap();
        assert_eq!(last.id, "m2");
    }

    #[tokio::test]
    async fn bulk_upsert_and_bulk_delete_messages() {
        let db = Database::open_in_memory().unwrap();
        db.create_thread("t1".into(), "u1".into(), None, serde_json::json!({}), None)
            .await
            .unwrap();

        let batch = (0..3)
            .map(|i| NewMessage {
                id: format!("m{i}"),
                thread_id: "t1".into(),
                user_id: "u1".into(),
                role: Role::User,
                content: format!("message {i}"),
                metadata: serde_json::json!({}),
            })
            .collect();
        let written = db.bulk_upsert_messages(batch).await.unwrap();
        assert_eq!(written.value.len(), 3);
        assert_eq!(db.count_messages("t1".into()).await.unwrap(), 3);

        let deleted = db
            .bulk_delete_messages(vec!["m0".into(), "m1".into(), "never-existed".into()])
            .await
            .unwrap();
        assert_eq!(deleted.value, 2);
        assert_eq!(db.count_messages("t1".into()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hard_delete_message_removes_row() {
        let db = Database::open_in_memory().unwrap();
        db.create_thread("t1".into(), "u1".into(), None, serde_json::json!({}), None)
            .await
            .unwrap();
        db.upsert_message(
            "m1".into(),
            "t1".into(),
            "u1".into(),
            Role::User,
            "hello".into(),
            serde_json::json!({}),
            IfMatch::Any,
        )
        .await
        .unwrap();

        db.hard_delete_message("m1".into()).await.unwrap();
        assert!(db.get_message("m1".into()).await.unwrap().is_none());
        assert!(matches!(
            db.hard_delete_message("m1".into()).await,
            Err(DbError::NotFound(_))
        ));
    }
}
