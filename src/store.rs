//! SQLite-backed memory store for the orchestrator.
//!
//! One `Store` per thread of use; WAL mode keeps readers concurrent with the
//! coordinator's writes. Embeddings are stored as little-endian f32 blobs
//! next to a dimension tag so vectors from a different model are rejected
//! instead of silently mixed.

use std::path::Path;
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    new_id, now_ms, ConversationStats, JournalEntry, Message, Reminder, Role, StateFile, Summary,
    Topic, TriggerKind, TriggerSource,
};
use crate::CodingTaskState;

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum StoreError {
    /// Transient contention (busy/locked). Worth retrying with backoff.
    Retryable(String),
    /// Schema or constraint problem. Aborts the current invocation.
    Fatal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable(msg) => write!(f, "storage (retryable): {msg}"),
            Self::Fatal(msg) => write!(f, "storage: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(
                    inner.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Retryable(err.to_string())
            }
            _ => StoreError::Fatal(err.to_string()),
        }
    }
}

pub(crate) type StoreResult<T> = Result<T, StoreError>;

const RETRY_BACKOFF_MS: [u64; 3] = [100, 500, 2000];

/// Run `op`, retrying retryable failures up to three times with the fixed
/// backoff ladder before surfacing the last error.
pub(crate) fn with_retry<T>(mut op: impl FnMut() -> StoreResult<T>) -> StoreResult<T> {
    for (attempt, backoff) in RETRY_BACKOFF_MS.iter().enumerate() {
        match op() {
            Ok(value) => return Ok(value),
            Err(StoreError::Retryable(msg)) => {
                eprintln!("[store] retryable failure (attempt {}): {msg}", attempt + 1);
                thread::sleep(Duration::from_millis(*backoff));
            }
            Err(err) => return Err(err),
        }
    }
    op()
}

// ── Embedding blobs ──────────────────────────────────────────────────────

pub(crate) fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Some(out)
}

// ── Schema ───────────────────────────────────────────────────────────────

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    \"trigger\" TEXT NOT NULL DEFAULT 'message',
    source TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

CREATE TABLE IF NOT EXISTS journal (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    topic TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    embedding_dim INTEGER
);
CREATE INDEX IF NOT EXISTS idx_journal_timestamp ON journal(timestamp);

CREATE TABLE IF NOT EXISTS state_files (
    name TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS topics (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    embedding BLOB,
    embedding_dim INTEGER
);

CREATE TABLE IF NOT EXISTS reminders (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    payload TEXT NOT NULL,
    cron_expression TEXT,
    scheduled_time INTEGER,
    created_at INTEGER NOT NULL,
    CHECK ((cron_expression IS NULL) <> (scheduled_time IS NULL))
);

CREATE TABLE IF NOT EXISTS summaries (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    content TEXT NOT NULL,
    notes TEXT,
    key_decisions TEXT,
    open_threads TEXT,
    learned_patterns TEXT,
    from_timestamp INTEGER NOT NULL,
    to_timestamp INTEGER NOT NULL,
    message_count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_summaries_timestamp ON summaries(timestamp);

CREATE TABLE IF NOT EXISTS coding_task_state (
    repo_url TEXT PRIMARY KEY,
    branch TEXT NOT NULL,
    session_id TEXT,
    last_task TEXT NOT NULL,
    last_timestamp INTEGER NOT NULL
);
";

// ── Store ────────────────────────────────────────────────────────────────

pub(crate) struct Store {
    conn: Connection,
}

impl Store {
    pub(crate) fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Fatal(format!("create dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.apply_pragmas()?;
        store.init_schema()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Meta / embedding dimension ───────────────────────────────────

    pub(crate) fn embedding_dim(&self) -> StoreResult<Option<usize>> {
        let value: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'embedding_dim'", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Record the vector dimension on first use; reject a different one.
    pub(crate) fn ensure_embedding_dim(&self, dim: usize) -> StoreResult<()> {
        match self.embedding_dim()? {
            Some(existing) if existing != dim => Err(StoreError::Fatal(format!(
                "embedding dimension mismatch: store has {existing}, got {dim}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('embedding_dim', ?1)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![dim.to_string()],
                )?;
                Ok(())
            }
        }
    }

    // ── Messages ─────────────────────────────────────────────────────

    pub(crate) fn append_message(&self, message: &Message) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO messages (id, role, content, timestamp, \"trigger\", source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.role.as_str(),
                message.content,
                message.timestamp,
                message.trigger.as_str(),
                message.source.map(|s| s.as_str()),
            ],
        )?;
        Ok(())
    }

    /// The last `limit` messages, ascending by timestamp.
    pub(crate) fn recent_messages(&self, limit: usize) -> StoreResult<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, role, content, timestamp, \"trigger\", source FROM (
                 SELECT * FROM messages ORDER BY timestamp DESC, id DESC LIMIT ?1
             ) ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub(crate) fn all_messages(&self) -> StoreResult<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, role, content, timestamp, \"trigger\", source
             FROM messages ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub(crate) fn clear_messages(&self) -> StoreResult<usize> {
        let deleted = self.conn.execute("DELETE FROM messages", [])?;
        Ok(deleted)
    }

    pub(crate) fn conversation_stats(&self, compact_threshold: usize) -> StoreResult<ConversationStats> {
        let (count, total_chars): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(content)), 0) FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let approx_tokens = ((total_chars as usize) + 3) / 4;
        Ok(ConversationStats {
            count: count as usize,
            approx_tokens,
            needs_compaction: approx_tokens > compact_threshold,
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> Result<Message, rusqlite::Error> {
        let source: Option<String> = row.get(5)?;
        Ok(Message {
            id: row.get(0)?,
            role: Role::from_db_str(&row.get::<_, String>(1)?),
            content: row.get(2)?,
            timestamp: row.get(3)?,
            trigger: TriggerKind::from_db_str(&row.get::<_, String>(4)?),
            source: source.as_deref().and_then(TriggerSource::from_db_str),
        })
    }

    // ── Journal ──────────────────────────────────────────────────────

    pub(crate) fn write_journal(
        &self,
        entry: &JournalEntry,
        embedding: Option<&[f32]>,
    ) -> StoreResult<()> {
        let (blob, dim) = match embedding {
            Some(vector) => {
                self.ensure_embedding_dim(vector.len())?;
                (Some(encode_embedding(vector)), Some(vector.len() as i64))
            }
            None => (None, None),
        };
        self.conn.execute(
            "INSERT INTO journal (id, timestamp, topic, content, embedding, embedding_dim)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![entry.id, entry.timestamp, entry.topic, entry.content, blob, dim],
        )?;
        Ok(())
    }

    /// Newest `limit` entries, newest first.
    pub(crate) fn recent_journal(&self, limit: usize) -> StoreResult<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, topic, content FROM journal
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(JournalEntry {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                topic: row.get(2)?,
                content: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Newest entries that carry a vector, capped at `max_scanned`,
    /// newest first. Rows whose dimension tag disagrees with the store's
    /// recorded dimension are skipped.
    pub(crate) fn list_journal_with_embeddings(
        &self,
        max_scanned: usize,
    ) -> StoreResult<Vec<(JournalEntry, Vec<f32>)>> {
        let expected = self.embedding_dim()?;
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, topic, content, embedding, embedding_dim FROM journal
             WHERE embedding IS NOT NULL
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![max_scanned as i64], |row| {
            Ok((
                JournalEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    topic: row.get(2)?,
                    content: row.get(3)?,
                },
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (entry, blob, dim) = row?;
            if let (Some(expected), Some(dim)) = (expected, dim) {
                if dim as usize != expected {
                    eprintln!(
                        "[store] skipping journal {} with stale embedding dim {dim}",
                        entry.id
                    );
                    continue;
                }
            }
            if let Some(vector) = decode_embedding(&blob) {
                out.push((entry, vector));
            }
        }
        Ok(out)
    }

    // ── State files ──────────────────────────────────────────────────

    pub(crate) fn write_state_file(&self, name: &str, content: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO state_files (name, content, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET content = excluded.content,
                                             updated_at = excluded.updated_at",
            params![name, content, now_ms()],
        )?;
        Ok(())
    }

    pub(crate) fn read_state_file(&self, name: &str) -> StoreResult<Option<StateFile>> {
        self.conn
            .query_row(
                "SELECT name, content, updated_at FROM state_files WHERE name = ?1",
                params![name],
                |row| {
                    Ok(StateFile {
                        name: row.get(0)?,
                        content: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub(crate) fn list_state_files(&self) -> StoreResult<Vec<StateFile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, content, updated_at FROM state_files ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(StateFile {
                name: row.get(0)?,
                content: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    // ── Topics ───────────────────────────────────────────────────────

    /// Insert or overwrite by name. `created_at` survives overwrites;
    /// `updated_at` always advances.
    pub(crate) fn upsert_topic(
        &self,
        name: &str,
        content: &str,
        embedding: Option<&[f32]>,
    ) -> StoreResult<Topic> {
        let (blob, dim) = match embedding {
            Some(vector) => {
                self.ensure_embedding_dim(vector.len())?;
                (Some(encode_embedding(vector)), Some(vector.len() as i64))
            }
            None => (None, None),
        };
        let now = now_ms();
        let existing = self.get_topic(name)?;
        match existing {
            Some(topic) => {
                let updated_at = now.max(topic.updated_at + 1);
                self.conn.execute(
                    "UPDATE topics SET content = ?1, updated_at = ?2, embedding = ?3,
                                       embedding_dim = ?4
                     WHERE name = ?5",
                    params![content, updated_at, blob, dim, name],
                )?;
                Ok(Topic {
                    content: content.to_string(),
                    updated_at,
                    ..topic
                })
            }
            None => {
                let topic = Topic {
                    id: new_id(),
                    name: name.to_string(),
                    content: content.to_string(),
                    created_at: now,
                    updated_at: now,
                };
                self.conn.execute(
                    "INSERT INTO topics (id, name, content, created_at, updated_at, embedding, embedding_dim)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![topic.id, topic.name, topic.content, topic.created_at, topic.updated_at, blob, dim],
                )?;
                Ok(topic)
            }
        }
    }

    pub(crate) fn get_topic(&self, name: &str) -> StoreResult<Option<Topic>> {
        self.conn
            .query_row(
                "SELECT id, name, content, created_at, updated_at FROM topics WHERE name = ?1",
                params![name],
                Self::row_to_topic,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub(crate) fn list_topics(&self) -> StoreResult<Vec<Topic>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, content, created_at, updated_at FROM topics ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], Self::row_to_topic)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub(crate) fn list_topics_with_embeddings(
        &self,
        max_scanned: usize,
    ) -> StoreResult<Vec<(Topic, Vec<f32>)>> {
        let expected = self.embedding_dim()?;
        let mut stmt = self.conn.prepare(
            "SELECT id, name, content, created_at, updated_at, embedding, embedding_dim
             FROM topics WHERE embedding IS NOT NULL
             ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![max_scanned as i64], |row| {
            Ok((
                Topic {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    content: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                },
                row.get::<_, Vec<u8>>(5)?,
                row.get::<_, Option<i64>>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (topic, blob, dim) = row?;
            if let (Some(expected), Some(dim)) = (expected, dim) {
                if dim as usize != expected {
                    eprintln!(
                        "[store] skipping topic '{}' with stale embedding dim {dim}",
                        topic.name
                    );
                    continue;
                }
            }
            if let Some(vector) = decode_embedding(&blob) {
                out.push((topic, vector));
            }
        }
        Ok(out)
    }

    fn row_to_topic(row: &rusqlite::Row) -> Result<Topic, rusqlite::Error> {
        Ok(Topic {
            id: row.get(0)?,
            name: row.get(1)?,
            content: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    // ── Reminders ────────────────────────────────────────────────────

    pub(crate) fn save_reminder(&self, reminder: &Reminder) -> StoreResult<()> {
        if reminder.cron_expression.is_some() == reminder.scheduled_time.is_some() {
            return Err(StoreError::Fatal(
                "reminder must set exactly one of cron_expression / scheduled_time".to_string(),
            ));
        }
        self.conn.execute(
            "INSERT INTO reminders (id, description, payload, cron_expression, scheduled_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET description = excluded.description,
                                           payload = excluded.payload,
                                           cron_expression = excluded.cron_expression,
                                           scheduled_time = excluded.scheduled_time",
            params![
                reminder.id,
                reminder.description,
                reminder.payload,
                reminder.cron_expression,
                reminder.scheduled_time,
                reminder.created_at,
            ],
        )?;
        Ok(())
    }

    /// Returns true when a row was actually removed.
    pub(crate) fn delete_reminder(&self, id: &str) -> StoreResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM reminders WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub(crate) fn list_reminders(&self) -> StoreResult<Vec<Reminder>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, description, payload, cron_expression, scheduled_time, created_at
             FROM reminders ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Reminder {
                id: row.get(0)?,
                description: row.get(1)?,
                payload: row.get(2)?,
                cron_expression: row.get(3)?,
                scheduled_time: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    // ── Summaries ────────────────────────────────────────────────────

    /// Write the summary row and delete every message it absorbed
    /// (timestamp ≤ to_timestamp) in one transaction.
    pub(crate) fn save_summary(&mut self, summary: &Summary) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO summaries (id, timestamp, content, notes, key_decisions, open_threads,
                                    learned_patterns, from_timestamp, to_timestamp, message_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                summary.id,
                summary.timestamp,
                summary.content,
                summary.notes,
                serde_json::to_string(&summary.key_decisions).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&summary.open_threads).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&summary.learned_patterns).unwrap_or_else(|_| "[]".into()),
                summary.from_timestamp,
                summary.to_timestamp,
                summary.message_count,
            ],
        )?;
        let pruned = tx.execute(
            "DELETE FROM messages WHERE timestamp <= ?1",
            params![summary.to_timestamp],
        )?;
        tx.commit()?;
        Ok(pruned)
    }

    pub(crate) fn latest_summary(&self) -> StoreResult<Option<Summary>> {
        let mut list = self.recent_summaries(1)?;
        Ok(list.pop())
    }

    /// Newest `count` summaries, newest first.
    pub(crate) fn recent_summaries(&self, count: usize) -> StoreResult<Vec<Summary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, content, notes, key_decisions, open_threads, learned_patterns,
                    from_timestamp, to_timestamp, message_count
             FROM summaries ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![count as i64], |row| {
            let decisions: Option<String> = row.get(4)?;
            let threads: Option<String> = row.get(5)?;
            let patterns: Option<String> = row.get(6)?;
            Ok(Summary {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                content: row.get(2)?,
                notes: row.get(3)?,
                key_decisions: decisions
                    .and_then(|j| serde_json::from_str(&j).ok())
                    .unwrap_or_default(),
                open_threads: threads
                    .and_then(|j| serde_json::from_str(&j).ok())
                    .unwrap_or_default(),
                learned_patterns: patterns
                    .and_then(|j| serde_json::from_str(&j).ok())
                    .unwrap_or_default(),
                from_timestamp: row.get(7)?,
                to_timestamp: row.get(8)?,
                message_count: row.get(9)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    // ── Coding task state ────────────────────────────────────────────

    pub(crate) fn get_coding_task_state(&self, repo_url: &str) -> StoreResult<Option<CodingTaskState>> {
        self.conn
            .query_row(
                "SELECT repo_url, branch, session_id, last_task, last_timestamp
                 FROM coding_task_state WHERE repo_url = ?1",
                params![repo_url],
                |row| {
                    Ok(CodingTaskState {
                        repo_url: row.get(0)?,
                        branch: row.get(1)?,
                        session_id: row.get(2)?,
                        last_task: row.get(3)?,
                        last_timestamp: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub(crate) fn save_coding_task_state(&self, state: &CodingTaskState) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO coding_task_state (repo_url, branch, session_id, last_task, last_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(repo_url) DO UPDATE SET branch = excluded.branch,
                                                 session_id = excluded.session_id,
                                                 last_task = excluded.last_task,
                                                 last_timestamp = excluded.last_timestamp",
            params![
                state.repo_url,
                state.branch,
                state.session_id,
                state.last_task,
                state.last_timestamp,
            ],
        )?;
        Ok(())
    }

    // ── Counts (status subcommand) ───────────────────────────────────

    pub(crate) fn table_count(&self, table: &str) -> usize {
        // table names come from a fixed internal list, never user input
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .unwrap_or(0) as usize
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("outpost_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("test_store_{}_{name}.sqlite", std::process::id()))
    }

    fn open(name: &str) -> (Store, PathBuf) {
        let path = temp_db_path(name);
        let _ = std::fs::remove_file(&path);
        (Store::open(&path).unwrap(), path)
    }

    fn message(content: &str, timestamp: i64, role: Role) -> Message {
        Message {
            id: new_id(),
            role,
            content: content.to_string(),
            timestamp,
            trigger: TriggerKind::Message,
            source: Some(TriggerSource::Telegram),
        }
    }

    #[test]
    fn test_messages_ascending_order() {
        let (store, path) = open("msg_order");
        store.append_message(&message("second", 200, Role::Assistant)).unwrap();
        store.append_message(&message("first", 100, Role::User)).unwrap();
        store.append_message(&message("third", 300, Role::User)).unwrap();

        let recent = store.recent_messages(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "second");
        assert_eq!(recent[1].content, "third");

        let all = store.all_messages().unwrap();
        assert_eq!(all[0].content, "first");
        assert_eq!(all[2].content, "third");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_conversation_stats_threshold() {
        let (store, path) = open("stats");
        // 40 chars -> 10 approx tokens
        store.append_message(&message(&"x".repeat(40), 1, Role::User)).unwrap();
        let stats = store.conversation_stats(9).unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.approx_tokens, 10);
        assert!(stats.needs_compaction);
        let stats = store.conversation_stats(10).unwrap();
        assert!(!stats.needs_compaction);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_summary_prunes_absorbed_messages_atomically() {
        let (mut store, path) = open("summary");
        for ts in [100, 200, 300, 400] {
            store.append_message(&message(&format!("m{ts}"), ts, Role::User)).unwrap();
        }
        let summary = Summary {
            id: new_id(),
            timestamp: 500,
            content: "first era".to_string(),
            from_timestamp: 100,
            to_timestamp: 300,
            message_count: 3,
            ..Default::default()
        };
        let pruned = store.save_summary(&summary).unwrap();
        assert_eq!(pruned, 3);

        let left = store.all_messages().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content, "m400");
        // no dangling absorbed messages
        assert!(left.iter().all(|m| m.timestamp > 300));

        let latest = store.latest_summary().unwrap().unwrap();
        assert_eq!(latest.content, "first era");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_topic_upsert_preserves_created_at() {
        let (store, path) = open("topic");
        let first = store.upsert_topic("rust", "v1", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.upsert_topic("rust", "v2", None).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(store.get_topic("rust").unwrap().unwrap().content, "v2");
        assert_eq!(store.list_topics().unwrap().len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reminder_exactly_one_schedule() {
        let (store, path) = open("reminder");
        let bad = Reminder {
            id: "r1".into(),
            description: "bad".into(),
            payload: String::new(),
            cron_expression: Some("* * * * *".into()),
            scheduled_time: Some(123),
            created_at: 1,
        };
        assert!(store.save_reminder(&bad).is_err());

        let good = Reminder {
            cron_expression: None,
            scheduled_time: Some(123),
            ..bad
        };
        store.save_reminder(&good).unwrap();
        assert_eq!(store.list_reminders().unwrap().len(), 1);

        assert!(store.delete_reminder("r1").unwrap());
        assert!(!store.delete_reminder("r1").unwrap());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_embedding_roundtrip_and_dim_guard() {
        let (store, path) = open("embed");
        let entry = JournalEntry {
            id: new_id(),
            timestamp: 1,
            topic: "t".into(),
            content: "c".into(),
        };
        store.write_journal(&entry, Some(&[0.6, 0.8])).unwrap();
        assert_eq!(store.embedding_dim().unwrap(), Some(2));

        let listed = store.list_journal_with_embeddings(10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1, vec![0.6, 0.8]);

        // a vector of another dimension is refused at write time
        let other = JournalEntry {
            id: new_id(),
            timestamp: 2,
            topic: "t".into(),
            content: "c".into(),
        };
        assert!(store.write_journal(&other, Some(&[1.0, 0.0, 0.0])).is_err());

        // entries without embeddings are listed by recency but invisible here
        store.write_journal(&other, None).unwrap();
        assert_eq!(store.recent_journal(10).unwrap().len(), 2);
        assert_eq!(store.list_journal_with_embeddings(10).unwrap().len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_state_files_roundtrip_unknown_names() {
        let (store, path) = open("state");
        store.write_state_file("identity", "I am Outpost.").unwrap();
        store.write_state_file("weird-custom", "kept as-is").unwrap();
        assert_eq!(
            store.read_state_file("weird-custom").unwrap().unwrap().content,
            "kept as-is"
        );
        assert_eq!(store.list_state_files().unwrap().len(), 2);
        assert!(store.read_state_file("missing").unwrap().is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_coding_task_state_overwrite() {
        let (store, path) = open("coding");
        let state = CodingTaskState {
            repo_url: "https://github.com/a/b".into(),
            branch: "outie/add-logging-abc123".into(),
            session_id: Some("s1".into()),
            last_task: "Add logging".into(),
            last_timestamp: 100,
        };
        store.save_coding_task_state(&state).unwrap();
        let updated = CodingTaskState {
            last_task: "Make level configurable".into(),
            last_timestamp: 200,
            ..state.clone()
        };
        store.save_coding_task_state(&updated).unwrap();
        let loaded = store.get_coding_task_state("https://github.com/a/b").unwrap().unwrap();
        assert_eq!(loaded.last_timestamp, 200);
        assert_eq!(loaded.branch, state.branch);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_decode_embedding_rejects_ragged() {
        assert!(decode_embedding(&[1, 2, 3]).is_none());
        assert_eq!(decode_embedding(&encode_embedding(&[1.5, -2.0])).unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_journal_embedding_scan_is_capped_newest_first() {
        let (store, path) = open("scan_cap");
        for ts in 1..=6 {
            store
                .write_journal(
                    &JournalEntry {
                        id: new_id(),
                        timestamp: ts,
                        topic: format!("t{ts}"),
                        content: "c".into(),
                    },
                    Some(&[1.0, 0.0]),
                )
                .unwrap();
        }
        let listed = store.list_journal_with_embeddings(3).unwrap();
        assert_eq!(listed.len(), 3);
        let timestamps: Vec<i64> = listed.iter().map(|(e, _)| e.timestamp).collect();
        assert_eq!(timestamps, vec![6, 5, 4]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_with_retry_retries_then_succeeds() {
        let mut attempts = 0;
        let result: StoreResult<i32> = with_retry(|| {
            attempts += 1;
            if attempts < 3 {
                Err(StoreError::Retryable("database is locked".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_with_retry_fatal_is_immediate() {
        let mut attempts = 0;
        let result: StoreResult<()> = with_retry(|| {
            attempts += 1;
            Err(StoreError::Fatal("schema mismatch".into()))
        });
        assert!(matches!(result, Err(StoreError::Fatal(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_summary_list_fields_roundtrip() {
        let (mut store, path) = open("summary_fields");
        let summary = Summary {
            id: new_id(),
            timestamp: 10,
            content: "era".into(),
            notes: Some("note".into()),
            key_decisions: vec!["ship it".into(), "use sqlite".into()],
            open_threads: vec!["follow up".into()],
            learned_patterns: vec!["user works late".into()],
            from_timestamp: 1,
            to_timestamp: 5,
            message_count: 4,
        };
        store.save_summary(&summary).unwrap();

        let loaded = store.latest_summary().unwrap().unwrap();
        assert_eq!(loaded.notes.as_deref(), Some("note"));
        assert_eq!(loaded.key_decisions.len(), 2);
        assert_eq!(loaded.open_threads, vec!["follow up".to_string()]);
        assert_eq!(loaded.learned_patterns, vec!["user works late".to_string()]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_recent_summaries_newest_first() {
        let (mut store, path) = open("summary_order");
        for ts in [100, 300, 200] {
            store
                .save_summary(&Summary {
                    id: new_id(),
                    timestamp: ts,
                    content: format!("s{ts}"),
                    ..Default::default()
                })
                .unwrap();
        }
        let recent = store.recent_summaries(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "s300");
        assert_eq!(recent[1].content, "s200");
        std::fs::remove_file(&path).ok();
    }
}
