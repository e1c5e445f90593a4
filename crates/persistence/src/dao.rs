//! Data access over the embedded SQLite store.
//!
//! One `Connection` behind a mutex gives the single-writer discipline the
//! schema assumes; WAL journaling keeps concurrent readers cheap. Every
//! multi-row mutation (session creation with its v1 context, message
//! appends with their mirror-write, the compressor's version swap, result
//! ingestion) runs inside one transaction.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;

use pw_domain::error::{Error, Result};
use pw_domain::tool::{Message, Role};

use crate::records::{
    CompressedContextRecord, GlobalStatistics, SearchHit, SessionRecord, SessionStatistics,
    ToolExecutionRecord,
};
use crate::schema::{db_err, init_schema};

pub struct Dao {
    conn: Mutex<Connection>,
}

impl Dao {
    /// Open (creating if absent) the database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        let _: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(db_err)?;
        init_schema(&conn)?;
        tracing::info!(path, "database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Sessions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Create a session row together with its version-1 active compressed
    /// context (empty messages, ratio 1.0) in one transaction.
    pub fn create_session(&self, title: &str, metadata: Value) -> Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut guard = self.conn.lock();
        let tx = guard.transaction().map_err(db_err)?;

        tx.execute(
            "INSERT INTO sessions (session_id, title, metadata) VALUES (?1, ?2, ?3)",
            params![session_id, title, metadata.to_string()],
        )
        .map_err(db_err)?;

        tx.execute(
            "INSERT INTO compressed_context (
                context_id, session_id, compression_version,
                original_message_count, compressed_message_count,
                original_token_count, compressed_token_count,
                compression_ratio, compressed_messages, summary,
                key_decisions, tool_execution_results, is_active
             ) VALUES (?1, ?2, 1, 0, 0, 0, 0, 1.0, '[]', '', '[]', '{}', 1)",
            params![uuid::Uuid::new_v4().to_string(), session_id],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        tracing::info!(session_id = %session_id, title, "session created");
        Ok(session_id)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT session_id, title, created_at, updated_at, project_stage,
                    total_messages, total_tokens, metadata, status
             FROM sessions WHERE session_id = ?1",
            [session_id],
            row_to_session,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn list_sessions(&self, limit: usize, status: &str) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT session_id, title, created_at, updated_at, project_stage,
                        total_messages, total_tokens, metadata, status
                 FROM sessions
                 WHERE status = ?1
                 ORDER BY updated_at DESC
                 LIMIT ?2",
            )
            .map_err(db_err)?;
        let sessions = stmt
            .query_map(params![status, limit as i64], row_to_session)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(sessions)
    }

    /// Active sessions whose id starts with `prefix`.
    pub fn find_sessions_by_prefix(&self, prefix: &str) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT session_id, title, created_at, updated_at, project_stage,
                        total_messages, total_tokens, metadata, status
                 FROM sessions
                 WHERE session_id LIKE ?1 AND status = 'active'
                 ORDER BY updated_at DESC",
            )
            .map_err(db_err)?;
        let pattern = format!("{}%", prefix.replace(['%', '_'], ""));
        let sessions = stmt
            .query_map([pattern], row_to_session)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(sessions)
    }

    pub fn update_session_title(&self, session_id: &str, title: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE sessions SET title = ?2 WHERE session_id = ?1",
                params![session_id, title],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Soft status change (`active` | `archived` | `deleted`).
    pub fn update_session_status(&self, session_id: &str, status: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE sessions SET status = ?2 WHERE session_id = ?1",
                params![session_id, status],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Messages (append + mirror-write)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Append one message: audit insert plus mirror-append into the active
    /// compressed context, in a single transaction.
    pub fn add_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut guard = self.conn.lock();
        let tx = guard.transaction().map_err(db_err)?;
        insert_message_tx(&tx, session_id, message)?;
        tx.commit().map_err(db_err)
    }

    /// Ingest one orchestration delta: the optional user message, then the
    /// run's new messages in order, then the per-key tool-result merge.
    /// One transaction for the lot. Returns the number of messages skipped
    /// by validation.
    pub fn ingest_result(
        &self,
        session_id: &str,
        user_input: Option<&Message>,
        new_messages: &[Message],
        updates: &BTreeMap<String, Value>,
    ) -> Result<usize> {
        let mut guard = self.conn.lock();
        let tx = guard.transaction().map_err(db_err)?;
        let mut skipped = 0usize;

        if let Some(user) = user_input {
            insert_message_tx(&tx, session_id, user)?;
        }

        for message in new_messages {
            if message.role == Role::Tool
                && message
                    .tool_call_id
                    .as_deref()
                    .map_or(true, |id| id.trim().is_empty())
            {
                tracing::warn!(
                    session_id,
                    "skipping tool message with empty tool_call_id"
                );
                skipped += 1;
                continue;
            }
            insert_message_tx(&tx, session_id, message)?;
        }

        if !updates.is_empty() {
            merge_tool_results_tx(&tx, session_id, updates)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(skipped)
    }

    pub fn get_messages(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT message_id, role, content, timestamp, token_count, metadata,
                    tool_calls, tool_call_id
             FROM messages
             WHERE session_id = ?1
             ORDER BY timestamp ASC, rowid ASC{}",
            match limit {
                Some(n) => format!(" LIMIT {n}"),
                None => String::new(),
            }
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let messages = stmt
            .query_map([session_id], row_to_message)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(messages)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Compressed context
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn get_active_compressed_context(
        &self,
        session_id: &str,
    ) -> Result<Option<CompressedContextRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT context_id, session_id, compression_version, created_at,
                    original_message_count, compressed_message_count,
                    original_token_count, compressed_token_count,
                    compression_ratio, compressed_messages, summary,
                    key_decisions, tool_execution_results, is_active
             FROM compressed_context
             WHERE session_id = ?1 AND is_active = 1",
            [session_id],
            row_to_context,
        )
        .optional()
        .map_err(db_err)
    }

    /// Count of `compressed_context` rows for a session (all versions).
    pub fn compressed_context_count(&self, session_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM compressed_context WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// Atomically retire the active context and install the next version.
    ///
    /// The prior row's `tool_execution_results` column is copied verbatim —
    /// compression never touches tool results. Returns the new version.
    pub fn swap_compressed_context(
        &self,
        session_id: &str,
        messages: &[Message],
        summary: &str,
        key_decisions: &[String],
    ) -> Result<i64> {
        let mut guard = self.conn.lock();
        let tx = guard.transaction().map_err(db_err)?;

        let (old_context_id, old_version, original_message_count, original_token_count, tool_results_raw): (String, i64, i64, i64, Option<String>) = tx
            .query_row(
                "SELECT context_id, compression_version, original_message_count,
                        original_token_count, tool_execution_results
                 FROM compressed_context
                 WHERE session_id = ?1 AND is_active = 1",
                [session_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| {
                Error::DataCorruption(format!(
                    "session {session_id} has no active compressed context"
                ))
            })?;

        let compressed_message_count = messages.len() as i64;
        let compressed_token_count: i64 = messages.iter().map(|m| m.token_count).sum();
        let ratio = compressed_message_count as f64 / original_message_count.max(1) as f64;

        tx.execute(
            "UPDATE compressed_context SET is_active = 0 WHERE context_id = ?1",
            [&old_context_id],
        )
        .map_err(db_err)?;

        let messages_json = serde_json::to_string(messages)?;
        let decisions_json = serde_json::to_string(key_decisions)?;
        let new_version = old_version + 1;

        tx.execute(
            "INSERT INTO compressed_context (
                context_id, session_id, compression_version,
                original_message_count, compressed_message_count,
                original_token_count, compressed_token_count,
                compression_ratio, compressed_messages, summary,
                key_decisions, tool_execution_results, is_active
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1)",
            params![
                uuid::Uuid::new_v4().to_string(),
                session_id,
                new_version,
                original_message_count,
                compressed_message_count,
                original_token_count,
                compressed_token_count,
                ratio,
                messages_json,
                summary,
                decisions_json,
                tool_results_raw.unwrap_or_else(|| "{}".into()),
            ],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(new_version)
    }

    /// Per-key replacement merge into the active context's tool-result map.
    pub fn merge_tool_results(
        &self,
        session_id: &str,
        updates: &BTreeMap<String, Value>,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut guard = self.conn.lock();
        let tx = guard.transaction().map_err(db_err)?;
        merge_tool_results_tx(&tx, session_id, updates)?;
        tx.commit().map_err(db_err)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tool executions (audit)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn add_tool_execution(&self, record: &ToolExecutionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tool_executions (
                execution_id, session_id, message_id, tool_name, arguments,
                result, success, execution_time, started_at, completed_at,
                error_message
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.execution_id,
                record.session_id,
                record.message_id,
                record.tool_name,
                record.arguments.to_string(),
                record.result.as_ref().map(|v| v.to_string()),
                record.success,
                record.execution_time,
                record.started_at,
                record.completed_at,
                record.error_message,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn tool_execution_count(&self, session_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM tool_executions WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Search & statistics
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Full-text keyword search over indexed message content.
    pub fn search_sessions(&self, keyword: &str, limit: usize) -> Result<Vec<SearchHit>> {
        if keyword.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT f.session_id, s.title, f.message_id, f.searchable_content
                 FROM fts_search_content f
                 JOIN sessions s ON s.session_id = f.session_id
                 WHERE fts_search_content MATCH ?1 AND s.status = 'active'
                 ORDER BY rank
                 LIMIT ?2",
            )
            .map_err(db_err)?;

        // Quote the user keyword so FTS operators in it are inert.
        let quoted = format!("\"{}\"", keyword.replace('"', "\"\""));
        let hits = stmt
            .query_map(params![quoted, limit as i64], |row| {
                let content: String = row.get(3)?;
                Ok(SearchHit {
                    session_id: row.get(0)?,
                    title: row.get(1)?,
                    message_id: row.get(2)?,
                    snippet: content.chars().take(160).collect(),
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(hits)
    }

    pub fn session_statistics(&self, session_id: &str) -> Result<Option<SessionStatistics>> {
        let Some(session) = self.get_session(session_id)? else {
            return Ok(None);
        };

        let conn = self.conn.lock();
        let mut by_role = BTreeMap::new();
        let mut stmt = conn
            .prepare("SELECT role, COUNT(*) FROM messages WHERE session_id = ?1 GROUP BY role")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;
        for row in rows {
            let (role, count) = row.map_err(db_err)?;
            by_role.insert(role, count);
        }

        let tool_execution_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM tool_executions WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let (compression_version, compressed_message_count): (i64, i64) = conn
            .query_row(
                "SELECT compression_version, compressed_message_count
                 FROM compressed_context WHERE session_id = ?1 AND is_active = 1",
                [session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?
            .unwrap_or((0, 0));

        Ok(Some(SessionStatistics {
            session_id: session.session_id,
            total_messages: session.total_messages,
            total_tokens: session.total_tokens,
            messages_by_role: by_role,
            tool_execution_count,
            compression_version,
            compressed_message_count,
        }))
    }

    /// Test hook for simulating out-of-band state (e.g. corruption).
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(sql, []).map_err(db_err)
    }

    pub fn global_statistics(&self) -> Result<GlobalStatistics> {
        let conn = self.conn.lock();
        let session_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .map_err(db_err)?;
        let message_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(db_err)?;
        let tool_execution_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tool_executions", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(GlobalStatistics {
            session_count,
            message_count,
            tool_execution_count,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transaction helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn insert_message_tx(tx: &Transaction<'_>, session_id: &str, message: &Message) -> Result<()> {
    let tool_calls_json = message
        .tool_calls
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    tx.execute(
        "INSERT INTO messages (
            message_id, session_id, role, content, timestamp,
            token_count, metadata, tool_calls, tool_call_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.message_id,
            session_id,
            message.role.as_str(),
            message.content,
            message.timestamp,
            message.token_count,
            message.metadata.as_ref().map(|m| m.to_string()),
            tool_calls_json,
            message.tool_call_id,
        ],
    )
    .map_err(db_err)?;

    tx.execute(
        "UPDATE sessions SET total_tokens = total_tokens + ?2 WHERE session_id = ?1",
        params![session_id, message.token_count],
    )
    .map_err(db_err)?;

    // Mirror-write: the active compressed context is the orchestrator's
    // read source, so it must see every append immediately.
    let (context_id, messages_raw): (String, String) = tx
        .query_row(
            "SELECT context_id, compressed_messages FROM compressed_context
             WHERE session_id = ?1 AND is_active = 1",
            [session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| {
            Error::DataCorruption(format!(
                "session {session_id} has no active compressed context"
            ))
        })?;

    let mut mirrored: Vec<Value> = serde_json::from_str(&messages_raw).unwrap_or_default();
    mirrored.push(serde_json::to_value(message)?);

    tx.execute(
        "UPDATE compressed_context
         SET compressed_messages = ?2,
             compressed_message_count = compressed_message_count + 1,
             compressed_token_count = compressed_token_count + ?3,
             original_message_count = original_message_count + 1,
             original_token_count = original_token_count + ?3
         WHERE context_id = ?1",
        params![
            context_id,
            serde_json::to_string(&mirrored)?,
            message.token_count
        ],
    )
    .map_err(db_err)?;

    tx.execute(
        "INSERT INTO search_index (index_id, session_id, message_id, content_type, searchable_content)
         VALUES (?1, ?2, ?3, 'message', ?4)",
        params![
            uuid::Uuid::new_v4().to_string(),
            session_id,
            message.message_id,
            message.content,
        ],
    )
    .map_err(db_err)?;

    Ok(())
}

fn merge_tool_results_tx(
    tx: &Transaction<'_>,
    session_id: &str,
    updates: &BTreeMap<String, Value>,
) -> Result<()> {
    let (context_id, raw): (String, Option<String>) = tx
        .query_row(
            "SELECT context_id, tool_execution_results FROM compressed_context
             WHERE session_id = ?1 AND is_active = 1",
            [session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| {
            Error::DataCorruption(format!(
                "session {session_id} has no active compressed context"
            ))
        })?;

    let mut results: BTreeMap<String, Value> = raw
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(serde_json::from_str)
        .transpose()?
        .unwrap_or_default();

    for (key, value) in updates {
        results.insert(key.clone(), value.clone());
    }

    tx.execute(
        "UPDATE compressed_context SET tool_execution_results = ?2 WHERE context_id = ?1",
        params![context_id, serde_json::to_string(&results)?],
    )
    .map_err(db_err)?;

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let metadata_raw: Option<String> = row.get(7)?;
    Ok(SessionRecord {
        session_id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        project_stage: row.get(4)?,
        total_messages: row.get(5)?,
        total_tokens: row.get(6)?,
        metadata: metadata_raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null),
        status: row.get(8)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_raw: String = row.get(1)?;
    let metadata_raw: Option<String> = row.get(5)?;
    let tool_calls_raw: Option<String> = row.get(6)?;
    Ok(Message {
        message_id: row.get(0)?,
        role: role_raw.parse().unwrap_or(Role::User),
        content: row.get(2)?,
        timestamp: row.get(3)?,
        token_count: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        metadata: metadata_raw.and_then(|s| serde_json::from_str(&s).ok()),
        tool_calls: tool_calls_raw.and_then(|s| serde_json::from_str(&s).ok()),
        tool_call_id: row.get(7)?,
    })
}

fn row_to_context(row: &rusqlite::Row<'_>) -> rusqlite::Result<CompressedContextRecord> {
    let messages_raw: String = row.get(9)?;
    let decisions_raw: Option<String> = row.get(11)?;
    let tool_results_raw: Option<String> = row.get(12)?;
    Ok(CompressedContextRecord {
        context_id: row.get(0)?,
        session_id: row.get(1)?,
        compression_version: row.get(2)?,
        created_at: row.get(3)?,
        original_message_count: row.get(4)?,
        compressed_message_count: row.get(5)?,
        original_token_count: row.get(6)?,
        compressed_token_count: row.get(7)?,
        compression_ratio: row.get(8)?,
        compressed_messages: serde_json::from_str(&messages_raw).unwrap_or_default(),
        summary: row.get(10)?,
        key_decisions: decisions_raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        tool_execution_results: tool_results_raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        is_active: row.get(13)?,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use pw_domain::tool::ToolCall;

    fn dao_with_session() -> (Dao, String) {
        let dao = Dao::open_in_memory().unwrap();
        let session_id = dao
            .create_session("test session", Value::Null)
            .unwrap();
        (dao, session_id)
    }

    #[test]
    fn create_session_installs_v1_context() {
        let (dao, session_id) = dao_with_session();
        let context = dao
            .get_active_compressed_context(&session_id)
            .unwrap()
            .unwrap();
        assert_eq!(context.compression_version, 1);
        assert_eq!(context.compressed_message_count, 0);
        assert!(context.compressed_messages.is_empty());
        assert!((context.compression_ratio - 1.0).abs() < f64::EPSILON);
        assert!(context.is_active);
    }

    #[test]
    fn add_message_mirrors_into_active_context() {
        let (dao, session_id) = dao_with_session();
        let msg = Message::user("hello there");
        dao.add_message(&session_id, &msg).unwrap();

        let context = dao
            .get_active_compressed_context(&session_id)
            .unwrap()
            .unwrap();
        assert_eq!(context.compressed_message_count, 1);
        assert_eq!(context.compressed_messages.len(), 1);
        assert_eq!(context.compressed_messages[0].content, "hello there");
        assert_eq!(context.compressed_token_count, msg.token_count);

        // Trigger-maintained counter.
        let session = dao.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.total_messages, 1);
        assert_eq!(session.total_tokens, msg.token_count);
    }

    #[test]
    fn tool_calls_round_trip_through_storage() {
        let (dao, session_id) = dao_with_session();
        let assistant = Message::assistant_with_tools(
            "",
            vec![ToolCall {
                call_id: "c1".into(),
                tool_name: "research".into(),
                arguments: serde_json::json!({"q": "flask"}),
            }],
        );
        dao.add_message(&session_id, &assistant).unwrap();
        dao.add_message(&session_id, &Message::tool("{\"ok\":true}", "c1"))
            .unwrap();

        let messages = dao.get_messages(&session_id, None).unwrap();
        assert_eq!(messages.len(), 2);
        let calls = messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].call_id, "c1");
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn message_without_session_fails_fk() {
        let dao = Dao::open_in_memory().unwrap();
        let result = dao.add_message("nope", &Message::user("hi"));
        assert!(result.is_err());
    }

    #[test]
    fn missing_active_context_is_corruption() {
        let (dao, session_id) = dao_with_session();
        {
            let conn = dao.conn.lock();
            conn.execute(
                "UPDATE compressed_context SET is_active = 0 WHERE session_id = ?1",
                [&session_id],
            )
            .unwrap();
        }
        let result = dao.add_message(&session_id, &Message::user("hi"));
        assert!(matches!(result, Err(Error::DataCorruption(_))));
    }

    #[test]
    fn ingest_skips_tool_messages_without_call_id() {
        let (dao, session_id) = dao_with_session();
        let mut orphan = Message::tool("{}", "c1");
        orphan.tool_call_id = Some("  ".into());

        let skipped = dao
            .ingest_result(
                &session_id,
                Some(&Message::user("hi")),
                &[Message::assistant("hello"), orphan],
                &BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(skipped, 1);

        let session = dao.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.total_messages, 2);
    }

    #[test]
    fn ingest_empty_result_is_noop() {
        let (dao, session_id) = dao_with_session();
        let skipped = dao
            .ingest_result(&session_id, None, &[], &BTreeMap::new())
            .unwrap();
        assert_eq!(skipped, 0);
        let session = dao.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.total_messages, 0);
        let context = dao
            .get_active_compressed_context(&session_id)
            .unwrap()
            .unwrap();
        assert_eq!(context.compressed_message_count, 0);
    }

    #[test]
    fn merge_tool_results_is_per_key_replacement() {
        let (dao, session_id) = dao_with_session();

        let mut first = BTreeMap::new();
        first.insert("recommended_tools".to_string(), serde_json::json!(["a"]));
        first.insert("short_planning".to_string(), serde_json::json!("v1"));
        dao.merge_tool_results(&session_id, &first).unwrap();

        let mut second = BTreeMap::new();
        second.insert("short_planning".to_string(), serde_json::json!("v2"));
        dao.merge_tool_results(&session_id, &second).unwrap();

        let context = dao
            .get_active_compressed_context(&session_id)
            .unwrap()
            .unwrap();
        assert_eq!(
            context.tool_execution_results["recommended_tools"],
            serde_json::json!(["a"])
        );
        assert_eq!(
            context.tool_execution_results["short_planning"],
            serde_json::json!("v2")
        );
    }

    #[test]
    fn swap_compressed_context_preserves_tool_results() {
        let (dao, session_id) = dao_with_session();
        for i in 0..6 {
            dao.add_message(&session_id, &Message::user(format!("message {i}")))
                .unwrap();
        }
        let mut updates = BTreeMap::new();
        updates.insert("research_findings".to_string(), serde_json::json!({"x": 1}));
        dao.merge_tool_results(&session_id, &updates).unwrap();

        let before = dao
            .get_active_compressed_context(&session_id)
            .unwrap()
            .unwrap();

        let new_messages = vec![Message::assistant("summary of it all"), Message::user("message 5")];
        let version = dao
            .swap_compressed_context(&session_id, &new_messages, "a summary", &["decision".into()])
            .unwrap();
        assert_eq!(version, 2);

        let after = dao
            .get_active_compressed_context(&session_id)
            .unwrap()
            .unwrap();
        assert_eq!(after.compression_version, 2);
        assert_eq!(after.compressed_message_count, 2);
        assert_eq!(after.original_message_count, before.original_message_count);
        assert_eq!(after.tool_execution_results, before.tool_execution_results);
        assert_eq!(after.summary, "a summary");

        // Exactly one active row; audit log untouched.
        let active_count: i64 = {
            let conn = dao.conn.lock();
            conn.query_row(
                "SELECT COUNT(*) FROM compressed_context WHERE session_id = ?1 AND is_active = 1",
                [&session_id],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(active_count, 1);
        assert_eq!(dao.compressed_context_count(&session_id).unwrap(), 2);
        assert_eq!(dao.get_messages(&session_id, None).unwrap().len(), 6);
    }

    #[test]
    fn fts_search_finds_indexed_content() {
        let (dao, session_id) = dao_with_session();
        dao.add_message(&session_id, &Message::user("build me a flask api"))
            .unwrap();
        dao.add_message(&session_id, &Message::assistant("sure, here is a plan"))
            .unwrap();

        let hits = dao.search_sessions("flask", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, session_id);

        assert!(dao.search_sessions("nonexistent", 10).unwrap().is_empty());
        assert!(dao.search_sessions("  ", 10).unwrap().is_empty());
    }

    #[test]
    fn prefix_lookup_matches_active_only() {
        let (dao, session_id) = dao_with_session();
        let prefix = &session_id[..8];
        let matches = dao.find_sessions_by_prefix(prefix).unwrap();
        assert_eq!(matches.len(), 1);

        dao.update_session_status(&session_id, "archived").unwrap();
        assert!(dao.find_sessions_by_prefix(prefix).unwrap().is_empty());
    }

    #[test]
    fn statistics_reflect_contents() {
        let (dao, session_id) = dao_with_session();
        dao.add_message(&session_id, &Message::user("q")).unwrap();
        dao.add_message(&session_id, &Message::assistant("a")).unwrap();
        dao.add_tool_execution(&ToolExecutionRecord {
            execution_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            message_id: None,
            tool_name: "research".into(),
            arguments: serde_json::json!({}),
            result: None,
            success: true,
            execution_time: 0.5,
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: Some(chrono::Utc::now().to_rfc3339()),
            error_message: None,
        })
        .unwrap();

        let stats = dao.session_statistics(&session_id).unwrap().unwrap();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.messages_by_role["user"], 1);
        assert_eq!(stats.tool_execution_count, 1);
        assert_eq!(stats.compression_version, 1);

        let global = dao.global_statistics().unwrap();
        assert_eq!(global.session_count, 1);
        assert_eq!(global.message_count, 2);
    }

    #[test]
    fn file_backed_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.db");
        let path = path.to_str().unwrap();

        let session_id = {
            let dao = Dao::open(path).unwrap();
            let session_id = dao.create_session("durable", Value::Null).unwrap();
            dao.add_message(&session_id, &Message::user("persist me"))
                .unwrap();
            session_id
        };

        // Re-opening re-applies the (idempotent) schema and sees the data.
        let dao = Dao::open(path).unwrap();
        let session = dao.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.title, "durable");
        assert_eq!(session.total_messages, 1);
        let context = dao
            .get_active_compressed_context(&session_id)
            .unwrap()
            .unwrap();
        assert_eq!(context.compressed_messages.len(), 1);
    }

    #[test]
    fn list_sessions_orders_by_update() {
        let dao = Dao::open_in_memory().unwrap();
        let _a = dao.create_session("first", Value::Null).unwrap();
        let b = dao.create_session("second", Value::Null).unwrap();
        dao.add_message(&b, &Message::user("bump")).unwrap();

        let sessions = dao.list_sessions(10, "active").unwrap();
        assert_eq!(sessions.len(), 2);
    }
}
