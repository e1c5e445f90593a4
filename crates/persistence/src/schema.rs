//! SQLite schema: tables, indexes, full-text search, and triggers.
//!
//! `messages` is the immutable audit log; `compressed_context` holds the
//! per-session active context record the orchestrator reads from. The
//! search tables pair a plain `search_index` with an FTS5 virtual
//! companion kept in sync by triggers. Denormalized counters on `sessions`
//! are trigger-maintained.
//!
//! Initialization is idempotent: every statement is `IF NOT EXISTS`, and a
//! `schema_version` row is written into `database_metadata`.

use rusqlite::Connection;

use pw_domain::error::{Error, Result};

pub const SCHEMA_VERSION: i32 = 1;

const TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    project_stage TEXT NOT NULL DEFAULT 'requirements',
    total_messages INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NULL,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    token_count INTEGER NULL,
    metadata TEXT NULL,
    tool_calls TEXT NULL,
    tool_call_id TEXT NULL,
    parent_message_id TEXT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions (session_id) ON DELETE CASCADE,
    FOREIGN KEY (parent_message_id) REFERENCES messages (message_id)
);

CREATE TABLE IF NOT EXISTS compressed_context (
    context_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    compression_version INTEGER NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    original_message_count INTEGER NOT NULL,
    compressed_message_count INTEGER NOT NULL,
    original_token_count INTEGER NOT NULL,
    compressed_token_count INTEGER NOT NULL,
    compression_ratio REAL NOT NULL,
    compressed_messages TEXT NOT NULL,
    summary TEXT NOT NULL,
    key_decisions TEXT NULL,
    tool_execution_results TEXT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    FOREIGN KEY (session_id) REFERENCES sessions (session_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS tool_executions (
    execution_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    message_id TEXT NULL,
    tool_name TEXT NOT NULL,
    arguments TEXT NOT NULL,
    result TEXT NULL,
    success BOOLEAN NOT NULL,
    execution_time REAL NOT NULL,
    started_at TIMESTAMP NOT NULL,
    completed_at TIMESTAMP NULL,
    error_message TEXT NULL,
    metadata TEXT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions (session_id) ON DELETE CASCADE,
    FOREIGN KEY (message_id) REFERENCES messages (message_id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS search_index (
    index_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    content_type TEXT NOT NULL,
    searchable_content TEXT NOT NULL,
    keywords TEXT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (session_id) REFERENCES sessions (session_id) ON DELETE CASCADE,
    FOREIGN KEY (message_id) REFERENCES messages (message_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS database_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions (updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions (status);

CREATE INDEX IF NOT EXISTS idx_messages_session_timestamp ON messages (session_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_role ON messages (role);

CREATE INDEX IF NOT EXISTS idx_compressed_context_version ON compressed_context (session_id, compression_version DESC);
CREATE INDEX IF NOT EXISTS idx_compressed_context_active ON compressed_context (session_id, is_active);

CREATE INDEX IF NOT EXISTS idx_tool_executions_session_time ON tool_executions (session_id, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_tool_executions_tool ON tool_executions (tool_name);

CREATE INDEX IF NOT EXISTS idx_search_index_session ON search_index (session_id);
CREATE INDEX IF NOT EXISTS idx_search_index_message ON search_index (message_id);
"#;

const FTS: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS fts_search_content USING fts5(
    session_id,
    message_id,
    content_type,
    searchable_content,
    keywords,
    content='search_index',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS fts_search_content_insert AFTER INSERT ON search_index BEGIN
    INSERT INTO fts_search_content(rowid, session_id, message_id, content_type, searchable_content, keywords)
    VALUES (new.rowid, new.session_id, new.message_id, new.content_type, new.searchable_content, new.keywords);
END;

CREATE TRIGGER IF NOT EXISTS fts_search_content_delete AFTER DELETE ON search_index BEGIN
    INSERT INTO fts_search_content(fts_search_content, rowid, session_id, message_id, content_type, searchable_content, keywords)
    VALUES ('delete', old.rowid, old.session_id, old.message_id, old.content_type, old.searchable_content, old.keywords);
END;

CREATE TRIGGER IF NOT EXISTS fts_search_content_update AFTER UPDATE ON search_index BEGIN
    INSERT INTO fts_search_content(fts_search_content, rowid, session_id, message_id, content_type, searchable_content, keywords)
    VALUES ('delete', old.rowid, old.session_id, old.message_id, old.content_type, old.searchable_content, old.keywords);
    INSERT INTO fts_search_content(rowid, session_id, message_id, content_type, searchable_content, keywords)
    VALUES (new.rowid, new.session_id, new.message_id, new.content_type, new.searchable_content, new.keywords);
END;
"#;

const TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS sessions_update_timestamp
AFTER UPDATE ON sessions
FOR EACH ROW
BEGIN
    UPDATE sessions SET updated_at = CURRENT_TIMESTAMP WHERE session_id = NEW.session_id;
END;

CREATE TRIGGER IF NOT EXISTS sessions_message_count_insert
AFTER INSERT ON messages
FOR EACH ROW
BEGIN
    UPDATE sessions
    SET total_messages = total_messages + 1,
        updated_at = CURRENT_TIMESTAMP
    WHERE session_id = NEW.session_id;
END;

CREATE TRIGGER IF NOT EXISTS sessions_message_count_delete
AFTER DELETE ON messages
FOR EACH ROW
BEGIN
    UPDATE sessions
    SET total_messages = total_messages - 1,
        updated_at = CURRENT_TIMESTAMP
    WHERE session_id = OLD.session_id;
END;
"#;

/// Apply all DDL and record the schema version. Safe to call on every open.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(TABLES).map_err(db_err)?;
    conn.execute_batch(INDEXES).map_err(db_err)?;
    conn.execute_batch(FTS).map_err(db_err)?;
    conn.execute_batch(TRIGGERS).map_err(db_err)?;

    conn.execute(
        "INSERT OR REPLACE INTO database_metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )
    .map_err(db_err)?;

    Ok(())
}

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Persistence(e.to_string())
}
