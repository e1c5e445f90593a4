//! Session manager facade.
//!
//! Translates between the relational store and the in-memory
//! [`AgentContext`] / [`AgentResult`] types, and enforces the core read
//! invariant: the orchestrator's context comes exclusively from the active
//! compressed context row, never from the raw `messages` audit log. A
//! session that exists but has no active row is corrupt, not empty — an
//! empty session still has its version-1 row.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use pw_domain::context::{AgentContext, AgentResult};
use pw_domain::error::{Error, Result};
use pw_domain::tool::{Message, ToolCall};

use crate::dao::Dao;
use crate::records::{GlobalStatistics, SearchHit, SessionRecord, SessionStatistics};

pub struct SessionManager {
    dao: Arc<Dao>,
    current: Mutex<Option<String>>,
}

/// Outcome of a partial-id lookup: loaded, ambiguous, or not found.
#[derive(Debug)]
pub enum PartialIdLookup {
    Loaded(String),
    Ambiguous(Vec<SessionRecord>),
    NotFound,
}

impl SessionManager {
    pub fn new(dao: Arc<Dao>) -> Self {
        Self {
            dao,
            current: Mutex::new(None),
        }
    }

    pub fn dao(&self) -> &Arc<Dao> {
        &self.dao
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.current.lock().clone()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Session lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Create a session (plus its v1 context) and make it current.
    pub fn create_session(&self, title: Option<&str>) -> Result<String> {
        let title = match title {
            Some(t) => t.to_string(),
            None => format!("New session - {}", Utc::now().format("%Y-%m-%d %H:%M")),
        };
        let session_id = self.dao.create_session(
            &title,
            serde_json::json!({"created_by": "session_manager"}),
        )?;
        *self.current.lock() = Some(session_id.clone());
        Ok(session_id)
    }

    /// Load an existing active session as current.
    pub fn load_session(&self, session_id: &str) -> Result<bool> {
        match self.dao.get_session(session_id)? {
            Some(session) if session.status == "active" => {
                *self.current.lock() = Some(session_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Exact lookup first; otherwise prefix-match across active sessions.
    pub fn load_session_by_partial_id(&self, partial_id: &str) -> Result<PartialIdLookup> {
        if self.load_session(partial_id)? {
            return Ok(PartialIdLookup::Loaded(partial_id.to_string()));
        }

        let matches = self.dao.find_sessions_by_prefix(partial_id)?;
        match matches.len() {
            0 => Ok(PartialIdLookup::NotFound),
            1 => {
                let session_id = matches[0].session_id.clone();
                self.load_session(&session_id)?;
                Ok(PartialIdLookup::Loaded(session_id))
            }
            _ => Ok(PartialIdLookup::Ambiguous(matches)),
        }
    }

    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        self.dao.list_sessions(limit, "active")
    }

    pub fn update_session_title(&self, session_id: &str, title: &str) -> Result<bool> {
        self.dao.update_session_title(session_id, title)
    }

    pub fn archive_session(&self, session_id: &str) -> Result<bool> {
        let archived = self.dao.update_session_status(session_id, "archived")?;
        if archived {
            self.clear_if_current(session_id);
        }
        Ok(archived)
    }

    /// Soft delete: history stays on disk, the session leaves all listings.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let deleted = self.dao.update_session_status(session_id, "deleted")?;
        if deleted {
            self.clear_if_current(session_id);
        }
        Ok(deleted)
    }

    fn clear_if_current(&self, session_id: &str) {
        let mut current = self.current.lock();
        if current.as_deref() == Some(session_id) {
            *current = None;
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Context assembly
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Materialize the orchestrator's context from the active compressed
    /// context row. `None` when the session doesn't exist; an error when a
    /// known session lacks its active row (corruption).
    pub fn build_agent_context(&self, session_id: Option<&str>) -> Result<Option<AgentContext>> {
        let Some(session_id) = self.resolve_id(session_id) else {
            return Ok(None);
        };
        let Some(session) = self.dao.get_session(&session_id)? else {
            return Ok(None);
        };

        let context = self
            .dao
            .get_active_compressed_context(&session_id)?
            .ok_or_else(|| {
                Error::DataCorruption(format!(
                    "session {session_id} has no active compressed context"
                ))
            })?;

        Ok(Some(AgentContext {
            session_id,
            dialogue_history: context.compressed_messages,
            tool_execution_results: context.tool_execution_results,
            session_metadata: session.metadata,
            is_compressed: context.compression_version > 1,
        }))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Message appends (mirror-writes)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn add_user_message(&self, session_id: Option<&str>, content: &str) -> Result<String> {
        let session_id = self.require_id(session_id)?;
        let message = Message::user(content);
        self.dao.add_message(&session_id, &message)?;
        Ok(message.message_id)
    }

    pub fn add_assistant_message(
        &self,
        session_id: Option<&str>,
        content: &str,
        tool_calls: Vec<ToolCall>,
        metadata: Option<Value>,
    ) -> Result<String> {
        let session_id = self.require_id(session_id)?;
        let mut message = Message::assistant_with_tools(content, tool_calls);
        message.metadata = metadata;
        self.dao.add_message(&session_id, &message)?;
        Ok(message.message_id)
    }

    pub fn add_tool_message(
        &self,
        session_id: Option<&str>,
        content: &str,
        tool_call_id: &str,
    ) -> Result<String> {
        let session_id = self.require_id(session_id)?;
        if tool_call_id.trim().is_empty() {
            return Err(Error::Validation(
                "tool messages require a non-empty tool_call_id".into(),
            ));
        }
        let message = Message::tool(content, tool_call_id);
        self.dao.add_message(&session_id, &message)?;
        Ok(message.message_id)
    }

    /// Persist one orchestration delta: the user input (when given), every
    /// new message in order, and the tool-result map updates — one
    /// transaction. Invalid tool messages are skipped with a warning
    /// inside the DAO rather than aborting the whole delta.
    pub fn update_from_agent_result(
        &self,
        session_id: Option<&str>,
        result: &AgentResult,
        user_input: Option<&str>,
    ) -> Result<bool> {
        let session_id = self.require_id(session_id)?;
        let user_message = user_input.map(Message::user);

        match self.dao.ingest_result(
            &session_id,
            user_message.as_ref(),
            &result.new_messages,
            &result.tool_execution_results_updates,
        ) {
            Ok(skipped) => {
                tracing::debug!(
                    session_id = %session_id,
                    new_messages = result.new_messages.len(),
                    skipped,
                    updates = result.tool_execution_results_updates.len(),
                    "agent result persisted"
                );
                Ok(true)
            }
            Err(e) => {
                // The stream already reached the user; losing the save is
                // logged, not fatal.
                tracing::warn!(session_id = %session_id, error = %e, "failed to persist agent result");
                Ok(false)
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Search & statistics
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn search_sessions(&self, keyword: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.dao.search_sessions(keyword, limit)
    }

    pub fn get_session_statistics(
        &self,
        session_id: Option<&str>,
    ) -> Result<Option<SessionStatistics>> {
        let Some(session_id) = self.resolve_id(session_id) else {
            return Ok(None);
        };
        self.dao.session_statistics(&session_id)
    }

    /// Store-wide counts across all sessions.
    pub fn get_global_statistics(&self) -> Result<GlobalStatistics> {
        self.dao.global_statistics()
    }

    fn resolve_id(&self, session_id: Option<&str>) -> Option<String> {
        session_id
            .map(str::to_string)
            .or_else(|| self.current.lock().clone())
    }

    fn require_id(&self, session_id: Option<&str>) -> Result<String> {
        self.resolve_id(session_id)
            .ok_or_else(|| Error::Validation("no session loaded".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
