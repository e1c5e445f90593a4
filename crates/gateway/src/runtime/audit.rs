//! Post-turn audit writes.
//!
//! Tool invocations are audited into `tool_executions` after the run, from
//! the executor's outcomes. The executor itself never touches the store;
//! losing an audit row is logged, never fatal.

use pw_persistence::records::ToolExecutionRecord;
use pw_persistence::Dao;

use super::executor::ToolOutcome;

pub fn record_tool_outcomes(dao: &Dao, session_id: &str, outcomes: &[ToolOutcome]) {
    for outcome in outcomes {
        let record = ToolExecutionRecord {
            execution_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            message_id: None,
            tool_name: outcome.tool_name.clone(),
            arguments: outcome.arguments.clone(),
            result: outcome.success.then(|| outcome.result.clone()),
            success: outcome.success,
            execution_time: outcome.execution_time,
            started_at: outcome.started_at.clone(),
            completed_at: Some(outcome.completed_at.clone()),
            error_message: outcome.error.clone(),
        };
        if let Err(e) = dao.add_tool_execution(&record) {
            tracing::warn!(
                session_id,
                tool = %outcome.tool_name,
                error = %e,
                "failed to audit tool execution"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn outcomes_become_audit_rows() {
        let dao = Dao::open_in_memory().unwrap();
        let session_id = dao.create_session("t", Value::Null).unwrap();

        let outcomes = vec![ToolOutcome {
            call_id: "c1".into(),
            tool_name: "research".into(),
            arguments: serde_json::json!({"q": "x"}),
            result: serde_json::json!({"ok": true}),
            success: true,
            execution_time: 0.2,
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: chrono::Utc::now().to_rfc3339(),
            error: None,
        }];
        record_tool_outcomes(&dao, &session_id, &outcomes);
        assert_eq!(dao.tool_execution_count(&session_id).unwrap(), 1);
    }
}
