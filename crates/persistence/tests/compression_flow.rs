//! End-to-end compression flow: a session grows past the message
//! threshold, the compressor rewrites the active context, and the audit
//! log plus tool-result map come through untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use pw_domain::config::CompressionConfig;
use pw_domain::context::AgentResult;
use pw_domain::error::Result;
use pw_domain::stream::{BoxStream, LlmDelta};
use pw_domain::tool::Message;
use pw_persistence::{Compressor, Dao, SessionManager};
use pw_providers::traits::{ChatRequest, ChatResponse, LlmProvider};

struct FixedSummarizer;

#[async_trait::async_trait]
impl LlmProvider for FixedSummarizer {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: r#"{
                "compressed_messages": [
                    {"role": "user", "content": "many turns of planning, merged"},
                    {"role": "assistant", "content": "the agreed plan so far"}
                ],
                "summary": "long planning conversation",
                "key_decisions": ["keep sqlite"]
            }"#
            .to_string(),
            tool_calls: vec![],
            usage: None,
            model: "fixed".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(&self, _req: &ChatRequest) -> Result<BoxStream<'static, Result<LlmDelta>>> {
        unimplemented!("summarization is non-streaming")
    }

    fn provider_id(&self) -> &str {
        "fixed"
    }
}

#[tokio::test]
async fn threshold_crossing_swaps_active_context() {
    let dao = Arc::new(Dao::open_in_memory().unwrap());
    let manager = SessionManager::new(dao.clone());
    let session_id = manager.create_session(Some("long session")).unwrap();

    // Grow the session past the 50-message default via the normal delta
    // ingestion path (30 turns of user + assistant).
    for i in 0..30 {
        let mut updates = BTreeMap::new();
        updates.insert(
            "short_planning".to_string(),
            serde_json::json!({"round": i}),
        );
        let result = AgentResult::success(
            vec![Message::assistant(format!("reply {i}"))],
            updates,
            0.1,
            serde_json::Value::Null,
        );
        assert!(manager
            .update_from_agent_result(Some(&session_id), &result, Some(&format!("ask {i}")))
            .unwrap());
    }

    let before = dao
        .get_active_compressed_context(&session_id)
        .unwrap()
        .unwrap();
    assert_eq!(before.compressed_message_count, 60);
    assert_eq!(before.compression_version, 1);

    let compressor = Compressor::start(
        dao.clone(),
        Arc::new(FixedSummarizer),
        CompressionConfig::default(),
    );
    assert!(compressor.should_compress(&session_id));

    compressor.compress_if_needed(&session_id);
    compressor.stop().await;

    let after = dao
        .get_active_compressed_context(&session_id)
        .unwrap()
        .unwrap();
    assert_eq!(after.compression_version, 2);
    assert!(after.is_active);
    // 2 rollups + 5 preserved, well under the threshold.
    assert_eq!(after.compressed_message_count, 7);
    assert!(after.compressed_message_count <= 50);
    assert!(!compressor.should_compress(&session_id));

    // Compression never touches tool results.
    assert_eq!(after.tool_execution_results, before.tool_execution_results);
    assert_eq!(
        after.tool_execution_results["short_planning"],
        serde_json::json!({"round": 29})
    );

    // The audit log is untouched and the session counters still match it.
    assert_eq!(dao.get_messages(&session_id, None).unwrap().len(), 60);
    let session = dao.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.total_messages, 60);

    // The context handed to the orchestrator now reads as compressed.
    let context = manager
        .build_agent_context(Some(&session_id))
        .unwrap()
        .unwrap();
    assert!(context.is_compressed);
    assert_eq!(context.dialogue_history.len(), 7);
    assert_eq!(
        context.dialogue_history[0].content,
        "many turns of planning, merged"
    );
    // The tail keeps the newest raw turns.
    assert_eq!(context.dialogue_history[6].content, "reply 29");
}
