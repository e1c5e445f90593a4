use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl Config {
    /// Startup validation. Returns human-readable issues; an empty list
    /// means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.orchestrator.max_recursion_depth == 0 {
            issues.push("orchestrator.max_recursion_depth must be at least 1".into());
        }
        if self.compression.preserve_recent_count as i64 >= self.compression.max_messages {
            issues.push(
                "compression.preserve_recent_count should be well below compression.max_messages"
                    .into(),
            );
        }
        for p in &self.llm.providers {
            if p.id.trim().is_empty() {
                issues.push("llm.providers entries must have a non-empty id".into());
            }
            if p.base_url.trim().is_empty() {
                issues.push(format!("llm provider '{}' has an empty base_url", p.id));
            }
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8011,
            host: "127.0.0.1".into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// Configured provider endpoints. All are OpenAI-compatible.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Role → provider id (e.g. `executor`, `summarizer`).
    #[serde(default)]
    pub roles: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id referenced by `roles`.
    pub id: String,
    pub base_url: String,
    /// Env var holding the API key. Resolved at registry construction.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Inline API key (discouraged; prefer `api_key_env`).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "d_provider_timeout")]
    pub timeout_secs: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounds on the ReAct function-calling cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum LLM ↔ tool cycles per request.
    #[serde(default = "d_5")]
    pub max_recursion_depth: usize,
    /// Default per-tool-call timeout in seconds (tools may override).
    #[serde(default = "d_tool_timeout")]
    pub tool_timeout_secs: u64,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: 5,
            tool_timeout_secs: 120,
            temperature: 0.2,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// SSE heartbeat interval in seconds.
    #[serde(default = "d_heartbeat")]
    pub heartbeat_secs: u64,
    /// Coalesce assistant chunk events before writing to SSE clients.
    #[serde(default)]
    pub buffer_events: bool,
    /// Include event metadata in serialized output.
    #[serde(default)]
    pub include_metadata: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            buffer_events: false,
            include_metadata: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the SQLite database file.
    #[serde(default = "d_db_path")]
    pub db_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: d_db_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thresholds for background context compression. The active compressed
/// context is rewritten when either bound is exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Compress when the active context holds more tokens than this.
    #[serde(default = "d_max_tokens")]
    pub max_tokens: i64,
    /// Compress when the active context holds more messages than this.
    #[serde(default = "d_max_messages")]
    pub max_messages: i64,
    /// Messages kept verbatim at the tail of the compressed history.
    #[serde(default = "d_preserve_recent")]
    pub preserve_recent_count: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: 8000,
            max_messages: 50,
            preserve_recent_count: 5,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    8011
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_provider_timeout() -> u64 {
    120
}
fn d_5() -> usize {
    5
}
fn d_tool_timeout() -> u64 {
    120
}
fn d_temperature() -> f32 {
    0.2
}
fn d_heartbeat() -> u64 {
    30
}
fn d_db_path() -> String {
    "planweaver.db".into()
}
fn d_true() -> bool {
    true
}
fn d_max_tokens() -> i64 {
    8000
}
fn d_max_messages() -> i64 {
    50
}
fn d_preserve_recent() -> usize {
    5
}
