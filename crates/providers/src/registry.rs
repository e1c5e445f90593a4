//! Provider registry.
//!
//! Constructs and holds all configured LLM provider instances, plus the
//! role map (`executor` drives orchestration, `summarizer` drives context
//! compression). Providers that fail to initialize are logged and skipped
//! so one bad entry doesn't take the whole process down.

use std::collections::HashMap;
use std::sync::Arc;

use pw_domain::config::LlmConfig;
use pw_domain::error::Result;

use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    roles: HashMap<String, String>,
}

impl ProviderRegistry {
    /// Build the registry from the application's [`LlmConfig`]. API keys
    /// are resolved eagerly (env vars are read at this point).
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();

        for pc in &config.providers {
            match OpenAiCompatProvider::from_config(pc) {
                Ok(p) => {
                    tracing::info!(provider_id = %pc.id, "LLM provider initialized");
                    providers.insert(pc.id.clone(), Arc::new(p));
                }
                Err(e) => {
                    tracing::warn!(provider_id = %pc.id, error = %e, "skipping LLM provider");
                }
            }
        }

        Ok(Self {
            providers,
            roles: config.roles.clone(),
        })
    }

    /// Registry with a single pre-built provider (used by tests and
    /// embedders that construct providers themselves).
    pub fn single(role: &str, provider: Arc<dyn LlmProvider>) -> Self {
        let id = provider.provider_id().to_string();
        let mut providers = HashMap::new();
        providers.insert(id.clone(), provider);
        let mut roles = HashMap::new();
        roles.insert(role.to_string(), id);
        Self { providers, roles }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(id).cloned()
    }

    /// Resolve the provider assigned to `role`, if configured.
    pub fn for_role(&self, role: &str) -> Option<Arc<dyn LlmProvider>> {
        self.roles.get(role).and_then(|id| self.get(id))
    }

    /// Resolution order: requested role → executor → any provider.
    pub fn resolve(&self, role: &str) -> Option<Arc<dyn LlmProvider>> {
        self.for_role(role)
            .or_else(|| self.for_role("executor"))
            .or_else(|| self.providers.values().next().cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }
}
