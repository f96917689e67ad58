//! Provider registry.
//!
//! Constructs and holds all LLM provider instances the current environment
//! can support. At startup the registry inspects the credentials discovered
//! by [`Config`], instantiates the appropriate adapter for each, and probes
//! the local Ollama endpoint before including it.

use std::collections::HashMap;
use std::sync::Arc;

use osa_domain::config::Config;

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;
use crate::util::mask_secrets;

/// Default local Ollama endpoint (OpenAI-compatible path appended).
pub const OLLAMA_HOST: &str = "127.0.0.1";
pub const OLLAMA_PORT: u16 = 11434;

/// Preference order used when auto-deriving the fallback chain.
pub const PREFERRED_ORDER: &[&str] = &["anthropic", "openai", "groq", "openrouter", "ollama"];

/// Records a provider that failed to initialize.
#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub provider_id: String,
    /// Error message with any potential secrets masked.
    pub error: String,
}

/// Holds all instantiated LLM providers.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    init_errors: Vec<ProviderInitError>,
}

impl ProviderRegistry {
    /// Build the registry from the environment-derived [`Config`].
    ///
    /// Providers that fail to initialize are logged and skipped rather
    /// than aborting boot. A local Ollama server is included only after a
    /// fast TCP probe succeeds.
    pub async fn from_config(config: &Config) -> Self {
        let mut registry = Self {
            providers: HashMap::new(),
            init_errors: Vec::new(),
        };
        let timeout = config.provider_timeout_secs;

        for (provider_id, key) in &config.credentials {
            let result: osa_domain::Result<Arc<dyn LlmProvider>> = match provider_id.as_str() {
                "anthropic" => AnthropicProvider::new(key.clone(), None, timeout)
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                "openai" => OpenAiCompatProvider::new(
                    "openai",
                    "https://api.openai.com/v1",
                    key.clone(),
                    "gpt-4o",
                    timeout,
                )
                .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                "groq" => OpenAiCompatProvider::new(
                    "groq",
                    "https://api.groq.com/openai/v1",
                    key.clone(),
                    "llama-3.3-70b-versatile",
                    timeout,
                )
                .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                "openrouter" => OpenAiCompatProvider::new(
                    "openrouter",
                    "https://openrouter.ai/api/v1",
                    key.clone(),
                    "openai/gpt-4o-mini",
                    timeout,
                )
                .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                other => {
                    tracing::warn!(provider_id = other, "unrecognized provider credential");
                    continue;
                }
            };
            registry.insert_result(provider_id, result);
        }

        // Local Ollama: only when something answers the socket quickly.
        if probe_tcp(OLLAMA_HOST, OLLAMA_PORT).await {
            let result = OpenAiCompatProvider::new(
                "ollama",
                format!("http://{OLLAMA_HOST}:{OLLAMA_PORT}/v1"),
                "ollama",
                "llama3.2",
                timeout,
            )
            .map(|p| Arc::new(p) as Arc<dyn LlmProvider>);
            registry.insert_result("ollama", result);
        }

        if registry.providers.is_empty() {
            tracing::warn!(
                "no LLM providers available; the runtime will boot but every \
                 chat call will fail until a credential is configured"
            );
        }

        registry
    }

    /// Registry with an explicit provider set (tests and embedding).
    pub fn with_providers(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|p| (p.provider_id().to_string(), p))
                .collect(),
            init_errors: Vec::new(),
        }
    }

    fn insert_result(
        &mut self,
        provider_id: &str,
        result: osa_domain::Result<Arc<dyn LlmProvider>>,
    ) {
        match result {
            Ok(provider) => {
                tracing::info!(provider_id, "registered LLM provider");
                self.providers.insert(provider_id.to_string(), provider);
            }
            Err(e) => {
                let safe_error = mask_secrets(&e.to_string());
                tracing::warn!(provider_id, error = %safe_error, "failed to initialize LLM provider, skipping");
                self.init_errors.push(ProviderInitError {
                    provider_id: provider_id.to_string(),
                    error: safe_error,
                });
            }
        }
    }

    /// Look up a provider by id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    /// Registered provider ids in the preferred fallback order, with any
    /// unknown ids appended alphabetically.
    pub fn preferred_order(&self) -> Vec<String> {
        let mut out: Vec<String> = PREFERRED_ORDER
            .iter()
            .filter(|id| self.providers.contains_key(**id))
            .map(|id| id.to_string())
            .collect();
        let mut extra: Vec<String> = self
            .providers
            .keys()
            .filter(|id| !PREFERRED_ORDER.contains(&id.as_str()))
            .cloned()
            .collect();
        extra.sort();
        out.extend(extra);
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn LlmProvider>)> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider initialization errors (empty if all succeeded). Surfaced
    /// by the `status` command so missing keys are diagnosable without
    /// scraping logs.
    pub fn init_errors(&self) -> &[ProviderInitError] {
        &self.init_errors
    }
}

/// Fast reachability probe for the local provider.
pub async fn probe_tcp(host: &str, port: u16) -> bool {
    let addr = format!("{host}:{port}");
    matches!(
        tokio::time::timeout(
            std::time::Duration::from_millis(250),
            tokio::net::TcpStream::connect(&addr),
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    #[test]
    fn preferred_order_filters_and_appends() {
        let registry = ProviderRegistry::with_providers(vec![
            Arc::new(MockProvider::new("zeta")),
            Arc::new(MockProvider::new("openai")),
            Arc::new(MockProvider::new("anthropic")),
        ]);
        assert_eq!(registry.preferred_order(), vec!["anthropic", "openai", "zeta"]);
    }

    #[tokio::test]
    async fn probe_unreachable_port_is_false() {
        // Port 1 is essentially never listening.
        assert!(!probe_tcp("127.0.0.1", 1).await);
    }

    #[tokio::test]
    async fn empty_config_builds_empty_registry() {
        let cfg = osa_domain::config::Config::from_lookup(&|_| None);
        let registry = ProviderRegistry::from_config(&cfg).await;
        // No credentials; ollama probe may or may not succeed on dev boxes,
        // so only assert the credentialed providers are absent.
        assert!(registry.get("anthropic").is_none());
        assert!(registry.get("openai").is_none());
        assert!(registry.init_errors().is_empty());
    }
}
