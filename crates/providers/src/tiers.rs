//! Tier → model mapping.
//!
//! Each capability tier resolves to a concrete (provider, model) pair. The
//! hosted providers ship static maps; a local Ollama server derives its
//! map dynamically from the installed model sizes (largest = elite,
//! smallest = utility).

use std::collections::HashMap;

use osa_domain::agent::AgentTier;
use osa_domain::error::{Error, Result};

use crate::registry::ProviderRegistry;

/// A concrete model selection for one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
}

/// Tier → model map for the active provider set.
#[derive(Debug, Clone, Default)]
pub struct TierMap {
    entries: HashMap<AgentTier, ModelSpec>,
}

impl TierMap {
    pub fn resolve(&self, tier: AgentTier) -> Option<&ModelSpec> {
        self.entries.get(&tier)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, tier: AgentTier, provider: &str, model: &str) {
        self.entries.insert(
            tier,
            ModelSpec {
                provider: provider.into(),
                model: model.into(),
            },
        );
    }

    /// Static defaults for a hosted provider id. `None` for providers whose
    /// map must be derived (ollama) or that are unknown.
    pub fn defaults_for(provider_id: &str) -> Option<TierMap> {
        let mut map = TierMap::default();
        match provider_id {
            "anthropic" => {
                map.insert(AgentTier::Elite, "anthropic", "claude-opus-4-20250514");
                map.insert(AgentTier::Specialist, "anthropic", "claude-sonnet-4-20250514");
                map.insert(AgentTier::Utility, "anthropic", "claude-3-5-haiku-20241022");
            }
            "openai" => {
                map.insert(AgentTier::Elite, "openai", "gpt-4o");
                map.insert(AgentTier::Specialist, "openai", "gpt-4o");
                map.insert(AgentTier::Utility, "openai", "gpt-4o-mini");
            }
            "groq" => {
                map.insert(AgentTier::Elite, "groq", "llama-3.3-70b-versatile");
                map.insert(AgentTier::Specialist, "groq", "llama-3.3-70b-versatile");
                map.insert(AgentTier::Utility, "groq", "llama-3.1-8b-instant");
            }
            "openrouter" => {
                map.insert(AgentTier::Elite, "openrouter", "anthropic/claude-sonnet-4");
                map.insert(AgentTier::Specialist, "openrouter", "openai/gpt-4o");
                map.insert(AgentTier::Utility, "openrouter", "openai/gpt-4o-mini");
            }
            _ => return None,
        }
        Some(map)
    }

    /// Build the tier map for the registered provider set: the first
    /// provider (in preferred order) with a static map wins; a lone Ollama
    /// install gets its map from [`derive_ollama`] at boot.
    pub fn for_registry(registry: &ProviderRegistry) -> TierMap {
        for id in registry.preferred_order() {
            if let Some(map) = TierMap::defaults_for(&id) {
                return map;
            }
        }
        TierMap::default()
    }

    /// Derive a tier map from the models installed on a local Ollama
    /// server, sorted by on-disk size.
    pub async fn derive_ollama(base_url: &str) -> Result<TierMap> {
        let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let body: serde_json::Value = client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let models = body
            .get("models")
            .and_then(|m| m.as_array())
            .ok_or_else(|| Error::Provider {
                provider: "ollama".into(),
                message: "missing 'models' array in /api/tags response".into(),
            })?;

        let mut sized: Vec<(String, u64)> = models
            .iter()
            .filter_map(|m| {
                let name = m.get("name")?.as_str()?.to_string();
                let size = m.get("size").and_then(|s| s.as_u64()).unwrap_or(0);
                Some((name, size))
            })
            .collect();
        if sized.is_empty() {
            return Err(Error::Provider {
                provider: "ollama".into(),
                message: "no models installed".into(),
            });
        }
        sized.sort_by(|a, b| b.1.cmp(&a.1));

        Ok(Self::from_sized_models(&sized))
    }

    /// Largest installed model is elite, smallest is utility, and the
    /// median is the specialist class.
    fn from_sized_models(sorted_desc: &[(String, u64)]) -> TierMap {
        let mut map = TierMap::default();
        let largest = &sorted_desc[0].0;
        let smallest = &sorted_desc[sorted_desc.len() - 1].0;
        let middle = &sorted_desc[sorted_desc.len() / 2].0;
        map.insert(AgentTier::Elite, "ollama", largest);
        map.insert(AgentTier::Specialist, "ollama", middle);
        map.insert(AgentTier::Utility, "ollama", smallest);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_defaults_cover_all_tiers() {
        let map = TierMap::defaults_for("anthropic").unwrap();
        assert!(map.resolve(AgentTier::Elite).is_some());
        assert!(map.resolve(AgentTier::Specialist).is_some());
        assert!(map.resolve(AgentTier::Utility).is_some());
    }

    #[test]
    fn unknown_provider_has_no_defaults() {
        assert!(TierMap::defaults_for("ollama").is_none());
        assert!(TierMap::defaults_for("whatever").is_none());
    }

    #[test]
    fn sized_models_map_by_size() {
        let sorted = vec![
            ("llama3.3:70b".to_string(), 40_000_000_000),
            ("qwen2.5:14b".to_string(), 9_000_000_000),
            ("llama3.2:3b".to_string(), 2_000_000_000),
        ];
        let map = TierMap::from_sized_models(&sorted);
        assert_eq!(map.resolve(AgentTier::Elite).unwrap().model, "llama3.3:70b");
        assert_eq!(map.resolve(AgentTier::Specialist).unwrap().model, "qwen2.5:14b");
        assert_eq!(map.resolve(AgentTier::Utility).unwrap().model, "llama3.2:3b");
    }

    #[test]
    fn single_model_fills_every_tier() {
        let sorted = vec![("llama3.2:3b".to_string(), 2_000_000_000)];
        let map = TierMap::from_sized_models(&sorted);
        assert_eq!(map.resolve(AgentTier::Elite).unwrap().model, "llama3.2:3b");
        assert_eq!(map.resolve(AgentTier::Utility).unwrap().model, "llama3.2:3b");
    }
}
