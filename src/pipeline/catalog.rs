//! Read-only tenant configuration: directors, agents, prompts, model configs.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{Collection, TenantStore};

fn default_enabled() -> bool {
    true
}

/// A workflow triggered by filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Director {
    pub id: String,
    pub name: String,
    pub prompt_id: String,
    pub model_config_id: String,
    /// Agents this director may invoke as tools.
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A subordinate conversation a director can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt_id: String,
    pub model_config_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_timeout_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub name: String,
    pub system: String,
}

/// Backend model selection handed to the LLM backend untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub model_configs: Vec<ModelConfig>,
}

/// A resolved prompt + model pair.
#[derive(Debug, Clone)]
pub struct Binding {
    pub prompt: Prompt,
    pub model: ModelConfig,
}

/// Snapshot of a tenant's orchestration configuration.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub directors: Vec<Director>,
    pub agents: Vec<Agent>,
    pub prompts: Vec<Prompt>,
    pub model_configs: Vec<ModelConfig>,
}

impl Catalog {
    /// Load directors, agents, prompts and settings for one tenant.
    pub async fn load(store: &TenantStore) -> Result<Self, StoreError> {
        let settings: Vec<Settings> = store.load(Collection::Settings).await?;
        Ok(Self {
            directors: store.load(Collection::Directors).await?,
            agents: store.load(Collection::Agents).await?,
            prompts: store.load(Collection::Prompts).await?,
            model_configs: settings
                .into_iter()
                .flat_map(|s| s.model_configs)
                .collect(),
        })
    }

    pub fn director(&self, id: &str) -> Option<&Director> {
        self.directors.iter().find(|d| d.id == id)
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn prompt(&self, id: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.id == id)
    }

    pub fn model_config(&self, id: &str) -> Option<&ModelConfig> {
        self.model_configs.iter().find(|m| m.id == id)
    }

    /// Resolve a prompt/model pair. `None` if either side is missing.
    pub fn resolve_binding(&self, prompt_id: &str, model_config_id: &str) -> Option<Binding> {
        Some(Binding {
            prompt: self.prompt(prompt_id)?.clone(),
            model: self.model_config(model_config_id)?.clone(),
        })
    }

    /// Agents a director is allowed to call, in the director's order.
    pub fn agents_for(&self, director: &Director) -> Vec<&Agent> {
        director
            .agent_ids
            .iter()
            .filter_map(|id| self.agent(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn load_and_resolve() {
        let store = TenantStore::new(Arc::new(MemoryStore::new()), "t1");
        store
            .save(
                Collection::Prompts,
                &[json!({"id": "p1", "name": "Triage", "system": "You triage mail."})],
            )
            .await
            .unwrap();
        store
            .save(
                Collection::Settings,
                &[json!({"model_configs": [{"id": "m1", "provider": "openai", "model": "gpt"}]})],
            )
            .await
            .unwrap();
        store
            .save(
                Collection::Directors,
                &[json!({
                    "id": "d1", "name": "Billing", "prompt_id": "p1",
                    "model_config_id": "m1", "agent_ids": ["a1", "ghost"]
                })],
            )
            .await
            .unwrap();
        store
            .save(
                Collection::Agents,
                &[json!({"id": "a1", "name": "Lookup", "prompt_id": "p1", "model_config_id": "m1"})],
            )
            .await
            .unwrap();

        let catalog = Catalog::load(&store).await.unwrap();
        let director = catalog.director("d1").unwrap();
        assert!(director.enabled);

        let binding = catalog.resolve_binding("p1", "m1").unwrap();
        assert_eq!(binding.prompt.system, "You triage mail.");
        assert_eq!(binding.model.model, "gpt");
        assert!(catalog.resolve_binding("p1", "missing").is_none());

        let agents = catalog.agents_for(director);
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "a1");
    }
}
