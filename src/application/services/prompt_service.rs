//! Prompt service - Cached (key, language) -> content lookup with rendering
//!
//! Lookup falls back to English when the requested language is absent.
//! Rendering substitutes `{{NPC_COUNT}}` and `{{CHOICE_COUNT}}` from dynamic
//! config and `{{USER_INPUT}}` from the task, at most once for the latter.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::application::ports::outbound::{PromptStorePort, RepositoryError};
use crate::application::services::DynamicConfigService;

pub const FALLBACK_LANGUAGE: &str = "en";
/// Prompt key for the shared system prompt sent with every text task.
pub const SYSTEM_PROMPT_KEY: &str = "system";

const NPC_COUNT_PLACEHOLDER: &str = "{{NPC_COUNT}}";
const CHOICE_COUNT_PLACEHOLDER: &str = "{{CHOICE_COUNT}}";
const USER_INPUT_PLACEHOLDER: &str = "{{USER_INPUT}}";

pub const NPC_COUNT_KEY: &str = "generation.npc_count";
pub const CHOICE_COUNT_KEY: &str = "generation.choice_count";
const DEFAULT_NPC_COUNT: i64 = 3;
const DEFAULT_CHOICE_COUNT: i64 = 4;

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("prompt not found: {key} ({language})")]
    NotFound { key: String, language: String },
}

pub struct PromptService {
    store: Arc<dyn PromptStorePort>,
    config: Arc<DynamicConfigService>,
    cache: RwLock<HashMap<(String, String), String>>,
}

impl PromptService {
    pub fn new(store: Arc<dyn PromptStorePort>, config: Arc<DynamicConfigService>) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Initial snapshot load; called once at process start.
    pub async fn load(&self) -> Result<usize, RepositoryError> {
        let prompts = self.store.load_all().await?;
        let mut cache = self.cache.write().await;
        cache.clear();
        for prompt in prompts {
            cache.insert((prompt.key, prompt.language), prompt.content);
        }
        Ok(cache.len())
    }

    /// Raw prompt content for (key, language), falling back to English.
    pub async fn get_prompt(&self, key: &str, language: &str) -> Result<String, PromptError> {
        let cache = self.cache.read().await;
        if let Some(content) = cache.get(&(key.to_string(), language.to_string())) {
            return Ok(content.clone());
        }
        if language != FALLBACK_LANGUAGE {
            if let Some(content) = cache.get(&(key.to_string(), FALLBACK_LANGUAGE.to_string())) {
                return Ok(content.clone());
            }
        }
        Err(PromptError::NotFound {
            key: key.to_string(),
            language: language.to_string(),
        })
    }

    /// Prompt content with all placeholders substituted.
    pub async fn render(
        &self,
        key: &str,
        language: &str,
        user_input: &str,
    ) -> Result<String, PromptError> {
        let content = self.get_prompt(key, language).await?;

        let npc_count = self.config.get_positive_int(NPC_COUNT_KEY, DEFAULT_NPC_COUNT).await;
        let choice_count = self
            .config
            .get_positive_int(CHOICE_COUNT_KEY, DEFAULT_CHOICE_COUNT)
            .await;

        let rendered = content
            .replace(NPC_COUNT_PLACEHOLDER, &npc_count.to_string())
            .replace(CHOICE_COUNT_PLACEHOLDER, &choice_count.to_string())
            .replacen(USER_INPUT_PLACEHOLDER, user_input, 1);
        Ok(rendered)
    }

    /// Writer side of the cache bus: a prompt was created or updated.
    pub async fn apply_upsert(&self, key: String, language: String, content: String) {
        tracing::debug!(key, language, "applying prompt upsert");
        self.cache.write().await.insert((key, language), content);
    }

    /// Writer side of the cache bus: a prompt was deleted.
    pub async fn apply_delete(&self, key: &str, language: &str) {
        tracing::debug!(key, language, "applying prompt delete");
        self.cache
            .write()
            .await
            .remove(&(key.to_string(), language.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::application::ports::outbound::ConfigStorePort;
    use crate::domain::entities::Prompt;

    struct FixedPrompts(Vec<Prompt>);

    #[async_trait]
    impl PromptStorePort for FixedPrompts {
        async fn load_all(&self) -> Result<Vec<Prompt>, RepositoryError> {
            Ok(self.0.clone())
        }
    }

    struct FixedConfig(Vec<(String, String)>);

    #[async_trait]
    impl ConfigStorePort for FixedConfig {
        async fn load_all(&self) -> Result<Vec<(String, String)>, RepositoryError> {
            Ok(self.0.clone())
        }
    }

    async fn service(prompts: &[(&str, &str, &str)], config: &[(&str, &str)]) -> PromptService {
        let config_service = Arc::new(DynamicConfigService::new(Arc::new(FixedConfig(
            config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ))));
        config_service.load().await.unwrap();

        let service = PromptService::new(
            Arc::new(FixedPrompts(
                prompts
                    .iter()
                    .map(|(key, language, content)| Prompt {
                        key: key.to_string(),
                        language: language.to_string(),
                        content: content.to_string(),
                    })
                    .collect(),
            )),
            config_service,
        );
        service.load().await.unwrap();
        service
    }

    #[tokio::test]
    async fn exact_language_wins_over_fallback() {
        let svc = service(
            &[("narrator", "en", "english"), ("narrator", "de", "deutsch")],
            &[],
        )
        .await;
        assert_eq!(svc.get_prompt("narrator", "de").await.unwrap(), "deutsch");
    }

    #[tokio::test]
    async fn missing_language_falls_back_to_english() {
        let svc = service(&[("narrator", "en", "english")], &[]).await;
        assert_eq!(svc.get_prompt("narrator", "fr").await.unwrap(), "english");
    }

    #[tokio::test]
    async fn absent_prompt_is_not_found() {
        let svc = service(&[("narrator", "en", "english")], &[]).await;
        let err = svc.get_prompt("setup", "fr").await.unwrap_err();
        assert!(matches!(err, PromptError::NotFound { .. }));
    }

    #[tokio::test]
    async fn render_substitutes_counts_and_user_input_once() {
        let svc = service(
            &[(
                "scene_planner",
                "en",
                "Cast {{NPC_COUNT}} NPCs, {{CHOICE_COUNT}} choices. Premise: {{USER_INPUT}} / again: {{USER_INPUT}}",
            )],
            &[("generation.npc_count", "5"), ("generation.choice_count", "2")],
        )
        .await;

        let rendered = svc.render("scene_planner", "en", "a baker").await.unwrap();
        assert_eq!(
            rendered,
            "Cast 5 NPCs, 2 choices. Premise: a baker / again: {{USER_INPUT}}"
        );
    }

    #[tokio::test]
    async fn render_uses_defaults_when_config_missing() {
        let svc = service(&[("scene_planner", "en", "{{NPC_COUNT}}/{{CHOICE_COUNT}}")], &[]).await;
        let rendered = svc.render("scene_planner", "en", "").await.unwrap();
        assert_eq!(rendered, "3/4");
    }

    #[tokio::test]
    async fn bus_events_mutate_the_cache() {
        let svc = service(&[("narrator", "en", "old")], &[]).await;
        svc.apply_upsert("narrator".into(), "en".into(), "new".into()).await;
        assert_eq!(svc.get_prompt("narrator", "en").await.unwrap(), "new");

        svc.apply_delete("narrator", "en").await;
        assert!(svc.get_prompt("narrator", "en").await.is_err());
    }
}
