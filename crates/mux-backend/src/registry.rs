//! Runtime lookup of adapters by API identifier.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;
use crate::provider::{api, Provider};
use crate::vertex::VertexProvider;

/// Builds an adapter for a base URL. An empty base URL means the vendor's
/// default endpoint.
pub type ProviderFactory = Arc<dyn Fn(&str) -> Arc<dyn Provider> + Send + Sync>;

#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, ProviderFactory>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the OpenAI, Vertex and Anthropic adapters.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(api::OPENAI_COMPLETIONS, |base_url: &str| {
            Arc::new(OpenAiProvider::new(base_url)) as Arc<dyn Provider>
        });
        registry.register(api::GOOGLE_VERTEX, |base_url: &str| {
            Arc::new(VertexProvider::from_env(base_url)) as Arc<dyn Provider>
        });
        registry.register(api::ANTHROPIC_MESSAGES, |base_url: &str| {
            Arc::new(AnthropicProvider::new(base_url)) as Arc<dyn Provider>
        });
        registry
    }

    /// Register a factory, replacing any existing one for `api`.
    pub fn register<F>(&self, api: &str, factory: F)
    where
        F: Fn(&str) -> Arc<dyn Provider> + Send + Sync + 'static,
    {
        let replaced = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(api.to_string(), Arc::new(factory))
            .is_some();
        debug!(api, replaced, "registered provider");
    }

    /// Build the adapter for `api`, or `None` if nothing is registered.
    pub fn get(&self, api: &str, base_url: &str) -> Option<Arc<dyn Provider>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(api)
            .cloned()?;
        // The lock is released before the factory runs.
        Some(factory(base_url))
    }

    pub fn has(&self, api: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(api)
    }

    /// Registered identifiers, sorted.
    pub fn apis(&self) -> Vec<String> {
        let mut apis: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        apis.sort();
        apis
    }
}

/// The process-wide registry, created with the built-in adapters on first use.
pub fn global() -> &'static ProviderRegistry {
    static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();
    GLOBAL.get_or_init(ProviderRegistry::with_builtins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fixtures, MockProvider};
    use std::thread;

    #[test]
    fn builtins_are_registered() {
        let registry = ProviderRegistry::with_builtins();
        assert!(registry.has(api::OPENAI_COMPLETIONS));
        assert!(registry.has(api::GOOGLE_VERTEX));
        assert!(registry.has(api::ANTHROPIC_MESSAGES));
        assert!(!registry.has(api::MOCK));
        assert_eq!(
            registry.apis(),
            vec!["anthropic-messages", "google-vertex", "openai-completions"]
        );
    }

    #[test]
    fn get_builds_adapter_for_base_url() {
        let registry = ProviderRegistry::with_builtins();
        let provider = registry
            .get(api::OPENAI_COMPLETIONS, "http://localhost:8000/v1")
            .unwrap();
        assert_eq!(provider.api(), api::OPENAI_COMPLETIONS);
    }

    #[test]
    fn miss_returns_none() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("nope", "").is_none());
        assert!(!registry.has("nope"));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = ProviderRegistry::with_builtins();
        registry.register(api::OPENAI_COMPLETIONS, |_: &str| {
            Arc::new(MockProvider::new(fixtures::streaming_text(&["stub"]))) as Arc<dyn Provider>
        });

        let provider = registry.get(api::OPENAI_COMPLETIONS, "").unwrap();
        assert_eq!(provider.api(), api::MOCK);
        let result = provider
            .stream("m", &Default::default(), Default::default())
            .collect_result()
            .await;
        assert_eq!(result.text(), "stub");
    }

    #[test]
    fn concurrent_reads_and_writes() {
        let registry = Arc::new(ProviderRegistry::with_builtins());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..100 {
                        if i % 4 == 0 {
                            registry.register(api::MOCK, |_: &str| {
                                Arc::new(MockProvider::default()) as Arc<dyn Provider>
                            });
                        } else {
                            assert!(registry.get(api::GOOGLE_VERTEX, "").is_some());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.has(api::MOCK));
    }

    #[test]
    fn global_is_shared() {
        assert!(std::ptr::eq(global(), global()));
        assert!(global().has(api::GOOGLE_VERTEX));
    }
}
