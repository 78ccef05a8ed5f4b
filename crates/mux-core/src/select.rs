//! Choosing an adapter from command-line flags and config.

use std::sync::Arc;

use mux_backend::mock::fixtures;
use mux_backend::{api, MockProvider, Provider, ProviderRegistry, VertexProvider};

use crate::config::BackendConfig;

pub struct Selection {
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub api_key: Option<String>,
}

/// Apply config that changes how built-in adapters are constructed.
///
/// A configured Vertex project or location replaces the environment-based
/// factory.
pub fn configure_registry(registry: &ProviderRegistry, config: &BackendConfig) {
    let vertex = &config.vertex;
    if vertex.project.is_none() && vertex.location.is_none() {
        return;
    }
    let project = vertex
        .project
        .clone()
        .or_else(|| std::env::var(mux_backend::vertex::PROJECT_ENV).ok())
        .unwrap_or_default();
    let location = vertex
        .location
        .clone()
        .or_else(|| std::env::var(mux_backend::vertex::LOCATION_ENV).ok())
        .unwrap_or_default();
    registry.register(api::GOOGLE_VERTEX, move |base_url: &str| {
        Arc::new(VertexProvider::new(base_url, project.clone(), location.clone())) as Arc<dyn Provider>
    });
}

/// Register a mock adapter that echoes `prompt` back.
pub fn register_echo(registry: &ProviderRegistry, prompt: &str) {
    let config = fixtures::echo(prompt).with_chunk_delay(20);
    registry.register(api::MOCK, move |_: &str| {
        Arc::new(MockProvider::new(config.clone())) as Arc<dyn Provider>
    });
}

/// Resolve `api` (or the configured default) to an adapter, model and key.
pub fn select(
    registry: &ProviderRegistry,
    config: &BackendConfig,
    api: Option<&str>,
    model: Option<&str>,
) -> Result<Selection, String> {
    let api = api.unwrap_or(&config.default);
    let resolved = config.resolve(api);
    let base_url = resolved.as_ref().map_or("", |r| r.base_url.as_str());

    let provider = registry.get(api, base_url).ok_or_else(|| {
        format!(
            "unknown api '{api}' (available: {})",
            registry.apis().join(", ")
        )
    })?;

    let model = match (model, &resolved) {
        (Some(model), _) => model.to_string(),
        (None, Some(resolved)) => resolved.model.clone(),
        (None, None) if api == api::MOCK => "mock".to_string(),
        (None, None) => return Err(format!("no model configured for '{api}', pass --model")),
    };

    Ok(Selection {
        provider,
        model,
        api_key: resolved.and_then(|r| r.api_key()),
    })
}
