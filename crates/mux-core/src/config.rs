use std::path::{Path, PathBuf};
use std::time::Duration;

use mux_backend::{api, RetryPolicy, TransportConfig};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub transport: TransportSection,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// API identifier used when `--api` is not given.
    pub default: String,
    pub openai: VendorConfig,
    pub anthropic: VendorConfig,
    pub vertex: VertexConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default: api::OPENAI_COMPLETIONS.to_string(),
            openai: VendorConfig::default(),
            anthropic: VendorConfig::default(),
            vertex: VertexConfig::default(),
        }
    }
}

/// Unset fields fall back to the per-vendor defaults in [`BackendConfig::resolve`].
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct VendorConfig {
    /// Empty means the vendor's public endpoint.
    pub base_url: String,
    pub model: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct VertexConfig {
    pub base_url: String,
    pub model: Option<String>,
    /// Environment variable holding an OAuth access token.
    pub api_key_env: Option<String>,
    /// Falls back to `GOOGLE_CLOUD_PROJECT`.
    pub project: Option<String>,
    /// Falls back to `GOOGLE_CLOUD_LOCATION`, then `us-central1`.
    pub location: Option<String>,
}

/// Everything needed to start a stream against one vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBackend {
    pub api: String,
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
}

impl ResolvedBackend {
    /// The key from the configured environment variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

impl BackendConfig {
    /// Resolve settings for `api`, or `None` for an identifier with no
    /// configuration section.
    pub fn resolve(&self, api: &str) -> Option<ResolvedBackend> {
        let (base_url, model, key_env, default_model, default_key_env) = match api {
            api::OPENAI_COMPLETIONS => (
                &self.openai.base_url,
                &self.openai.model,
                &self.openai.api_key_env,
                "gpt-4o-mini",
                "OPENAI_API_KEY",
            ),
            api::ANTHROPIC_MESSAGES => (
                &self.anthropic.base_url,
                &self.anthropic.model,
                &self.anthropic.api_key_env,
                "claude-sonnet-4-20250514",
                "ANTHROPIC_API_KEY",
            ),
            api::GOOGLE_VERTEX => (
                &self.vertex.base_url,
                &self.vertex.model,
                &self.vertex.api_key_env,
                "gemini-2.0-flash",
                "GOOGLE_CLOUD_ACCESS_TOKEN",
            ),
            _ => return None,
        };
        Some(ResolvedBackend {
            api: api.to_string(),
            base_url: base_url.clone(),
            model: model.clone().unwrap_or_else(|| default_model.to_string()),
            api_key_env: key_env
                .clone()
                .unwrap_or_else(|| default_key_env.to_string()),
        })
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSection {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub header_timeout_secs: u64,
    /// Events buffered between an adapter and a slow consumer.
    pub queue_capacity: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            max_attempts: transport.retry.max_attempts,
            base_delay_ms: transport.retry.base_delay.as_millis() as u64,
            max_delay_ms: transport.retry.max_delay.as_millis() as u64,
            connect_timeout_secs: transport.connect_timeout.as_secs(),
            header_timeout_secs: transport.header_timeout.as_secs(),
            queue_capacity: mux_backend::stream::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl TransportSection {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
            },
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            header_timeout: Duration::from_secs(self.header_timeout_secs),
        }
    }
}

impl Config {
    pub fn load_or_default() -> Self {
        Self::load_from(&config_path())
    }

    /// Read `path`. A missing file gives the defaults; a malformed one is
    /// reported and also gives the defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to parse config");
                Config::default()
            }),
            Err(_) => {
                debug!(path = %path.display(), "no config file, using defaults");
                Config::default()
            }
        }
    }
}

pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("llmux").join("config.toml")
}
