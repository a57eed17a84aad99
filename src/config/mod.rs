//! Gateway configuration.
//!
//! One [`GatewayConfig`] snapshot maps names to [`ClientConfig`]s and is
//! replaced wholesale on change — never mutated in place. The factory holds
//! snapshots behind an `ArcSwap` and evicts every realized client when a
//! new snapshot arrives (see [`ConfigWatcher`] for file-driven updates).

mod watch;

pub use watch::ConfigWatcher;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::tokens::PriceTable;
use crate::{Error, ErrorContext, Result};

/// Violation policy for the content-safety layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SafetyPolicy {
    /// Emit masked text and continue.
    #[default]
    Replace,
    /// Abort and emit one fixed block message instead.
    Block,
    /// Emit unmodified text, record a warning.
    LogOnly,
}

/// One sensitive term with an optional per-term mask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyRule {
    pub term: String,
    #[serde(default)]
    pub mask: Option<String>,
}

impl SafetyRule {
    pub fn term(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: impl Into<String>) -> Self {
        self.mask = Some(mask.into());
        self
    }
}

/// Fixed-window rate-limit settings for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_secs: 60,
        }
    }
}

/// Which layers are enabled and their tunables. Part of [`ClientConfig`];
/// shares its snapshot lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry_enabled: bool,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,

    pub rate_limit_enabled: bool,

    pub logging_enabled: bool,

    pub audit_enabled: bool,

    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub semantic_cache_enabled: bool,
    pub semantic_threshold: f64,

    pub usage_enabled: bool,

    pub safety_enabled: bool,
    pub safety_policy: SafetyPolicy,
    pub filter_input: bool,
    pub filter_output: bool,
    pub sensitive_terms: Vec<SafetyRule>,
    pub mask_pii: bool,

    pub tools_enabled: bool,
    pub max_tool_iterations: u32,
    pub parallel_tools: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_enabled: true,
            max_retry_attempts: 3,
            retry_base_delay_ms: 200,
            rate_limit_enabled: false,
            logging_enabled: true,
            audit_enabled: false,
            cache_enabled: false,
            cache_ttl_secs: 3600,
            semantic_cache_enabled: false,
            semantic_threshold: 0.85,
            usage_enabled: true,
            safety_enabled: false,
            safety_policy: SafetyPolicy::Replace,
            filter_input: true,
            filter_output: true,
            sensitive_terms: Vec::new(),
            mask_pii: true,
            tools_enabled: true,
            max_tool_iterations: 5,
            parallel_tools: false,
        }
    }
}

/// One named backend's settings. Loaded as part of an immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Filled from the map key when loaded through [`GatewayConfig`].
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Inline credential. Prefer `api_key_env` outside of tests.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Name of an environment variable holding the credential.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default = "default_true")]
    pub supports_tools: bool,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Per-client price table; falls back to built-in presets by model id.
    #[serde(default)]
    pub prices: Option<PriceTable>,
    /// Names tried, in order, when this client is unhealthy.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            supports_streaming: true,
            supports_tools: true,
            rate_limit: RateLimitSettings::default(),
            pipeline: PipelineConfig::default(),
            prices: None,
            fallbacks: Vec::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Resolve the credential: inline key first, then the named env var.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = &self.api_key {
            if !key.trim().is_empty() {
                return Ok(key.clone());
            }
        }
        if let Some(var) = &self.api_key_env {
            if let Ok(key) = std::env::var(var) {
                if !key.trim().is_empty() {
                    return Ok(key);
                }
            }
        }
        Err(Error::configuration_with_context(
            "no api key configured",
            ErrorContext::new()
                .with_field_path(format!("clients.{}.api_key", self.name))
                .with_source("config"),
        ))
    }

    /// Price table for cost accounting: explicit table, else built-in
    /// preset, else zero prices.
    pub fn price_table(&self) -> PriceTable {
        self.prices
            .clone()
            .or_else(|| PriceTable::for_model(&self.model))
            .unwrap_or_default()
    }

    /// Fail-fast validation: required fields must be present at build time,
    /// never discovered missing at call time.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::configuration_with_context(
                "model id is required",
                ErrorContext::new()
                    .with_field_path(format!("clients.{}.model", self.name))
                    .with_source("config"),
            ));
        }
        url::Url::parse(&self.base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid base_url: {}", e),
                ErrorContext::new()
                    .with_field_path(format!("clients.{}.base_url", self.name))
                    .with_details(self.base_url.clone())
                    .with_source("config"),
            )
        })?;
        self.resolve_api_key()?;
        Ok(())
    }
}

/// Immutable configuration snapshot for the whole gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub fallback_providers: Vec<String>,
    #[serde(default)]
    pub clients: HashMap<String, ClientConfig>,
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, config: ClientConfig) -> Self {
        self.clients.insert(config.name.clone(), config);
        self
    }

    pub fn with_default_provider(mut self, name: impl Into<String>) -> Self {
        self.default_provider = Some(name.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ClientConfig> {
        self.clients.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config: GatewayConfig = serde_yaml::from_str(yaml).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid gateway config: {}", e),
                ErrorContext::new().with_source("config_loader"),
            )
        })?;
        for (name, client) in config.clients.iter_mut() {
            client.name = name.clone();
        }
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }
}
