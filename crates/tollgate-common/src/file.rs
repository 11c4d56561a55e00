use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::GatewayConfigPatch;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("provider name must not be empty")]
    EmptyProviderName,
    #[error("duplicate provider: {0}")]
    DuplicateProvider(String),
    #[error("route {route} references unknown provider {provider}")]
    UnknownProvider { route: String, provider: String },
    #[error("route {0} has no providers")]
    EmptyRoute(String),
    #[error("invalid route key {0}")]
    InvalidRouteKey(String),
    #[error("pricing for {provider}/{model} must not be negative")]
    NegativePrice { provider: String, model: String },
    #[error("api key hash for user {0} must be 64 hex characters")]
    InvalidKeyHash(Uuid),
    #[error("circuit failure_threshold must be at least 1")]
    InvalidCircuit,
}

/// On-disk configuration (TOML).
///
/// Everything here is read once at startup and turned into immutable
/// snapshots; nothing writes back to the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub circuit: CircuitSettings,
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
    #[serde(default)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub pricing: Vec<PricingSettings>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeySettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub min_attempt_budget_ms: Option<u64>,
    pub initial_credit: Option<Decimal>,
}

impl GatewaySection {
    pub fn to_patch(&self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            host: self.host.clone(),
            port: self.port,
            dsn: self.dsn.clone(),
            proxy: self.proxy.clone(),
            request_timeout_secs: self.request_timeout_secs,
            min_attempt_budget_ms: self.min_attempt_budget_ms,
            initial_credit: self.initial_credit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitSettings {
    #[serde(default = "default_circuit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_circuit_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            enabled: default_circuit_enabled(),
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKindName {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Aggregator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    pub name: String,
    pub kind: ProviderKindName,
    pub base_url: Option<String>,
    /// Inline secret. Prefer `api_key_env` outside of local setups.
    pub api_key: Option<String>,
    /// Environment variable holding the secret.
    pub api_key_env: Option<String>,
    /// Models advertised by `/v1/models`. Empty means "whatever is routed here".
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    64
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingSettings {
    /// Namespace (the part before `/`) -> ordered provider preferences.
    #[serde(default)]
    pub namespaces: BTreeMap<String, Vec<RouteTarget>>,
    /// Full `namespace/model` overrides, checked before namespaces.
    #[serde(default)]
    pub models: BTreeMap<String, Vec<RouteTarget>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteTarget {
    Name(String),
    Detailed {
        provider: String,
        priority: Option<u32>,
        model: Option<String>,
    },
}

impl RouteTarget {
    pub fn provider(&self) -> &str {
        match self {
            RouteTarget::Name(name) => name,
            RouteTarget::Detailed { provider, .. } => provider,
        }
    }

    pub fn priority(&self) -> Option<u32> {
        match self {
            RouteTarget::Name(_) => None,
            RouteTarget::Detailed { priority, .. } => *priority,
        }
    }

    /// Upstream model id override; `None` keeps the requested model.
    pub fn model(&self) -> Option<&str> {
        match self {
            RouteTarget::Name(_) => None,
            RouteTarget::Detailed { model, .. } => model.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingSettings {
    pub provider: String,
    /// Model id as routed to the provider, or `*` for a provider-wide rate.
    pub model: String,
    pub input_cost_per_1k: Decimal,
    pub output_cost_per_1k: Decimal,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub effective_date: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeySettings {
    pub name: Option<String>,
    /// blake3 hex digest of the bearer key.
    pub key_hash: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

impl ConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::InvalidCircuit);
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::EmptyProviderName);
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
        }

        for (namespace, targets) in &self.routing.namespaces {
            if namespace.is_empty() || namespace.contains('/') {
                return Err(ConfigError::InvalidRouteKey(namespace.clone()));
            }
            check_targets(namespace, targets, &names)?;
        }
        for (model, targets) in &self.routing.models {
            let valid = model
                .split_once('/')
                .is_some_and(|(ns, id)| !ns.is_empty() && !id.is_empty() && !id.contains('/'));
            if !valid {
                return Err(ConfigError::InvalidRouteKey(model.clone()));
            }
            check_targets(model, targets, &names)?;
        }

        for row in &self.pricing {
            if !names.contains(row.provider.as_str()) {
                return Err(ConfigError::UnknownProvider {
                    route: format!("pricing:{}", row.model),
                    provider: row.provider.clone(),
                });
            }
            if row.input_cost_per_1k.is_sign_negative() || row.output_cost_per_1k.is_sign_negative()
            {
                return Err(ConfigError::NegativePrice {
                    provider: row.provider.clone(),
                    model: row.model.clone(),
                });
            }
        }

        for key in &self.api_keys {
            let hash = key.key_hash.trim();
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ConfigError::InvalidKeyHash(key.user_id));
            }
        }

        Ok(())
    }
}

fn check_targets(
    route: &str,
    targets: &[RouteTarget],
    providers: &HashSet<&str>,
) -> Result<(), ConfigError> {
    if targets.is_empty() {
        return Err(ConfigError::EmptyRoute(route.to_string()));
    }
    for target in targets {
        if !providers.contains(target.provider()) {
            return Err(ConfigError::UnknownProvider {
                route: route.to_string(),
                provider: target.provider().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[gateway]
port = 9001
initial_credit = "250.00"

[circuit]
failure_threshold = 5

[[providers]]
name = "vercel"
kind = "aggregator"
api_key_env = "VERCEL_AI_GATEWAY_API_KEY"

[[providers]]
name = "openai"
kind = "openai"
models = ["openai/gpt-4o"]

[routing.namespaces]
openai = ["openai", { provider = "vercel", priority = 1 }]

[routing.models]
"acme/modelX" = [{ provider = "vercel", model = "acme/model-x-2024" }]

[[pricing]]
provider = "openai"
model = "*"
input_cost_per_1k = "0.001"
output_cost_per_1k = "0.002"
effective_date = "2024-01-01T00:00:00Z"

[[api_keys]]
key_hash = "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
user_id = "6b1b3c52-2c3a-4a4e-9df2-0f1b0b7c9a11"
organization_id = "2f0e8e4c-7f5d-4f3e-8f5e-1e2d3c4b5a69"
"#;

    #[test]
    fn parses_full_file() {
        let file = ConfigFile::parse(SAMPLE).unwrap();
        assert_eq!(file.gateway.port, Some(9001));
        assert_eq!(file.gateway.initial_credit, Some(Decimal::new(25000, 2)));
        assert_eq!(file.circuit.failure_threshold, 5);
        assert_eq!(file.circuit.cooldown_secs, 30);
        assert_eq!(file.providers.len(), 2);
        assert_eq!(file.providers[0].kind, ProviderKindName::Aggregator);
        assert_eq!(file.providers[0].max_concurrency, 64);

        let targets = &file.routing.namespaces["openai"];
        assert_eq!(targets[0], RouteTarget::Name("openai".to_string()));
        assert_eq!(targets[1].priority(), Some(1));
        assert_eq!(
            file.routing.models["acme/modelX"][0].model(),
            Some("acme/model-x-2024")
        );
        assert_eq!(file.pricing[0].input_cost_per_1k, Decimal::new(1, 3));
        assert!(file.pricing[0].effective_date.is_some());
    }

    #[test]
    fn rejects_route_to_unknown_provider() {
        let text = r#"
[[providers]]
name = "openai"
kind = "openai"

[routing.namespaces]
acme = ["missing"]
"#;
        let err = ConfigFile::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider { .. }));
    }

    #[test]
    fn rejects_duplicate_provider() {
        let text = r#"
[[providers]]
name = "openai"
kind = "openai"

[[providers]]
name = "openai"
kind = "aggregator"
"#;
        let err = ConfigFile::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProvider(name) if name == "openai"));
    }

    #[test]
    fn rejects_negative_price() {
        let text = r#"
[[providers]]
name = "openai"
kind = "openai"

[[pricing]]
provider = "openai"
model = "*"
input_cost_per_1k = "-0.1"
output_cost_per_1k = "0.1"
"#;
        let err = ConfigFile::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::NegativePrice { .. }));
    }

    #[test]
    fn rejects_model_override_without_namespace() {
        let text = r#"
[[providers]]
name = "openai"
kind = "openai"

[routing.models]
"gpt-4o" = ["openai"]
"#;
        let err = ConfigFile::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRouteKey(_)));
    }
}
