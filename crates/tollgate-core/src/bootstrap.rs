use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use time::OffsetDateTime;
use tracing::{info, warn};

use tollgate_common::{
    ConfigFile, GatewayConfig, GatewayConfigPatch, ProviderKindName, ProviderSettings,
};
use tollgate_provider_core::{CircuitConfig, Clock, HealthTracker, SystemClock, UpstreamClient};
use tollgate_provider_impl::{ProviderKind, ProviderSpec, build_registry};
use tollgate_storage::{LedgerStore, PricingRow, SeaOrmStorage};

use crate::auth::{AuthSnapshot, KeyAuth};
use crate::engine::{EngineSettings, RoutingEngine, RoutingSnapshot};
use crate::policy::RoutingPolicy;
use crate::pricing::PricingTable;
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "tollgate",
    version,
    about = "OpenAI-compatible LLM gateway with provider failover and cost accounting"
)]
pub struct CliArgs {
    /// TOML file with providers, routing, pricing and api keys.
    #[arg(long, env = "TOLLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database DSN for the usage ledger.
    #[arg(long, env = "TOLLGATE_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "TOLLGATE_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "TOLLGATE_PORT")]
    pub port: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "TOLLGATE_PROXY")]
    pub proxy: Option<String>,
}

pub struct Bootstrap {
    pub config: GatewayConfig,
    pub storage: Arc<SeaOrmStorage>,
    pub engine: Arc<RoutingEngine>,
    pub auth: Arc<KeyAuth>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let file = match args.config.as_ref() {
        Some(path) => ConfigFile::load(path)
            .with_context(|| format!("load config file {}", path.display()))?,
        None => {
            warn!("no config file given, starting without providers");
            ConfigFile::default()
        }
    };

    // clap already applies CLI > ENV per field; both overlay the file.
    let mut merged = file.gateway.to_patch();
    merged.overlay(GatewayConfigPatch {
        host: sanitize_optional_env_value(args.host),
        port: parse_u16_env_value(args.port, "TOLLGATE_PORT")?,
        dsn: sanitize_optional_env_value(args.dsn),
        proxy: sanitize_optional_env_value(args.proxy),
        ..GatewayConfigPatch::default()
    });
    if merged.dsn.is_none() {
        merged.dsn = Some(default_dsn());
    }
    let config = merged
        .into_config()
        .context("finalize merged gateway config")?;
    info!(
        host = %config.host,
        port = config.port,
        dsn = %config.dsn,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        "config loaded"
    );

    ensure_sqlite_parent_dir(&config.dsn)?;
    let storage = Arc::new(
        SeaOrmStorage::connect(config.dsn.clone())
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    let client = WreqUpstreamClient::new(UpstreamClientConfig::from_gateway(&config))
        .context("build upstream client")?;
    let engine = build_engine(
        &config,
        &file,
        Arc::new(client),
        storage.clone(),
        Arc::new(SystemClock),
    )
    .await?;
    let auth = KeyAuth::new(AuthSnapshot::from_settings(&file.api_keys));
    info!(api_keys = file.api_keys.len(), "auth ready");

    Ok(Bootstrap {
        config,
        storage,
        engine: Arc::new(engine),
        auth: Arc::new(auth),
    })
}

/// Seeds pricing, then assembles adapters, health tracking and the routing
/// snapshot around `storage`.
pub async fn build_engine(
    config: &GatewayConfig,
    file: &ConfigFile,
    client: Arc<dyn UpstreamClient>,
    storage: Arc<SeaOrmStorage>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<RoutingEngine> {
    let rows: Vec<PricingRow> = file
        .pricing
        .iter()
        .map(|row| PricingRow {
            provider: row.provider.clone(),
            model: row.model.clone(),
            input_cost_per_1k: row.input_cost_per_1k,
            output_cost_per_1k: row.output_cost_per_1k,
            effective_date: row.effective_date.unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
        .collect();
    let seeded = storage
        .seed_pricing(&rows)
        .await
        .context("seed pricing")?;
    let pricing = PricingTable::new(storage.load_pricing().await.context("load pricing")?);
    info!(seeded, rates = pricing.len(), "pricing loaded");

    let specs: Vec<ProviderSpec> = file.providers.iter().map(provider_spec).collect();
    let health = HealthTracker::new(
        CircuitConfig {
            enabled: file.circuit.enabled,
            failure_threshold: file.circuit.failure_threshold,
            window: Duration::from_secs(file.circuit.window_secs),
            cooldown: Duration::from_secs(file.circuit.cooldown_secs),
        },
        clock,
        specs.iter().map(|spec| spec.id.clone()),
    );
    for spec in &specs {
        info!(
            provider = %spec.id,
            kind = spec.kind.as_str(),
            models = spec.models.len(),
            max_concurrency = spec.max_concurrency,
            "provider ready"
        );
    }
    let registry = build_registry(specs, client);

    let snapshot = RoutingSnapshot {
        policy: RoutingPolicy::from_settings(&file.routing),
        pricing,
        settings: EngineSettings {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            min_attempt_budget: Duration::from_millis(config.min_attempt_budget_ms),
            initial_credit: config.initial_credit,
        },
    };
    let ledger: Arc<dyn LedgerStore> = storage;
    Ok(RoutingEngine::new(
        snapshot,
        Arc::new(registry),
        Arc::new(health),
        ledger,
    ))
}

fn provider_spec(settings: &ProviderSettings) -> ProviderSpec {
    let api_key = settings.api_key.clone().or_else(|| {
        let var = settings.api_key_env.as_deref()?;
        let value = sanitize_optional_env_value(std::env::var(var).ok());
        if value.is_none() {
            warn!(provider = %settings.name, env = %var, "api key environment variable is not set");
        }
        value
    });
    ProviderSpec {
        id: settings.name.clone(),
        kind: match settings.kind {
            ProviderKindName::OpenAi => ProviderKind::OpenAi,
            ProviderKindName::Anthropic => ProviderKind::Anthropic,
            ProviderKindName::Aggregator => ProviderKind::Aggregator,
        },
        base_url: settings.base_url.clone(),
        api_key,
        models: settings.models.clone(),
        max_concurrency: settings.max_concurrency,
    }
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Unresolved `${VAR}` placeholders count as unset.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn default_dsn() -> String {
    if let Some(data_dir) = sanitize_optional_env_value(std::env::var("TOLLGATE_DATA_DIR").ok()) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/tollgate.db?mode=rwc");
    }
    "sqlite://tollgate.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    let normalized = path_part.strip_prefix("//").unwrap_or(path_part);
    if normalized.is_empty() || normalized.eq_ignore_ascii_case(":memory:") {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}
