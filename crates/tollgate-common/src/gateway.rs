use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MIN_ATTEMPT_BUDGET_MS: u64 = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
    #[error("invalid gateway config field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for the usage ledger.
    pub dsn: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub request_timeout_secs: u64,
    /// Below this remaining budget no further provider attempt is started.
    pub min_attempt_budget_ms: u64,
    /// Starting balance every owner's credits are measured against.
    pub initial_credit: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub min_attempt_budget_ms: Option<u64>,
    pub initial_credit: Option<Decimal>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.request_timeout_secs.is_some() {
            self.request_timeout_secs = other.request_timeout_secs;
        }
        if other.min_attempt_budget_ms.is_some() {
            self.min_attempt_budget_ms = other.min_attempt_budget_ms;
        }
        if other.initial_credit.is_some() {
            self.initial_credit = other.initial_credit;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        let request_timeout_secs = self
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        if request_timeout_secs == 0 {
            return Err(GatewayConfigError::Invalid {
                field: "request_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        let initial_credit = self.initial_credit.unwrap_or_else(|| Decimal::new(100, 0));
        if initial_credit.is_sign_negative() {
            return Err(GatewayConfigError::Invalid {
                field: "initial_credit",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            dsn: self.dsn.ok_or(GatewayConfigError::MissingField("dsn"))?,
            proxy: self.proxy.filter(|proxy| !proxy.trim().is_empty()),
            request_timeout_secs,
            min_attempt_budget_ms: self
                .min_attempt_budget_ms
                .unwrap_or(DEFAULT_MIN_ATTEMPT_BUDGET_MS),
            initial_credit,
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            proxy: value.proxy,
            request_timeout_secs: Some(value.request_timeout_secs),
            min_attempt_budget_ms: Some(value.min_attempt_budget_ms),
            initial_credit: Some(value.initial_credit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layers() {
        let mut base = GatewayConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
            dsn: Some("sqlite://file.db".to_string()),
            ..Default::default()
        };
        base.overlay(GatewayConfigPatch {
            port: Some(9100),
            ..Default::default()
        });

        let config = base.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9100);
        assert_eq!(config.request_timeout_secs, 120);
        assert_eq!(config.min_attempt_budget_ms, 1_000);
        assert_eq!(config.initial_credit, Decimal::new(100, 0));
    }

    #[test]
    fn dsn_is_required() {
        let err = GatewayConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GatewayConfigError::MissingField("dsn")));
    }

    #[test]
    fn blank_proxy_is_dropped() {
        let config = GatewayConfigPatch {
            dsn: Some("sqlite::memory:".to_string()),
            proxy: Some("  ".to_string()),
            ..Default::default()
        }
        .into_config()
        .unwrap();
        assert!(config.proxy.is_none());
    }
}
