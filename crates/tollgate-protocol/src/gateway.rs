//! Gateway-specific schemas: the vendor metadata block attached to completions,
//! and the generation / credits lookup responses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub gateway: GatewayMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayMetadata {
    pub provider: String,
    /// Decimal USD string; `None` when no pricing row matched.
    pub cost: Option<String>,
    /// Milliseconds from the first attempt to completion.
    pub latency: u64,
    pub routing: RoutingMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub selected_provider: String,
    /// Providers that were tried and failed before the selected one.
    pub fallback_providers: Vec<String>,
}

impl ProviderMetadata {
    pub fn new(
        provider: impl Into<String>,
        cost: Option<String>,
        latency: u64,
        fallback_providers: Vec<String>,
    ) -> Self {
        let provider = provider.into();
        Self {
            gateway: GatewayMetadata {
                provider: provider.clone(),
                cost,
                latency,
                routing: RoutingMetadata {
                    selected_provider: provider,
                    fallback_providers,
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub data: GenerationData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationData {
    pub id: String,
    pub total_cost: f64,
    /// Same value as `total_cost`; kept for clients of the older schema.
    pub usage: f64,
    /// RFC3339 timestamp.
    pub created_at: String,
    pub model: String,
    pub provider_name: String,
    pub streamed: bool,
    pub latency: u64,
    pub generation_time: u64,
    pub tokens_prompt: u64,
    pub tokens_completion: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cost_unknown: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditsResponse {
    /// Two-decimal USD strings.
    pub balance: String,
    pub total_used: String,
    pub usage_breakdown: BTreeMap<String, String>,
}
