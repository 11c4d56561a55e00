use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use time::OffsetDateTime;

use tollgate_provider_core::UsageCounters;
use tollgate_storage::{CostMicros, PricingRow};

/// Fractional digits kept on every cost component.
pub const COST_SCALE: u32 = 6;

/// Matches any model of a provider.
pub const WILDCARD_MODEL: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("no pricing for provider {provider:?} model {model:?}")]
    NotFound { provider: String, model: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub input_cost_per_1k: Decimal,
    pub output_cost_per_1k: Decimal,
    pub effective_date: OffsetDateTime,
}

/// Derived cost of one request. Never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub total_cost: Decimal,
}

impl CostRecord {
    /// Zero cost for usage that could not be priced.
    pub fn unpriced(provider: &str, model: &str, usage: UsageCounters) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            input_cost: Decimal::ZERO,
            output_cost: Decimal::ZERO,
            total_cost: Decimal::ZERO,
        }
    }

    pub fn to_micros(&self) -> CostMicros {
        CostMicros {
            input: decimal_to_micros(self.input_cost),
            output: decimal_to_micros(self.output_cost),
            total: decimal_to_micros(self.total_cost),
        }
    }
}

/// Immutable pricing snapshot keyed by (provider, model).
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    rates: HashMap<(String, String), Vec<Rate>>,
}

impl PricingTable {
    pub fn new(rows: impl IntoIterator<Item = PricingRow>) -> Self {
        let mut rates: HashMap<(String, String), Vec<Rate>> = HashMap::new();
        for row in rows {
            rates.entry((row.provider, row.model)).or_default().push(Rate {
                input_cost_per_1k: row.input_cost_per_1k,
                output_cost_per_1k: row.output_cost_per_1k,
                effective_date: row.effective_date,
            });
        }
        for list in rates.values_mut() {
            list.sort_by_key(|rate| rate.effective_date);
        }
        Self { rates }
    }

    pub fn len(&self) -> usize {
        self.rates.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Latest rate effective at `at`; an exact model row wins over the
    /// provider wildcard.
    pub fn rate(&self, provider: &str, model: &str, at: OffsetDateTime) -> Result<Rate, PricingError> {
        [model, WILDCARD_MODEL]
            .into_iter()
            .find_map(|key| {
                self.rates
                    .get(&(provider.to_string(), key.to_string()))?
                    .iter()
                    .rev()
                    .find(|rate| rate.effective_date <= at)
                    .copied()
            })
            .ok_or_else(|| PricingError::NotFound {
                provider: provider.to_string(),
                model: model.to_string(),
            })
    }

    pub fn cost(
        &self,
        provider: &str,
        model: &str,
        usage: UsageCounters,
        at: OffsetDateTime,
    ) -> Result<CostRecord, PricingError> {
        let rate = self.rate(provider, model, at)?;
        let input_cost = component(usage.input_tokens, rate.input_cost_per_1k);
        let output_cost = component(usage.output_tokens, rate.output_cost_per_1k);
        Ok(CostRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        })
    }
}

fn component(tokens: u64, per_1k: Decimal) -> Decimal {
    (Decimal::from(tokens) * per_1k / Decimal::ONE_THOUSAND)
        .round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointNearestEven)
}

pub fn decimal_to_micros(value: Decimal) -> i64 {
    (value * Decimal::from(1_000_000))
        .round()
        .to_i64()
        .unwrap_or(i64::MAX)
}

pub fn micros_to_decimal(micros: i64) -> Decimal {
    Decimal::new(micros, COST_SCALE)
}
