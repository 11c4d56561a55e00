use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("invalid decimal {value:?} in {column}: {source}")]
    InvalidDecimal {
        column: &'static str,
        value: String,
        source: rust_decimal::Error,
    },
    #[error("unknown ledger status {0:?}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerStatus {
    Success,
    Error,
    Timeout,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Success => "success",
            LedgerStatus::Error => "error",
            LedgerStatus::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(LedgerStatus::Success),
            "error" => Some(LedgerStatus::Error),
            "timeout" => Some(LedgerStatus::Timeout),
            _ => None,
        }
    }
}

/// Cost of one entry in micro-USD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CostMicros {
    pub input: i64,
    pub output: i64,
    pub total: i64,
}

/// One finalized request. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub generation_id: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub provider: String,
    pub model: String,
    pub request_type: String,
    pub streamed: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// `None` when nothing billable was observed.
    pub cost: Option<CostMicros>,
    pub cost_unknown: bool,
    pub latency_ms: u64,
    pub status: LedgerStatus,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// An entry for this generation id already existed; nothing was written.
    AlreadyRecorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOwner {
    User(Uuid),
    Organization(Uuid),
}

/// Inclusive `created_at` bounds; open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreditWindow {
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreditAggregate {
    pub total_used_micros: i64,
    pub by_provider: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingRow {
    pub provider: String,
    /// `*` matches any model of the provider.
    pub model: String,
    pub input_cost_per_1k: Decimal,
    pub output_cost_per_1k: Decimal,
    pub effective_date: OffsetDateTime,
}

/// Durable, idempotent usage ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create-if-absent keyed by `generation_id`, enforced by a unique index.
    async fn record(&self, entry: &LedgerEntry) -> StorageResult<RecordOutcome>;

    async fn get_by_generation_id(&self, generation_id: &str)
    -> StorageResult<Option<LedgerEntry>>;

    /// Sums cost-bearing entries for `owner` in one grouped query.
    async fn aggregate_credits(
        &self,
        owner: LedgerOwner,
        window: CreditWindow,
    ) -> StorageResult<CreditAggregate>;

    async fn ping(&self) -> StorageResult<()>;
}
