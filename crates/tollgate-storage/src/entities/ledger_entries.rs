use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub generation_id: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub provider: String,
    pub model: String,
    pub request_type: String,
    pub streamed: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    /// Micro-USD. Null when no billable usage was observed.
    pub input_cost_micros: Option<i64>,
    pub output_cost_micros: Option<i64>,
    pub total_cost_micros: Option<i64>,
    pub cost_unknown: bool,
    pub latency_ms: i64,
    pub status: String,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
