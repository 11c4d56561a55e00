use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_costs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "provider_model_effective")]
    pub provider: String,
    #[sea_orm(unique_key = "provider_model_effective")]
    pub model: String,
    /// Decimal USD, kept as text so no precision is lost on any backend.
    pub input_cost_per_1k: String,
    pub output_cost_per_1k: String,
    #[sea_orm(unique_key = "provider_model_effective")]
    pub effective_date: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
