use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::sea_query::{Index, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, DbErr, EntityTrait, FromQueryResult, QueryFilter, QueryOrder, QuerySelect,
    Schema, SqlErr,
};
use time::OffsetDateTime;
use tracing::debug;

use crate::entities;
use crate::ledger::{
    CostMicros, CreditAggregate, CreditWindow, LedgerEntry, LedgerOwner, LedgerStatus,
    LedgerStore, PricingRow, RecordOutcome, StorageError, StorageResult,
};

#[derive(Debug, FromQueryResult)]
struct ProviderCostRow {
    provider: String,
    total_cost_micros: Option<i64>,
}

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(options: impl Into<ConnectOptions>) -> StorageResult<Self> {
        let db = Database::connect(options).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    /// Private in-memory SQLite database with its schema synced. A single
    /// pooled connection keeps every query on the same database.
    pub async fn connect_in_memory() -> StorageResult<Self> {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options
            .max_connections(1)
            .min_connections(1)
            .sqlx_logging(false);
        let storage = Self::connect(options).await?;
        storage.sync().await?;
        Ok(storage)
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync.
    pub async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::LedgerEntries)
            .register(entities::ProviderCosts)
            .sync(&self.db)
            .await?;
        self.ensure_indexes().await?;
        Ok(())
    }

    async fn ensure_indexes(&self) -> StorageResult<()> {
        use entities::ledger_entries::Column;

        let statements = vec![
            Index::create()
                .name("idx_ledger_entries_user_created")
                .table(entities::ledger_entries::Entity)
                .col(Column::UserId)
                .col(Column::CreatedAt)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_ledger_entries_org_created")
                .table(entities::ledger_entries::Entity)
                .col(Column::OrganizationId)
                .col(Column::CreatedAt)
                .if_not_exists()
                .to_owned(),
        ];
        for statement in statements {
            self.db.execute(&statement).await?;
        }
        Ok(())
    }

    /// Inserts pricing rows that are not present yet. Returns how many were new.
    pub async fn seed_pricing(&self, rows: &[PricingRow]) -> StorageResult<u64> {
        use entities::provider_costs::Column;

        let now = OffsetDateTime::now_utc();
        let mut inserted = 0;
        for row in rows {
            let active = entities::provider_costs::ActiveModel {
                provider: ActiveValue::Set(row.provider.clone()),
                model: ActiveValue::Set(row.model.clone()),
                input_cost_per_1k: ActiveValue::Set(row.input_cost_per_1k.normalize().to_string()),
                output_cost_per_1k: ActiveValue::Set(
                    row.output_cost_per_1k.normalize().to_string(),
                ),
                effective_date: ActiveValue::Set(row.effective_date),
                created_at: ActiveValue::Set(now),
                ..Default::default()
            };
            let result = entities::ProviderCosts::insert(active)
                .on_conflict(
                    OnConflict::columns([Column::Provider, Column::Model, Column::EffectiveDate])
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&self.db)
                .await;
            match result {
                Ok(rows) => inserted += rows,
                Err(DbErr::RecordNotInserted) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(inserted)
    }

    pub async fn load_pricing(&self) -> StorageResult<Vec<PricingRow>> {
        use entities::provider_costs::Column;

        let rows = entities::ProviderCosts::find()
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(PricingRow {
                    input_cost_per_1k: parse_decimal("input_cost_per_1k", &row.input_cost_per_1k)?,
                    output_cost_per_1k: parse_decimal(
                        "output_cost_per_1k",
                        &row.output_cost_per_1k,
                    )?,
                    provider: row.provider,
                    model: row.model,
                    effective_date: row.effective_date,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LedgerStore for SeaOrmStorage {
    async fn record(&self, entry: &LedgerEntry) -> StorageResult<RecordOutcome> {
        use entities::ledger_entries::Column;

        let cost = entry.cost;
        let active = entities::ledger_entries::ActiveModel {
            generation_id: ActiveValue::Set(entry.generation_id.clone()),
            user_id: ActiveValue::Set(entry.user_id),
            organization_id: ActiveValue::Set(entry.organization_id),
            provider: ActiveValue::Set(entry.provider.clone()),
            model: ActiveValue::Set(entry.model.clone()),
            request_type: ActiveValue::Set(entry.request_type.clone()),
            streamed: ActiveValue::Set(entry.streamed),
            input_tokens: ActiveValue::Set(to_i64(entry.input_tokens)),
            output_tokens: ActiveValue::Set(to_i64(entry.output_tokens)),
            total_tokens: ActiveValue::Set(to_i64(entry.total_tokens)),
            input_cost_micros: ActiveValue::Set(cost.map(|c| c.input)),
            output_cost_micros: ActiveValue::Set(cost.map(|c| c.output)),
            total_cost_micros: ActiveValue::Set(cost.map(|c| c.total)),
            cost_unknown: ActiveValue::Set(entry.cost_unknown),
            latency_ms: ActiveValue::Set(to_i64(entry.latency_ms)),
            status: ActiveValue::Set(entry.status.as_str().to_string()),
            error_kind: ActiveValue::Set(entry.error_kind.clone()),
            error_message: ActiveValue::Set(entry.error_message.clone()),
            attempts: ActiveValue::Set(i32::try_from(entry.attempts).unwrap_or(i32::MAX)),
            created_at: ActiveValue::Set(entry.created_at),
            ..Default::default()
        };

        let result = entities::LedgerEntries::insert(active)
            .on_conflict(
                OnConflict::column(Column::GenerationId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await;

        match result {
            Ok(0) => Ok(RecordOutcome::AlreadyRecorded),
            Ok(_) => Ok(RecordOutcome::Inserted),
            Err(DbErr::RecordNotInserted) => Ok(RecordOutcome::AlreadyRecorded),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                debug!(generation_id = %entry.generation_id, "ledger entry raced, keeping first");
                Ok(RecordOutcome::AlreadyRecorded)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_by_generation_id(
        &self,
        generation_id: &str,
    ) -> StorageResult<Option<LedgerEntry>> {
        use entities::ledger_entries::Column;

        let Some(row) = entities::LedgerEntries::find()
            .filter(Column::GenerationId.eq(generation_id))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        entry_from_model(row).map(Some)
    }

    async fn aggregate_credits(
        &self,
        owner: LedgerOwner,
        window: CreditWindow,
    ) -> StorageResult<CreditAggregate> {
        use entities::ledger_entries::Column;

        let mut query = entities::LedgerEntries::find()
            .select_only()
            .column(Column::Provider)
            .column_as(Column::TotalCostMicros.sum(), "total_cost_micros")
            .filter(Column::TotalCostMicros.is_not_null());
        query = match owner {
            LedgerOwner::User(id) => query.filter(Column::UserId.eq(id)),
            LedgerOwner::Organization(id) => query.filter(Column::OrganizationId.eq(id)),
        };
        if let Some(from) = window.from {
            query = query.filter(Column::CreatedAt.gte(from));
        }
        if let Some(to) = window.to {
            query = query.filter(Column::CreatedAt.lte(to));
        }

        let rows = query
            .group_by(Column::Provider)
            .into_model::<ProviderCostRow>()
            .all(&self.db)
            .await?;

        let mut out = CreditAggregate::default();
        for row in rows {
            let used = row.total_cost_micros.unwrap_or(0);
            out.total_used_micros = out.total_used_micros.saturating_add(used);
            out.by_provider.insert(row.provider, used);
        }
        Ok(out)
    }

    async fn ping(&self) -> StorageResult<()> {
        self.db.ping().await?;
        Ok(())
    }
}

fn entry_from_model(row: entities::ledger_entries::Model) -> StorageResult<LedgerEntry> {
    let status =
        LedgerStatus::parse(&row.status).ok_or_else(|| StorageError::UnknownStatus(row.status))?;
    let cost = row.total_cost_micros.map(|total| CostMicros {
        input: row.input_cost_micros.unwrap_or(0),
        output: row.output_cost_micros.unwrap_or(0),
        total,
    });
    Ok(LedgerEntry {
        generation_id: row.generation_id,
        user_id: row.user_id,
        organization_id: row.organization_id,
        provider: row.provider,
        model: row.model,
        request_type: row.request_type,
        streamed: row.streamed,
        input_tokens: to_u64(row.input_tokens),
        output_tokens: to_u64(row.output_tokens),
        total_tokens: to_u64(row.total_tokens),
        cost,
        cost_unknown: row.cost_unknown,
        latency_ms: to_u64(row.latency_ms),
        status,
        error_kind: row.error_kind,
        error_message: row.error_message,
        attempts: u32::try_from(row.attempts).unwrap_or(0),
        created_at: row.created_at,
    })
}

fn parse_decimal(column: &'static str, value: &str) -> StorageResult<Decimal> {
    Decimal::from_str(value).map_err(|source| StorageError::InvalidDecimal {
        column,
        value: value.to_string(),
        source,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
