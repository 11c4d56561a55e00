use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tollgate_protocol::gateway::{
    CreditsResponse, GenerationData, GenerationResponse, ProviderMetadata,
};
use tollgate_protocol::openai::models::ModelObjectType;
use tollgate_protocol::openai::{ChatCompletionResponse, EmbeddingResponse, ModelList, ModelObject};
use tollgate_provider_core::{
    AdapterRegistry, AdapterReply, HealthTracker, NormalizedRequest, NormalizedResponse,
    ProviderCandidate, RequestError, UsageCounters,
};
use tollgate_storage::{
    CreditWindow, LedgerEntry, LedgerOwner, LedgerStatus, LedgerStore, RecordOutcome,
};

use crate::policy::RoutingPolicy;
use crate::pricing::{CostRecord, PricingTable, micros_to_decimal};
use crate::relay::{RelayOutcome, StreamRelay};
use crate::selector::{SelectError, Selected, Selector};
use crate::wire;

/// Buffered chunks between the relay task and the client body.
pub const STREAM_BUFFER: usize = 32;

const GENERATION_NAMESPACE: Uuid = Uuid::from_u128(0x5f0b_2c1e_8a47_4d39_b6e2_71c4_0d9a_e3f8);

/// Already-authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub request_timeout: Duration,
    pub min_attempt_budget: Duration,
    /// Starting balance every user and organization is granted.
    pub initial_credit: Decimal,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            min_attempt_budget: Duration::from_secs(1),
            initial_credit: Decimal::new(100, 0),
        }
    }
}

/// Everything a request reads from configuration. Swapped as a whole.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    pub policy: RoutingPolicy,
    pub pricing: PricingTable,
    pub settings: EngineSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreditScope {
    #[default]
    User,
    Organization,
}

#[derive(Debug)]
pub enum UnaryResponse {
    Chat(ChatCompletionResponse),
    Embedding(EmbeddingResponse),
}

#[derive(Debug)]
pub enum CompletionBody {
    Unary(UnaryResponse),
    /// Encoded SSE frames, ending with the `[DONE]` marker.
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct Completion {
    pub generation_id: String,
    pub body: CompletionBody,
}

/// Caller-visible failure. Display text is safe to return to clients.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("all providers failed: {summary}")]
    AllProvidersExhausted {
        summary: String,
        deadline_exceeded: bool,
    },
    /// The detail is for logs only.
    #[error("internal error")]
    Internal(String),
}

impl RouteError {
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::InvalidRequest(_) => "invalid_request",
            RouteError::NotFound(_) => "not_found",
            RouteError::AllProvidersExhausted { .. } => "all_providers_exhausted",
            RouteError::Internal(_) => "internal_error",
        }
    }

    /// OpenAI error `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::InvalidRequest(_) => "invalid_request_error",
            RouteError::NotFound(_) => "not_found_error",
            RouteError::AllProvidersExhausted { .. } | RouteError::Internal(_) => "api_error",
        }
    }

    pub fn is_deadline(&self) -> bool {
        matches!(
            self,
            RouteError::AllProvidersExhausted {
                deadline_exceeded: true,
                ..
            }
        )
    }
}

impl From<RequestError> for RouteError {
    fn from(value: RequestError) -> Self {
        RouteError::InvalidRequest(value.to_string())
    }
}

/// Routes normalized requests to providers and settles each one in the ledger.
pub struct RoutingEngine {
    snapshot: ArcSwap<RoutingSnapshot>,
    registry: Arc<AdapterRegistry>,
    health: Arc<HealthTracker>,
    ledger: Arc<dyn LedgerStore>,
    started_at: i64,
}

impl RoutingEngine {
    pub fn new(
        snapshot: RoutingSnapshot,
        registry: Arc<AdapterRegistry>,
        health: Arc<HealthTracker>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            registry,
            health,
            ledger,
            started_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.load_full()
    }

    /// In-flight requests keep the snapshot they started with.
    pub fn replace_snapshot(&self, snapshot: RoutingSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub async fn complete(
        &self,
        caller: CallerIdentity,
        req: NormalizedRequest,
    ) -> Result<Completion, RouteError> {
        let snapshot = self.snapshot.load_full();
        let generation_id = generation_id(&caller, req.idempotency_key());

        let candidates = snapshot.policy.candidates(req.model()).map_err(|err| {
            info!(generation_id = %generation_id, model = %req.model(), "no route for model");
            RouteError::InvalidRequest(err.to_string())
        })?;

        let pending = PendingEntry {
            generation_id: generation_id.clone(),
            caller,
            request_type: req.kind().as_str(),
            streamed: req.is_stream(),
            started: Instant::now(),
            created_at: OffsetDateTime::now_utc(),
        };
        let deadline = pending.started + snapshot.settings.request_timeout;
        let selector = Selector::new(
            self.registry.clone(),
            self.health.clone(),
            snapshot.settings.min_attempt_budget,
        );

        let selected = match selector.run(&generation_id, &req, &candidates, deadline).await {
            Ok(selected) => selected,
            Err(err) => return Err(self.settle_failure(pending, req.model().to_string(), err).await),
        };

        let Selected {
            candidate,
            reply,
            attempts,
            fallbacks,
        } = selected;
        match reply {
            AdapterReply::Unary(response) => {
                let usage = response.usage().unwrap_or_default();
                let (cost, cost_unknown) = price(&snapshot.pricing, &generation_id, &candidate, usage, pending.created_at);
                let latency_ms = pending.elapsed_ms();
                let metadata = ProviderMetadata::new(
                    candidate.provider.clone(),
                    cost_string(cost.as_ref(), cost_unknown),
                    latency_ms,
                    fallbacks,
                );
                let created = pending.created_at.unix_timestamp();
                let body = match response {
                    NormalizedResponse::Chat(result) => UnaryResponse::Chat(
                        wire::chat_response_to_wire(&generation_id, &candidate.model, created, result, usage, metadata),
                    ),
                    NormalizedResponse::Embedding(result) => UnaryResponse::Embedding(
                        wire::embedding_response_to_wire(&generation_id, &candidate.model, result, usage, metadata),
                    ),
                };
                let entry = pending.settle(Settlement {
                    provider: candidate.provider,
                    model: candidate.model,
                    usage,
                    cost,
                    cost_unknown,
                    status: LedgerStatus::Success,
                    error_kind: None,
                    error_message: None,
                    attempts,
                    latency_ms,
                });
                record(self.ledger.as_ref(), &entry).await;
                Ok(Completion {
                    generation_id,
                    body: CompletionBody::Unary(body),
                })
            }
            AdapterReply::Stream(handle) => {
                let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                let relay = StreamRelay::new(
                    handle,
                    tx,
                    generation_id.clone(),
                    candidate.model.clone(),
                    pending.created_at.unix_timestamp(),
                );
                let task = StreamTask {
                    relay,
                    pending,
                    candidate,
                    attempts,
                    fallbacks,
                    deadline,
                    snapshot,
                    ledger: self.ledger.clone(),
                    health: self.health.clone(),
                };
                tokio::spawn(task.run());
                Ok(Completion {
                    generation_id,
                    body: CompletionBody::Stream(rx),
                })
            }
        }
    }

    async fn settle_failure(&self, pending: PendingEntry, model: String, err: SelectError) -> RouteError {
        let attempts = err.attempts();
        let (route_error, provider, status, error_kind, error_message) = match err {
            SelectError::InvalidRequest { provider, error, .. } => (
                RouteError::InvalidRequest(format!("provider {provider} rejected the request")),
                Some(provider),
                LedgerStatus::Error,
                "invalid_request",
                error.message,
            ),
            SelectError::AllExhausted {
                failures,
                last_provider,
                deadline_exceeded,
                ..
            } => {
                let summary = if failures.is_empty() {
                    "no provider available".to_string()
                } else {
                    failures
                        .iter()
                        .map(|failure| format!("{} ({})", failure.provider, failure.reason))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                warn!(
                    generation_id = %pending.generation_id,
                    attempts,
                    deadline_exceeded,
                    "all providers exhausted: {summary}"
                );
                let status = if deadline_exceeded {
                    LedgerStatus::Timeout
                } else {
                    LedgerStatus::Error
                };
                (
                    RouteError::AllProvidersExhausted {
                        summary: summary.clone(),
                        deadline_exceeded,
                    },
                    last_provider,
                    status,
                    "all_providers_exhausted",
                    summary,
                )
            }
        };

        // Nothing was sent upstream: nothing to account for.
        if let Some(provider) = provider.filter(|_| attempts > 0) {
            let latency_ms = pending.elapsed_ms();
            let entry = pending.settle(Settlement {
                provider,
                model,
                usage: UsageCounters::default(),
                cost: None,
                cost_unknown: false,
                status,
                error_kind: Some(error_kind.to_string()),
                error_message: Some(error_message),
                attempts,
                latency_ms,
            });
            record(self.ledger.as_ref(), &entry).await;
        }
        route_error
    }

    /// Ledger entry for `id`, visible to its user and organization only.
    pub async fn generation(
        &self,
        caller: CallerIdentity,
        id: &str,
    ) -> Result<GenerationResponse, RouteError> {
        let entry = self
            .ledger
            .get_by_generation_id(id)
            .await
            .map_err(|err| RouteError::Internal(err.to_string()))?
            .filter(|entry| {
                entry.user_id == caller.user_id || entry.organization_id == caller.organization_id
            })
            .ok_or_else(|| RouteError::NotFound(format!("generation {id} not found")))?;

        let total_cost = entry
            .cost
            .map(|cost| micros_to_decimal(cost.total).to_f64().unwrap_or(0.0))
            .unwrap_or(0.0);
        Ok(GenerationResponse {
            data: GenerationData {
                id: entry.generation_id,
                total_cost,
                usage: total_cost,
                created_at: entry.created_at.format(&Rfc3339).unwrap_or_default(),
                model: entry.model,
                provider_name: entry.provider,
                streamed: entry.streamed,
                latency: entry.latency_ms,
                generation_time: entry.latency_ms,
                tokens_prompt: entry.input_tokens,
                tokens_completion: entry.output_tokens,
                status: entry.status.as_str().to_string(),
                error: entry.error_kind,
                cost_unknown: entry.cost_unknown,
            },
        })
    }

    pub async fn credits(
        &self,
        caller: CallerIdentity,
        scope: CreditScope,
        window: CreditWindow,
    ) -> Result<CreditsResponse, RouteError> {
        let owner = match scope {
            CreditScope::User => LedgerOwner::User(caller.user_id),
            CreditScope::Organization => LedgerOwner::Organization(caller.organization_id),
        };
        let aggregate = self
            .ledger
            .aggregate_credits(owner, window)
            .await
            .map_err(|err| RouteError::Internal(err.to_string()))?;

        let used = micros_to_decimal(aggregate.total_used_micros);
        let balance = self.snapshot.load().settings.initial_credit - used;
        let usage_breakdown: BTreeMap<String, String> = aggregate
            .by_provider
            .into_iter()
            .map(|(provider, micros)| (provider, usd(micros_to_decimal(micros))))
            .collect();
        Ok(CreditsResponse {
            balance: usd(balance),
            total_used: usd(used),
            usage_breakdown,
        })
    }

    /// Union of every adapter's advertised models, first registration wins.
    pub fn models(&self) -> ModelList {
        let mut seen = HashSet::new();
        let mut data = Vec::new();
        for adapter in self.registry.iter() {
            for id in adapter.describe_models() {
                if !seen.insert(id.clone()) {
                    continue;
                }
                let owned_by = id
                    .split_once('/')
                    .map(|(namespace, _)| namespace.to_string())
                    .unwrap_or_else(|| adapter.id().to_string());
                data.push(ModelObject {
                    id,
                    object: ModelObjectType::Model,
                    created: self.started_at,
                    owned_by,
                });
            }
        }
        ModelList::new(data)
    }

    pub fn model(&self, id: &str) -> Result<ModelObject, RouteError> {
        self.models()
            .data
            .into_iter()
            .find(|model| model.id == id)
            .ok_or_else(|| RouteError::NotFound("Model not found".to_string()))
    }

    pub async fn ping(&self) -> Result<(), RouteError> {
        self.ledger
            .ping()
            .await
            .map_err(|err| RouteError::Internal(err.to_string()))
    }
}

/// Stable per caller and idempotency key, so a retried request settles into
/// the same ledger row.
pub fn generation_id(caller: &CallerIdentity, idempotency_key: &str) -> String {
    let name = format!("{}:{}", caller.user_id, idempotency_key);
    format!(
        "gen-{}",
        Uuid::new_v5(&GENERATION_NAMESPACE, name.as_bytes()).simple()
    )
}

struct PendingEntry {
    generation_id: String,
    caller: CallerIdentity,
    request_type: &'static str,
    streamed: bool,
    started: Instant,
    created_at: OffsetDateTime,
}

struct Settlement {
    provider: String,
    model: String,
    usage: UsageCounters,
    cost: Option<CostRecord>,
    cost_unknown: bool,
    status: LedgerStatus,
    error_kind: Option<String>,
    error_message: Option<String>,
    attempts: u32,
    latency_ms: u64,
}

impl PendingEntry {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Consumes the pending entry so a request settles at most once.
    fn settle(self, settlement: Settlement) -> LedgerEntry {
        LedgerEntry {
            generation_id: self.generation_id,
            user_id: self.caller.user_id,
            organization_id: self.caller.organization_id,
            provider: settlement.provider,
            model: settlement.model,
            request_type: self.request_type.to_string(),
            streamed: self.streamed,
            input_tokens: settlement.usage.input_tokens,
            output_tokens: settlement.usage.output_tokens,
            total_tokens: settlement.usage.total_tokens,
            cost: settlement.cost.as_ref().map(CostRecord::to_micros),
            cost_unknown: settlement.cost_unknown,
            latency_ms: settlement.latency_ms,
            status: settlement.status,
            error_kind: settlement.error_kind,
            error_message: settlement.error_message,
            attempts: settlement.attempts,
            created_at: self.created_at,
        }
    }
}

struct StreamTask {
    relay: StreamRelay,
    pending: PendingEntry,
    candidate: ProviderCandidate,
    attempts: u32,
    fallbacks: Vec<String>,
    deadline: Instant,
    snapshot: Arc<RoutingSnapshot>,
    ledger: Arc<dyn LedgerStore>,
    health: Arc<HealthTracker>,
}

impl StreamTask {
    async fn run(self) {
        let StreamTask {
            mut relay,
            pending,
            candidate,
            attempts,
            fallbacks,
            deadline,
            snapshot,
            ledger,
            health,
        } = self;

        let outcome = relay.pump(deadline).await;
        let usage = relay.usage();
        let latency_ms = pending.elapsed_ms();
        let generation_id = pending.generation_id.clone();

        let (status, error_kind, error_message) = match &outcome {
            RelayOutcome::Completed => (LedgerStatus::Success, None, None),
            RelayOutcome::Cancelled => (
                LedgerStatus::Error,
                Some("client_cancelled".to_string()),
                Some("client disconnected".to_string()),
            ),
            RelayOutcome::TimedOut => {
                // Nothing reached the client: the provider stalled like a failed attempt.
                if relay.forwarded() == 0 {
                    health.record_failure(&candidate.provider);
                }
                (
                    LedgerStatus::Timeout,
                    Some("deadline_exceeded".to_string()),
                    Some("request deadline exceeded mid-stream".to_string()),
                )
            }
            RelayOutcome::UpstreamFailed(error) => {
                if error.kind.affects_health() {
                    health.record_failure(&candidate.provider);
                }
                (
                    LedgerStatus::Error,
                    Some(error.kind.as_str().to_string()),
                    Some(error.message.clone()),
                )
            }
        };

        let (cost, cost_unknown) = if status == LedgerStatus::Success || usage.total_tokens > 0 {
            price(&snapshot.pricing, &generation_id, &candidate, usage, pending.created_at)
        } else {
            (None, false)
        };
        let cost_label = cost_string(cost.as_ref(), cost_unknown);
        let entry = pending.settle(Settlement {
            provider: candidate.provider.clone(),
            model: candidate.model.clone(),
            usage,
            cost,
            cost_unknown,
            status,
            error_kind,
            error_message,
            attempts,
            latency_ms,
        });
        info!(
            generation_id = %generation_id,
            provider = %candidate.provider,
            model = %candidate.model,
            status = entry.status.as_str(),
            finish_reason = relay.finish_reason().map(|reason| reason.as_str()),
            chunks = relay.forwarded(),
            latency_ms,
            "stream finished"
        );
        // Settle before the terminator so a client that saw [DONE] can look
        // the generation up.
        record(ledger.as_ref(), &entry).await;

        match outcome {
            RelayOutcome::Completed => {
                let metadata = ProviderMetadata::new(candidate.provider, cost_label, latency_ms, fallbacks);
                relay.close_ok(usage, metadata).await;
            }
            RelayOutcome::TimedOut => {
                relay
                    .close_err("deadline_exceeded", "request deadline exceeded")
                    .await;
            }
            RelayOutcome::UpstreamFailed(_) => {
                relay
                    .close_err("upstream_stream_error", "provider stream failed")
                    .await;
            }
            RelayOutcome::Cancelled => {}
        }
    }
}

fn price(
    pricing: &PricingTable,
    generation_id: &str,
    candidate: &ProviderCandidate,
    usage: UsageCounters,
    at: OffsetDateTime,
) -> (Option<CostRecord>, bool) {
    match pricing.cost(&candidate.provider, &candidate.model, usage, at) {
        Ok(cost) => (Some(cost), false),
        Err(err) => {
            warn!(
                generation_id = %generation_id,
                provider = %candidate.provider,
                model = %candidate.model,
                error = %err,
                "pricing unknown, recording zero cost"
            );
            (
                Some(CostRecord::unpriced(&candidate.provider, &candidate.model, usage)),
                true,
            )
        }
    }
}

fn cost_string(cost: Option<&CostRecord>, cost_unknown: bool) -> Option<String> {
    cost.filter(|_| !cost_unknown)
        .map(|cost| cost.total_cost.normalize().to_string())
}

/// Two-decimal USD amount.
fn usd(value: Decimal) -> String {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded.to_string()
}

async fn record(ledger: &dyn LedgerStore, entry: &LedgerEntry) {
    match ledger.record(entry).await {
        Ok(RecordOutcome::Inserted) => {
            debug!(generation_id = %entry.generation_id, status = entry.status.as_str(), "ledger entry recorded");
        }
        Ok(RecordOutcome::AlreadyRecorded) => {
            info!(generation_id = %entry.generation_id, "generation already settled, keeping first entry");
        }
        Err(err) => {
            error!(generation_id = %entry.generation_id, error = %err, "ledger write failed");
        }
    }
}
