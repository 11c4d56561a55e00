use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use tollgate_common::{RouteTarget, RoutingSettings};
use tollgate_core::{
    CallerIdentity, CompletionBody, CreditScope, EngineSettings, PricingTable, RouteError,
    RoutingEngine, RoutingPolicy, RoutingSnapshot, UnaryResponse, generation_id,
};
use tollgate_protocol::openai::ChatCompletionResponse;
use tollgate_provider_core::{
    AdapterError, AdapterErrorKind, AdapterHealth, AdapterRegistry, AdapterReply, AdapterResult,
    AssistantMessage, AttemptCtx, ChatRequest, ChatResult, CircuitConfig, CircuitState,
    FinishReason, GenerationParams, HealthTracker, ManualClock, Message, NormalizedRequest,
    NormalizedResponse, ProviderAdapter, ProviderCandidate, RequestBody, Role, StreamDelta,
    StreamEvent, StreamHandle, UsageCounters, UsageHint,
};
use tollgate_storage::{CreditWindow, LedgerEntry, LedgerStatus, LedgerStore, PricingRow, SeaOrmStorage};

const CALLER: CallerIdentity = CallerIdentity {
    user_id: Uuid::from_u128(0x11),
    organization_id: Uuid::from_u128(0x21),
};

#[derive(Debug, Clone)]
enum Behavior {
    Reply { input: u64, output: u64 },
    Fail(AdapterErrorKind),
    /// Emits the events, then ends the stream or holds it open.
    Stream { events: Vec<StreamEvent>, hold_open: bool },
    /// Emits the events, then a stream error.
    StreamFail { events: Vec<StreamEvent>, kind: AdapterErrorKind },
    Hang,
}

struct ScriptedAdapter {
    id: String,
    behavior: Mutex<Behavior>,
    calls: AtomicU32,
}

impl ScriptedAdapter {
    fn new(id: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            behavior: Mutex::new(behavior),
            calls: AtomicU32::new(0),
        })
    }

    fn set(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn describe_models(&self) -> Vec<String> {
        vec!["acme/modelX".to_string()]
    }

    fn health(&self) -> AdapterHealth {
        AdapterHealth::default()
    }

    async fn send(
        &self,
        _ctx: &AttemptCtx,
        _req: &NormalizedRequest,
        candidate: &ProviderCandidate,
    ) -> AdapterResult<AdapterReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Reply { input, output } => {
                Ok(AdapterReply::Unary(NormalizedResponse::Chat(ChatResult {
                    model: candidate.model.clone(),
                    message: AssistantMessage {
                        content: Some(format!("hello from {}", self.id)),
                        tool_calls: Vec::new(),
                    },
                    finish_reason: FinishReason::Stop,
                    usage: Some(UsageCounters::new(input, output)),
                })))
            }
            Behavior::Fail(kind) => Err(AdapterError::new(kind, "scripted failure")),
            Behavior::Stream { events, hold_open } => {
                let (tx, rx) = mpsc::channel(16);
                let join = tokio::spawn(async move {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    if hold_open {
                        tx.closed().await;
                    }
                });
                Ok(AdapterReply::Stream(StreamHandle::new(rx, join.abort_handle())))
            }
            Behavior::StreamFail { events, kind } => {
                let (tx, rx) = mpsc::channel(16);
                for event in events {
                    let _ = tx.send(Ok(event)).await;
                }
                let _ = tx.send(Err(AdapterError::new(kind, "overloaded"))).await;
                Ok(AdapterReply::Stream(StreamHandle::from_receiver(rx)))
            }
            Behavior::Hang => std::future::pending().await,
        }
    }
}

struct Harness {
    engine: RoutingEngine,
    storage: Arc<SeaOrmStorage>,
    clock: Arc<ManualClock>,
    p1: Arc<ScriptedAdapter>,
    p2: Arc<ScriptedAdapter>,
    p3: Arc<ScriptedAdapter>,
}

fn reply(input: u64, output: u64) -> Behavior {
    Behavior::Reply { input, output }
}

async fn harness(behaviors: [Behavior; 3], settings: EngineSettings) -> Harness {
    let [b1, b2, b3] = behaviors;
    let p1 = ScriptedAdapter::new("p1", b1);
    let p2 = ScriptedAdapter::new("p2", b2);
    let p3 = ScriptedAdapter::new("p3", b3);

    let mut registry = AdapterRegistry::new();
    registry.register(p1.clone());
    registry.register(p2.clone());
    registry.register(p3.clone());

    let clock = Arc::new(ManualClock::new());
    let health = HealthTracker::new(CircuitConfig::default(), clock.clone(), ["p1", "p2", "p3"]);

    let storage = Arc::new(SeaOrmStorage::connect_in_memory().await.unwrap());
    let rows = vec![
        PricingRow {
            provider: "p1".to_string(),
            model: "acme/modelX".to_string(),
            input_cost_per_1k: Decimal::new(15, 4),
            output_cost_per_1k: Decimal::new(2, 3),
            effective_date: OffsetDateTime::UNIX_EPOCH,
        },
        PricingRow {
            provider: "p2".to_string(),
            model: "*".to_string(),
            input_cost_per_1k: Decimal::new(1, 3),
            output_cost_per_1k: Decimal::new(1, 3),
            effective_date: OffsetDateTime::UNIX_EPOCH,
        },
    ];
    storage.seed_pricing(&rows).await.unwrap();
    let pricing = PricingTable::new(storage.load_pricing().await.unwrap());

    let mut namespaces = BTreeMap::new();
    namespaces.insert(
        "acme".to_string(),
        vec![
            RouteTarget::Name("p1".to_string()),
            RouteTarget::Name("p2".to_string()),
            RouteTarget::Name("p3".to_string()),
        ],
    );
    namespaces.insert("solo".to_string(), vec![RouteTarget::Name("p3".to_string())]);
    let snapshot = RoutingSnapshot {
        policy: RoutingPolicy::from_settings(&RoutingSettings {
            namespaces,
            models: BTreeMap::new(),
        }),
        pricing,
        settings,
    };

    let ledger: Arc<dyn LedgerStore> = storage.clone();
    let engine = RoutingEngine::new(snapshot, Arc::new(registry), Arc::new(health), ledger);
    Harness {
        engine,
        storage,
        clock,
        p1,
        p2,
        p3,
    }
}

fn chat(model: &str, key: &str, stream: bool) -> NormalizedRequest {
    let body = RequestBody::Chat(ChatRequest {
        messages: vec![Message::text(Role::User, "hi")],
        tools: Vec::new(),
        tool_choice: None,
        params: GenerationParams::default(),
    });
    NormalizedRequest::new(model, body, stream, Some(key.to_string())).unwrap()
}

fn unary_chat(body: CompletionBody) -> ChatCompletionResponse {
    match body {
        CompletionBody::Unary(UnaryResponse::Chat(response)) => response,
        other => panic!("expected unary chat, got {other:?}"),
    }
}

fn stream_of(body: CompletionBody) -> mpsc::Receiver<Bytes> {
    match body {
        CompletionBody::Stream(rx) => rx,
        other => panic!("expected stream, got {other:?}"),
    }
}

async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<String> {
    let mut frames = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = rx.recv().await {
            frames.push(String::from_utf8(frame.to_vec()).unwrap());
        }
    })
    .await
    .expect("stream did not finish");
    frames
}

async fn ledger_entry(storage: &SeaOrmStorage, key: &str) -> Option<LedgerEntry> {
    storage
        .get_by_generation_id(&generation_id(&CALLER, key))
        .await
        .unwrap()
}

/// Streams settle on their own task; wait for the row.
async fn wait_for_entry(storage: &SeaOrmStorage, key: &str) -> LedgerEntry {
    for _ in 0..200 {
        if let Some(entry) = ledger_entry(storage, key).await {
            return entry;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no ledger entry for {key}");
}

fn delta(text: &str) -> StreamEvent {
    StreamEvent::Delta(StreamDelta {
        role: None,
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
    })
}

fn usage(input: u64, output: u64) -> StreamEvent {
    StreamEvent::Usage(UsageHint {
        input_tokens: Some(input),
        output_tokens: Some(output),
    })
}

#[tokio::test]
async fn first_priority_provider_answers_and_is_priced() {
    let h = harness([reply(10, 12), reply(1, 1), reply(1, 1)], EngineSettings::default()).await;

    let completion = h.engine.complete(CALLER, chat("acme/modelX", "a-1", false)).await.unwrap();
    assert_eq!(completion.generation_id, generation_id(&CALLER, "a-1"));
    let response = unary_chat(completion.body);

    assert_eq!(response.id, completion.generation_id);
    assert_eq!(response.usage.unwrap().total_tokens, 22);
    let metadata = response.provider_metadata.unwrap();
    assert_eq!(metadata.gateway.provider, "p1");
    assert_eq!(metadata.gateway.routing.selected_provider, "p1");
    assert!(metadata.gateway.routing.fallback_providers.is_empty());
    assert_eq!(metadata.gateway.cost.as_deref(), Some("0.000039"));
    assert_eq!(h.p2.calls(), 0);
    assert_eq!(h.p3.calls(), 0);

    let entry = ledger_entry(&h.storage, "a-1").await.unwrap();
    assert_eq!(entry.status, LedgerStatus::Success);
    assert_eq!(entry.provider, "p1");
    assert_eq!((entry.input_tokens, entry.output_tokens, entry.total_tokens), (10, 12, 22));
    let cost = entry.cost.unwrap();
    assert_eq!((cost.input, cost.output, cost.total), (15, 24, 39));
    assert_eq!(cost.total, cost.input + cost.output);
    assert!(!entry.cost_unknown);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn open_circuit_skips_provider_until_cooldown() {
    let h = harness(
        [
            Behavior::Fail(AdapterErrorKind::UpstreamUnavailable),
            reply(10, 12),
            reply(1, 1),
        ],
        EngineSettings::default(),
    )
    .await;

    for n in 0..3 {
        let key = format!("b-{n}");
        let response = unary_chat(h.engine.complete(CALLER, chat("acme/modelX", &key, false)).await.unwrap().body);
        let routing = response.provider_metadata.unwrap().gateway.routing;
        assert_eq!(routing.selected_provider, "p2");
        assert_eq!(routing.fallback_providers, vec!["p1".to_string()]);
        assert_eq!(ledger_entry(&h.storage, &key).await.unwrap().attempts, 2);
    }
    assert_eq!(h.p1.calls(), 3);
    assert_eq!(h.engine.health().state("p1"), CircuitState::Open);

    let response = unary_chat(h.engine.complete(CALLER, chat("acme/modelX", "b-3", false)).await.unwrap().body);
    let routing = response.provider_metadata.unwrap().gateway.routing;
    assert_eq!(routing.selected_provider, "p2");
    assert!(routing.fallback_providers.is_empty());
    assert_eq!(h.p1.calls(), 3);

    // After the cooldown one probe goes through and closes the circuit.
    h.clock.advance(Duration::from_secs(31));
    h.p1.set(reply(10, 12));
    let response = unary_chat(h.engine.complete(CALLER, chat("acme/modelX", "b-4", false)).await.unwrap().body);
    assert_eq!(response.provider_metadata.unwrap().gateway.provider, "p1");
    assert_eq!(h.p1.calls(), 4);
    assert_eq!(h.engine.health().state("p1"), CircuitState::Closed);
}

#[tokio::test]
async fn unroutable_model_is_rejected_without_side_effects() {
    let h = harness([reply(1, 1), reply(1, 1), reply(1, 1)], EngineSettings::default()).await;

    let err = h.engine.complete(CALLER, chat("bogus/model", "c-1", false)).await.unwrap_err();
    assert!(matches!(err, RouteError::InvalidRequest(_)));
    assert_eq!(err.code(), "invalid_request");
    assert_eq!(h.p1.calls() + h.p2.calls() + h.p3.calls(), 0);
    assert!(ledger_entry(&h.storage, "c-1").await.is_none());
}

#[tokio::test]
async fn retried_key_keeps_first_ledger_entry() {
    let h = harness([reply(10, 12), reply(1, 1), reply(1, 1)], EngineSettings::default()).await;

    let first = h.engine.complete(CALLER, chat("acme/modelX", "same", false)).await.unwrap();
    let recorded = ledger_entry(&h.storage, "same").await.unwrap();

    h.p1.set(reply(20, 30));
    let second = h.engine.complete(CALLER, chat("acme/modelX", "same", false)).await.unwrap();
    assert_eq!(first.generation_id, second.generation_id);

    let after = ledger_entry(&h.storage, "same").await.unwrap();
    assert_eq!(after, recorded);
    assert_eq!(after.input_tokens, 10);
}

#[tokio::test]
async fn caller_error_is_not_retried_elsewhere() {
    let h = harness(
        [
            Behavior::Fail(AdapterErrorKind::InvalidRequest),
            reply(1, 1),
            reply(1, 1),
        ],
        EngineSettings::default(),
    )
    .await;

    let err = h.engine.complete(CALLER, chat("acme/modelX", "d-1", false)).await.unwrap_err();
    assert!(matches!(err, RouteError::InvalidRequest(_)));
    assert!(!err.to_string().contains("scripted"));
    assert_eq!(h.p2.calls(), 0);
    assert_eq!(h.engine.health().consecutive_failures("p1"), 0);

    let entry = ledger_entry(&h.storage, "d-1").await.unwrap();
    assert_eq!(entry.status, LedgerStatus::Error);
    assert_eq!(entry.error_kind.as_deref(), Some("invalid_request"));
    assert!(entry.cost.is_none());
}

#[tokio::test]
async fn unsupported_model_skips_to_next_candidate() {
    let h = harness(
        [
            Behavior::Fail(AdapterErrorKind::UnsupportedModel),
            reply(10, 12),
            reply(1, 1),
        ],
        EngineSettings::default(),
    )
    .await;

    let response = unary_chat(h.engine.complete(CALLER, chat("acme/modelX", "e-1", false)).await.unwrap().body);
    let gateway = response.provider_metadata.unwrap().gateway;
    assert_eq!(gateway.provider, "p2");
    assert!(gateway.routing.fallback_providers.is_empty());
    // 10 * 0.001 / 1k + 12 * 0.001 / 1k
    assert_eq!(gateway.cost.as_deref(), Some("0.000022"));
    assert_eq!(h.engine.health().consecutive_failures("p1"), 0);
}

#[tokio::test]
async fn exhaustion_aggregates_reasons() {
    let h = harness(
        [
            Behavior::Fail(AdapterErrorKind::UpstreamUnavailable),
            Behavior::Fail(AdapterErrorKind::RateLimited),
            Behavior::Fail(AdapterErrorKind::UpstreamUnavailable),
        ],
        EngineSettings::default(),
    )
    .await;

    let err = h.engine.complete(CALLER, chat("acme/modelX", "f-1", false)).await.unwrap_err();
    assert_eq!(err.code(), "all_providers_exhausted");
    assert!(!err.is_deadline());
    let message = err.to_string();
    assert!(message.contains("p1 (upstream_unavailable)"));
    assert!(message.contains("p2 (rate_limited)"));
    assert!(!message.contains("scripted"));

    let entry = ledger_entry(&h.storage, "f-1").await.unwrap();
    assert_eq!(entry.status, LedgerStatus::Error);
    assert_eq!(entry.provider, "p3");
    assert_eq!(entry.attempts, 3);
    assert_eq!(entry.error_kind.as_deref(), Some("all_providers_exhausted"));
}

#[tokio::test]
async fn unknown_pricing_records_zero_cost() {
    let h = harness([reply(1, 1), reply(1, 1), reply(10, 12)], EngineSettings::default()).await;

    let response = unary_chat(h.engine.complete(CALLER, chat("solo/modelY", "g-1", false)).await.unwrap().body);
    assert_eq!(response.provider_metadata.unwrap().gateway.cost, None);

    let entry = ledger_entry(&h.storage, "g-1").await.unwrap();
    assert_eq!(entry.status, LedgerStatus::Success);
    assert!(entry.cost_unknown);
    assert_eq!(entry.cost.unwrap().total, 0);
}

#[tokio::test]
async fn stream_relays_in_order_with_one_terminator() {
    let h = harness(
        [
            Behavior::Stream {
                events: vec![
                    delta("Hel"),
                    delta("lo"),
                    usage(10, 12),
                    StreamEvent::Finish(FinishReason::Stop),
                ],
                hold_open: false,
            },
            reply(1, 1),
            reply(1, 1),
        ],
        EngineSettings::default(),
    )
    .await;

    let completion = h.engine.complete(CALLER, chat("acme/modelX", "s-1", true)).await.unwrap();
    let frames = drain(stream_of(completion.body)).await;

    assert_eq!(frames.iter().filter(|frame| frame.contains("[DONE]")).count(), 1);
    assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
    let hel = frames.iter().position(|f| f.contains("\"Hel\"")).unwrap();
    let lo = frames.iter().position(|f| f.contains("\"lo\"")).unwrap();
    assert!(hel < lo);
    assert!(frames.iter().all(|f| f.contains("[DONE]") || f.contains(&completion.generation_id)));
    let last_chunk = &frames[frames.len() - 2];
    assert!(last_chunk.contains("\"total_tokens\":22"));
    assert!(last_chunk.contains("\"cost\":\"0.000039\""));

    // Settled before the terminator was sent.
    let entry = ledger_entry(&h.storage, "s-1").await.unwrap();
    assert_eq!(entry.status, LedgerStatus::Success);
    assert!(entry.streamed);
    assert_eq!(entry.total_tokens, 22);
    assert_eq!(entry.cost.unwrap().total, 39);
}

#[tokio::test]
async fn client_disconnect_records_partial_usage() {
    let h = harness(
        [
            Behavior::Stream {
                events: vec![usage(5, 1), delta("Hel")],
                hold_open: true,
            },
            reply(1, 1),
            reply(1, 1),
        ],
        EngineSettings::default(),
    )
    .await;

    let completion = h.engine.complete(CALLER, chat("acme/modelX", "x-1", true)).await.unwrap();
    let mut rx = stream_of(completion.body);
    let first = rx.recv().await.unwrap();
    assert!(String::from_utf8(first.to_vec()).unwrap().contains("\"Hel\""));
    drop(rx);

    let entry = wait_for_entry(&h.storage, "x-1").await;
    assert_eq!(entry.status, LedgerStatus::Error);
    assert_eq!(entry.error_kind.as_deref(), Some("client_cancelled"));
    assert_eq!((entry.input_tokens, entry.output_tokens), (5, 1));
    // 5 * 0.0015 / 1k + 1 * 0.002 / 1k, rounded to micros
    assert_eq!(entry.cost.unwrap().total, 10);
}

#[tokio::test]
async fn stream_deadline_ends_with_error_chunk() {
    let settings = EngineSettings {
        request_timeout: Duration::from_millis(300),
        min_attempt_budget: Duration::from_millis(10),
        ..EngineSettings::default()
    };
    let h = harness(
        [
            Behavior::Stream {
                events: vec![delta("Hel")],
                hold_open: true,
            },
            reply(1, 1),
            reply(1, 1),
        ],
        settings,
    )
    .await;

    let completion = h.engine.complete(CALLER, chat("acme/modelX", "t-1", true)).await.unwrap();
    let frames = drain(stream_of(completion.body)).await;
    assert_eq!(frames.len(), 3);
    assert!(frames[1].contains("deadline_exceeded"));
    assert_eq!(frames[2], "data: [DONE]\n\n");

    let entry = ledger_entry(&h.storage, "t-1").await.unwrap();
    assert_eq!(entry.status, LedgerStatus::Timeout);
}

#[tokio::test]
async fn stream_failing_before_output_fails_over() {
    let h = harness(
        [
            Behavior::StreamFail {
                events: vec![usage(3, 0)],
                kind: AdapterErrorKind::UpstreamUnavailable,
            },
            Behavior::Stream {
                events: vec![delta("ok"), usage(10, 12), StreamEvent::Finish(FinishReason::Stop)],
                hold_open: false,
            },
            reply(1, 1),
        ],
        EngineSettings::default(),
    )
    .await;

    let completion = h.engine.complete(CALLER, chat("acme/modelX", "f-1", true)).await.unwrap();
    let frames = drain(stream_of(completion.body)).await;

    assert_eq!(h.p1.calls(), 1);
    assert_eq!(h.p2.calls(), 1);
    assert_eq!(h.engine.health().consecutive_failures("p1"), 1);
    assert!(frames.iter().any(|f| f.contains("\"ok\"")));
    assert!(frames.iter().all(|f| !f.contains("upstream_stream_error")));
    assert_eq!(frames.iter().filter(|f| f.contains("[DONE]")).count(), 1);
    let last_chunk = &frames[frames.len() - 2];
    assert!(last_chunk.contains("\"selected_provider\":\"p2\""));
    assert!(last_chunk.contains("\"fallback_providers\":[\"p1\"]"));

    let entry = ledger_entry(&h.storage, "f-1").await.unwrap();
    assert_eq!(entry.provider, "p2");
    assert_eq!(entry.attempts, 2);
    assert_eq!(entry.status, LedgerStatus::Success);
    assert_eq!(entry.total_tokens, 22);
}

#[tokio::test]
async fn stream_failing_after_output_is_terminal() {
    let h = harness(
        [
            Behavior::StreamFail {
                events: vec![delta("Hel")],
                kind: AdapterErrorKind::UpstreamUnavailable,
            },
            reply(1, 1),
            reply(1, 1),
        ],
        EngineSettings::default(),
    )
    .await;

    let completion = h.engine.complete(CALLER, chat("acme/modelX", "f-2", true)).await.unwrap();
    let frames = drain(stream_of(completion.body)).await;

    assert_eq!(frames.len(), 3);
    assert!(frames[0].contains("\"Hel\""));
    assert!(frames[1].contains("upstream_stream_error"));
    assert_eq!(frames[2], "data: [DONE]\n\n");
    assert_eq!(h.p2.calls(), 0);
    assert_eq!(h.engine.health().consecutive_failures("p1"), 1);

    let entry = ledger_entry(&h.storage, "f-2").await.unwrap();
    assert_eq!(entry.status, LedgerStatus::Error);
    assert_eq!(entry.error_kind.as_deref(), Some("upstream_unavailable"));
}

#[tokio::test]
async fn silent_stream_counts_against_provider_health() {
    let settings = EngineSettings {
        request_timeout: Duration::from_millis(300),
        min_attempt_budget: Duration::from_millis(10),
        ..EngineSettings::default()
    };
    let h = harness(
        [
            Behavior::Stream {
                events: Vec::new(),
                hold_open: true,
            },
            reply(1, 1),
            reply(1, 1),
        ],
        settings,
    )
    .await;

    let err = h.engine.complete(CALLER, chat("acme/modelX", "t-3", true)).await.unwrap_err();
    assert!(err.is_deadline());
    assert_eq!(h.p2.calls(), 0);
    assert_eq!(h.engine.health().consecutive_failures("p1"), 1);

    let entry = ledger_entry(&h.storage, "t-3").await.unwrap();
    assert_eq!(entry.status, LedgerStatus::Timeout);
    assert_eq!(entry.provider, "p1");
    assert!(entry.streamed);
}

#[tokio::test]
async fn deadline_stops_failover() {
    let settings = EngineSettings {
        request_timeout: Duration::from_millis(300),
        min_attempt_budget: Duration::from_millis(100),
        ..EngineSettings::default()
    };
    let h = harness([Behavior::Hang, reply(1, 1), reply(1, 1)], settings).await;

    let err = h.engine.complete(CALLER, chat("acme/modelX", "t-2", false)).await.unwrap_err();
    assert!(err.is_deadline());
    assert_eq!(h.p2.calls(), 0);
    assert_eq!(h.engine.health().consecutive_failures("p1"), 1);

    let entry = ledger_entry(&h.storage, "t-2").await.unwrap();
    assert_eq!(entry.status, LedgerStatus::Timeout);
}

#[tokio::test]
async fn generation_lookup_is_scoped_to_owner() {
    let h = harness([reply(10, 12), reply(1, 1), reply(1, 1)], EngineSettings::default()).await;
    let completion = h.engine.complete(CALLER, chat("acme/modelX", "l-1", false)).await.unwrap();

    let generation = h.engine.generation(CALLER, &completion.generation_id).await.unwrap();
    assert_eq!(generation.data.id, completion.generation_id);
    assert_eq!(generation.data.provider_name, "p1");
    assert_eq!(generation.data.tokens_prompt, 10);
    assert_eq!(generation.data.tokens_completion, 12);
    assert_eq!(generation.data.status, "success");
    assert!((generation.data.total_cost - 0.000039).abs() < 1e-12);
    assert!(!generation.data.streamed);
    assert_eq!(generation.data.latency, generation.data.generation_time);

    let same_org = CallerIdentity {
        user_id: Uuid::from_u128(0x99),
        organization_id: CALLER.organization_id,
    };
    assert!(h.engine.generation(same_org, &completion.generation_id).await.is_ok());

    let stranger = CallerIdentity {
        user_id: Uuid::from_u128(0x98),
        organization_id: Uuid::from_u128(0x97),
    };
    assert!(matches!(
        h.engine.generation(stranger, &completion.generation_id).await,
        Err(RouteError::NotFound(_))
    ));
    assert!(matches!(
        h.engine.generation(CALLER, "gen-missing").await,
        Err(RouteError::NotFound(_))
    ));
}

#[tokio::test]
async fn credits_subtract_usage_from_initial_balance() {
    let h = harness([reply(1_000_000, 500_000), reply(1, 1), reply(1, 1)], EngineSettings::default()).await;
    h.engine.complete(CALLER, chat("acme/modelX", "k-1", false)).await.unwrap();

    let credits = h
        .engine
        .credits(CALLER, CreditScope::User, CreditWindow::default())
        .await
        .unwrap();
    assert_eq!(credits.total_used, "2.50");
    assert_eq!(credits.balance, "97.50");
    assert_eq!(credits.usage_breakdown.get("p1").map(String::as_str), Some("2.50"));

    let org = h
        .engine
        .credits(CALLER, CreditScope::Organization, CreditWindow::default())
        .await
        .unwrap();
    assert_eq!(org.total_used, "2.50");
}

#[tokio::test]
async fn models_are_deduplicated_and_snapshot_swaps() {
    let h = harness([reply(1, 1), reply(1, 1), reply(1, 1)], EngineSettings::default()).await;

    let models = h.engine.models();
    assert_eq!(models.data.len(), 1);
    assert_eq!(models.data[0].id, "acme/modelX");
    assert_eq!(models.data[0].owned_by, "acme");
    assert_eq!(h.engine.model("acme/modelX").unwrap(), models.data[0]);
    assert!(matches!(h.engine.model("acme/modelY"), Err(RouteError::NotFound(_))));
    h.engine.ping().await.unwrap();

    h.engine.replace_snapshot(RoutingSnapshot::default());
    let err = h.engine.complete(CALLER, chat("acme/modelX", "m-1", false)).await.unwrap_err();
    assert!(matches!(err, RouteError::InvalidRequest(_)));
    assert_eq!(h.p1.calls(), 0);
}
