use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, warn};

use tollgate_protocol::sse::SseDecoder;
use tollgate_provider_core::{
    AdapterError, AdapterHealth, AdapterReply, AdapterResult, AttemptCtx, ByteStream,
    NormalizedRequest, ProviderAdapter, ProviderCandidate, StreamEvent, StreamHandle,
    UpstreamBody, UpstreamClient, UpstreamFailure, classify_failure,
};

use crate::kind::{ProviderKind, StreamDecoder};

const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Static description of one configured provider.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub id: String,
    pub kind: ProviderKind,
    /// Falls back to the kind's public endpoint.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub models: Vec<String>,
    pub max_concurrency: usize,
}

/// Adapter for any provider reachable over HTTP + JSON/SSE.
pub struct HttpProviderAdapter {
    id: String,
    kind: ProviderKind,
    base_url: String,
    api_key: Option<String>,
    models: Vec<String>,
    client: Arc<dyn UpstreamClient>,
    slots: Arc<Semaphore>,
    health: Mutex<AdapterHealth>,
}

impl HttpProviderAdapter {
    pub fn new(spec: ProviderSpec, client: Arc<dyn UpstreamClient>) -> Self {
        let base_url = spec
            .base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| spec.kind.default_base_url().to_string());
        Self {
            id: spec.id,
            kind: spec.kind,
            base_url,
            api_key: spec.api_key,
            models: spec.models,
            client,
            slots: Arc::new(Semaphore::new(spec.max_concurrency.max(1))),
            health: Mutex::new(AdapterHealth::default()),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn note(&self, outcome: Result<(), &AdapterError>) {
        let Ok(mut health) = self.health.lock() else {
            return;
        };
        let now = SystemTime::now();
        match outcome {
            Ok(()) => health.last_success = Some(now),
            Err(err) => {
                health.last_failure = Some(now);
                health.last_error = Some(err.kind);
            }
        }
    }

    async fn attempt(
        &self,
        ctx: &AttemptCtx,
        req: &NormalizedRequest,
        candidate: &ProviderCandidate,
    ) -> AdapterResult<AdapterReply> {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| AdapterError::unavailable("connection_pool_exhausted"))?;

        let model = self.kind.upstream_model(&candidate.model);
        let upstream = self
            .kind
            .build_request(&self.base_url, self.api_key.as_deref(), req, model)?;
        debug!(
            provider = %self.id,
            generation_id = %ctx.generation_id,
            attempt = ctx.attempt_no,
            url = %upstream.url,
            stream = upstream.is_stream,
            "upstream request"
        );

        let response = self
            .client
            .send(upstream)
            .await
            .map_err(|failure| classify_failure(&failure))?;

        if !(200..300).contains(&response.status) {
            let body = match response.body {
                UpstreamBody::Bytes(bytes) => bytes,
                UpstreamBody::Stream(rx) => collect_body(rx).await,
            };
            return Err(classify_failure(&UpstreamFailure::Http {
                status: response.status,
                headers: response.headers,
                body,
            }));
        }

        if req.is_stream() {
            let rx = match response.body {
                UpstreamBody::Stream(rx) => rx,
                UpstreamBody::Bytes(bytes) => {
                    let (tx, rx) = mpsc::channel(1);
                    // Capacity one, so this never waits.
                    let _ = tx.try_send(bytes);
                    rx
                }
            };
            let (tx, events) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            let decoder = self.kind.stream_decoder();
            let provider = self.id.clone();
            let join = tokio::spawn(pump_stream(provider, rx, decoder, tx, permit));
            return Ok(AdapterReply::Stream(StreamHandle::new(
                events,
                join.abort_handle(),
            )));
        }

        let body = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(rx) => collect_body(rx).await,
        };
        drop(permit);
        self.kind
            .parse_response(req.kind(), &body)
            .map(AdapterReply::Unary)
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn describe_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn health(&self) -> AdapterHealth {
        self.health
            .lock()
            .map(|health| health.clone())
            .unwrap_or_default()
    }

    async fn send(
        &self,
        ctx: &AttemptCtx,
        req: &NormalizedRequest,
        candidate: &ProviderCandidate,
    ) -> AdapterResult<AdapterReply> {
        let result = self.attempt(ctx, req, candidate).await;
        self.note(result.as_ref().map(|_| ()));
        result
    }
}

async fn collect_body(mut rx: ByteStream) -> bytes::Bytes {
    let mut buf = Vec::new();
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
    }
    bytes::Bytes::from(buf)
}

/// Decodes upstream SSE into normalized events until the upstream is done or
/// the consumer goes away. Holds the concurrency slot for the stream's lifetime.
async fn pump_stream(
    provider: String,
    mut body: ByteStream,
    mut decoder: StreamDecoder,
    tx: mpsc::Sender<AdapterResult<StreamEvent>>,
    _permit: OwnedSemaphorePermit,
) {
    let mut sse = SseDecoder::new();
    loop {
        let (frames, eof) = match body.recv().await {
            Some(chunk) => (sse.push(&chunk), false),
            None => (sse.finish(), true),
        };
        for frame in frames {
            match decoder.decode(&frame) {
                Ok(events) => {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(provider = %provider, error = %err, "upstream stream failed");
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
            if decoder.is_done() {
                return;
            }
        }
        if eof {
            break;
        }
    }

    if !decoder.has_finished() {
        warn!(provider = %provider, "upstream stream ended before completion");
        let _ = tx
            .send(Err(AdapterError::unavailable(
                "upstream stream ended before completion",
            )))
            .await;
    }
}
