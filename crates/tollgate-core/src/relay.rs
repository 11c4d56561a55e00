//! Forwards a provider's normalized stream to the client as OpenAI chunks.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use tollgate_protocol::gateway::ProviderMetadata;
use tollgate_protocol::openai::{ChatCompletionChunk, ChatDelta, ErrorBody};
use tollgate_protocol::sse;
use tollgate_provider_core::{
    AdapterError, FinishReason, StreamEvent, StreamHandle, UsageCounters,
};
use tollgate_provider_impl::providers::openai::{
    delta_to_wire, finish_reason_to_wire, usage_to_wire,
};

/// How the upstream half of a relayed stream ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// The adapter closed its stream normally.
    Completed,
    /// The client went away.
    Cancelled,
    /// The request deadline passed mid-stream.
    TimedOut,
    UpstreamFailed(AdapterError),
}

pub struct StreamRelay {
    handle: StreamHandle,
    out: mpsc::Sender<Bytes>,
    id: String,
    model: String,
    created: i64,
    input_tokens: u64,
    output_tokens: u64,
    finish: Option<FinishReason>,
    forwarded: u32,
}

impl StreamRelay {
    pub fn new(
        handle: StreamHandle,
        out: mpsc::Sender<Bytes>,
        id: impl Into<String>,
        model: impl Into<String>,
        created: i64,
    ) -> Self {
        Self {
            handle,
            out,
            id: id.into(),
            model: model.into(),
            created,
            input_tokens: 0,
            output_tokens: 0,
            finish: None,
            forwarded: 0,
        }
    }

    /// Usage seen so far; the last hint for each counter wins.
    pub fn usage(&self) -> UsageCounters {
        UsageCounters::new(self.input_tokens, self.output_tokens)
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    /// Chunks handed to the client by `pump`.
    pub fn forwarded(&self) -> u32 {
        self.forwarded
    }

    /// Relays events until the upstream ends, the client disconnects or
    /// `deadline` passes. The upstream is aborted on every path but `Completed`.
    pub async fn pump(&mut self, deadline: Instant) -> RelayOutcome {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.out.closed() => {
                    self.handle.abort();
                    return RelayOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.handle.abort();
                    return RelayOutcome::TimedOut;
                }
                event = self.handle.recv() => event,
            };

            let chunk = match event {
                None => return RelayOutcome::Completed,
                Some(Err(error)) => {
                    self.handle.abort();
                    return RelayOutcome::UpstreamFailed(error);
                }
                Some(Ok(StreamEvent::Usage(hint))) => {
                    if let Some(input) = hint.input_tokens {
                        self.input_tokens = input;
                    }
                    if let Some(output) = hint.output_tokens {
                        self.output_tokens = output;
                    }
                    continue;
                }
                Some(Ok(StreamEvent::Delta(delta))) => self.chunk().with_delta(delta_to_wire(&delta), None),
                Some(Ok(StreamEvent::Finish(reason))) => {
                    self.finish = Some(reason);
                    self.chunk()
                        .with_delta(ChatDelta::default(), Some(finish_reason_to_wire(reason)))
                }
            };

            if !self.send_chunk(&chunk).await {
                self.handle.abort();
                return RelayOutcome::Cancelled;
            }
            self.forwarded += 1;
        }
    }

    /// Final usage chunk carrying gateway metadata, then the terminator.
    pub async fn close_ok(self, usage: UsageCounters, metadata: ProviderMetadata) {
        let mut chunk = self.chunk();
        chunk.usage = Some(usage_to_wire(usage));
        chunk.provider_metadata = Some(metadata);
        if self.send_chunk(&chunk).await {
            let _ = self.out.send(sse::encode_done()).await;
        }
    }

    /// Error chunk, then the terminator.
    pub async fn close_err(self, code: &str, message: &str) {
        let mut chunk = self
            .chunk()
            .with_delta(ChatDelta::default(), Some(finish_reason_to_wire(FinishReason::Error)));
        chunk.error = Some(ErrorBody {
            code: code.to_string(),
            kind: "api_error".to_string(),
            message: message.to_string(),
        });
        if self.send_chunk(&chunk).await {
            let _ = self.out.send(sse::encode_done()).await;
        }
    }

    fn chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk::new(self.id.clone(), self.model.clone(), self.created)
    }

    /// False once the client is gone.
    async fn send_chunk(&self, chunk: &ChatCompletionChunk) -> bool {
        match sse::encode_json(chunk) {
            Ok(bytes) => self.out.send(bytes).await.is_ok(),
            Err(err) => {
                warn!(generation_id = %self.id, error = %err, "failed to encode stream chunk");
                true
            }
        }
    }
}
