use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::errors::{AdapterErrorKind, AdapterResult};
use crate::model::{NormalizedRequest, NormalizedResponse, ProviderCandidate, StreamEvent};

/// Per-attempt context handed to an adapter.
#[derive(Debug, Clone)]
pub struct AttemptCtx {
    pub generation_id: String,
    /// 1-based, counted across all providers tried for this request.
    pub attempt_no: u32,
    pub deadline: Instant,
}

/// Ordered event stream produced by an adapter.
///
/// Dropping the handle (or calling [`StreamHandle::abort`]) cancels the producer
/// task, which in turn drops the upstream connection.
pub struct StreamHandle {
    events: mpsc::Receiver<AdapterResult<StreamEvent>>,
    producer: Option<AbortHandle>,
    read_ahead: VecDeque<StreamEvent>,
}

impl StreamHandle {
    pub fn new(events: mpsc::Receiver<AdapterResult<StreamEvent>>, producer: AbortHandle) -> Self {
        Self {
            events,
            producer: Some(producer),
            read_ahead: VecDeque::new(),
        }
    }

    /// A stream without a producer task to cancel.
    pub fn from_receiver(events: mpsc::Receiver<AdapterResult<StreamEvent>>) -> Self {
        Self {
            events,
            producer: None,
            read_ahead: VecDeque::new(),
        }
    }

    pub async fn recv(&mut self) -> Option<AdapterResult<StreamEvent>> {
        if let Some(event) = self.read_ahead.pop_front() {
            return Some(Ok(event));
        }
        self.events.recv().await
    }

    /// Reads ahead to the first event a client would see (a delta or a finish)
    /// or to the end of the stream. An error before that point is returned
    /// here instead of from `recv`; events read so far are replayed by `recv`.
    pub async fn prime(&mut self) -> AdapterResult<()> {
        while let Some(event) = self.events.recv().await {
            let event = event?;
            let visible = !matches!(event, StreamEvent::Usage(_));
            self.read_ahead.push_back(event);
            if visible {
                break;
            }
        }
        Ok(())
    }

    pub fn abort(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        self.events.close();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("has_producer", &self.producer.is_some())
            .field("read_ahead", &self.read_ahead.len())
            .finish()
    }
}

#[derive(Debug)]
pub enum AdapterReply {
    Unary(NormalizedResponse),
    Stream(StreamHandle),
}

/// Last outcome observed by an adapter. Informational only; routing decisions
/// use the shared `HealthTracker`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterHealth {
    pub last_success: Option<SystemTime>,
    pub last_failure: Option<SystemTime>,
    pub last_error: Option<AdapterErrorKind>,
}

impl AdapterHealth {
    pub fn is_good(&self) -> bool {
        match (self.last_success, self.last_failure) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(ok), Some(bad)) => ok >= bad,
        }
    }
}

/// Uniform interface to one upstream provider.
///
/// Implementations must not retry: one call is one attempt, and failover is
/// decided by the caller.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Model ids this adapter advertises. Empty means it serves whatever is
    /// routed to it.
    fn describe_models(&self) -> Vec<String>;

    fn health(&self) -> AdapterHealth;

    async fn send(
        &self,
        ctx: &AttemptCtx,
        req: &NormalizedRequest,
        candidate: &ProviderCandidate,
    ) -> AdapterResult<AdapterReply>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AdapterError;
    use crate::model::{FinishReason, UsageHint};

    fn usage() -> StreamEvent {
        StreamEvent::Usage(UsageHint {
            input_tokens: Some(4),
            output_tokens: None,
        })
    }

    #[tokio::test]
    async fn prime_surfaces_an_error_before_output() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(usage())).await.unwrap();
        tx.send(Err(AdapterError::unavailable("overloaded"))).await.unwrap();

        let mut handle = StreamHandle::from_receiver(rx);
        let err = handle.prime().await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::UpstreamUnavailable);
    }

    #[tokio::test]
    async fn prime_replays_events_read_ahead() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(usage())).await.unwrap();
        tx.send(Ok(StreamEvent::Finish(FinishReason::Stop))).await.unwrap();
        tx.send(Err(AdapterError::unavailable("late"))).await.unwrap();
        drop(tx);

        let mut handle = StreamHandle::from_receiver(rx);
        handle.prime().await.unwrap();
        assert!(matches!(handle.recv().await, Some(Ok(StreamEvent::Usage(_)))));
        assert!(matches!(
            handle.recv().await,
            Some(Ok(StreamEvent::Finish(FinishReason::Stop)))
        ));
        // Errors after the first visible event stay in the stream.
        assert!(matches!(handle.recv().await, Some(Err(_))));
        assert!(handle.recv().await.is_none());
    }
}
