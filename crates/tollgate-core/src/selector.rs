use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use tollgate_provider_core::{
    AdapterError, AdapterErrorKind, AdapterRegistry, AdapterReply, AdapterResult, AttemptCtx,
    HealthTracker, NormalizedRequest, ProviderAdapter, ProviderCandidate,
};

/// Why one candidate did not serve the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub provider: String,
    /// Stable reason code: an adapter error kind, `circuit_open`,
    /// `not_registered` or `deadline_exceeded`.
    pub reason: String,
    pub message: String,
}

impl CandidateFailure {
    fn new(provider: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// The candidate that answered.
#[derive(Debug)]
pub struct Selected {
    pub candidate: ProviderCandidate,
    pub reply: AdapterReply,
    /// Adapter invocations, including the successful one.
    pub attempts: u32,
    /// Providers that were tried and failed before this one.
    pub fallbacks: Vec<String>,
}

#[derive(Debug)]
pub enum SelectError {
    /// The caller's request was rejected by a provider. Never retried elsewhere.
    InvalidRequest {
        provider: String,
        error: AdapterError,
        attempts: u32,
    },
    AllExhausted {
        failures: Vec<CandidateFailure>,
        attempts: u32,
        /// The last provider that was actually invoked.
        last_provider: Option<String>,
        deadline_exceeded: bool,
    },
}

impl SelectError {
    pub fn attempts(&self) -> u32 {
        match self {
            SelectError::InvalidRequest { attempts, .. }
            | SelectError::AllExhausted { attempts, .. } => *attempts,
        }
    }
}

/// Drives failover across an ordered candidate list.
pub struct Selector {
    registry: Arc<AdapterRegistry>,
    health: Arc<HealthTracker>,
    min_attempt_budget: Duration,
}

impl Selector {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        health: Arc<HealthTracker>,
        min_attempt_budget: Duration,
    ) -> Self {
        Self {
            registry,
            health,
            min_attempt_budget,
        }
    }

    pub async fn run(
        &self,
        generation_id: &str,
        req: &NormalizedRequest,
        candidates: &[ProviderCandidate],
        deadline: Instant,
    ) -> Result<Selected, SelectError> {
        let mut failures = Vec::new();
        let mut fallbacks = Vec::new();
        let mut attempts = 0u32;
        let mut last_provider = None;
        let mut deadline_exceeded = false;

        for candidate in candidates {
            let provider = candidate.provider.as_str();

            if deadline.saturating_duration_since(Instant::now()) < self.min_attempt_budget {
                warn!(
                    generation_id = %generation_id,
                    provider = %provider,
                    "request budget too small for another attempt"
                );
                deadline_exceeded = true;
                break;
            }

            let Some(adapter) = self.registry.get(provider) else {
                failures.push(CandidateFailure::new(
                    provider,
                    "not_registered",
                    "provider is not configured",
                ));
                continue;
            };
            let Some(permit) = self.health.try_begin(provider) else {
                info!(generation_id = %generation_id, provider = %provider, "skipping provider, circuit open");
                failures.push(CandidateFailure::new(provider, "circuit_open", "circuit open"));
                continue;
            };

            attempts += 1;
            last_provider = Some(provider.to_string());
            let ctx = AttemptCtx {
                generation_id: generation_id.to_string(),
                attempt_no: attempts,
                deadline,
            };

            let outcome =
                tokio::time::timeout_at(deadline, attempt(adapter.as_ref(), &ctx, req, candidate)).await;
            match outcome {
                Ok(Ok(reply)) => {
                    let probe = permit.is_probe();
                    permit.success();
                    info!(
                        generation_id = %generation_id,
                        provider = %provider,
                        model = %candidate.model,
                        attempt_no = attempts,
                        probe,
                        "provider selected"
                    );
                    return Ok(Selected {
                        candidate: candidate.clone(),
                        reply,
                        attempts,
                        fallbacks,
                    });
                }
                Ok(Err(error)) => match error.kind {
                    AdapterErrorKind::InvalidRequest => {
                        permit.release();
                        warn!(
                            generation_id = %generation_id,
                            provider = %provider,
                            error = %error,
                            "request rejected by provider"
                        );
                        return Err(SelectError::InvalidRequest {
                            provider: provider.to_string(),
                            error,
                            attempts,
                        });
                    }
                    AdapterErrorKind::UnsupportedModel => {
                        permit.release();
                        info!(
                            generation_id = %generation_id,
                            provider = %provider,
                            model = %candidate.model,
                            "model unsupported, trying next provider"
                        );
                        failures.push(CandidateFailure::new(provider, error.kind.as_str(), error.message));
                    }
                    AdapterErrorKind::UpstreamUnavailable | AdapterErrorKind::RateLimited => {
                        permit.failure();
                        warn!(
                            generation_id = %generation_id,
                            provider = %provider,
                            attempt_no = attempts,
                            error = %error,
                            "provider failed, failing over"
                        );
                        failures.push(CandidateFailure::new(provider, error.kind.as_str(), error.message));
                        fallbacks.push(provider.to_string());
                    }
                },
                Err(_) => {
                    permit.failure();
                    warn!(
                        generation_id = %generation_id,
                        provider = %provider,
                        attempt_no = attempts,
                        "provider attempt hit the request deadline"
                    );
                    failures.push(CandidateFailure::new(
                        provider,
                        "deadline_exceeded",
                        "request deadline exceeded",
                    ));
                    fallbacks.push(provider.to_string());
                    deadline_exceeded = true;
                }
            }
        }

        Err(SelectError::AllExhausted {
            failures,
            attempts,
            last_provider,
            deadline_exceeded,
        })
    }
}

/// One adapter call. A stream only counts as answered once it produced its
/// first visible event; failing before that is a failed attempt.
async fn attempt(
    adapter: &dyn ProviderAdapter,
    ctx: &AttemptCtx,
    req: &NormalizedRequest,
    candidate: &ProviderCandidate,
) -> AdapterResult<AdapterReply> {
    match adapter.send(ctx, req, candidate).await? {
        AdapterReply::Stream(mut handle) => {
            handle.prime().await?;
            Ok(AdapterReply::Stream(handle))
        }
        unary => Ok(unary),
    }
}
