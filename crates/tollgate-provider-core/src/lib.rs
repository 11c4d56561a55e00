//! Provider-facing abstractions for tollgate.
//!
//! This crate does not depend on axum or on a concrete HTTP client. Adapters build
//! `UpstreamHttpRequest`s and hand them to an `UpstreamClient`; the engine above
//! decides which adapter to call and what to do when it fails.

pub mod adapter;
pub mod errors;
pub mod health;
pub mod model;
pub mod registry;
pub mod upstream;

pub use adapter::{AdapterHealth, AdapterReply, AttemptCtx, ProviderAdapter, StreamHandle};
pub use errors::{AdapterError, AdapterErrorKind, AdapterResult};
pub use health::{
    AttemptPermit, CircuitConfig, CircuitState, Clock, HealthTracker, ManualClock, SystemClock,
};
pub use model::{
    AssistantMessage, ChatRequest, ChatResult, ContentPart, EmbeddingRequest, EmbeddingResult,
    FinishReason, GenerationParams, Message, ModelName, ModelNameError, NormalizedRequest,
    NormalizedResponse, ProviderCandidate, RequestBody, RequestError, RequestKind, Role,
    StreamEvent, StreamDelta, StructuredOutput, ToolCall, ToolCallDelta, ToolDefinition,
    UsageCounters, UsageHint,
};
pub use registry::AdapterRegistry;
pub use upstream::{
    ByteStream, Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind, classify_failure,
    header_get, header_set,
};
