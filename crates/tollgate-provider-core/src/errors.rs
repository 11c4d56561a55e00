use std::error::Error;
use std::fmt;
use std::time::Duration;

pub type AdapterResult<T> = Result<T, AdapterError>;

/// How the selector must react to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterErrorKind {
    /// Caller error; never retried on another provider.
    InvalidRequest,
    /// 5xx, transport failure, timeout or local pool exhaustion.
    UpstreamUnavailable,
    RateLimited,
    /// The provider does not serve this model or operation; skip the candidate.
    UnsupportedModel,
}

impl AdapterErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterErrorKind::InvalidRequest => "invalid_request",
            AdapterErrorKind::UpstreamUnavailable => "upstream_unavailable",
            AdapterErrorKind::RateLimited => "rate_limited",
            AdapterErrorKind::UnsupportedModel => "unsupported_model",
        }
    }

    /// Failures that count against a provider's circuit.
    pub fn affects_health(&self) -> bool {
        matches!(
            self,
            AdapterErrorKind::UpstreamUnavailable | AdapterErrorKind::RateLimited
        )
    }
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    /// Internal detail for logs; never echoed to callers.
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::InvalidRequest, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::UpstreamUnavailable, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: AdapterErrorKind::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn unsupported_model(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::UnsupportedModel, message)
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for AdapterError {}
