use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;

use crate::errors::AdapterError;

pub type Headers = Vec<(String, String)>;
pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match headers
        .iter_mut()
        .find(|(key, _)| key.eq_ignore_ascii_case(&name))
    {
        Some((_, existing)) => *existing = value,
        None => headers.push((name, value)),
    }
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

impl UpstreamTransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamTransportErrorKind::Timeout => "timeout",
            UpstreamTransportErrorKind::ReadTimeout => "read_timeout",
            UpstreamTransportErrorKind::Connect => "connect",
            UpstreamTransportErrorKind::Dns => "dns",
            UpstreamTransportErrorKind::Tls => "tls",
            UpstreamTransportErrorKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// No HTTP response was received.
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// Non-2xx response captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

/// Performs the network IO for adapters.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

const ERROR_BODY_PREVIEW: usize = 512;

/// Maps a failed upstream exchange onto the adapter error taxonomy.
pub fn classify_failure(failure: &UpstreamFailure) -> AdapterError {
    match failure {
        UpstreamFailure::Transport { kind, message } => {
            AdapterError::unavailable(format!("transport {}: {message}", kind.as_str()))
        }
        UpstreamFailure::Http {
            status,
            headers,
            body,
        } => {
            let message = format!("upstream status {status}: {}", preview(body));
            match *status {
                429 => AdapterError::rate_limited(message, parse_retry_after(headers)),
                404 => AdapterError::unsupported_model(message),
                // Credential or account problems make the provider unusable,
                // they are not the caller's fault.
                401 | 402 | 403 | 408 | 409 => AdapterError::unavailable(message),
                400..=499 => AdapterError::invalid_request(message),
                _ => AdapterError::unavailable(message),
            }
        }
    }
}

fn preview(body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(ERROR_BODY_PREVIEW) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}

fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}
