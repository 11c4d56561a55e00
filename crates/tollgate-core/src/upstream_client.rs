use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use tollgate_common::GatewayConfig;
use tollgate_provider_core::{
    Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind,
};

const USER_AGENT: &str = concat!("tollgate/", env!("CARGO_PKG_VERSION"));
const FORWARD_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-exchange cap. The per-request deadline is enforced above this.
    pub request_timeout: Duration,
    /// Longest silence tolerated between two streamed chunks.
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        let proxy = config
            .proxy
            .as_deref()
            .map(str::trim)
            .filter(|proxy| !proxy.is_empty())
            .map(str::to_string);
        Self {
            proxy,
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            ..Self::default()
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// `UpstreamClient` over one pooled wreq client shared by every adapter.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    client: wreq::Client,
    stream_idle_timeout: Duration,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let mut builder = wreq::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(wreq::Proxy::all(proxy.as_str())?);
        }
        Ok(Self {
            client: builder.build()?,
            stream_idle_timeout: config.stream_idle_timeout,
        })
    }

    async fn exchange(&self, req: UpstreamHttpRequest) -> Result<UpstreamHttpResponse, UpstreamFailure> {
        let method = match req.method {
            HttpMethod::Get => wreq::Method::GET,
            HttpMethod::Post => wreq::Method::POST,
        };
        let mut builder = self
            .client
            .request(method, &req.url)
            .header("user-agent", USER_AGENT);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(transport_failure)?;
        let status = resp.status().as_u16();
        debug!(
            method = req.method.as_str(),
            url = %req.url,
            status,
            stream = req.is_stream,
            "upstream responded"
        );

        // Error bodies are always buffered so the adapter can classify them.
        if req.is_stream && (200..300).contains(&status) {
            Ok(forward_stream(resp, self.stream_idle_timeout))
        } else {
            buffer_response(resp).await
        }
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(self.exchange(req))
    }
}

async fn buffer_response(resp: wreq::Response) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = collect_headers(resp.headers());
    let body = resp.bytes().await.map_err(transport_failure)?;
    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Bytes(body),
    })
}

/// Hands chunks over a channel. The sender is dropped without a terminal
/// frame when upstream goes idle or breaks; the adapter reports that as a
/// truncated stream.
fn forward_stream(resp: wreq::Response, idle_timeout: Duration) -> UpstreamHttpResponse {
    let status = resp.status().as_u16();
    let headers = collect_headers(resp.headers());
    let (tx, rx) = mpsc::channel::<Bytes>(FORWARD_BUFFER);
    tokio::spawn(pump_chunks(resp.bytes_stream(), tx, idle_timeout));

    UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    }
}

/// Copies upstream chunks into `tx` until upstream ends, stalls for
/// `idle_timeout`, or the receiver is dropped.
async fn pump_chunks<S, E>(chunks: S, tx: mpsc::Sender<Bytes>, idle_timeout: Duration)
where
    S: futures_util::Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut chunks = std::pin::pin!(chunks);
    loop {
        let next = tokio::select! {
            biased;
            // Consumer gone; returning drops `chunks` and closes the connection.
            _ = tx.closed() => return,
            next = tokio::time::timeout(idle_timeout, chunks.next()) => next,
        };
        let chunk = match next {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(err))) => {
                debug!(error = %err, "upstream stream read failed");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                debug!(idle_ms = idle_timeout.as_millis() as u64, "upstream stream idle");
                return;
            }
        };
        if tx.send(chunk).await.is_err() {
            return;
        }
    }
}

fn collect_headers(map: &wreq::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn transport_failure(err: wreq::Error) -> UpstreamFailure {
    UpstreamFailure::Transport {
        kind: transport_kind(&err),
        message: err.to_string(),
    }
}

fn transport_kind(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let text = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        return kind_from_text(&text, UpstreamTransportErrorKind::Timeout);
    }
    if err.is_connect() || err.is_connection_reset() {
        return kind_from_text(&text, UpstreamTransportErrorKind::Connect);
    }
    kind_from_text(&text, UpstreamTransportErrorKind::Other)
}

/// Refines a coarse kind from the error text; wreq does not expose DNS, TLS
/// or read-phase failures as separate predicates.
fn kind_from_text(text: &str, fallback: UpstreamTransportErrorKind) -> UpstreamTransportErrorKind {
    use UpstreamTransportErrorKind as Kind;
    let mentions = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));
    match fallback {
        Kind::Timeout if mentions(&["read", "idle"]) => Kind::ReadTimeout,
        Kind::Connect if mentions(&["dns", "resolve"]) => Kind::Dns,
        _ if mentions(&["tls", "ssl", "certificate"]) => Kind::Tls,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn config_follows_gateway_settings() {
        let gateway = GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 8787,
            dsn: "sqlite::memory:".to_string(),
            proxy: Some("  ".to_string()),
            request_timeout_secs: 45,
            min_attempt_budget_ms: 1000,
            initial_credit: Decimal::new(100, 0),
        };
        let config = UpstreamClientConfig::from_gateway(&gateway);
        assert_eq!(config.proxy, None);
        assert_eq!(config.request_timeout, Duration::from_secs(45));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn forwarder_stops_once_the_receiver_is_gone() {
        let first = Bytes::from_static(b"data: 1\n\n");
        let chunks = futures_util::stream::iter([Ok::<_, std::convert::Infallible>(first.clone())])
            .chain(futures_util::stream::pending());
        let (tx, mut rx) = mpsc::channel(FORWARD_BUFFER);
        let task = tokio::spawn(pump_chunks(chunks, tx, Duration::from_secs(3600)));

        assert_eq!(rx.recv().await, Some(first));
        drop(rx);
        // Upstream is silent; only the dropped receiver can end the task.
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("forwarder kept running")
            .unwrap();
    }

    #[test]
    fn error_text_refines_transport_kind() {
        use UpstreamTransportErrorKind as Kind;
        assert_eq!(kind_from_text("read timed out", Kind::Timeout), Kind::ReadTimeout);
        assert_eq!(kind_from_text("operation timed out", Kind::Timeout), Kind::Timeout);
        assert_eq!(kind_from_text("failed to resolve host", Kind::Connect), Kind::Dns);
        assert_eq!(kind_from_text("invalid certificate", Kind::Connect), Kind::Tls);
        assert_eq!(kind_from_text("connection refused", Kind::Connect), Kind::Connect);
        assert_eq!(kind_from_text("ssl handshake", Kind::Other), Kind::Tls);
    }
}
