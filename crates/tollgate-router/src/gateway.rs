use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Extension, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use tollgate_core::wire;
use tollgate_core::{
    CallerIdentity, Completion, CompletionBody, CreditScope, KeyAuth, RouteError, RoutingEngine,
    UnaryResponse,
};
use tollgate_protocol::gateway::{CreditsResponse, GenerationResponse};
use tollgate_protocol::openai::{ChatCompletionRequest, EmbeddingRequest, ModelList, ModelObject};
use tollgate_protocol::sse;
use tollgate_storage::CreditWindow;

use crate::error::ApiError;

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const GENERATION_ID_HEADER: HeaderName = HeaderName::from_static("x-generation-id");
const IDEMPOTENCY_HEADERS: [&str; 2] = ["idempotency-key", "x-idempotency-key"];

#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<RoutingEngine>,
    pub auth: Arc<KeyAuth>,
}

pub fn gateway_router(engine: Arc<RoutingEngine>, auth: Arc<KeyAuth>) -> Router {
    let state = GatewayState { engine, auth };

    let api = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        // Namespaced ids contain '/'.
        .route("/v1/models/{*model}", get(get_model))
        .route("/v1/credits", get(credits))
        .route("/v1/generation", get(generation))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .fallback(not_found)
        .with_state(state)
}

async fn require_api_key(
    State(state): State<GatewayState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let caller = match state.auth.authenticate(req.headers()) {
        Ok(caller) => caller,
        Err(err) => {
            debug!(path = %req.uri().path(), error = %err, "rejected request");
            return Err(err.into());
        }
    };

    // Key material stops here.
    strip_auth_headers(req.headers_mut());
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

fn strip_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
}

async fn chat_completions(
    State(state): State<GatewayState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: ChatCompletionRequest = parse_body(&body)?;
    let normalized =
        wire::chat_request_from_wire(req, idempotency_key(&headers)).map_err(RouteError::from)?;
    let completion = state.engine.complete(caller, normalized).await?;
    Ok(completion_response(completion))
}

async fn embeddings(
    State(state): State<GatewayState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: EmbeddingRequest = parse_body(&body)?;
    let normalized = wire::embedding_request_from_wire(req, idempotency_key(&headers))
        .map_err(RouteError::from)?;
    let completion = state.engine.complete(caller, normalized).await?;
    Ok(completion_response(completion))
}

async fn list_models(State(state): State<GatewayState>) -> Json<ModelList> {
    Json(state.engine.models())
}

async fn get_model(
    State(state): State<GatewayState>,
    Path(model): Path<String>,
) -> Result<Json<ModelObject>, ApiError> {
    Ok(Json(state.engine.model(model.trim_start_matches('/'))?))
}

#[derive(Debug, Default, Deserialize)]
struct CreditsQuery {
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

async fn credits(
    State(state): State<GatewayState>,
    Extension(caller): Extension<CallerIdentity>,
    Query(query): Query<CreditsQuery>,
) -> Result<Json<CreditsResponse>, ApiError> {
    let scope = match query.scope.as_deref().map(str::trim) {
        None | Some("") | Some("user") => CreditScope::User,
        Some("organization") | Some("org") => CreditScope::Organization,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "scope must be user or organization, got {other:?}"
            )));
        }
    };
    let window = CreditWindow {
        from: parse_time("from", query.from.as_deref())?,
        to: parse_time("to", query.to.as_deref())?,
    };
    Ok(Json(state.engine.credits(caller, scope, window).await?))
}

#[derive(Debug, Default, Deserialize)]
struct GenerationQuery {
    #[serde(default)]
    id: Option<String>,
}

async fn generation(
    State(state): State<GatewayState>,
    Extension(caller): Extension<CallerIdentity>,
    Query(query): Query<GenerationQuery>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let id = query
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing id query parameter"))?;
    Ok(Json(state.engine.generation(caller, &id).await?))
}

async fn health(State(state): State<GatewayState>) -> Response {
    match state.engine.ping().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response(),
        Err(err) => {
            warn!(error = ?err, "ledger ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable", "ledger": "unreachable" })),
            )
                .into_response()
        }
    }
}

async fn not_found() -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        "not_found",
        "not_found_error",
        "unknown route",
    )
}

// ---- Helpers ----

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("malformed request body: {err}")))
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    IDEMPOTENCY_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn parse_time(field: &str, raw: Option<&str>) -> Result<Option<OffsetDateTime>, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    OffsetDateTime::parse(raw, &Rfc3339)
        .map(Some)
        .map_err(|err| ApiError::bad_request(format!("invalid {field}: {err}")))
}

fn completion_response(completion: Completion) -> Response {
    let Completion {
        generation_id,
        body,
    } = completion;
    let mut response = match body {
        CompletionBody::Unary(UnaryResponse::Chat(chat)) => Json(chat).into_response(),
        CompletionBody::Unary(UnaryResponse::Embedding(embedding)) => {
            Json(embedding).into_response()
        }
        CompletionBody::Stream(rx) => sse_response(rx),
    };
    if let Ok(value) = HeaderValue::from_str(&generation_id) {
        response.headers_mut().insert(GENERATION_ID_HEADER, value);
    }
    response
}

fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(wrap_sse_stream_with_heartbeat(rx)).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    // Hint reverse proxies not to buffer.
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

/// Interleaves keep-alive comments into a quiet stream. Dropping the returned
/// receiver drops `upstream_rx`, which the relay sees as a disconnect.
fn wrap_sse_stream_with_heartbeat(mut upstream_rx: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(sse::encode_keep_alive()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_prefers_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-idempotency-key", HeaderValue::from_static("legacy"));
        assert_eq!(idempotency_key(&headers).as_deref(), Some("legacy"));

        headers.insert("idempotency-key", HeaderValue::from_static(" abc "));
        assert_eq!(idempotency_key(&headers).as_deref(), Some("abc"));

        assert_eq!(idempotency_key(&HeaderMap::new()), None);
    }

    #[test]
    fn window_bounds_parse_as_rfc3339() {
        let parsed = parse_time("from", Some("2026-01-01T00:00:00Z")).unwrap().unwrap();
        assert_eq!(parsed.unix_timestamp(), 1_767_225_600);
        assert!(parse_time("from", Some("")).unwrap().is_none());
        assert!(parse_time("to", Some("yesterday")).is_err());
    }
}
