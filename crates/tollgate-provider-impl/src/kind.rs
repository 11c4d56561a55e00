use bytes::Bytes;

use tollgate_provider_core::{
    AdapterError, AdapterResult, Headers, HttpMethod, NormalizedRequest, NormalizedResponse,
    RequestBody, RequestKind, UpstreamHttpRequest, header_set,
};

use crate::providers::anthropic::{self, AnthropicStream};
use crate::providers::openai::{self, OpenAiStream};

/// The closed set of upstream flavours. Adding a provider means adding a
/// variant here; routing and relaying never branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    /// OpenAI-compatible gateway that takes namespaced model ids as-is.
    Aggregator,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Aggregator => "aggregator",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Aggregator => "https://ai-gateway.vercel.sh/v1",
        }
    }

    /// Model id as this provider expects it on the wire.
    pub fn upstream_model<'a>(&self, model: &'a str) -> &'a str {
        match self {
            ProviderKind::Aggregator => model,
            ProviderKind::OpenAi | ProviderKind::Anthropic => model
                .split_once('/')
                .map(|(_, rest)| rest)
                .unwrap_or(model),
        }
    }

    pub(crate) fn build_request(
        &self,
        base_url: &str,
        api_key: Option<&str>,
        req: &NormalizedRequest,
        model: &str,
    ) -> AdapterResult<UpstreamHttpRequest> {
        let stream = req.is_stream();
        let (path, body) = match (self, req.body()) {
            (ProviderKind::Anthropic, RequestBody::Chat(chat)) => {
                ("/messages", anthropic::encode_request(chat, model, stream)?)
            }
            (ProviderKind::Anthropic, RequestBody::Embedding(_)) => {
                return Err(AdapterError::unsupported_model(
                    "anthropic does not serve embeddings",
                ));
            }
            (_, RequestBody::Chat(chat)) => (
                "/chat/completions",
                openai::encode_chat_request(chat, model, stream)?,
            ),
            (_, RequestBody::Embedding(embedding)) => {
                ("/embeddings", openai::encode_embedding_request(embedding, model)?)
            }
        };

        let mut headers = Headers::new();
        header_set(&mut headers, "content-type", "application/json");
        if stream {
            header_set(&mut headers, "accept", "text/event-stream");
        }
        match self {
            ProviderKind::Anthropic => {
                if let Some(key) = api_key {
                    header_set(&mut headers, "x-api-key", key);
                }
                header_set(
                    &mut headers,
                    "anthropic-version",
                    tollgate_protocol::anthropic::ANTHROPIC_VERSION,
                );
            }
            ProviderKind::OpenAi | ProviderKind::Aggregator => {
                if let Some(key) = api_key {
                    header_set(&mut headers, "authorization", format!("Bearer {key}"));
                }
            }
        }

        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}{path}", base_url.trim_end_matches('/')),
            headers,
            body: Some(body),
            is_stream: stream,
        })
    }

    pub(crate) fn parse_response(
        &self,
        kind: RequestKind,
        body: &Bytes,
    ) -> AdapterResult<NormalizedResponse> {
        match (self, kind) {
            (ProviderKind::Anthropic, RequestKind::Chat) => {
                anthropic::decode_response(body).map(NormalizedResponse::Chat)
            }
            (ProviderKind::Anthropic, RequestKind::Embedding) => Err(
                AdapterError::unsupported_model("anthropic does not serve embeddings"),
            ),
            (_, RequestKind::Chat) => openai::decode_chat_response(body).map(NormalizedResponse::Chat),
            (_, RequestKind::Embedding) => {
                openai::decode_embedding_response(body).map(NormalizedResponse::Embedding)
            }
        }
    }

    pub(crate) fn stream_decoder(&self) -> StreamDecoder {
        match self {
            ProviderKind::Anthropic => StreamDecoder::Anthropic(AnthropicStream::default()),
            ProviderKind::OpenAi | ProviderKind::Aggregator => {
                StreamDecoder::OpenAi(OpenAiStream::default())
            }
        }
    }
}

/// Provider-native SSE frames -> normalized stream events.
pub(crate) enum StreamDecoder {
    OpenAi(OpenAiStream),
    Anthropic(AnthropicStream),
}

impl StreamDecoder {
    pub(crate) fn decode(
        &mut self,
        frame: &tollgate_protocol::sse::SseFrame,
    ) -> AdapterResult<Vec<tollgate_provider_core::StreamEvent>> {
        match self {
            StreamDecoder::OpenAi(state) => state.decode(frame),
            StreamDecoder::Anthropic(state) => state.decode(frame),
        }
    }

    /// The upstream signalled end of stream; nothing after it matters.
    pub(crate) fn is_done(&self) -> bool {
        match self {
            StreamDecoder::OpenAi(state) => state.is_done(),
            StreamDecoder::Anthropic(state) => state.is_done(),
        }
    }

    /// A finish reason was seen, so a missing end marker is tolerable.
    pub(crate) fn has_finished(&self) -> bool {
        match self {
            StreamDecoder::OpenAi(state) => state.has_finished(),
            StreamDecoder::Anthropic(state) => state.has_finished(),
        }
    }
}
