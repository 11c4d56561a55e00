//! Mapping between the gateway's OpenAI-compatible surface and the normalized model.

use tollgate_protocol::gateway::ProviderMetadata;
use tollgate_protocol::openai::chat_completions::response::ChatCompletionObjectType;
use tollgate_protocol::openai::embeddings::{EmbeddingObjectType, ListObjectType};
use tollgate_protocol::openai::{
    ChatCompletionChoice, ChatCompletionRequest, ChatCompletionResponse, ChatResponseMessage,
    ChatRole, Embedding, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage,
};
use tollgate_provider_core::{
    ChatRequest, ChatResult, EmbeddingResult, GenerationParams, NormalizedRequest, RequestBody,
    RequestError, UsageCounters,
};
use tollgate_provider_impl::providers::openai::{
    finish_reason_to_wire, message_from_wire, structured_output_from_wire,
    tool_call_to_wire, tool_definition_from_wire, usage_to_wire,
};

pub fn chat_request_from_wire(
    req: ChatCompletionRequest,
    idempotency_key: Option<String>,
) -> Result<NormalizedRequest, RequestError> {
    let stream = req.stream.unwrap_or(false);
    let chat = ChatRequest {
        messages: req.messages.into_iter().map(message_from_wire).collect(),
        tools: req
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(tool_definition_from_wire)
            .collect(),
        tool_choice: req.tool_choice,
        params: GenerationParams {
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_completion_tokens.or(req.max_tokens),
            stop: req.stop.map(|stop| stop.into_vec()).unwrap_or_default(),
            structured_output: req.response_format.and_then(structured_output_from_wire),
        },
    };
    NormalizedRequest::new(&req.model, RequestBody::Chat(chat), stream, idempotency_key)
}

pub fn embedding_request_from_wire(
    req: EmbeddingRequest,
    idempotency_key: Option<String>,
) -> Result<NormalizedRequest, RequestError> {
    let body = RequestBody::Embedding(tollgate_provider_core::EmbeddingRequest {
        inputs: req.input.into_vec(),
        dimensions: req.dimensions,
    });
    NormalizedRequest::new(&req.model, body, false, idempotency_key)
}

pub fn chat_response_to_wire(
    id: &str,
    model: &str,
    created: i64,
    result: ChatResult,
    usage: UsageCounters,
    metadata: ProviderMetadata,
) -> ChatCompletionResponse {
    let tool_calls = (!result.message.tool_calls.is_empty())
        .then(|| result.message.tool_calls.iter().map(tool_call_to_wire).collect());
    ChatCompletionResponse {
        id: id.to_string(),
        object: ChatCompletionObjectType::ChatCompletion,
        created,
        model: model.to_string(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatResponseMessage {
                role: ChatRole::Assistant,
                content: result.message.content,
                tool_calls,
                refusal: None,
            },
            finish_reason: Some(finish_reason_to_wire(result.finish_reason)),
        }],
        usage: Some(usage_to_wire(usage)),
        provider_metadata: Some(metadata),
    }
}

pub fn embedding_response_to_wire(
    id: &str,
    model: &str,
    result: EmbeddingResult,
    usage: UsageCounters,
    metadata: ProviderMetadata,
) -> EmbeddingResponse {
    EmbeddingResponse {
        id: Some(id.to_string()),
        object: ListObjectType::List,
        data: result
            .vectors
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| Embedding {
                object: EmbeddingObjectType::Embedding,
                index: index as u32,
                embedding,
            })
            .collect(),
        model: model.to_string(),
        usage: Some(EmbeddingUsage {
            prompt_tokens: usage.input_tokens,
            total_tokens: usage.total_tokens,
        }),
        provider_metadata: Some(metadata),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_provider_core::{RequestKind, Role};

    fn request(json: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn chat_request_keeps_messages_and_params() {
        let req = request(serde_json::json!({
            "model": "acme/modelX",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ],
            "max_tokens": 10,
            "max_completion_tokens": 20,
            "stop": "END",
            "stream": true
        }));
        let normalized = chat_request_from_wire(req, Some("key-1".to_string())).unwrap();
        assert_eq!(normalized.kind(), RequestKind::Chat);
        assert!(normalized.is_stream());
        assert_eq!(normalized.idempotency_key(), "key-1");
        let RequestBody::Chat(chat) = normalized.body() else {
            panic!("expected chat body");
        };
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, Role::System);
        assert_eq!(chat.messages[1].plain_text(), "hi");
        assert_eq!(chat.params.max_tokens, Some(20));
        assert_eq!(chat.params.stop, vec!["END".to_string()]);
    }

    #[test]
    fn unnamespaced_model_is_rejected() {
        let req = request(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(matches!(
            chat_request_from_wire(req, None),
            Err(RequestError::InvalidModel(_))
        ));
    }

    #[test]
    fn single_embedding_input_becomes_one_vector_request() {
        let req: EmbeddingRequest = serde_json::from_value(serde_json::json!({
            "model": "openai/text-embedding-3-small",
            "input": "hello"
        }))
        .unwrap();
        let normalized = embedding_request_from_wire(req, None).unwrap();
        let RequestBody::Embedding(body) = normalized.body() else {
            panic!("expected embedding body");
        };
        assert_eq!(body.inputs, vec!["hello".to_string()]);
        assert!(!normalized.is_stream());
    }
}
