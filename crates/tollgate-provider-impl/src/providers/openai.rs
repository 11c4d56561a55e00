//! OpenAI chat-completions / embeddings wire format, shared by the OpenAI and
//! aggregator adapters. The conversion helpers are public so the gateway's own
//! OpenAI-compatible surface uses the same mapping in the other direction.

use bytes::Bytes;

use tollgate_protocol::openai as wire;
use tollgate_protocol::sse::SseFrame;
use tollgate_provider_core::{
    AdapterError, AdapterResult, AssistantMessage, ChatRequest, ChatResult, ContentPart,
    EmbeddingRequest, EmbeddingResult, FinishReason, Message, Role, StreamDelta, StreamEvent,
    StructuredOutput, ToolCall, ToolCallDelta, ToolDefinition, UsageCounters, UsageHint,
};

use super::{encode_error, malformed};

pub fn encode_chat_request(chat: &ChatRequest, model: &str, stream: bool) -> AdapterResult<Bytes> {
    let body = wire::ChatCompletionRequest {
        model: model.to_string(),
        messages: chat.messages.iter().map(message_to_wire).collect(),
        temperature: chat.params.temperature,
        top_p: chat.params.top_p,
        max_tokens: chat.params.max_tokens,
        max_completion_tokens: None,
        stop: (!chat.params.stop.is_empty())
            .then(|| wire::StopConfiguration::Many(chat.params.stop.clone())),
        stream: stream.then_some(true),
        stream_options: stream.then_some(wire::StreamOptions {
            include_usage: Some(true),
        }),
        tools: (!chat.tools.is_empty())
            .then(|| chat.tools.iter().map(tool_definition_to_wire).collect()),
        tool_choice: chat.tool_choice.clone(),
        response_format: chat
            .params
            .structured_output
            .as_ref()
            .map(structured_output_to_wire),
        user: None,
    };
    serde_json::to_vec(&body).map(Bytes::from).map_err(encode_error)
}

pub fn encode_embedding_request(req: &EmbeddingRequest, model: &str) -> AdapterResult<Bytes> {
    let body = wire::EmbeddingRequest {
        model: model.to_string(),
        input: wire::EmbeddingInput::Many(req.inputs.clone()),
        dimensions: req.dimensions,
        encoding_format: Some("float".to_string()),
        user: None,
    };
    serde_json::to_vec(&body).map(Bytes::from).map_err(encode_error)
}

pub fn decode_chat_response(body: &Bytes) -> AdapterResult<ChatResult> {
    let response: wire::ChatCompletionResponse =
        serde_json::from_slice(body).map_err(|err| malformed("chat completion", err))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AdapterError::unavailable("upstream returned no choices"))?;
    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(tool_call_from_wire)
        .collect::<Vec<_>>();
    Ok(ChatResult {
        model: response.model,
        message: AssistantMessage {
            content: choice.message.content,
            tool_calls,
        },
        finish_reason: choice
            .finish_reason
            .map(finish_reason_from_wire)
            .unwrap_or(FinishReason::Stop),
        usage: response.usage.map(usage_from_wire),
    })
}

pub fn decode_embedding_response(body: &Bytes) -> AdapterResult<EmbeddingResult> {
    let response: wire::EmbeddingResponse =
        serde_json::from_slice(body).map_err(|err| malformed("embedding response", err))?;
    let mut data = response.data;
    data.sort_by_key(|item| item.index);
    Ok(EmbeddingResult {
        model: response.model,
        vectors: data.into_iter().map(|item| item.embedding).collect(),
        usage: response
            .usage
            .map(|usage| UsageCounters::new(usage.prompt_tokens, 0)),
    })
}

/// Decoder state for an OpenAI-format chunk stream.
#[derive(Debug, Default)]
pub struct OpenAiStream {
    done: bool,
    finished: bool,
}

impl OpenAiStream {
    pub fn decode(&mut self, frame: &SseFrame) -> AdapterResult<Vec<StreamEvent>> {
        if frame.is_done() {
            self.done = true;
            return Ok(Vec::new());
        }
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let chunk: wire::ChatCompletionChunk =
            serde_json::from_str(&frame.data).map_err(|err| malformed("stream chunk", err))?;
        if let Some(error) = chunk.error {
            return Err(AdapterError::unavailable(format!(
                "upstream stream error {}: {}",
                error.code, error.message
            )));
        }

        let mut events = Vec::new();
        if let Some(choice) = chunk.choices.into_iter().next() {
            let delta = delta_from_wire(choice.delta);
            if delta.role.is_some() || delta.content.is_some() || !delta.tool_calls.is_empty() {
                events.push(StreamEvent::Delta(delta));
            }
            if let Some(reason) = choice.finish_reason {
                self.finished = true;
                events.push(StreamEvent::Finish(finish_reason_from_wire(reason)));
            }
        }
        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::Usage(UsageHint {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
            }));
        }
        Ok(events)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn has_finished(&self) -> bool {
        self.finished
    }
}

pub fn message_to_wire(message: &Message) -> wire::ChatMessage {
    match message.role {
        Role::System => wire::ChatMessage::System {
            content: content_to_wire(&message.content),
            name: message.name.clone(),
        },
        Role::User => wire::ChatMessage::User {
            content: content_to_wire(&message.content),
            name: message.name.clone(),
        },
        Role::Assistant => wire::ChatMessage::Assistant {
            content: (!message.content.is_empty()).then(|| content_to_wire(&message.content)),
            name: message.name.clone(),
            tool_calls: (!message.tool_calls.is_empty())
                .then(|| message.tool_calls.iter().map(tool_call_to_wire).collect()),
        },
        Role::Tool => wire::ChatMessage::Tool {
            content: wire::MessageContent::Text(message.plain_text()),
            tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
        },
    }
}

pub fn message_from_wire(message: wire::ChatMessage) -> Message {
    match message {
        wire::ChatMessage::System { content, name }
        | wire::ChatMessage::Developer { content, name } => Message {
            role: Role::System,
            content: content_from_wire(content),
            name,
            tool_call_id: None,
            tool_calls: Vec::new(),
        },
        wire::ChatMessage::User { content, name } => Message {
            role: Role::User,
            content: content_from_wire(content),
            name,
            tool_call_id: None,
            tool_calls: Vec::new(),
        },
        wire::ChatMessage::Assistant {
            content,
            name,
            tool_calls,
        } => Message {
            role: Role::Assistant,
            content: content.map(content_from_wire).unwrap_or_default(),
            name,
            tool_call_id: None,
            tool_calls: tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(tool_call_from_wire)
                .collect(),
        },
        wire::ChatMessage::Tool {
            content,
            tool_call_id,
        } => Message {
            role: Role::Tool,
            content: content_from_wire(content),
            name: None,
            tool_call_id: Some(tool_call_id),
            tool_calls: Vec::new(),
        },
    }
}

fn content_to_wire(parts: &[ContentPart]) -> wire::MessageContent {
    if let [ContentPart::Text(text)] = parts {
        return wire::MessageContent::Text(text.clone());
    }
    wire::MessageContent::Parts(
        parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => wire::ContentPart::Text { text: text.clone() },
                ContentPart::Image { url, detail } => wire::ContentPart::ImageUrl {
                    image_url: wire::ImageUrl {
                        url: url.clone(),
                        detail: detail.clone(),
                    },
                },
                ContentPart::Document {
                    file_id,
                    filename,
                    data,
                } => wire::ContentPart::File {
                    file: wire::FileReference {
                        file_id: file_id.clone(),
                        filename: filename.clone(),
                        file_data: data.clone(),
                    },
                },
            })
            .collect(),
    )
}

fn content_from_wire(content: wire::MessageContent) -> Vec<ContentPart> {
    match content {
        wire::MessageContent::Text(text) => vec![ContentPart::Text(text)],
        wire::MessageContent::Parts(parts) => parts
            .into_iter()
            .map(|part| match part {
                wire::ContentPart::Text { text } => ContentPart::Text(text),
                wire::ContentPart::ImageUrl { image_url } => ContentPart::Image {
                    url: image_url.url,
                    detail: image_url.detail,
                },
                wire::ContentPart::File { file } => ContentPart::Document {
                    file_id: file.file_id,
                    filename: file.filename,
                    data: file.file_data,
                },
            })
            .collect(),
    }
}

pub fn tool_definition_to_wire(tool: &ToolDefinition) -> wire::ChatToolDefinition {
    wire::ChatToolDefinition {
        kind: wire::ToolType::Function,
        function: wire::FunctionDefinition {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(tool.parameters.clone()),
            strict: None,
        },
    }
}

pub fn tool_definition_from_wire(tool: wire::ChatToolDefinition) -> ToolDefinition {
    ToolDefinition {
        name: tool.function.name,
        description: tool.function.description,
        parameters: tool
            .function
            .parameters
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
    }
}

pub fn tool_call_to_wire(call: &ToolCall) -> wire::ChatToolCall {
    wire::ChatToolCall {
        id: call.id.clone(),
        kind: wire::ToolType::Function,
        function: wire::FunctionCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        },
    }
}

fn tool_call_from_wire(call: wire::ChatToolCall) -> ToolCall {
    ToolCall {
        id: call.id,
        name: call.function.name,
        arguments: call.function.arguments,
    }
}

pub fn structured_output_to_wire(output: &StructuredOutput) -> wire::ResponseFormat {
    match output {
        StructuredOutput::JsonObject => wire::ResponseFormat::JsonObject,
        StructuredOutput::JsonSchema {
            name,
            schema,
            strict,
        } => wire::ResponseFormat::JsonSchema {
            json_schema: wire::JsonSchemaFormat {
                name: name.clone(),
                description: None,
                schema: Some(schema.clone()),
                strict: Some(*strict),
            },
        },
    }
}

pub fn structured_output_from_wire(format: wire::ResponseFormat) -> Option<StructuredOutput> {
    match format {
        wire::ResponseFormat::Text => None,
        wire::ResponseFormat::JsonObject => Some(StructuredOutput::JsonObject),
        wire::ResponseFormat::JsonSchema { json_schema } => Some(StructuredOutput::JsonSchema {
            name: json_schema.name,
            schema: json_schema
                .schema
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            strict: json_schema.strict.unwrap_or(false),
        }),
    }
}

pub fn finish_reason_from_wire(reason: wire::FinishReason) -> FinishReason {
    match reason {
        wire::FinishReason::Stop => FinishReason::Stop,
        wire::FinishReason::Length => FinishReason::Length,
        wire::FinishReason::ToolCalls | wire::FinishReason::FunctionCall => FinishReason::ToolCalls,
        wire::FinishReason::ContentFilter => FinishReason::ContentFilter,
        wire::FinishReason::Error => FinishReason::Error,
    }
}

pub fn finish_reason_to_wire(reason: FinishReason) -> wire::FinishReason {
    match reason {
        FinishReason::Stop => wire::FinishReason::Stop,
        FinishReason::Length => wire::FinishReason::Length,
        FinishReason::ToolCalls => wire::FinishReason::ToolCalls,
        FinishReason::ContentFilter => wire::FinishReason::ContentFilter,
        FinishReason::Error => wire::FinishReason::Error,
    }
}

pub fn usage_to_wire(usage: UsageCounters) -> wire::CompletionUsage {
    wire::CompletionUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
    }
}

fn usage_from_wire(usage: wire::CompletionUsage) -> UsageCounters {
    UsageCounters::new(usage.prompt_tokens, usage.completion_tokens)
}

pub fn role_to_wire(role: Role) -> wire::ChatRole {
    match role {
        Role::System => wire::ChatRole::System,
        Role::User => wire::ChatRole::User,
        Role::Assistant => wire::ChatRole::Assistant,
        Role::Tool => wire::ChatRole::Tool,
    }
}

fn role_from_wire(role: wire::ChatRole) -> Role {
    match role {
        wire::ChatRole::System | wire::ChatRole::Developer => Role::System,
        wire::ChatRole::User => Role::User,
        wire::ChatRole::Assistant => Role::Assistant,
        wire::ChatRole::Tool => Role::Tool,
    }
}

fn delta_from_wire(delta: wire::ChatDelta) -> StreamDelta {
    StreamDelta {
        role: delta.role.map(role_from_wire),
        content: delta.content.filter(|content| !content.is_empty()),
        tool_calls: delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let (name, arguments) = match call.function {
                    Some(function) => (function.name, function.arguments),
                    None => (None, None),
                };
                ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                }
            })
            .collect(),
    }
}

pub fn delta_to_wire(delta: &StreamDelta) -> wire::ChatDelta {
    wire::ChatDelta {
        role: delta.role.map(role_to_wire),
        content: delta.content.clone(),
        tool_calls: (!delta.tool_calls.is_empty()).then(|| {
            delta
                .tool_calls
                .iter()
                .map(|call| wire::ChatToolCallChunk {
                    index: call.index,
                    id: call.id.clone(),
                    kind: call.id.as_ref().map(|_| wire::ToolType::Function),
                    function: Some(wire::FunctionCallChunk {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    }),
                })
                .collect()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_provider_core::GenerationParams;

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn encodes_stream_request_with_usage_option() {
        let chat = ChatRequest {
            messages: vec![
                Message::text(Role::System, "be brief"),
                Message::text(Role::User, "hi"),
            ],
            tools: Vec::new(),
            tool_choice: None,
            params: GenerationParams {
                max_tokens: Some(5),
                stop: vec!["\n".to_string()],
                ..GenerationParams::default()
            },
        };
        let body = encode_chat_request(&chat, "gpt-4o", true).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["stream"], true);
        assert_eq!(value["stream_options"]["include_usage"], true);
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hi");
        assert_eq!(value["max_tokens"], 5);
        assert_eq!(value["stop"][0], "\n");
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn decodes_chunks_in_order() {
        let mut stream = OpenAiStream::default();
        let events = stream
            .decode(&frame(
                r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"},"finish_reason":null}]}"#,
            ))
            .unwrap();
        assert!(matches!(&events[..], [StreamEvent::Delta(d)] if d.content.as_deref() == Some("Hel")));

        let events = stream
            .decode(&frame(
                r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            ))
            .unwrap();
        assert_eq!(events, vec![StreamEvent::Finish(FinishReason::Stop)]);
        assert!(stream.has_finished());

        let events = stream
            .decode(&frame(
                r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":12,"total_tokens":22}}"#,
            ))
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Usage(UsageHint {
                input_tokens: Some(10),
                output_tokens: Some(12),
            })]
        );

        assert!(stream.decode(&frame("[DONE]")).unwrap().is_empty());
        assert!(stream.is_done());
    }

    #[test]
    fn malformed_chunk_is_unavailable() {
        let mut stream = OpenAiStream::default();
        let err = stream.decode(&frame("{not json")).unwrap_err();
        assert_eq!(
            err.kind,
            tollgate_provider_core::AdapterErrorKind::UpstreamUnavailable
        );
    }

    #[test]
    fn wire_messages_round_trip_tool_calls() {
        let wire_message: wire::ChatMessage = serde_json::from_value(serde_json::json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":1}"}}]
        }))
        .unwrap();
        let message = message_from_wire(wire_message);
        assert_eq!(message.role, Role::Assistant);
        assert!(message.content.is_empty());
        assert_eq!(message.tool_calls[0].name, "lookup");

        let back = serde_json::to_value(message_to_wire(&message)).unwrap();
        assert_eq!(back["tool_calls"][0]["function"]["arguments"], "{\"q\":1}");
        assert!(back.get("content").is_none());
    }
}
