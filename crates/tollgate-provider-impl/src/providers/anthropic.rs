//! Anthropic Messages API adapter format.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use tollgate_protocol::anthropic as wire;
use tollgate_protocol::sse::SseFrame;
use tollgate_provider_core::{
    AdapterError, AdapterResult, AssistantMessage, ChatRequest, ChatResult, ContentPart,
    FinishReason, Message, Role, StreamDelta, StreamEvent, ToolCall, ToolCallDelta, UsageCounters,
    UsageHint,
};

use super::{encode_error, malformed};

const DEFAULT_MAX_TOKENS: u32 = 1000;

pub fn encode_request(chat: &ChatRequest, model: &str, stream: bool) -> AdapterResult<Bytes> {
    let mut system = Vec::new();
    let mut messages: Vec<wire::MessageParam> = Vec::new();

    for message in &chat.messages {
        let (role, blocks) = match message.role {
            Role::System => {
                system.push(message.plain_text());
                continue;
            }
            Role::User => (wire::MessageRole::User, content_blocks(&message.content)),
            Role::Assistant => (wire::MessageRole::Assistant, assistant_blocks(message)),
            Role::Tool => (
                wire::MessageRole::User,
                vec![wire::ContentBlockParam::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: message.plain_text(),
                }],
            ),
        };
        if blocks.is_empty() {
            continue;
        }
        // Consecutive turns from the same side are merged into one message.
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => messages.push(wire::MessageParam {
                role,
                content: blocks,
            }),
        }
    }

    if messages.is_empty() {
        return Err(AdapterError::invalid_request(
            "request has no user or assistant messages",
        ));
    }

    let body = wire::MessagesRequest {
        model: model.to_string(),
        max_tokens: chat.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        temperature: chat.params.temperature,
        top_p: chat.params.top_p,
        stop_sequences: chat.params.stop.clone(),
        stream,
        tools: chat
            .tools
            .iter()
            .map(|tool| wire::ToolParam {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.parameters.clone(),
            })
            .collect(),
        tool_choice: chat.tool_choice.as_ref().and_then(tool_choice),
    };
    serde_json::to_vec(&body).map(Bytes::from).map_err(encode_error)
}

fn content_blocks(parts: &[ContentPart]) -> Vec<wire::ContentBlockParam> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text(text) if text.is_empty() => None,
            ContentPart::Text(text) => Some(wire::ContentBlockParam::Text { text: text.clone() }),
            ContentPart::Image { url, .. } => Some(wire::ContentBlockParam::Image {
                source: media_source(url),
            }),
            ContentPart::Document { file_id, data, .. } => {
                let source = match (data, file_id) {
                    (Some(data), _) => media_source(data),
                    (None, Some(file_id)) => wire::MediaSource::File {
                        file_id: file_id.clone(),
                    },
                    (None, None) => return None,
                };
                Some(wire::ContentBlockParam::Document { source })
            }
        })
        .collect()
}

fn assistant_blocks(message: &Message) -> Vec<wire::ContentBlockParam> {
    let mut blocks = content_blocks(&message.content);
    for call in &message.tool_calls {
        let input = serde_json::from_str::<JsonValue>(&call.arguments)
            .unwrap_or_else(|_| JsonValue::Object(Default::default()));
        blocks.push(wire::ContentBlockParam::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input,
        });
    }
    blocks
}

/// `data:<mime>;base64,<payload>` becomes an inline source, anything else a URL.
fn media_source(url: &str) -> wire::MediaSource {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((meta, data)) = rest.split_once(',')
        && let Some(media_type) = meta.strip_suffix(";base64")
    {
        return wire::MediaSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        };
    }
    wire::MediaSource::Url {
        url: url.to_string(),
    }
}

/// OpenAI `tool_choice` -> Anthropic `tool_choice`.
fn tool_choice(choice: &JsonValue) -> Option<JsonValue> {
    match choice {
        JsonValue::String(mode) => match mode.as_str() {
            "auto" => Some(serde_json::json!({"type": "auto"})),
            "required" => Some(serde_json::json!({"type": "any"})),
            "none" => Some(serde_json::json!({"type": "none"})),
            _ => None,
        },
        JsonValue::Object(map) => {
            let name = map.get("function")?.get("name")?.as_str()?;
            Some(serde_json::json!({"type": "tool", "name": name}))
        }
        _ => None,
    }
}

pub fn decode_response(body: &Bytes) -> AdapterResult<ChatResult> {
    let response: wire::MessagesResponse =
        serde_json::from_slice(body).map_err(|err| malformed("message", err))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            wire::ContentBlock::Text { text: part } => text.push_str(&part),
            wire::ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input.to_string(),
            }),
            wire::ContentBlock::Unknown => {}
        }
    }

    Ok(ChatResult {
        model: response.model,
        message: AssistantMessage {
            content: (!text.is_empty()).then_some(text),
            tool_calls,
        },
        finish_reason: stop_reason(response.stop_reason.as_deref()),
        usage: Some(UsageCounters::new(
            response.usage.input_tokens,
            response.usage.output_tokens,
        )),
    })
}

pub fn stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Decoder state for a Messages event stream.
#[derive(Debug, Default)]
pub struct AnthropicStream {
    /// Content block index -> OpenAI tool call index.
    tool_slots: HashMap<u32, u32>,
    finished: bool,
    done: bool,
}

impl AnthropicStream {
    pub fn decode(&mut self, frame: &SseFrame) -> AdapterResult<Vec<StreamEvent>> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let event: wire::MessageStreamEvent =
            serde_json::from_str(&frame.data).map_err(|err| malformed("stream event", err))?;

        let events = match event {
            wire::MessageStreamEvent::MessageStart { message } => {
                let mut events = vec![StreamEvent::Delta(StreamDelta {
                    role: Some(Role::Assistant),
                    ..StreamDelta::default()
                })];
                if let Some(usage) = message.usage {
                    events.push(StreamEvent::Usage(UsageHint {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    }));
                }
                events
            }
            wire::MessageStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                wire::ContentBlock::ToolUse { id, name, .. } => {
                    let slot = self.tool_slots.len() as u32;
                    self.tool_slots.insert(index, slot);
                    vec![StreamEvent::Delta(StreamDelta {
                        tool_calls: vec![ToolCallDelta {
                            index: slot,
                            id: Some(id),
                            name: Some(name),
                            arguments: Some(String::new()),
                        }],
                        ..StreamDelta::default()
                    })]
                }
                wire::ContentBlock::Text { text } if !text.is_empty() => {
                    vec![text_delta(text)]
                }
                _ => Vec::new(),
            },
            wire::MessageStreamEvent::ContentBlockDelta { index, delta } => match delta {
                wire::ContentDelta::TextDelta { text } if !text.is_empty() => {
                    vec![text_delta(text)]
                }
                wire::ContentDelta::InputJsonDelta { partial_json } => {
                    match self.tool_slots.get(&index) {
                        Some(slot) => vec![StreamEvent::Delta(StreamDelta {
                            tool_calls: vec![ToolCallDelta {
                                index: *slot,
                                id: None,
                                name: None,
                                arguments: Some(partial_json),
                            }],
                            ..StreamDelta::default()
                        })],
                        None => Vec::new(),
                    }
                }
                _ => Vec::new(),
            },
            wire::MessageStreamEvent::MessageDelta { delta, usage } => {
                let mut events = Vec::new();
                if let Some(usage) = usage {
                    events.push(StreamEvent::Usage(UsageHint {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    }));
                }
                if let Some(reason) = delta.stop_reason {
                    self.finished = true;
                    events.push(StreamEvent::Finish(stop_reason(Some(&reason))));
                }
                events
            }
            wire::MessageStreamEvent::MessageStop => {
                self.done = true;
                if self.finished {
                    Vec::new()
                } else {
                    self.finished = true;
                    vec![StreamEvent::Finish(FinishReason::Stop)]
                }
            }
            wire::MessageStreamEvent::ContentBlockStop { .. } | wire::MessageStreamEvent::Ping => {
                Vec::new()
            }
            wire::MessageStreamEvent::Error { error } => {
                let message = format!("upstream stream error {}: {}", error.kind, error.message);
                return Err(if error.kind == "rate_limit_error" {
                    AdapterError::rate_limited(message, None)
                } else {
                    AdapterError::unavailable(message)
                });
            }
        };
        Ok(events)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn has_finished(&self) -> bool {
        self.finished
    }
}

fn text_delta(text: String) -> StreamEvent {
    StreamEvent::Delta(StreamDelta {
        content: Some(text),
        ..StreamDelta::default()
    })
}
