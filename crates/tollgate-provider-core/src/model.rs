//! Provider-neutral request/response model.
//!
//! The router converts OpenAI wire types into these once at the boundary; every
//! adapter converts them into its own wire format. Nothing downstream of the
//! router sees raw JSON bodies.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelNameError {
    Empty,
    MissingNamespace(String),
    TooManySegments(String),
}

impl fmt::Display for ModelNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelNameError::Empty => write!(f, "model must not be empty"),
            ModelNameError::MissingNamespace(raw) => {
                write!(f, "model {raw:?} must be namespaced as provider/model")
            }
            ModelNameError::TooManySegments(raw) => {
                write!(f, "model {raw:?} must contain exactly one '/'")
            }
        }
    }
}

impl std::error::Error for ModelNameError {}

/// A model id of the form `namespace/model`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelName {
    namespace: String,
    model: String,
}

impl ModelName {
    pub fn parse(raw: &str) -> Result<Self, ModelNameError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ModelNameError::Empty);
        }
        let Some((namespace, model)) = raw.split_once('/') else {
            return Err(ModelNameError::MissingNamespace(raw.to_string()));
        };
        if namespace.is_empty() || model.is_empty() {
            return Err(ModelNameError::MissingNamespace(raw.to_string()));
        }
        if model.contains('/') {
            return Err(ModelNameError::TooManySegments(raw.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            model: model.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// URL or data URL.
    Image { url: String, detail: Option<String> },
    Document {
        file_id: Option<String>,
        filename: Option<String>,
        /// Data URL (`data:<mime>;base64,...`).
        data: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
    pub name: Option<String>,
    /// Set on `Role::Tool` messages.
    pub tool_call_id: Option<String>,
    /// Set on `Role::Assistant` messages that called tools.
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text(text.into())],
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Concatenated text parts; non-text parts are skipped.
    pub fn plain_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the arguments.
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StructuredOutput {
    JsonObject,
    JsonSchema {
        name: String,
        schema: JsonValue,
        strict: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub structured_output: Option<StructuredOutput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<JsonValue>,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRequest {
    pub inputs: Vec<String>,
    pub dimensions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Chat(ChatRequest),
    Embedding(EmbeddingRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Chat,
    Embedding,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Chat => "chat",
            RequestKind::Embedding => "embedding",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    InvalidModel(ModelNameError),
    EmptyMessages,
    EmptyInput,
    StreamingUnsupported(RequestKind),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::InvalidModel(err) => write!(f, "{err}"),
            RequestError::EmptyMessages => write!(f, "messages must not be empty"),
            RequestError::EmptyInput => write!(f, "input must not be empty"),
            RequestError::StreamingUnsupported(kind) => {
                write!(f, "{} requests cannot be streamed", kind.as_str())
            }
        }
    }
}

impl std::error::Error for RequestError {}

impl From<ModelNameError> for RequestError {
    fn from(value: ModelNameError) -> Self {
        RequestError::InvalidModel(value)
    }
}

/// Immutable, validated request handed to the routing engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    model: ModelName,
    body: RequestBody,
    stream: bool,
    idempotency_key: String,
}

impl NormalizedRequest {
    pub fn new(
        model: &str,
        body: RequestBody,
        stream: bool,
        idempotency_key: Option<String>,
    ) -> Result<Self, RequestError> {
        let model = ModelName::parse(model)?;
        match &body {
            RequestBody::Chat(chat) if chat.messages.is_empty() => {
                return Err(RequestError::EmptyMessages);
            }
            RequestBody::Embedding(embedding) => {
                if embedding.inputs.is_empty() {
                    return Err(RequestError::EmptyInput);
                }
                if stream {
                    return Err(RequestError::StreamingUnsupported(RequestKind::Embedding));
                }
            }
            RequestBody::Chat(_) => {}
        }
        let idempotency_key = idempotency_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(Self {
            model,
            body,
            stream,
            idempotency_key,
        })
    }

    pub fn model(&self) -> &ModelName {
        &self.model
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn kind(&self) -> RequestKind {
        match self.body {
            RequestBody::Chat(_) => RequestKind::Chat,
            RequestBody::Embedding(_) => RequestKind::Embedding,
        }
    }
}

/// One provider to try, in selector order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCandidate {
    pub provider: String,
    /// Model id as it should be sent to this provider.
    pub model: String,
    pub rank: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl UsageCounters {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }
}

/// Usage reported mid-stream. Values are cumulative: a later hint replaces an
/// earlier one field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageHint {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssistantMessage {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResult {
    pub model: String,
    pub message: AssistantMessage,
    pub finish_reason: FinishReason,
    pub usage: Option<UsageCounters>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    pub model: String,
    pub vectors: Vec<Vec<f32>>,
    pub usage: Option<UsageCounters>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedResponse {
    Chat(ChatResult),
    Embedding(EmbeddingResult),
}

impl NormalizedResponse {
    pub fn usage(&self) -> Option<UsageCounters> {
        match self {
            NormalizedResponse::Chat(chat) => chat.usage,
            NormalizedResponse::Embedding(embedding) => embedding.usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

/// One normalized event on a streaming response, in upstream order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(StreamDelta),
    Usage(UsageHint),
    Finish(FinishReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_name_requires_one_namespace() {
        let name = ModelName::parse("acme/modelX").unwrap();
        assert_eq!(name.namespace(), "acme");
        assert_eq!(name.model(), "modelX");
        assert_eq!(name.to_string(), "acme/modelX");

        assert!(matches!(
            ModelName::parse("gpt-4o"),
            Err(ModelNameError::MissingNamespace(_))
        ));
        assert!(matches!(
            ModelName::parse("/gpt-4o"),
            Err(ModelNameError::MissingNamespace(_))
        ));
        assert!(matches!(
            ModelName::parse("a/b/c"),
            Err(ModelNameError::TooManySegments(_))
        ));
        assert!(matches!(ModelName::parse("  "), Err(ModelNameError::Empty)));
    }

    #[test]
    fn chat_requires_messages() {
        let chat = ChatRequest {
            messages: Vec::new(),
            tools: Vec::new(),
            tool_choice: None,
            params: GenerationParams::default(),
        };
        let err = NormalizedRequest::new("acme/modelX", RequestBody::Chat(chat), false, None)
            .unwrap_err();
        assert_eq!(err, RequestError::EmptyMessages);
    }

    #[test]
    fn embeddings_cannot_stream() {
        let body = RequestBody::Embedding(EmbeddingRequest {
            inputs: vec!["hello".to_string()],
            dimensions: None,
        });
        let err = NormalizedRequest::new("openai/text-embedding-3-small", body, true, None)
            .unwrap_err();
        assert!(matches!(err, RequestError::StreamingUnsupported(_)));
    }

    #[test]
    fn blank_idempotency_key_is_replaced() {
        let chat = ChatRequest {
            messages: vec![Message::text(Role::User, "hi")],
            tools: Vec::new(),
            tool_choice: None,
            params: GenerationParams::default(),
        };
        let req = NormalizedRequest::new(
            "acme/modelX",
            RequestBody::Chat(chat.clone()),
            false,
            Some("  ".to_string()),
        )
        .unwrap();
        assert!(!req.idempotency_key().trim().is_empty());

        let req = NormalizedRequest::new(
            "acme/modelX",
            RequestBody::Chat(chat),
            false,
            Some("key-1".to_string()),
        )
        .unwrap();
        assert_eq!(req.idempotency_key(), "key-1");
    }

    #[test]
    fn usage_total_saturates() {
        assert_eq!(UsageCounters::new(10, 12).total_tokens, 22);
        assert_eq!(UsageCounters::new(u64::MAX, 5).total_tokens, u64::MAX);
    }
}
