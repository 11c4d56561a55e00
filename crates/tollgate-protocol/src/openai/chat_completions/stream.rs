use serde::{Deserialize, Serialize};

use crate::gateway::ProviderMetadata;
use crate::openai::chat_completions::types::{ChatDelta, CompletionUsage, FinishReason};
use crate::openai::error::ErrorBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatCompletionChunkObjectType {
    #[serde(rename = "chat.completion.chunk")]
    ChatCompletionChunk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunkChoice {
    pub index: u32,
    pub delta: ChatDelta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: ChatCompletionChunkObjectType,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
    #[serde(
        rename = "providerMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_metadata: Option<ProviderMetadata>,
    /// Set on the final chunk when the stream ends early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ChatCompletionChunk {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            object: ChatCompletionChunkObjectType::ChatCompletionChunk,
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: None,
            provider_metadata: None,
            error: None,
        }
    }

    pub fn with_delta(mut self, delta: ChatDelta, finish_reason: Option<FinishReason>) -> Self {
        self.choices.push(ChatCompletionChunkChoice {
            index: 0,
            delta,
            finish_reason,
        });
        self
    }
}
