pub mod chat_completions;
pub mod embeddings;
pub mod error;
pub mod models;

pub use chat_completions::request::{ChatCompletionRequest, StopConfiguration};
pub use chat_completions::response::{ChatCompletionChoice, ChatCompletionResponse};
pub use chat_completions::stream::{ChatCompletionChunk, ChatCompletionChunkChoice};
pub use chat_completions::types::*;
pub use embeddings::{
    Embedding, EmbeddingInput, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage,
};
pub use error::{ErrorBody, ErrorResponse};
pub use models::{ModelList, ModelObject};
