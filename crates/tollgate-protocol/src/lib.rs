//! Wire types spoken by the gateway: the OpenAI-compatible surface it exposes,
//! the Anthropic Messages API it translates to, and the SSE framing shared by both.

pub mod anthropic;
pub mod gateway;
pub mod openai;
pub mod sse;
