//! HTTP surface for tollgate: OpenAI-compatible endpoints over the routing engine.

mod error;
mod gateway;

pub use error::ApiError;
pub use gateway::{GatewayState, gateway_router};
