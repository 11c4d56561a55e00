//! Subset of the Anthropic Messages API the gateway translates to and from.

pub mod messages;
pub mod stream;

pub use messages::*;
pub use stream::*;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
