pub mod anthropic;
pub mod openai;

use tollgate_provider_core::AdapterError;

fn encode_error(err: serde_json::Error) -> AdapterError {
    AdapterError::invalid_request(format!("failed to encode upstream request: {err}"))
}

fn malformed(what: &str, err: serde_json::Error) -> AdapterError {
    AdapterError::unavailable(format!("malformed upstream {what}: {err}"))
}
