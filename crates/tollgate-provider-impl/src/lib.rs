mod http_adapter;
mod kind;
pub mod providers;

use std::sync::Arc;

use tollgate_provider_core::{AdapterRegistry, UpstreamClient};

pub use http_adapter::{HttpProviderAdapter, ProviderSpec};
pub use kind::ProviderKind;

/// Builds one adapter per spec, all sharing `client` for IO.
pub fn build_registry(specs: Vec<ProviderSpec>, client: Arc<dyn UpstreamClient>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for spec in specs {
        registry.register(Arc::new(HttpProviderAdapter::new(spec, client.clone())));
    }
    registry
}
