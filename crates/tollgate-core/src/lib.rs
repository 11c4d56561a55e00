//! Routing engine for tollgate: candidate policy, failover, stream relaying and
//! cost settlement against the usage ledger.

pub mod auth;
pub mod bootstrap;
pub mod engine;
pub mod policy;
pub mod pricing;
pub mod relay;
pub mod selector;
pub mod upstream_client;
pub mod wire;

pub use auth::{AuthError, AuthSnapshot, KeyAuth, hash_api_key};
pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env, build_engine};
pub use engine::{
    CallerIdentity, Completion, CompletionBody, CreditScope, EngineSettings, RouteError,
    RoutingEngine, RoutingSnapshot, UnaryResponse, generation_id,
};
pub use policy::{PolicyError, RoutingPolicy};
pub use pricing::{CostRecord, PricingError, PricingTable};
pub use upstream_client::{UpstreamClientConfig, WreqUpstreamClient};
