mod file;
mod gateway;

pub use file::{
    ApiKeySettings, CircuitSettings, ConfigError, ConfigFile, GatewaySection, PricingSettings,
    ProviderKindName, ProviderSettings, RouteTarget, RoutingSettings,
};
pub use gateway::{GatewayConfig, GatewayConfigError, GatewayConfigPatch};
