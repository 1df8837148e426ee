pub mod adapters;
pub mod config;
pub mod orchestrator;
pub mod providers;

pub use adapters::{build_adapters, build_http_client, ProviderAdapter};
pub use config::{AiProviderInfo, FanOutPolicy, ProviderEndpoint};
pub use orchestrator::FanOutOrchestrator;
pub use providers::{ProviderId, ProviderRoute};
