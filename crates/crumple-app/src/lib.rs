pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod inflight;
pub mod orchestrator;
pub mod prepare;
pub mod schemas;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use crumple_core::cache::ResultCache;
use crate::client::HttpTransformClient;
use crate::config::AppConfig;
use crate::orchestrator::{TransformOrchestrator, TransformServices};
use crate::prepare::ResizingPreparer;

pub use crate::error::{ConfigError, OrchestratorError};
pub use crate::events::TransformEvent;

/// Wire the HTTP client, resizing preparer and cache described by `config`
pub fn build_services(config: &AppConfig) -> anyhow::Result<TransformServices> {
    let client = HttpTransformClient::new(config.service.clone())?;
    let cache = ResultCache::new(config.cache_capacity, config.cache_ttl)?;

    Ok(TransformServices::new(
        Arc::new(client),
        Arc::new(ResizingPreparer::new(config.max_dimension)),
        cache,
        config.retry,
    ))
}

pub fn build_orchestrator(config: &AppConfig) -> anyhow::Result<TransformOrchestrator> {
    let services = build_services(config)?;
    Ok(TransformOrchestrator::new(services, config.profiles.clone(), config.history_cap))
}
