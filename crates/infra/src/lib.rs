//! Infrastructure layer: job queue and workers, quota ledger, cache,
//! resilience, configuration, and the Postgres/Redis adapters behind them.

pub mod cache;
pub mod config;
pub mod context;
pub mod jobs;
pub mod quota;
#[cfg(feature = "redis")]
pub mod redis_conn;
pub mod resilience;

#[cfg(test)]
mod integration_tests;

pub use config::{BulwarkConfig, ConfigError};
pub use context::{AppContext, ContextError};
