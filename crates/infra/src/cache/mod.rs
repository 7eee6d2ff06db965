//! Multi-tier cache.
//!
//! ## Components
//!
//! - `LocalTier`: bounded in-process map with insertion-order eviction
//! - `SharedTier`: cross-process tier (in-memory or Redis) with a tag index
//! - `SharedTierLink`: connection state of the shared tier; failures degrade to local-only
//! - `CacheManager`: reads, writes, pattern/tag invalidation, warming and preload
//! - `InvalidationStrategy`: event-driven invalidation rules

pub mod invalidation;
pub mod local;
pub mod manager;
pub mod shared;

pub use invalidation::{fill_template, InvalidationReport, InvalidationStrategy, InvalidationTarget};
pub use local::LocalTier;
pub use manager::{
    CacheConfig, CacheError, CacheManager, CacheStats, Fetcher, PreloadOutcome, PreloadPriority, PreloadSpec,
    SetOptions, TierFlags, WarmReport,
};
#[cfg(feature = "redis")]
pub use shared::RedisSharedTier;
pub use shared::{InMemorySharedTier, LinkState, SharedTier, SharedTierError, SharedTierLink};
