//! Quota and rate-limit ledger.
//!
//! ## Components
//!
//! - `QuotaRecord`: per-caller daily/monthly windows, concurrency, tier, block
//! - `QuotaStore`: durable record storage (in-memory or Postgres)
//! - `WindowCounter`: per-minute/per-hour counters (in-memory or Redis)
//! - `QuotaLedger`: admission, usage accounting and administration

pub mod counter;
pub mod ledger;
pub mod postgres;
pub mod store;
pub mod types;

pub use counter::{CounterError, InMemoryWindowCounter, WindowCounter};
#[cfg(feature = "redis")]
pub use counter::RedisWindowCounter;
pub use ledger::{LedgerConfig, QuotaError, QuotaLedger};
pub use postgres::PostgresQuotaStore;
pub use store::{InMemoryQuotaStore, QuotaStore, QuotaStoreError, RecordMutation};
pub use types::{
    Admission, Block, Concurrency, DenyReason, QuotaRecord, QuotaSummary, RecordedUsage, Tier,
    TierLimits, TierTable, UsageSample, Window, WindowSummary,
};
