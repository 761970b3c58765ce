//! Voice usage metering, quotas, and abuse detection
//!
//! Three layers: persistent counters ([`store`]), the per-session real-time
//! meter ([`tracker`]), and the advisory pattern detector ([`abuse`]).

pub mod abuse;
pub mod models;
pub mod store;
pub mod tracker;

pub use models::{LimitKind, UsageSummary};
pub use store::{SqliteUsageStore, StoreError, UsageStore};
pub use tracker::UsageTracker;
