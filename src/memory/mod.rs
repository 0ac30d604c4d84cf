//! Guest memory management
//!
//! - `stats` - per-VM memory samples from `vm.info` and the guest daemon
//! - `controller` - periodic balloon sizing
//! - `stats_store` - persisted sample history

pub mod controller;
pub mod stats;
pub mod stats_store;

pub use controller::{calculate_target_balloon, CycleReport, MemoryController};
pub use stats::{GuestMemoryReport, VMMemoryStats};
pub use stats_store::{MemoryStatsRecord, StatsStore};
