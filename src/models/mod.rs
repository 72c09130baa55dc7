//! Core data types shared across the engine.

mod work_item;

pub use work_item::{PageRecord, StatsSnapshot, StoreStats, WorkItem, WorkState};
