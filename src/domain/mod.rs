//! Domain types for claimr
//!
//! - WorkItem: one claimable unit of work and its claim state
//! - WorkStatus: derived lifecycle state (Pending, Claimed, Done)

pub mod work_item;

pub use work_item::{WorkItem, WorkStatus};
