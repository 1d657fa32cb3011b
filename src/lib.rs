//! Claimr - coordinate independently launched jobs over a shared work list
//!
//! A single registry server hands out work items (keys) one at a time to
//! client jobs, records their completion, and reclaims work from jobs that
//! went silent. Clients speak a small versioned JSON protocol over TCP.

pub mod coordinator;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod id;
pub mod ipc;
pub mod registry;

pub use error::{ClaimrError, Result};
