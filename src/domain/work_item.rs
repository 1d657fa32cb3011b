//! Work item record and its claim lifecycle
//!
//! A WorkItem moves `Pending -> Claimed -> Done`. A stale claim may be
//! released back to `Pending`. `Done` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single unit of work tracked by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier (usually a filename like "a.pkl")
    pub key: String,

    /// Job currently holding the claim
    pub claimed_by: Option<String>,

    /// Human-readable name of the claiming job
    pub job_name: Option<String>,

    /// When the current claim was granted
    pub claim_time: Option<DateTime<Utc>>,

    pub done: bool,
}

/// Derived state of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Pending,
    Claimed,
    Done,
}

impl WorkStatus {
    /// Returns true if the item can never change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Done)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkStatus::Pending => "PENDING",
            WorkStatus::Claimed => "CLAIMED",
            WorkStatus::Done => "DONE",
        };
        write!(f, "{}", s)
    }
}

impl WorkItem {
    /// Create a new unclaimed item
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            claimed_by: None,
            job_name: None,
            claim_time: None,
            done: false,
        }
    }

    pub fn status(&self) -> WorkStatus {
        if self.done {
            WorkStatus::Done
        } else if self.claimed_by.is_some() {
            WorkStatus::Claimed
        } else {
            WorkStatus::Pending
        }
    }

    /// Whether `claim` may hand this item out
    pub fn is_claimable(&self) -> bool {
        self.status() == WorkStatus::Pending
    }

    /// Grant an exclusive claim to `job_id`
    pub fn claim(&mut self, job_id: &str, job_name: &str, now: DateTime<Utc>) {
        self.claimed_by = Some(job_id.to_string());
        self.job_name = Some(job_name.to_string());
        self.claim_time = Some(now);
    }

    /// Return a claimed item to the pending pool
    pub fn release(&mut self) {
        self.claimed_by = None;
        self.job_name = None;
        self.claim_time = None;
    }

    /// Mark the item finished. The last claim holder is kept for auditing.
    pub fn complete(&mut self) {
        self.done = true;
    }

    /// True if the item is claimed and the claim was granted before `cutoff`
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status() == WorkStatus::Claimed && self.claim_time.is_some_and(|t| t < cutoff)
    }
}
