//! Work Registry - authoritative bookkeeping of work items and their claims
//!
//! Items are kept in insertion order, so claims are granted in the order the
//! work list was seeded. Every mutating operation takes `&mut self`; the server
//! owns the registry from a single dispatcher task, which gives the
//! one-writer-at-a-time discipline without an internal lock.

pub mod store;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::domain::{WorkItem, WorkStatus};
use crate::error::{ClaimrError, Result};

pub use store::{StateFile, read_keys_file};

/// Per-state item counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounts {
    pub pending: usize,
    pub claimed: usize,
    pub done: usize,
}

impl RegistryCounts {
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.done
    }
}

/// In-memory registry of all work items
#[derive(Debug, Clone, Default)]
pub struct WorkRegistry {
    items: Vec<WorkItem>,
    index: HashMap<String, usize>,
}

impl WorkRegistry {
    /// Seed a registry with pending items, one per key.
    ///
    /// Keys are identities, so duplicates are rejected.
    pub fn new<I, S>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_items(keys.into_iter().map(WorkItem::new).collect())
    }

    /// Rebuild a registry from previously persisted items.
    pub fn from_items(items: Vec<WorkItem>) -> Result<Self> {
        let mut index = HashMap::with_capacity(items.len());
        for (pos, item) in items.iter().enumerate() {
            if index.insert(item.key.clone(), pos).is_some() {
                return Err(ClaimrError::Config(format!("Duplicate work key: {}", item.key)));
            }
        }
        Ok(Self { items, index })
    }

    /// Claim the first pending item for `job_id`.
    ///
    /// A job that already holds a live claim gets that item back unchanged,
    /// so a retried `start` whose first reply was lost cannot strand a key.
    /// Returns `None` when nothing is left to hand out.
    pub fn claim_next(&mut self, job_id: &str, job_name: &str) -> Option<WorkItem> {
        self.claim_next_at(job_id, job_name, Utc::now())
    }

    /// Same as [`claim_next`](Self::claim_next) with an explicit clock.
    pub fn claim_next_at(&mut self, job_id: &str, job_name: &str, now: DateTime<Utc>) -> Option<WorkItem> {
        if let Some(held) = self.held_by(job_id) {
            info!("reissuing key={} to job_id={}", held.key, job_id);
            return Some(held.clone());
        }
        let item = self.items.iter_mut().find(|item| item.is_claimable())?;
        item.claim(job_id, job_name, now);
        info!("claimed key={} job_id={} job_name={}", item.key, job_id, job_name);
        Some(item.clone())
    }

    /// Transition `key` to done.
    ///
    /// Returns false only if the key is unknown. Completing an item that is
    /// already done is a no-op. A completion for an item that is not currently
    /// claimed (released after a stale timeout, or never claimed) still marks
    /// it done, since the work was evidently finished somewhere.
    pub fn mark_done(&mut self, key: &str) -> bool {
        let Some(&pos) = self.index.get(key) else {
            warn!("completion for unknown key={}", key);
            return false;
        };
        let item = &mut self.items[pos];
        match item.status() {
            WorkStatus::Done => {
                debug!("duplicate completion key={}", key);
            }
            WorkStatus::Claimed => {
                item.complete();
                info!("done key={} job_id={}", key, item.claimed_by.as_deref().unwrap_or("-"));
            }
            WorkStatus::Pending => {
                warn!("stale completion key={} (item was not claimed), marking done", key);
                item.complete();
            }
        }
        true
    }

    /// Return every claim older than `timeout` that has not completed to the
    /// pending pool. Returns the released keys.
    pub fn release_stale_claims(&mut self, timeout: Duration) -> Vec<String> {
        self.release_stale_claims_at(timeout, Utc::now())
    }

    /// Same as [`release_stale_claims`](Self::release_stale_claims) with an explicit clock.
    pub fn release_stale_claims_at(&mut self, timeout: Duration, now: DateTime<Utc>) -> Vec<String> {
        let Some(cutoff) = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|delta| now.checked_sub_signed(delta))
        else {
            return Vec::new();
        };

        let mut released = Vec::new();
        for item in self.items.iter_mut().filter(|item| item.is_stale(cutoff)) {
            warn!(
                "releasing stale claim key={} job_id={}",
                item.key,
                item.claimed_by.as_deref().unwrap_or("-")
            );
            item.release();
            released.push(item.key.clone());
        }
        released
    }

    /// The unfinished item currently claimed by `job_id`, if any.
    pub fn held_by(&self, job_id: &str) -> Option<&WorkItem> {
        self.items
            .iter()
            .find(|item| item.status() == WorkStatus::Claimed && item.claimed_by.as_deref() == Some(job_id))
    }

    /// Put back a previously read copy of an item. Returns false for unknown keys.
    pub fn restore(&mut self, item: WorkItem) -> bool {
        match self.index.get(&item.key) {
            Some(&pos) => {
                self.items[pos] = item;
                true
            }
            None => false,
        }
    }

    /// Undo a claim on `key`. Returns false unless the item was claimed.
    pub fn release(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&pos) if self.items[pos].status() == WorkStatus::Claimed => {
                self.items[pos].release();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&WorkItem> {
        self.index.get(key).map(|&pos| &self.items[pos])
    }

    pub fn status(&self, key: &str) -> Option<WorkStatus> {
        self.get(key).map(WorkItem::status)
    }

    /// All items in registry order
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for item in &self.items {
            match item.status() {
                WorkStatus::Pending => counts.pending += 1,
                WorkStatus::Claimed => counts.claimed += 1,
                WorkStatus::Done => counts.done += 1,
            }
        }
        counts
    }

    /// True once every item is done
    pub fn is_finished(&self) -> bool {
        self.items.iter().all(|item| item.done)
    }
}
