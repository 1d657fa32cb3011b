//! Sweep timing and dispatcher counters
//!
//! The dispatcher ticks on `sweep_interval` and releases claims older than
//! `stale_timeout`. With no stale timeout configured, claims are never
//! released and no ticks are scheduled.

use std::time::Duration;

/// Configuration for the periodic stale-claim sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickConfig {
    /// Interval between sweeps
    pub sweep_interval: Duration,
    /// Age after which an unfinished claim is released
    pub stale_timeout: Option<Duration>,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            stale_timeout: None,
        }
    }
}

impl TickConfig {
    pub fn new(sweep_interval: Duration, stale_timeout: Option<Duration>) -> Self {
        Self {
            sweep_interval,
            stale_timeout,
        }
    }

    /// Set the stale claim timeout
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = Some(timeout);
        self
    }

    pub fn sweeps_enabled(&self) -> bool {
        self.stale_timeout.is_some() && !self.sweep_interval.is_zero()
    }
}

/// Counters kept by the dispatcher for the shutdown summary
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickState {
    /// Requests handled
    pub requests: u64,
    /// Work items handed out
    pub claims: u64,
    /// `start` requests answered with no work
    pub no_work: u64,
    /// Completions accepted for known keys
    pub completions: u64,
    /// Completions for keys the registry never had
    pub unknown_completions: u64,
    /// Stale claims returned to the pool
    pub released: u64,
    /// Requests answered with an error
    pub errors: u64,
}

impl TickState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_claim(&mut self, claimed: bool) {
        if claimed {
            self.claims += 1;
        } else {
            self.no_work += 1;
        }
    }

    pub fn record_completion(&mut self, known: bool) {
        if known {
            self.completions += 1;
        } else {
            self.unknown_completions += 1;
        }
    }

    pub fn record_released(&mut self, count: usize) {
        self.released += count as u64;
    }
}
