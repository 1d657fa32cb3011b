//! Client side of work claiming
//!
//! A [`Coordinator`] owns one control channel connection and turns server
//! replies into typed results:
//! - `get_work` claims the next key or fails with `NoWorkAvailable`,
//!   `Remote`, or `Timeout`
//! - `report_done` never fails the job; an unconfirmed completion is logged
//! - `get_learner` maps the assigned key back onto the caller's local handles

pub mod retry;
pub mod telemetry;

pub use retry::RetryPolicy;
pub use telemetry::{Metric, ProcessSource, ProgressReporter, ProgressSource};

use std::time::Duration;

use log::{debug, info, warn};

use crate::domain::WorkItem;
use crate::error::{ClaimrError, Result};
use crate::ipc::{Command, IpcClient, IpcClientConfig, Reply};

/// Items fetched per status request; keeps each reply well under the frame cap.
pub const STATUS_PAGE: usize = 1000;

/// Connection settings for a [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:5555".to_string(),
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of reporting a key as finished.
#[derive(Debug)]
pub enum CompletionReport {
    /// The server recorded the completion.
    Acknowledged,
    /// The server has never heard of this key.
    UnknownKey,
    /// No confirmation arrived. The work itself is still done locally.
    Unconfirmed(ClaimrError),
}

impl CompletionReport {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, CompletionReport::Acknowledged)
    }
}

/// One job's view of the registry server.
pub struct Coordinator {
    client: IpcClient,
    retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let client = IpcClient::new(IpcClientConfig::with_endpoint(config.endpoint).timeout(config.timeout));
        Self {
            client,
            retry: config.retry,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    /// Claim the next work item, trying once.
    pub async fn get_work(&mut self, log_path: &str, job_id: &str, job_name: &str) -> Result<String> {
        let command = Command::Start {
            job_id: job_id.to_string(),
            log_path: log_path.to_string(),
            job_name: job_name.to_string(),
        };
        match self.client.request(command).await? {
            Reply::Assigned { key } => {
                info!("claimed key={} job_id={} job_name={}", key, job_id, job_name);
                Ok(key)
            }
            Reply::NoWork => Err(ClaimrError::NoWorkAvailable),
            Reply::Error { kind, message } => Err(ClaimrError::Remote { kind, message }),
            other => Err(unexpected("start", &other)),
        }
    }

    /// Claim the next work item, retrying transient failures with backoff.
    ///
    /// A timed-out attempt may still have claimed a key on the server. The
    /// retry carries the same job id, so the server hands that key back.
    pub async fn get_work_with_retry(&mut self, log_path: &str, job_id: &str, job_name: &str) -> Result<String> {
        let attempts = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            match self.get_work(log_path, job_id, job_name).await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "get_work attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Claim a key and resolve it to one of `learners`, paired by position
    /// with `fnames`.
    pub async fn get_learner<'a, T>(
        &mut self,
        learners: &'a [T],
        fnames: &[String],
        log_path: &str,
        job_id: &str,
        job_name: &str,
    ) -> Result<(&'a T, String)> {
        if learners.len() != fnames.len() {
            return Err(ClaimrError::Config(format!(
                "{} learners but {} file names",
                learners.len(),
                fnames.len()
            )));
        }
        let key = self.get_work_with_retry(log_path, job_id, job_name).await?;
        let learner = select_learner(learners, fnames, &key)?;
        Ok((learner, key))
    }

    /// Report `key` as finished. Never returns an error.
    pub async fn report_done(&mut self, key: &str) -> CompletionReport {
        let command = Command::Stop { key: key.to_string() };
        let report = match self.client.request(command).await {
            Ok(Reply::Ack { known: true }) => CompletionReport::Acknowledged,
            Ok(Reply::Ack { known: false }) => CompletionReport::UnknownKey,
            Ok(Reply::Error { kind, message }) => CompletionReport::Unconfirmed(ClaimrError::Remote { kind, message }),
            Ok(other) => CompletionReport::Unconfirmed(unexpected("stop", &other)),
            Err(e) => CompletionReport::Unconfirmed(e),
        };
        match &report {
            CompletionReport::Acknowledged => debug!("completion acknowledged key={}", key),
            CompletionReport::UnknownKey => warn!("server does not know key={}; completion ignored", key),
            CompletionReport::Unconfirmed(e) => warn!("completion of key={} not confirmed: {}", key, e),
        }
        report
    }

    /// Snapshot of every work item on the server, fetched in pages.
    pub async fn status(&mut self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        loop {
            let command = Command::Status {
                offset: items.len(),
                limit: Some(STATUS_PAGE),
            };
            match self.client.request(command).await? {
                Reply::Status { items: page, total } => {
                    let last = page.is_empty() || items.len() + page.len() >= total;
                    items.extend(page);
                    if last {
                        debug!("status fetched {} of {} items", items.len(), total);
                        return Ok(items);
                    }
                }
                Reply::Error { kind, message } => return Err(ClaimrError::Remote { kind, message }),
                other => return Err(unexpected("status", &other)),
            }
        }
    }
}

/// Find the learner paired with `key`.
pub fn select_learner<'a, T>(learners: &'a [T], fnames: &[String], key: &str) -> Result<&'a T> {
    fnames
        .iter()
        .position(|fname| fname == key)
        .and_then(|i| learners.get(i))
        .ok_or_else(|| ClaimrError::UnknownKey(key.to_string()))
}

/// One-shot claim without keeping a connection around.
pub async fn get_work(
    server_address: &str,
    log_path: &str,
    job_id: &str,
    job_name: &str,
    timeout: Duration,
) -> Result<String> {
    let config = CoordinatorConfig::with_endpoint(server_address).timeout(timeout);
    Coordinator::new(config).get_work(log_path, job_id, job_name).await
}

/// One-shot completion report.
pub async fn report_done(server_address: &str, key: &str, timeout: Duration) -> CompletionReport {
    let config = CoordinatorConfig::with_endpoint(server_address).timeout(timeout);
    Coordinator::new(config).report_done(key).await
}

fn unexpected(request: &str, reply: &Reply) -> ClaimrError {
    ClaimrError::Ipc(format!("Unexpected reply to {}: {:?}", request, reply))
}
