//! Single-writer dispatcher that owns the work registry
//!
//! Connection tasks never touch the registry. They send each request to the
//! dispatcher over a channel and wait for the reply, so claims, completions
//! and stale sweeps are applied strictly one at a time.

use std::panic::{AssertUnwindSafe, catch_unwind};

use log::{error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::daemon::tick::{TickConfig, TickState};
use crate::error::Result;
use crate::ipc::{Command, ControlRequest, Reply, RequestHandler};
use crate::registry::{StateFile, WorkRegistry};

const CHANNEL_CAPACITY: usize = 256;

enum DaemonMsg {
    Request {
        command: Command,
        reply: oneshot::Sender<Reply>,
    },
    Shutdown,
}

/// Registry owner. Build one, then [`spawn`](Self::spawn) it.
pub struct Daemon {
    registry: WorkRegistry,
    state_file: Option<StateFile>,
    tick: TickConfig,
    stats: TickState,
    finished: Option<CancellationToken>,
}

impl Daemon {
    pub fn new(registry: WorkRegistry, state_file: Option<StateFile>, tick: TickConfig) -> Self {
        Self {
            registry,
            state_file,
            tick,
            stats: TickState::new(),
            finished: None,
        }
    }

    /// Resume from `state_file` if it holds a snapshot, otherwise seed from `keys`.
    pub fn open(keys: Vec<String>, state_file: Option<StateFile>, tick: TickConfig) -> Result<Self> {
        let resumed = match &state_file {
            Some(file) => file.load()?,
            None => None,
        };

        let registry = match resumed {
            Some(items) => {
                let registry = WorkRegistry::from_items(items)?;
                let counts = registry.counts();
                info!(
                    "resumed registry pending={} claimed={} done={}",
                    counts.pending, counts.claimed, counts.done
                );
                if !keys.is_empty() {
                    warn!("state file present, ignoring {} seed keys", keys.len());
                }
                registry
            }
            None => {
                let registry = WorkRegistry::new(keys)?;
                info!("seeded registry with {} items", registry.len());
                registry
            }
        };

        let daemon = Self::new(registry, state_file, tick);
        daemon.persist()?;
        Ok(daemon)
    }

    /// Cancel `token` once every item is done.
    pub fn with_finish_signal(mut self, token: CancellationToken) -> Self {
        self.finished = Some(token);
        self
    }

    pub fn registry(&self) -> &WorkRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &TickState {
        &self.stats
    }

    fn persist(&self) -> Result<()> {
        match &self.state_file {
            Some(file) => file.save(self.registry.items()),
            None => Ok(()),
        }
    }

    /// Apply one command to the registry.
    ///
    /// Never panics outward: a panic while handling is turned into an
    /// `internal` error reply.
    pub fn handle_command(&mut self, command: Command) -> Reply {
        self.stats.requests += 1;
        let name = command.name();
        let reply = match catch_unwind(AssertUnwindSafe(|| self.apply(command))) {
            Ok(reply) => reply,
            Err(_) => {
                error!("panic while handling {} request", name);
                Reply::internal(format!("server panicked while handling {}", name))
            }
        };
        if let Reply::Error { kind, message } = &reply {
            self.stats.errors += 1;
            warn!("{} failed kind={} message={}", name, kind, message);
        }
        reply
    }

    fn apply(&mut self, command: Command) -> Reply {
        match command {
            Command::Start {
                job_id,
                log_path,
                job_name,
            } => {
                info!("start job_id={} job_name={} log_path={}", job_id, job_name, log_path);
                let reissued = self.registry.held_by(&job_id).is_some();
                let Some(item) = self.registry.claim_next(&job_id, &job_name) else {
                    self.stats.record_claim(false);
                    info!("no work left for job_id={}", job_id);
                    return Reply::NoWork;
                };
                if let Err(e) = self.persist() {
                    // a reissued claim was already durable before this request
                    if !reissued {
                        self.registry.release(&item.key);
                    }
                    return Reply::internal(format!("failed to persist claim: {}", e));
                }
                self.stats.record_claim(true);
                Reply::Assigned { key: item.key }
            }
            Command::Stop { key } => {
                let before = self.registry.get(&key).cloned();
                let known = self.registry.mark_done(&key);
                if known {
                    if let Err(e) = self.persist() {
                        if let Some(item) = before {
                            self.registry.restore(item);
                        }
                        return Reply::internal(format!("failed to persist completion: {}", e));
                    }
                }
                self.stats.record_completion(known);
                if known {
                    self.signal_if_finished();
                }
                Reply::Ack { known }
            }
            Command::Status { offset, limit } => {
                let items = self.registry.items();
                let start = offset.min(items.len());
                let end = match limit {
                    Some(limit) => start.saturating_add(limit).min(items.len()),
                    None => items.len(),
                };
                Reply::Status {
                    items: items[start..end].to_vec(),
                    total: items.len(),
                }
            }
        }
    }

    /// Release stale claims once. Returns the released keys.
    pub fn sweep(&mut self) -> Vec<String> {
        let Some(timeout) = self.tick.stale_timeout else {
            return Vec::new();
        };
        let released = self.registry.release_stale_claims(timeout);
        if !released.is_empty() {
            self.stats.record_released(released.len());
            if let Err(e) = self.persist() {
                error!("failed to persist released claims: {}", e);
            }
        }
        released
    }

    fn signal_if_finished(&self) {
        if let Some(token) = &self.finished {
            if self.registry.is_finished() && !token.is_cancelled() {
                info!("all {} items done", self.registry.len());
                token.cancel();
            }
        }
    }

    /// Move the daemon onto its own task.
    ///
    /// The join handle yields the final registry after [`DaemonHandle::shutdown`].
    pub fn spawn(self) -> (DaemonHandle, JoinHandle<WorkRegistry>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.signal_if_finished();
        let join = tokio::spawn(self.run(rx));
        (DaemonHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DaemonMsg>) -> WorkRegistry {
        let mut sweep = if self.tick.sweeps_enabled() {
            let mut interval = tokio::time::interval(self.tick.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        } else {
            None
        };

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(DaemonMsg::Request { command, reply }) => {
                        let result = self.handle_command(command);
                        let _ = reply.send(result);
                    }
                    Some(DaemonMsg::Shutdown) | None => break,
                },
                _ = next_tick(&mut sweep) => {
                    self.sweep();
                }
            }
        }

        let counts = self.registry.counts();
        let stats = &self.stats;
        info!(
            "dispatcher stopped requests={} claims={} completions={} released={} errors={} pending={} claimed={} done={}",
            stats.requests,
            stats.claims,
            stats.completions,
            stats.released,
            stats.errors,
            counts.pending,
            counts.claimed,
            counts.done
        );
        self.registry
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Cloneable sender side of the dispatcher; serves as the IPC request handler.
#[derive(Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<DaemonMsg>,
}

impl DaemonHandle {
    /// Submit a command and wait for the dispatcher's reply.
    pub async fn submit(&self, command: Command) -> Reply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = DaemonMsg::Request {
            command,
            reply: reply_tx,
        };
        if self.tx.send(msg).await.is_err() {
            return Reply::unavailable("registry is shutting down");
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Reply::unavailable("registry stopped before replying"))
    }

    /// Ask the dispatcher to stop after the requests already queued.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(DaemonMsg::Shutdown).await;
    }
}

impl RequestHandler for DaemonHandle {
    fn handle(&self, request: ControlRequest) -> impl std::future::Future<Output = Reply> + Send {
        self.submit(request.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkStatus;
    use crate::ipc::ErrorKind;
    use std::time::Duration;
    use tempfile::TempDir;

    fn start(job: &str) -> Command {
        Command::Start {
            job_id: job.to_string(),
            log_path: format!("/logs/{job}.log"),
            job_name: format!("name-{job}"),
        }
    }

    fn stop(key: &str) -> Command {
        Command::Stop { key: key.to_string() }
    }

    fn daemon(keys: &[&str]) -> Daemon {
        let registry = WorkRegistry::new(keys.iter().copied()).unwrap();
        Daemon::new(registry, None, TickConfig::default())
    }

    #[test]
    fn test_start_assigns_in_order_then_no_work() {
        let mut d = daemon(&["a.pkl", "b.pkl"]);
        assert_eq!(d.handle_command(start("1")), Reply::Assigned { key: "a.pkl".into() });
        assert_eq!(d.handle_command(start("2")), Reply::Assigned { key: "b.pkl".into() });
        assert_eq!(d.handle_command(start("3")), Reply::NoWork);
        assert_eq!(d.stats().claims, 2);
        assert_eq!(d.stats().no_work, 1);
        assert_eq!(d.stats().errors, 0);
    }

    #[test]
    fn test_stop_unknown_key_acknowledged() {
        let mut d = daemon(&["a.pkl"]);
        assert_eq!(d.handle_command(stop("nope.pkl")), Reply::Ack { known: false });
        assert_eq!(d.registry().status("a.pkl"), Some(WorkStatus::Pending));
    }

    #[test]
    fn test_stop_claimed_marks_done() {
        let mut d = daemon(&["a.pkl", "b.pkl"]);
        d.handle_command(start("1"));
        d.handle_command(start("2"));
        assert_eq!(d.handle_command(stop("a.pkl")), Reply::Ack { known: true });
        assert_eq!(d.registry().status("a.pkl"), Some(WorkStatus::Done));
        assert_eq!(d.registry().status("b.pkl"), Some(WorkStatus::Claimed));
    }

    #[test]
    fn test_status_lists_items_in_order() {
        let mut d = daemon(&["a.pkl", "b.pkl"]);
        d.handle_command(start("1"));
        match d.handle_command(Command::Status { offset: 0, limit: None }) {
            Reply::Status { items, total } => {
                assert_eq!(total, 2);
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].key, "a.pkl");
                assert_eq!(items[0].claimed_by.as_deref(), Some("1"));
                assert_eq!(items[1].status(), WorkStatus::Pending);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_status_pages_through_items() {
        let mut d = daemon(&["a.pkl", "b.pkl", "c.pkl"]);
        let page = |d: &mut Daemon, offset, limit| match d.handle_command(Command::Status { offset, limit }) {
            Reply::Status { items, total } => (items.into_iter().map(|i| i.key).collect::<Vec<_>>(), total),
            other => panic!("unexpected reply: {:?}", other),
        };
        assert_eq!(page(&mut d, 0, Some(2)), (vec!["a.pkl".to_string(), "b.pkl".to_string()], 3));
        assert_eq!(page(&mut d, 2, Some(2)), (vec!["c.pkl".to_string()], 3));
        assert_eq!(page(&mut d, 5, Some(2)), (vec![], 3));
        assert_eq!(page(&mut d, 1, None).0.len(), 2);
    }

    #[test]
    fn test_retried_start_gets_same_key() {
        let mut d = daemon(&["a.pkl", "b.pkl"]);
        assert_eq!(d.handle_command(start("1")), Reply::Assigned { key: "a.pkl".into() });
        // first reply lost in transit, the job asks again
        assert_eq!(d.handle_command(start("1")), Reply::Assigned { key: "a.pkl".into() });
        assert_eq!(d.registry().counts().claimed, 1);
        assert_eq!(d.handle_command(start("2")), Reply::Assigned { key: "b.pkl".into() });
    }

    #[test]
    fn test_sweep_without_timeout_is_noop() {
        let mut d = daemon(&["a.pkl"]);
        d.handle_command(start("1"));
        assert!(d.sweep().is_empty());
    }

    #[test]
    fn test_sweep_releases_stale_claims() {
        let registry = WorkRegistry::new(["a.pkl"]).unwrap();
        let tick = TickConfig::default().with_stale_timeout(Duration::ZERO);
        let mut d = Daemon::new(registry, None, tick);
        d.handle_command(start("1"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(d.sweep(), vec!["a.pkl".to_string()]);
        assert_eq!(d.handle_command(start("2")), Reply::Assigned { key: "a.pkl".into() });
        assert_eq!(d.stats().released, 1);
    }

    #[test]
    fn test_open_seeds_and_persists() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("state.jsonl"));
        let mut d = Daemon::open(
            vec!["a.pkl".into(), "b.pkl".into()],
            Some(file.clone()),
            TickConfig::default(),
        )
        .unwrap();
        d.handle_command(start("1"));
        d.handle_command(stop("a.pkl"));

        let saved = file.load().unwrap().unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved[0].done);
        assert_eq!(saved[1].status(), WorkStatus::Pending);
    }

    #[test]
    fn test_open_resumes_existing_state() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("state.jsonl"));
        {
            let mut d = Daemon::open(vec!["a.pkl".into(), "b.pkl".into()], Some(file.clone()), TickConfig::default())
                .unwrap();
            d.handle_command(start("1"));
            d.handle_command(stop("a.pkl"));
        }

        // seed keys are ignored once a snapshot exists
        let mut d = Daemon::open(vec!["zzz.pkl".into()], Some(file), TickConfig::default()).unwrap();
        assert_eq!(d.registry().len(), 2);
        assert_eq!(d.handle_command(start("2")), Reply::Assigned { key: "b.pkl".into() });
        assert_eq!(d.handle_command(start("3")), Reply::NoWork);
    }

    #[test]
    fn test_persist_failure_rolls_back_claim() {
        let dir = TempDir::new().unwrap();
        // a directory where the state file should be makes every save fail
        let blocked = dir.path().join("state.jsonl");
        std::fs::create_dir_all(blocked.with_extension("jsonl.tmp")).unwrap();

        let registry = WorkRegistry::new(["a.pkl"]).unwrap();
        let mut d = Daemon::new(registry, Some(StateFile::new(&blocked)), TickConfig::default());
        match d.handle_command(start("1")) {
            Reply::Error { kind, .. } => assert_eq!(kind, ErrorKind::Internal),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(d.registry().status("a.pkl"), Some(WorkStatus::Pending));
        assert_eq!(d.stats().errors, 1);
    }

    #[test]
    fn test_persist_failure_rolls_back_completion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.jsonl");
        let registry = WorkRegistry::new(["a.pkl"]).unwrap();
        let mut d = Daemon::new(registry, Some(StateFile::new(&path)), TickConfig::default());
        assert_eq!(d.handle_command(start("1")), Reply::Assigned { key: "a.pkl".into() });

        std::fs::create_dir_all(path.with_extension("jsonl.tmp")).unwrap();
        match d.handle_command(stop("a.pkl")) {
            Reply::Error { kind, .. } => assert_eq!(kind, ErrorKind::Internal),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(d.registry().status("a.pkl"), Some(WorkStatus::Claimed));
        assert_eq!(d.registry().get("a.pkl").unwrap().claimed_by.as_deref(), Some("1"));
        assert_eq!(d.stats().completions, 0);

        // once the disk recovers the retried completion lands
        std::fs::remove_dir(path.with_extension("jsonl.tmp")).unwrap();
        assert_eq!(d.handle_command(stop("a.pkl")), Reply::Ack { known: true });
        assert!(file_has_done(&path));
    }

    #[test]
    fn test_persist_failure_keeps_reissued_claim() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.jsonl");
        let registry = WorkRegistry::new(["a.pkl"]).unwrap();
        let mut d = Daemon::new(registry, Some(StateFile::new(&path)), TickConfig::default());
        d.handle_command(start("1"));

        std::fs::create_dir_all(path.with_extension("jsonl.tmp")).unwrap();
        assert!(matches!(d.handle_command(start("1")), Reply::Error { .. }));
        assert_eq!(d.registry().status("a.pkl"), Some(WorkStatus::Claimed));
    }

    fn file_has_done(path: &std::path::Path) -> bool {
        StateFile::new(path).load().unwrap().unwrap().iter().any(|i| i.done)
    }

    #[tokio::test]
    async fn test_spawned_dispatcher_serializes_requests() {
        let (handle, join) = daemon(&["a.pkl", "b.pkl", "c.pkl"]).spawn();

        let mut tasks = Vec::new();
        for i in 0..6 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.submit(start(&i.to_string())).await }));
        }
        let mut assigned = Vec::new();
        let mut no_work = 0;
        for task in tasks {
            match task.await.unwrap() {
                Reply::Assigned { key } => assigned.push(key),
                Reply::NoWork => no_work += 1,
                other => panic!("unexpected reply: {:?}", other),
            }
        }
        assigned.sort();
        assert_eq!(assigned, vec!["a.pkl", "b.pkl", "c.pkl"]);
        assert_eq!(no_work, 3);

        handle.shutdown().await;
        let registry = join.await.unwrap();
        assert_eq!(registry.counts().claimed, 3);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_is_unavailable() {
        let (handle, join) = daemon(&["a.pkl"]).spawn();
        handle.shutdown().await;
        join.await.unwrap();
        match handle.submit(start("1")).await {
            Reply::Error { kind, .. } => assert_eq!(kind, ErrorKind::Unavailable),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finish_signal_fires_when_all_done() {
        let token = CancellationToken::new();
        let d = daemon(&["a.pkl"]).with_finish_signal(token.clone());
        let (handle, join) = d.spawn();
        handle.submit(start("1")).await;
        assert!(!token.is_cancelled());
        handle.submit(stop("a.pkl")).await;
        assert!(token.is_cancelled());
        handle.shutdown().await;
        join.await.unwrap();
    }
}
