//! Best-effort progress telemetry for a running job
//!
//! A [`ProgressReporter`] samples a [`ProgressSource`] on an interval and logs
//! the metrics as `key=value` pairs. Sampling failures are logged at debug
//! and skipped; telemetry never affects the job.

use std::fmt::Write as _;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::task::JoinHandle;

use crate::error::{ClaimrError, Result};

/// One named measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub value: String,
}

impl Metric {
    pub fn new(name: &'static str, value: impl ToString) -> Self {
        Self {
            name,
            value: value.to_string(),
        }
    }
}

/// Something that can report progress metrics.
pub trait ProgressSource: Send + Sync {
    /// Sample every metric. Each entry may fail on its own.
    fn sample(&self) -> Vec<Result<Metric>>;
}

/// Elapsed wall time plus, where `/proc` is available, the resident memory
/// and CPU time of a process.
#[derive(Debug, Clone)]
pub struct ProcessSource {
    started: Instant,
    pid: Option<u32>,
}

impl ProcessSource {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            started: Instant::now(),
            pid,
        }
    }

    fn pid(&self) -> Result<u32> {
        self.pid
            .ok_or_else(|| ClaimrError::Config("no process to sample".into()))
    }

    fn rss_kb(&self) -> Result<u64> {
        let pid = self.pid()?;
        let status = fs::read_to_string(format!("/proc/{}/status", pid))?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("VmRSS:"))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse().ok())
            .ok_or_else(|| ClaimrError::Config(format!("VmRSS not reported for pid {}", pid)))
    }

    /// User plus system time in clock ticks.
    fn cpu_ticks(&self) -> Result<u64> {
        let pid = self.pid()?;
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;
        parse_cpu_ticks(&stat).ok_or_else(|| ClaimrError::Config(format!("unreadable stat for pid {}", pid)))
    }
}

/// utime + stime from a `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parens, so fields are counted from
/// the last `)`. utime and stime are fields 14 and 15 of the line.
pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

impl ProgressSource for ProcessSource {
    fn sample(&self) -> Vec<Result<Metric>> {
        vec![
            Ok(Metric::new("elapsed_s", self.started.elapsed().as_secs())),
            self.rss_kb().map(|kb| Metric::new("rss_kb", kb)),
            self.cpu_ticks().map(|ticks| Metric::new("cpu_ticks", ticks)),
        ]
    }
}

/// Render one sample as `key=value` pairs, skipping failed metrics.
pub fn format_sample(samples: Vec<Result<Metric>>) -> String {
    let mut line = String::new();
    for sample in samples {
        match sample {
            Ok(metric) => {
                if !line.is_empty() {
                    line.push(' ');
                }
                let _ = write!(line, "{}={}", metric.name, metric.value);
            }
            Err(e) => debug!("metric unavailable: {}", e),
        }
    }
    line
}

/// Periodic logger task. Stops when dropped.
pub struct ProgressReporter {
    task: JoinHandle<()>,
}

impl ProgressReporter {
    /// Start logging samples from `source` every `interval`, tagged with `key`.
    pub fn spawn(key: String, source: Arc<dyn ProgressSource>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick fires immediately; skip it so the first report comes after one interval
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let line = format_sample(source.sample());
                if !line.is_empty() {
                    info!("progress key={} {}", key, line);
                }
            }
        });
        Self { task }
    }

    pub fn stop(self) {}
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySource;

    impl ProgressSource for FlakySource {
        fn sample(&self) -> Vec<Result<Metric>> {
            vec![
                Ok(Metric::new("points", 120)),
                Err(ClaimrError::Config("loss not tracked by this learner".into())),
                Ok(Metric::new("npoints_per_s", "3.5")),
            ]
        }
    }

    struct CountingSource(Arc<AtomicUsize>);

    impl ProgressSource for CountingSource {
        fn sample(&self) -> Vec<Result<Metric>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            vec![Ok(Metric::new("n", 1))]
        }
    }

    #[test]
    fn test_format_sample_skips_failures() {
        let line = format_sample(FlakySource.sample());
        assert_eq!(line, "points=120 npoints_per_s=3.5");
    }

    #[test]
    fn test_format_sample_all_failed() {
        let line = format_sample(vec![Err(ClaimrError::Config("x".into()))]);
        assert!(line.is_empty());
    }

    #[test]
    fn test_process_source_without_pid() {
        let source = ProcessSource::new(None);
        let samples = source.sample();
        assert!(samples[0].is_ok());
        assert!(samples[1].is_err());
        assert!(samples[2].is_err());
    }

    #[test]
    fn test_parse_cpu_ticks() {
        let stat = "4242 (python3 (my job)) S 1 4242 4242 0 -1 4194304 1500 0 0 0 730 41 0 0 20 0 1 0 100 0 0";
        assert_eq!(parse_cpu_ticks(stat), Some(771));
        assert_eq!(parse_cpu_ticks("4242 (x) S 1 2"), None);
        assert_eq!(parse_cpu_ticks("no parens here"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_source_samples_own_process() {
        let source = ProcessSource::new(Some(std::process::id()));
        let line = format_sample(source.sample());
        assert!(line.contains("rss_kb="), "{}", line);
        assert!(line.contains("cpu_ticks="), "{}", line);
    }

    #[tokio::test]
    async fn test_reporter_samples_until_dropped() {
        let count = Arc::new(AtomicUsize::new(0));
        let reporter = ProgressReporter::spawn(
            "a.pkl".into(),
            Arc::new(CountingSource(Arc::clone(&count))),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        reporter.stop();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several samples, got {}", seen);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
