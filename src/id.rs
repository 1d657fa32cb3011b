//! Job identity helpers
//!
//! Jobs launched by a batch scheduler inherit its job id. Anything else gets
//! a generated one.

use std::env;

use rand::Rng;

/// Environment variables batch schedulers use for the job id, checked in order.
pub const SCHEDULER_JOB_ID_VARS: &[&str] = &["SLURM_JOB_ID", "PBS_JOBID", "LSB_JOBID"];

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a job ID
///
/// Format: `job-{timestamp_ms}-{random_hex}`
/// Example: `job-1738300800123-a1b2`
pub fn generate_job_id() -> String {
    let random: u16 = rand::rng().random();
    format!("job-{}-{:04x}", now_ms(), random)
}

/// Job id assigned by the surrounding batch scheduler, if any
pub fn job_id_from_env() -> Option<String> {
    job_id_from(|name| env::var(name).ok())
}

fn job_id_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    SCHEDULER_JOB_ID_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// Scheduler job id, or a generated one
pub fn resolve_job_id() -> String {
    job_id_from_env().unwrap_or_else(generate_job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        assert!(ts > 1577836800000); // 2020-01-01
        assert!(ts < 4102444800000); // 2100-01-01
    }

    #[test]
    fn test_generate_job_id_format() {
        let id = generate_job_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "job");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_job_id_prefers_slurm() {
        let id = job_id_from(|name| match name {
            "SLURM_JOB_ID" => Some("4242".into()),
            "PBS_JOBID" => Some("17.pbs-head".into()),
            _ => None,
        });
        assert_eq!(id.as_deref(), Some("4242"));
    }

    #[test]
    fn test_job_id_skips_blank_values() {
        let id = job_id_from(|name| match name {
            "SLURM_JOB_ID" => Some("  ".into()),
            "LSB_JOBID" => Some("991".into()),
            _ => None,
        });
        assert_eq!(id.as_deref(), Some("991"));
    }

    #[test]
    fn test_job_id_none_outside_scheduler() {
        assert_eq!(job_id_from(|_| None), None);
    }
}
