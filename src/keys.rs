//! Coordination-store key layout and the small prefix-trim helpers shared by
//! the registrar and the watcher.

pub const JOBS_PREFIX: &str = "jobs/";
pub const KILLER_PREFIX: &str = "killer/";
pub const LOCK_PREFIX: &str = "lock/";
pub const WORKERS_PREFIX: &str = "workers/";

pub fn job_key(name: &str) -> String {
    format!("{JOBS_PREFIX}{name}")
}

pub fn killer_key(name: &str) -> String {
    format!("{KILLER_PREFIX}{name}")
}

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_PREFIX}{name}")
}

pub fn worker_key(ip: &str) -> String {
    format!("{WORKERS_PREFIX}{ip}")
}

/// Strip the jobs prefix off a raw store key, yielding the job name.
pub fn extract_job_name(key: &str) -> Option<&str> {
    key.strip_prefix(JOBS_PREFIX)
}

/// Strip the killer prefix off a raw store key, yielding the job name.
pub fn extract_killer_name(key: &str) -> Option<&str> {
    key.strip_prefix(KILLER_PREFIX)
}

/// Strip the workers prefix off a raw store key, yielding the worker IP.
pub fn extract_worker_ip(key: &str) -> Option<&str> {
    key.strip_prefix(WORKERS_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_job_name() {
        let k = job_key("backup-db");
        assert_eq!(extract_job_name(&k), Some("backup-db"));
    }

    #[test]
    fn round_trips_killer_name() {
        let k = killer_key("backup-db");
        assert_eq!(extract_killer_name(&k), Some("backup-db"));
    }

    #[test]
    fn round_trips_worker_ip() {
        let k = worker_key("10.0.0.4");
        assert_eq!(extract_worker_ip(&k), Some("10.0.0.4"));
    }

    #[test]
    fn rejects_unrelated_key() {
        assert_eq!(extract_job_name("lock/backup-db"), None);
    }
}
