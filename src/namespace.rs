/// Builder for every Redis key this crate touches. The key layout is the
/// Resque wire contract, so external dashboards and enqueuers can observe
/// this worker; none of these formats can change without breaking interop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

pub const DEFAULT_NAMESPACE: &str = "resque:";

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Namespace {
        Namespace(prefix.into())
    }

    pub fn prefix(&self) -> &str {
        self.0.as_str()
    }

    /// The FIFO list of JSON payloads for one queue.
    pub fn queue(&self, name: &str) -> String {
        format!("{}queue:{}", self.0, name)
    }

    /// The set of known queue names.
    pub fn queues(&self) -> String {
        format!("{}queues", self.0)
    }

    /// The set of live worker identities.
    pub fn workers(&self) -> String {
        format!("{}workers", self.0)
    }

    /// The in-flight work envelope for one worker.
    pub fn worker(&self, identity: &str) -> String {
        format!("{}worker:{}", self.0, identity)
    }

    pub fn worker_started(&self, identity: &str) -> String {
        format!("{}worker:{}:started", self.0, identity)
    }

    pub fn stat_processed(&self) -> String {
        format!("{}stat:processed", self.0)
    }

    pub fn stat_processed_for(&self, identity: &str) -> String {
        format!("{}stat:processed:{}", self.0, identity)
    }

    pub fn stat_failed(&self) -> String {
        format!("{}stat:failed", self.0)
    }

    pub fn stat_failed_for(&self, identity: &str) -> String {
        format!("{}stat:failed:{}", self.0, identity)
    }

    /// The list of failure records.
    pub fn failed(&self) -> String {
        format!("{}failed", self.0)
    }

    /// The sorted set of deferred jobs, scored by scheduled unix time.
    pub fn deferred(&self) -> String {
        format!("{}_deferred", self.0)
    }

    /// The identity -> RFC3339 timestamp heartbeat hash.
    pub fn heartbeats(&self) -> String {
        format!("{}workers:heartbeat", self.0)
    }

    pub fn prune_lock(&self) -> String {
        format!("{}pruning_dead_workers_in_progress", self.0)
    }

    pub fn retry_clean_lock(&self) -> String {
        format!("{}cleaning_expired_retried_in_progress", self.0)
    }
}

impl Default for Namespace {
    fn default() -> Namespace {
        Namespace(DEFAULT_NAMESPACE.to_string())
    }
}
