use std::{collections::HashMap, env, time::Duration};

use crate::error::Error;

pub const DEFAULT_URI: &str = "redis://localhost:6379/";

/// Everything the worker pool needs to know up front. Construct with
/// `Default` and override fields, or pull overrides from the environment
/// with [`WorkerSettings::from_env`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Comma-separated `name[=weight]` list. Any `=` in the spec selects
    /// weighted (non-strict) mode; otherwise queues are consulted strictly
    /// in declaration order.
    pub queues: String,
    /// Optional queue-name -> priority map used in non-strict mode. Lower
    /// values are consulted first; missing or negative entries count as 0.
    pub priorities: HashMap<String, i32>,
    /// Seconds to sleep when every queue is empty.
    pub interval: f64,
    /// Number of concurrent job executors.
    pub concurrency: usize,
    /// Floor for the Redis connection pool. The pool is always at least
    /// `concurrency + 1` so the poller cannot be starved by busy workers.
    pub connections: usize,
    /// Redis URI. When empty, resolution falls back to the env var named by
    /// `$REDIS_PROVIDER`, then `$REDIS_URL`, then localhost.
    pub uri: String,
    pub namespace: String,
    /// Stop once every queue has been drained.
    pub exit_on_complete: bool,
    /// Decode JSON numbers losslessly instead of into i64/f64.
    pub use_number: bool,
    /// Disable certificate verification for `rediss://` URIs.
    pub skip_tls_verify: bool,
    /// Accepted for parity with other Resque workers; certificate loading
    /// happens in the Redis client layer, not here.
    pub tls_cert_path: Option<String>,
    /// Age after which a retried failure record is removed from the failed
    /// list. Zero disables the cleaner.
    pub max_age_retries: Duration,
    pub heartbeat_interval: Duration,
    pub retry_clean_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> WorkerSettings {
        WorkerSettings {
            queues: String::new(),
            priorities: HashMap::new(),
            interval: 5.0,
            concurrency: 25,
            connections: 2,
            uri: String::new(),
            namespace: "resque:".to_string(),
            exit_on_complete: false,
            use_number: false,
            skip_tls_verify: false,
            tls_cert_path: None,
            max_age_retries: Duration::from_secs(0),
            heartbeat_interval: Duration::from_secs(60),
            retry_clean_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerSettings {
    /// Defaults overridden by whatever is present in the environment.
    pub fn from_env() -> Result<WorkerSettings, Error> {
        let mut settings = WorkerSettings::default();

        if let Ok(queues) = env::var("QUEUES") {
            settings.queues = queues;
        }
        if let Some(interval) = parse_env_var::<f64>("INTERVAL")? {
            settings.interval = interval;
        }
        if let Some(concurrency) = parse_env_var::<usize>("CONCURRENCY")? {
            settings.concurrency = concurrency;
        }
        if let Some(connections) = parse_env_var::<usize>("CONNECTIONS")? {
            settings.connections = connections;
        }
        if let Ok(namespace) = env::var("NAMESPACE") {
            settings.namespace = namespace;
        }
        if let Some(exit_on_complete) = parse_env_var::<bool>("EXIT_ON_COMPLETE")? {
            settings.exit_on_complete = exit_on_complete;
        }
        if let Some(use_number) = parse_env_var::<bool>("USE_NUMBER")? {
            settings.use_number = use_number;
        }
        if let Some(skip_tls_verify) = parse_env_var::<bool>("SKIP_TLS_VERIFY")? {
            settings.skip_tls_verify = skip_tls_verify;
        }
        if let Ok(path) = env::var("TLS_CERT_PATH") {
            settings.tls_cert_path = Some(path);
        }
        if let Some(max_age) = parse_env_var::<f64>("MAX_AGE_RETRIES")? {
            settings.max_age_retries = duration_from_secs(max_age, "MAX_AGE_RETRIES")?;
        }
        if let Some(heartbeat) = parse_env_var::<f64>("HEARTBEAT_INTERVAL")? {
            settings.heartbeat_interval = duration_from_secs(heartbeat, "HEARTBEAT_INTERVAL")?;
        }

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrency < 1 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.connections < 1 {
            return Err(Error::Config("connections must be at least 1".to_string()));
        }
        if !(self.interval > 0.0) {
            return Err(Error::Config(
                "interval must be a positive number of seconds".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    /// Heartbeats older than this mark a worker as dead.
    pub fn prune_interval(&self) -> Duration {
        self.heartbeat_interval * 5
    }

    /// Resolve the Redis URI: the explicit setting wins, then the env var
    /// named by `$REDIS_PROVIDER`, then `$REDIS_URL`, then localhost.
    pub fn resolve_uri(&self) -> String {
        if !self.uri.is_empty() {
            return self.uri.clone();
        }

        if let Ok(provider) = env::var("REDIS_PROVIDER") {
            if !provider.is_empty() {
                if let Ok(uri) = env::var(&provider) {
                    if !uri.is_empty() {
                        return uri;
                    }
                }
            }
        }

        match env::var("REDIS_URL") {
            Ok(uri) if !uri.is_empty() => uri,
            _ => DEFAULT_URI.to_string(),
        }
    }
}

fn duration_from_secs(secs: f64, name: &str) -> Result<Duration, Error> {
    if !(secs >= 0.0) || !secs.is_finite() {
        return Err(Error::Config(format!(
            "${} must be a non-negative number of seconds",
            name
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Error> {
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("could not parse ${}={}", name, value))),
        Err(_) => Ok(None),
    }
}

/// Expand a `name[=weight]` queue spec into the consulted queue list.
///
/// A queue with weight `w` appears `w` times, in declaration order. Returns
/// the expanded list and whether strict (declaration-order) selection is in
/// effect; any `=` in the spec switches to weighted mode.
pub fn parse_queues(spec: &str) -> Result<(Vec<String>, bool), Error> {
    let strict = !spec.contains('=');
    let mut queues = Vec::new();

    for part in spec.split(',') {
        if part.is_empty() {
            continue;
        }

        match part.split_once('=') {
            Some((name, weight)) => {
                let weight: usize = weight.parse().map_err(|_| {
                    Error::Config("the weight must be a numeric value".to_string())
                })?;
                if !name.is_empty() {
                    for _ in 0..weight {
                        queues.push(name.to_string());
                    }
                }
            }
            None => queues.push(part.to_string()),
        }
    }

    if queues.is_empty() {
        return Err(Error::Config(
            "you must specify at least one queue".to_string(),
        ));
    }

    Ok((queues, strict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    // Serialize the tests that mutate process environment variables.
    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[test]
    fn queue_spec_expansion() {
        let cases: Vec<(&str, Option<(Vec<&str>, bool)>)> = vec![
            ("", None),
            ("high", Some((vec!["high"], true))),
            ("high,low", Some((vec!["high", "low"], true))),
            ("high=2,low=1", Some((vec!["high", "high", "low"], false))),
            ("high=2,low", Some((vec!["high", "high", "low"], false))),
            ("low=1,high=2", Some((vec!["low", "high", "high"], false))),
            ("low=,high=2", None),
            ("low=a,high=2", None),
            ("low=", None),
            ("low=a", None),
            ("high=2,,,=1", Some((vec!["high", "high"], false))),
            (",,,", None),
            ("=1", None),
        ];

        for (spec, expected) in cases {
            let actual = parse_queues(spec);
            match expected {
                Some((queues, strict)) => {
                    let (actual_queues, actual_strict) =
                        actual.unwrap_or_else(|e| panic!("spec {:?} failed: {}", spec, e));
                    assert_eq!(actual_queues, queues, "spec {:?}", spec);
                    assert_eq!(actual_strict, strict, "spec {:?}", spec);
                }
                None => {
                    assert_matches!(actual, Err(Error::Config(_)), "spec {:?}", spec);
                }
            }
        }
    }

    #[test]
    fn weight_expansion_total() {
        let (queues, _) = parse_queues("a=3,b=2,c=1").expect("parsing");
        assert_eq!(queues.len(), 6);
        assert_eq!(queues, vec!["a", "a", "a", "b", "b", "c"]);
    }

    #[test]
    fn zero_weight_drops_queue() {
        let (queues, strict) = parse_queues("a=0,b=1").expect("parsing");
        assert_eq!(queues, vec!["b"]);
        assert_eq!(strict, false);
    }

    #[test]
    fn uri_resolution_precedence() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("REDIS_PROVIDER");
        env::remove_var("REDIS_URL");

        let mut settings = WorkerSettings::default();
        assert_eq!(settings.resolve_uri(), DEFAULT_URI);

        env::set_var("REDIS_URL", "redis://from-url:6379/");
        assert_eq!(settings.resolve_uri(), "redis://from-url:6379/");

        env::set_var("CUSTOM_REDIS", "redis://from-provider:6379/");
        env::set_var("REDIS_PROVIDER", "CUSTOM_REDIS");
        assert_eq!(settings.resolve_uri(), "redis://from-provider:6379/");

        settings.uri = "redis://explicit:6379/".to_string();
        assert_eq!(settings.resolve_uri(), "redis://explicit:6379/");

        env::remove_var("REDIS_PROVIDER");
        env::remove_var("CUSTOM_REDIS");
        env::remove_var("REDIS_URL");
    }

    #[test]
    fn from_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("QUEUES", "high=2,low=1");
        env::set_var("CONCURRENCY", "4");
        env::set_var("EXIT_ON_COMPLETE", "true");

        let settings = WorkerSettings::from_env().expect("from_env");
        assert_eq!(settings.queues, "high=2,low=1");
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.exit_on_complete, true);
        // Untouched fields keep their defaults.
        assert_eq!(settings.interval, 5.0);
        assert_eq!(settings.namespace, "resque:");

        env::set_var("CONCURRENCY", "not-a-number");
        assert_matches!(WorkerSettings::from_env(), Err(Error::Config(_)));

        env::remove_var("QUEUES");
        env::remove_var("CONCURRENCY");
        env::remove_var("EXIT_ON_COMPLETE");
    }

    #[test]
    fn validation() {
        let mut settings = WorkerSettings::default();
        assert_matches!(settings.validate(), Ok(()));

        settings.concurrency = 0;
        assert_matches!(settings.validate(), Err(Error::Config(_)));

        settings.concurrency = 1;
        settings.interval = 0.0;
        assert_matches!(settings.validate(), Err(Error::Config(_)));
    }
}
