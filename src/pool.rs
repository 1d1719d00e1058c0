use std::{ops::Deref, sync::Arc};

use crate::{error::Error, settings::WorkerSettings};

/// Shared Redis connection pool. Every logical operation checks a
/// connection out, runs its commands, and returns it; connections never
/// escape the call that acquired them.
#[derive(Clone)]
pub struct RedisPool(Arc<RedisPoolInner>);

struct RedisPoolInner {
    pool: deadpool_redis::Pool,
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool").finish()
    }
}

impl Deref for RedisPool {
    type Target = deadpool_redis::Pool;

    fn deref(&self) -> &Self::Target {
        &self.0.pool
    }
}

impl RedisPool {
    pub fn new(settings: &WorkerSettings) -> Result<RedisPool, Error> {
        let mut url = settings.resolve_uri();

        if !(url.starts_with("redis://") || url.starts_with("rediss://") || url.starts_with("unix://")) {
            return Err(Error::Config(format!(
                "invalid Redis database URI scheme in {:?}",
                url
            )));
        }

        if settings.skip_tls_verify && url.starts_with("rediss://") && !url.contains('#') {
            // The client treats this fragment as "accept any certificate".
            url.push_str("#insecure");
        }

        // One connection per executor plus one for the poller, so workers
        // recording results can never starve the producer.
        let size = settings.connections.max(settings.concurrency + 1);

        let pool = deadpool_redis::Config {
            url: Some(url),
            connection: None,
            pool: Some(deadpool::managed::PoolConfig::new(size)),
        }
        .create_pool()?;

        Ok(RedisPool(Arc::new(RedisPoolInner { pool })))
    }

    pub fn pool(&self) -> &deadpool_redis::Pool {
        &self.0.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn rejects_unknown_scheme() {
        let settings = WorkerSettings {
            uri: "http://localhost:6379/".to_string(),
            ..WorkerSettings::default()
        };
        assert_matches!(RedisPool::new(&settings), Err(Error::Config(_)));
    }

    #[test]
    fn accepts_redis_scheme() {
        let settings = WorkerSettings {
            uri: "redis://localhost:6379/".to_string(),
            ..WorkerSettings::default()
        };
        assert!(RedisPool::new(&settings).is_ok());
    }
}
