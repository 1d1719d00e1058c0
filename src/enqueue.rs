use chrono::{DateTime, Utc};

use crate::{
    error::Error,
    namespace::Namespace,
    payload::{Deferred, Payload},
    pool::RedisPool,
    settings::WorkerSettings,
    value::Value,
};

/// The producer side: push jobs for any Resque-family worker to pick up.
/// Usable standalone, without running a worker pool in this process.
#[derive(Clone)]
pub struct Enqueuer {
    pool: RedisPool,
    namespace: Namespace,
}

impl Enqueuer {
    pub fn new(settings: &WorkerSettings) -> Result<Enqueuer, Error> {
        Ok(Enqueuer {
            pool: RedisPool::new(settings)?,
            namespace: Namespace::new(settings.namespace.clone()),
        })
    }

    pub(crate) fn with_pool(pool: RedisPool, namespace: Namespace) -> Enqueuer {
        Enqueuer { pool, namespace }
    }

    /// Append a job to the tail of a queue and record the queue name.
    pub async fn enqueue(&self, queue: &str, class: &str, args: Vec<Value>) -> Result<(), Error> {
        let payload = Payload {
            class: class.to_string(),
            args,
        };
        let body = serde_json::to_vec(&payload)?;

        let mut conn = self.pool.get().await?;
        redis::pipe()
            .cmd("RPUSH")
            .arg(self.namespace.queue(queue))
            .arg(body)
            .ignore()
            .cmd("SADD")
            .arg(self.namespace.queues())
            .arg(queue)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Schedule a job for promotion onto its queue at `when`.
    pub async fn enqueue_at(
        &self,
        when: DateTime<Utc>,
        queue: &str,
        class: &str,
        args: Vec<Value>,
    ) -> Result<(), Error> {
        let deferred = Deferred {
            queue: queue.to_string(),
            class: class.to_string(),
            args: serde_json::to_value(&args)?,
        };
        let body = serde_json::to_vec(&deferred)?;

        let mut conn = self.pool.get().await?;
        redis::cmd("ZADD")
            .arg(self.namespace.deferred())
            .arg(when.timestamp())
            .arg(body)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Schedule a job `delay` from now.
    pub async fn enqueue_in(
        &self,
        delay: std::time::Duration,
        queue: &str,
        class: &str,
        args: Vec<Value>,
    ) -> Result<(), Error> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| Error::Config(format!("enqueue delay out of range: {}", e)))?;
        self.enqueue_at(Utc::now() + delay, queue, class, args).await
    }
}
