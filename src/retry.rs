use std::time::Duration;

use chrono::Utc;
use resq_graceful_shutdown::GracefulShutdownConsumer;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::{error::Error, namespace::Namespace, payload::Failure, pool::RedisPool};

/// Periodically remove failure records whose retry has aged out. Runs only
/// when `max_age_retries` is nonzero.
pub(crate) fn start_retry_cleaner(
    pool: RedisPool,
    ns: Namespace,
    interval: Duration,
    max_age: Duration,
    mut shutdown: GracefulShutdownConsumer,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown_fut = shutdown.wait_for_shutdown();
        tokio::pin!(shutdown_fut);

        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_fut => break,
                _ = ticker.tick() => {},
            };

            if let Err(e) = clean_expired_retries(&pool, &ns, interval, max_age).await {
                event!(Level::ERROR, error=%e, "Error cleaning expired retries");
            }
        }
    })
}

async fn clean_expired_retries(
    pool: &RedisPool,
    ns: &Namespace,
    interval: Duration,
    max_age: Duration,
) -> Result<(), Error> {
    let mut conn = pool.get().await?;

    let lock: Option<String> = redis::cmd("SET")
        .arg(ns.retry_clean_lock())
        .arg(std::process::id())
        .arg("EX")
        .arg((interval.as_secs() / 2).max(1))
        .arg("NX")
        .query_async(&mut conn)
        .await?;
    if lock.is_none() {
        return Ok(());
    }

    let entries: Vec<String> = redis::cmd("LRANGE")
        .arg(ns.failed())
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await?;

    let now = Utc::now();
    let max_age =
        chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::max_value());
    let mut removed = 0usize;

    // Walk from the tail so indices of entries not yet visited stay valid
    // across our own removals.
    for (index, entry) in entries.iter().enumerate().rev() {
        let failure: Failure = match serde_json::from_str(entry) {
            Ok(failure) => failure,
            Err(e) => {
                event!(Level::WARN, index, error=%e, "Skipping undecodable failure entry");
                continue;
            }
        };

        let retried_at = match failure.retried_at {
            Some(retried_at) => retried_at,
            // Never retried; not ours to expire.
            None => continue,
        };

        let expired = retried_at
            .checked_add_signed(max_age)
            .map(|expires_at| expires_at < now)
            .unwrap_or(false);
        if expired {
            // The list only supports removal by content, so swap in a
            // sentinel that cannot collide with a real record and remove
            // that. A fresh UUID per deletion keeps it unique.
            let sentinel = uuid::Uuid::new_v4().to_string();
            redis::pipe()
                .cmd("LSET")
                .arg(ns.failed())
                .arg(index)
                .arg(&sentinel)
                .ignore()
                .cmd("LREM")
                .arg(ns.failed())
                .arg(1)
                .arg(&sentinel)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
            removed += 1;
        }
    }

    if removed > 0 {
        event!(Level::INFO, count=%removed, "Removed expired retried failures");
    }

    Ok(())
}
