use std::{collections::HashMap, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use resq_graceful_shutdown::GracefulShutdownConsumer;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{event, Level};

use crate::{
    error::Error,
    namespace::Namespace,
    payload::{Failure, Work},
    pool::RedisPool,
    process::{close_identity, Process},
};

/// Periodically refresh this process's entry in the heartbeat hash. Stops
/// when the returned sender drops or shutdown begins.
pub(crate) fn start_heartbeat(
    pool: RedisPool,
    process: Process,
    ns: Namespace,
    interval: Duration,
    mut shutdown: GracefulShutdownConsumer,
) -> (oneshot::Sender<()>, JoinHandle<()>) {
    let (closer_tx, closer_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let shutdown_fut = shutdown.wait_for_shutdown();
        tokio::pin!(shutdown_fut);
        tokio::pin!(closer_rx);

        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_fut => break,
                _ = &mut closer_rx => break,
                _ = ticker.tick() => {},
            };

            let result = async {
                let mut conn = pool.get().await?;
                process.heartbeat(&ns, &mut conn).await
            }
            .await;

            if let Err(e) = result {
                event!(Level::ERROR, worker=%process, error=%e, "Error writing heartbeat");
            }
        }
    });

    (closer_tx, task)
}

/// Evict workers whose heartbeats have expired, marking any job they held
/// as failed. Guarded by a namespace-wide lock so at most one sweep runs
/// per heartbeat interval.
pub(crate) async fn prune_dead_workers(
    pool: &RedisPool,
    ns: &Namespace,
    identity: &str,
    heartbeat_interval: Duration,
    prune_interval: Duration,
) -> Result<(), Error> {
    let mut conn = pool.get().await?;

    let lock: Option<String> = redis::cmd("SET")
        .arg(ns.prune_lock())
        .arg(identity)
        .arg("EX")
        .arg(heartbeat_interval.as_secs().max(1))
        .arg("NX")
        .query_async(&mut conn)
        .await?;
    if lock.is_none() {
        // Another worker swept recently.
        return Ok(());
    }

    let workers: Vec<String> = redis::cmd("SMEMBERS")
        .arg(ns.workers())
        .query_async(&mut conn)
        .await?;
    let heartbeats: HashMap<String, String> = redis::cmd("HGETALL")
        .arg(ns.heartbeats())
        .query_async(&mut conn)
        .await?;

    let now = Utc::now();
    let max_age = chrono::Duration::from_std(prune_interval)
        .unwrap_or_else(|_| chrono::Duration::max_value());

    for worker in workers {
        let alive = heartbeats
            .get(&worker)
            .and_then(|beat| DateTime::parse_from_rfc3339(beat).ok())
            .map(|beat| now.signed_duration_since(beat.with_timezone(&Utc)) < max_age)
            .unwrap_or(false);
        if alive {
            continue;
        }

        // Only touch entries that actually parse as worker identities; the
        // set can contain identities from other Resque implementations.
        if let Err(e) = Process::from_str(&worker) {
            event!(Level::WARN, worker=%worker, error=%e, "Skipping unparseable worker identity");
            continue;
        }

        event!(Level::INFO, worker=%worker, "Pruning dead worker");

        let envelope: Option<Vec<u8>> = redis::cmd("GET")
            .arg(ns.worker(&worker))
            .query_async(&mut conn)
            .await?;

        if let Some(bytes) = envelope {
            match serde_json::from_slice::<Work>(&bytes) {
                Ok(work) => {
                    let failure = Failure {
                        failed_at: now,
                        payload: work.payload.clone(),
                        exception: "Error".to_string(),
                        error: format!(
                            "Worker {} did not gracefully exit while processing {}",
                            worker, work.payload.class
                        ),
                        backtrace: Vec::new(),
                        worker: worker.clone(),
                        queue: work.queue,
                        retried_at: None,
                    };
                    let body = serde_json::to_vec(&failure)?;
                    redis::cmd("RPUSH")
                        .arg(ns.failed())
                        .arg(body)
                        .query_async::<_, ()>(&mut conn)
                        .await?;
                }
                Err(e) => {
                    event!(Level::ERROR, worker=%worker, error=%e, "Dead worker had an undecodable work envelope");
                }
            }

            redis::cmd("DEL")
                .arg(ns.worker(&worker))
                .query_async::<_, ()>(&mut conn)
                .await?;
        }

        redis::cmd("DEL")
            .arg(ns.worker_started(&worker))
            .query_async::<_, ()>(&mut conn)
            .await?;

        close_identity(&worker, ns, &mut conn).await?;
    }

    Ok(())
}
