use std::time::Duration;

use chrono::Utc;
use resq_graceful_shutdown::{GracefulShutdownConsumer, ShutdownTrigger};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{event, Level};

use crate::{
    error::Error,
    heartbeat,
    namespace::Namespace,
    payload::{Deferred, Job},
    pool::RedisPool,
    process::Process,
    selector::QueueSelector,
};

// KEYS:
//  1. deferred sorted set
// ARGV:
//  1. current unix time
//
// Pops the earliest deferral if it is due. Removal and the score check run
// inside one script so concurrent pollers cannot promote the same entry
// twice.
const PROMOTE_DEFERRED_SCRIPT: &str = r##"
    local v = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
    if v[2] and tonumber(v[2]) <= tonumber(ARGV[1]) then
        redis.call('ZREMRANGEBYRANK', KEYS[1], 0, 0)
        return v[1]
    end
    return false
"##;

/// The single producer: consults queues in selector order and hands decoded
/// jobs to the worker pool over a bounded channel.
pub(crate) struct Poller {
    process: Process,
    identity: String,
    pool: RedisPool,
    namespace: Namespace,
    selector: QueueSelector,
    interval: Duration,
    heartbeat_interval: Duration,
    exit_on_complete: bool,
    use_number: bool,
    promote_script: redis::Script,
}

pub(crate) struct PollerConfig {
    pub pool: RedisPool,
    pub namespace: Namespace,
    pub selector: QueueSelector,
    pub interval: Duration,
    pub heartbeat_interval: Duration,
    pub exit_on_complete: bool,
    pub use_number: bool,
}

impl Poller {
    pub(crate) fn new(config: PollerConfig) -> Result<Poller, Error> {
        let process = Process::new("poller", config.selector.queues().to_vec())?;
        let identity = process.to_string();

        Ok(Poller {
            process,
            identity,
            pool: config.pool,
            namespace: config.namespace,
            selector: config.selector,
            interval: config.interval,
            heartbeat_interval: config.heartbeat_interval,
            exit_on_complete: config.exit_on_complete,
            use_number: config.use_number,
            promote_script: redis::Script::new(PROMOTE_DEFERRED_SCRIPT),
        })
    }

    /// Spawn the poll task. The job channel closes when the task ends, which
    /// is what tells the workers to drain and exit.
    pub(crate) fn start(
        self,
        jobs: mpsc::Sender<Job>,
        shutdown: GracefulShutdownConsumer,
        trigger: ShutdownTrigger,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(jobs, shutdown, trigger).await {
                event!(Level::ERROR, worker=%self.identity, error=%e, "Poller terminated with error");
            }
        })
    }

    async fn run(
        &self,
        jobs: mpsc::Sender<Job>,
        mut shutdown: GracefulShutdownConsumer,
        trigger: ShutdownTrigger,
    ) -> Result<(), Error> {
        {
            let mut conn = self.pool.get().await?;
            self.process.open(&self.namespace, &mut conn).await?;
            self.process.start(&self.namespace, &mut conn).await?;
        }
        event!(Level::INFO, worker=%self.identity, "Poller started");

        let (heartbeat_closer, heartbeat_task) = heartbeat::start_heartbeat(
            self.pool.clone(),
            self.process.clone(),
            self.namespace.clone(),
            self.heartbeat_interval,
            shutdown.clone(),
        );

        let result = self.poll_loop(&jobs, &mut shutdown, &trigger).await;
        if let Err(e) = &result {
            event!(Level::ERROR, worker=%self.identity, error=%e, "Poll loop failed");
        }

        drop(heartbeat_closer);
        let _ = heartbeat_task.await;

        let teardown = async {
            let mut conn = self.pool.get().await?;
            self.process.finish(&self.namespace, &mut conn).await?;
            self.process.close(&self.namespace, &mut conn).await
        }
        .await;
        if let Err(e) = teardown {
            event!(Level::ERROR, worker=%self.identity, error=%e, "Error closing poller");
        }
        event!(Level::INFO, worker=%self.identity, "Poller stopped");

        result
    }

    async fn poll_loop(
        &self,
        jobs: &mpsc::Sender<Job>,
        shutdown: &mut GracefulShutdownConsumer,
        trigger: &ShutdownTrigger,
    ) -> Result<(), Error> {
        loop {
            if shutdown.shutting_down() {
                return Ok(());
            }

            match self.poll_once().await? {
                Some(job) => {
                    tokio::select! {
                        biased;

                        _ = shutdown.wait_for_shutdown() => {
                            self.requeue(&job).await?;
                            return Ok(());
                        }
                        permit = jobs.reserve() => match permit {
                            Ok(permit) => permit.send(job),
                            Err(_) => {
                                // Every worker is gone; put the job back.
                                self.requeue(&job).await?;
                                return Ok(());
                            }
                        },
                    }
                }
                None => {
                    if self.exit_on_complete {
                        event!(Level::INFO, worker=%self.identity, "All queues are empty, exiting");
                        trigger.shutdown();
                        return Ok(());
                    }

                    tokio::select! {
                        biased;

                        _ = shutdown.wait_for_shutdown() => return Ok(()),
                        _ = tokio::time::sleep(self.interval) => {},
                    };
                }
            }
        }
    }

    /// One tick: promote any due deferrals, then pop the first nonempty
    /// queue in selector order.
    async fn poll_once(&self) -> Result<Option<Job>, Error> {
        let mut conn = self.pool.get().await?;

        while let Some(deferred) = self.promote_deferred(&mut conn).await? {
            event!(
                Level::DEBUG,
                queue = %deferred.queue,
                class = %deferred.class,
                "Promoted deferred job"
            );
        }

        for queue in self.selector.order() {
            let popped: Option<Vec<u8>> = redis::cmd("LPOP")
                .arg(self.namespace.queue(&queue))
                .query_async(&mut conn)
                .await?;

            if let Some(bytes) = popped {
                let job = Job::from_queue_entry(&queue, bytes, self.use_number)?;
                redis::cmd("INCR")
                    .arg(self.namespace.stat_processed_for(&self.identity))
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                event!(
                    Level::DEBUG,
                    queue = %job.queue,
                    class = %job.payload.class,
                    "Popped job"
                );
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    async fn promote_deferred(
        &self,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<Option<Deferred>, Error> {
        let member: Option<String> = self
            .promote_script
            .key(self.namespace.deferred())
            .arg(Utc::now().timestamp())
            .invoke_async(&mut **conn)
            .await?;

        let member = match member {
            Some(member) => member,
            None => return Ok(None),
        };

        let deferred: Deferred = serde_json::from_str(&member)?;
        redis::cmd("LPUSH")
            .arg(self.namespace.queue(&deferred.queue))
            .arg(deferred.payload_bytes()?)
            .query_async::<_, ()>(conn)
            .await?;

        Ok(Some(deferred))
    }

    /// Return an undelivered job to the head of its origin queue, exactly
    /// as it was popped.
    async fn requeue(&self, job: &Job) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        redis::cmd("LPUSH")
            .arg(self.namespace.queue(&job.queue))
            .arg(job.raw())
            .query_async::<_, ()>(&mut conn)
            .await?;
        event!(Level::INFO, queue=%job.queue, class=%job.payload.class, "Requeued undelivered job");
        Ok(())
    }
}
