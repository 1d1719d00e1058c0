use std::{any::Any, sync::Arc, time::Duration};

use chrono::Utc;
use futures::FutureExt;
use resq_graceful_shutdown::GracefulShutdownConsumer;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{event, Level};

use crate::{
    error::Error,
    heartbeat,
    namespace::Namespace,
    payload::{Failure, Job, Work},
    pool::RedisPool,
    process::Process,
    registry::Registry,
};

/// Workers share one receiver; whichever is idle takes the next job.
pub(crate) type SharedJobs = Arc<Mutex<mpsc::Receiver<Job>>>;

const BACKTRACE_LIMIT: usize = 2048;

/// One consumer in the worker pool. Reads jobs until the channel closes,
/// recording a work envelope around every handler invocation.
pub(crate) struct Worker {
    process: Process,
    identity: String,
    pool: RedisPool,
    namespace: Namespace,
    registry: Registry,
    heartbeat_interval: Duration,
    prune_interval: Duration,
}

pub(crate) struct WorkerConfig {
    pub pool: RedisPool,
    pub namespace: Namespace,
    pub registry: Registry,
    pub heartbeat_interval: Duration,
    pub prune_interval: Duration,
}

impl Worker {
    pub(crate) fn new(id: String, queues: Vec<String>, config: WorkerConfig) -> Result<Worker, Error> {
        let process = Process::new(id, queues)?;
        let identity = process.to_string();

        Ok(Worker {
            process,
            identity,
            pool: config.pool,
            namespace: config.namespace,
            registry: config.registry,
            heartbeat_interval: config.heartbeat_interval,
            prune_interval: config.prune_interval,
        })
    }

    pub(crate) fn start(
        self,
        jobs: SharedJobs,
        shutdown: GracefulShutdownConsumer,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.work(jobs, shutdown).await {
                event!(Level::ERROR, worker=%self.identity, error=%e, "Worker terminated with error");
            }
        })
    }

    async fn work(
        &self,
        jobs: SharedJobs,
        shutdown: GracefulShutdownConsumer,
    ) -> Result<(), Error> {
        {
            let mut conn = self.pool.get().await?;
            self.process.open(&self.namespace, &mut conn).await?;
            self.process.start(&self.namespace, &mut conn).await?;
        }
        event!(Level::INFO, worker=%self.identity, "Worker started");

        // Before taking jobs, evict anyone who died without cleaning up.
        // Sweep failures are logged and do not stop this worker.
        if let Err(e) = heartbeat::prune_dead_workers(
            &self.pool,
            &self.namespace,
            &self.identity,
            self.heartbeat_interval,
            self.prune_interval,
        )
        .await
        {
            event!(Level::ERROR, worker=%self.identity, error=%e, "Error pruning dead workers");
        }

        let (heartbeat_closer, heartbeat_task) = heartbeat::start_heartbeat(
            self.pool.clone(),
            self.process.clone(),
            self.namespace.clone(),
            self.heartbeat_interval,
            shutdown.clone(),
        );

        // Drain until the poller drops the sending side. Shutdown never
        // interrupts an in-flight handler.
        let result = loop {
            let job = { jobs.lock().await.recv().await };
            match job {
                Some(job) => {
                    if let Err(e) = self.run_job(job).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            }
        };
        if let Err(e) = &result {
            event!(Level::ERROR, worker=%self.identity, error=%e, "Worker loop failed");
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
            event!(Level::ERROR, worker=%self.identity, error=%e, "Error closing worker");
        }
        event!(Level::INFO, worker=%self.identity, "Worker stopped");

        result
    }

    async fn run_job(&self, job: Job) -> Result<(), Error> {
        let processor = match self.registry.get(&job.payload.class) {
            Some(processor) => processor,
            None => {
                let error = format!(
                    "No worker for {} in queue {} with args {:?}",
                    job.payload.class, job.queue, job.payload.args
                );
                event!(Level::ERROR, class=%job.payload.class, queue=%job.queue, "No worker registered for class");

                let mut conn = self.pool.get().await?;
                let failure = self.build_failure(&job, error, Vec::new());
                self.process.fail(&self.namespace, &mut conn, &failure).await?;
                self.process.finish(&self.namespace, &mut conn).await?;
                return Ok(());
            }
        };

        let work = Work {
            queue: job.queue.clone(),
            run_at: Utc::now(),
            payload: job.payload.clone(),
        };
        {
            let mut conn = self.pool.get().await?;
            redis::cmd("SET")
                .arg(self.namespace.worker(&self.identity))
                .arg(serde_json::to_vec(&work)?)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        event!(Level::DEBUG, queue=%work.queue, class=%work.payload.class, "Processing job");

        let outcome =
            std::panic::AssertUnwindSafe(processor.perform(&job.queue, &job.payload.args))
                .catch_unwind()
                .await;

        let mut conn = self.pool.get().await?;
        match outcome {
            Ok(Ok(())) => {
                self.process.succeed(&self.namespace, &mut conn).await?;
                event!(Level::DEBUG, queue=%job.queue, class=%job.payload.class, "Job done");
            }
            Ok(Err(e)) => {
                event!(Level::ERROR, queue=%job.queue, class=%job.payload.class, error=%e, "Job failed");
                let failure = self.build_failure(&job, e.to_string(), backtrace_lines());
                self.process.fail(&self.namespace, &mut conn, &failure).await?;
            }
            Err(panic) => {
                let message = panic_message(panic);
                event!(Level::ERROR, queue=%job.queue, class=%job.payload.class, error=%message, "Job panicked");
                let failure = self.build_failure(&job, message, backtrace_lines());
                self.process.fail(&self.namespace, &mut conn, &failure).await?;
            }
        }

        self.process.finish(&self.namespace, &mut conn).await?;
        Ok(())
    }

    fn build_failure(&self, job: &Job, error: String, backtrace: Vec<String>) -> Failure {
        Failure {
            failed_at: Utc::now(),
            payload: job.payload.clone(),
            exception: "Error".to_string(),
            error,
            backtrace,
            worker: self.identity.clone(),
            queue: job.queue.clone(),
            retried_at: None,
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job handler panicked".to_string()
    }
}

fn backtrace_lines() -> Vec<String> {
    let backtrace = std::backtrace::Backtrace::force_capture().to_string();
    backtrace
        .chars()
        .take(BACKTRACE_LIMIT)
        .collect::<String>()
        .lines()
        .map(String::from)
        .collect()
}
