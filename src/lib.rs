//! A Resque-compatible background job worker.
//!
//! Jobs are JSON payloads (`{"class": "MyClass", "args": [...]}`) on Redis
//! lists, enqueued by this crate or by any other Resque-family client. A
//! [`WorkerPool`] polls the configured queues with one producer task, fans
//! jobs out to a bounded set of executors, and maintains the bookkeeping
//! (worker set, heartbeats, stats, failure records) that Resque dashboards
//! and sibling workers observe.
//!
//! ```no_run
//! use resq::{Value, WorkerPool, WorkerSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), resq::Error> {
//!     let pool = WorkerPool::new(WorkerSettings {
//!         queues: "high=2,low=1".to_string(),
//!         ..WorkerSettings::default()
//!     })?;
//!
//!     pool.register_fn("MyClass", |queue: String, args: Vec<Value>| async move {
//!         println!("from {}: {:?}", queue, args);
//!         Ok(())
//!     });
//!
//!     // Runs until SIGQUIT/SIGTERM/SIGINT, or until the queues drain when
//!     // exit_on_complete is set.
//!     pool.run().await
//! }
//! ```

mod enqueue;
mod error;
mod heartbeat;
mod namespace;
mod payload;
mod poller;
mod pool;
mod process;
mod registry;
mod retry;
mod selector;
mod settings;
#[cfg(all(test, feature = "test_redis"))]
mod test_util;
mod value;
mod worker;

pub use enqueue::Enqueuer;
pub use error::Error;
pub use namespace::{Namespace, DEFAULT_NAMESPACE};
pub use payload::{Deferred, Failure, Job, Payload, Work};
pub use pool::RedisPool;
pub use process::Process;
pub use registry::{JobProcessor, Registry};
pub use settings::{parse_queues, WorkerSettings, DEFAULT_URI};
pub use value::Value;

pub use resq_graceful_shutdown::{GracefulShutdown, GracefulShutdownConsumer, ShutdownTrigger};

use std::{future::Future, sync::Arc};

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{event, Level};

use crate::{
    poller::{Poller, PollerConfig},
    selector::QueueSelector,
    worker::{Worker, WorkerConfig},
};

/// The worker engine. Cheap to clone; all clones share one Redis pool and
/// one handler registry.
pub struct WorkerPool(Arc<WorkerPoolInner>);

struct WorkerPoolInner {
    settings: WorkerSettings,
    namespace: Namespace,
    pool: RedisPool,
    registry: Registry,

    // Expanded queue list and whether strict selection is in effect.
    queues: Vec<String>,
    strict: bool,

    closed: watch::Sender<bool>,
}

impl Clone for WorkerPool {
    fn clone(&self) -> WorkerPool {
        WorkerPool(self.0.clone())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queues", &self.0.queues)
            .field("strict", &self.0.strict)
            .field("namespace", &self.0.namespace.prefix())
            .field("concurrency", &self.0.settings.concurrency)
            .finish()
    }
}

impl WorkerPool {
    /// Validate the settings and connect the Redis pool. Fails fast on an
    /// empty queue list, a bad weight spec, or a bad URI.
    pub fn new(settings: WorkerSettings) -> Result<WorkerPool, Error> {
        settings.validate()?;
        let (queues, strict) = parse_queues(&settings.queues)?;
        let pool = RedisPool::new(&settings)?;
        let namespace = Namespace::new(settings.namespace.clone());
        let (closed, _) = watch::channel(false);

        Ok(WorkerPool(Arc::new(WorkerPoolInner {
            settings,
            namespace,
            pool,
            registry: Registry::new(),
            queues,
            strict,
            closed,
        })))
    }

    pub fn registry(&self) -> &Registry {
        &self.0.registry
    }

    /// Register a handler under the class name the enqueuing side uses.
    pub fn register(&self, class: impl Into<String>, processor: impl JobProcessor + 'static) {
        self.0.registry.register(class, processor);
    }

    /// Register a plain async function or closure as a handler.
    pub fn register_fn<F, Fut>(&self, class: impl Into<String>, f: F)
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.0.registry.register_fn(class, f);
    }

    /// A producer handle sharing this pool's connections and namespace.
    pub fn enqueuer(&self) -> Enqueuer {
        Enqueuer::with_pool(self.0.pool.clone(), self.0.namespace.clone())
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        class: &str,
        args: Vec<Value>,
    ) -> Result<(), Error> {
        self.enqueuer().enqueue(queue, class, args).await
    }

    /// Resolves once a `run` call has fully torn down: join barrier
    /// released and transport returned to the pool.
    pub async fn closed(&self) {
        let mut rx = self.0.closed.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run until a shutdown signal arrives (SIGQUIT, SIGTERM, SIGINT), or
    /// until the queues drain when `exit_on_complete` is set.
    pub async fn run(&self) -> Result<(), Error> {
        self.run_with_shutdown(GracefulShutdown::new()).await
    }

    /// Run with a caller-supplied shutdown, for embedding into a process
    /// that manages its own signals.
    pub async fn run_with_shutdown(&self, shutdown: GracefulShutdown) -> Result<(), Error> {
        let inner = &self.0;
        let settings = &inner.settings;

        let selector = QueueSelector::new(
            inner.queues.clone(),
            inner.strict,
            settings.priorities.clone(),
        );

        // The producer side of this channel lives in the poller; dropping it
        // on poller exit is what releases the draining workers.
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(1);
        let shared_jobs: worker::SharedJobs = Arc::new(Mutex::new(jobs_rx));

        let poller = Poller::new(PollerConfig {
            pool: inner.pool.clone(),
            namespace: inner.namespace.clone(),
            selector,
            interval: settings.poll_interval(),
            heartbeat_interval: settings.heartbeat_interval,
            exit_on_complete: settings.exit_on_complete,
            use_number: settings.use_number,
        })?;
        let poller_task = poller.start(jobs_tx, shutdown.consumer(), shutdown.trigger());

        let mut worker_tasks = Vec::with_capacity(settings.concurrency);
        for id in 0..settings.concurrency {
            let worker = Worker::new(
                id.to_string(),
                inner.queues.clone(),
                WorkerConfig {
                    pool: inner.pool.clone(),
                    namespace: inner.namespace.clone(),
                    registry: inner.registry.clone(),
                    heartbeat_interval: settings.heartbeat_interval,
                    prune_interval: settings.prune_interval(),
                },
            )?;
            worker_tasks.push(worker.start(shared_jobs.clone(), shutdown.consumer()));
        }
        // Only the workers hold the receiver now; when the last one exits,
        // a blocked poller send errors out instead of hanging.
        drop(shared_jobs);

        let cleaner_task = if settings.max_age_retries > std::time::Duration::from_secs(0) {
            Some(retry::start_retry_cleaner(
                inner.pool.clone(),
                inner.namespace.clone(),
                settings.retry_clean_interval,
                settings.max_age_retries,
                shutdown.consumer(),
            ))
        } else {
            None
        };

        // Join barrier: producer first, then the drained consumers.
        if let Err(e) = poller_task.await {
            event!(Level::ERROR, error=%e, "Poller task panicked");
        }
        for task in worker_tasks {
            if let Err(e) = task.await {
                event!(Level::ERROR, error=%e, "Worker task panicked");
            }
        }

        // Everything that outlives the workers stops via the broadcast.
        shutdown.shutdown();
        if let Some(task) = cleaner_task {
            if let Err(e) = task.await {
                event!(Level::ERROR, error=%e, "Retry cleaner task panicked");
            }
        }
        let _ = shutdown.shutdown_finished.await;

        // Connections return to the pool as tasks end; observers may now
        // treat the pool as closed.
        let _ = inner.closed.send(true);

        Ok(())
    }
}

#[cfg(all(test, feature = "test_redis"))]
mod tests {
    use super::*;
    use crate::test_util::cleanup;

    fn test_settings(queues: &str) -> WorkerSettings {
        dotenv::dotenv().ok();
        WorkerSettings {
            queues: queues.to_string(),
            namespace: format!("resq-test-{}:", uuid::Uuid::new_v4()),
            concurrency: 2,
            interval: 0.05,
            exit_on_complete: true,
            ..WorkerSettings::default()
        }
    }

    #[tokio::test]
    async fn enqueue_process_round_trip() {
        let settings = test_settings("round-trip");
        let namespace = settings.namespace.clone();
        let pool = WorkerPool::new(settings).expect("Creating pool");

        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<(String, Vec<Value>)>();
        let seen_tx = std::sync::Mutex::new(Some(seen_tx));
        pool.register_fn("Echo", move |queue: String, args: Vec<Value>| {
            let tx = seen_tx.lock().unwrap().take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send((queue, args));
                }
                Ok(())
            }
        });

        pool.enqueue("round-trip", "Echo", vec![Value::from("a"), Value::Int(1)])
            .await
            .expect("Enqueueing");

        pool.run().await.expect("Running pool");

        let (queue, args) = seen_rx.await.expect("Handler ran");
        assert_eq!(queue, "round-trip");
        assert_eq!(args, vec![Value::String("a".to_string()), Value::Int(1)]);

        let ns = Namespace::new(namespace.clone());
        let mut conn = pool.0.pool.get().await.expect("Getting connection");

        let processed: Option<String> = redis::cmd("GET")
            .arg(ns.stat_processed())
            .query_async(&mut conn)
            .await
            .expect("Reading processed stat");
        assert_eq!(processed.as_deref(), Some("1"));

        let remaining: i64 = redis::cmd("LLEN")
            .arg(ns.queue("round-trip"))
            .query_async(&mut conn)
            .await
            .expect("Reading queue length");
        assert_eq!(remaining, 0);

        // Liveness: every identity of this process is gone after run.
        let workers: Vec<String> = redis::cmd("SMEMBERS")
            .arg(ns.workers())
            .query_async(&mut conn)
            .await
            .expect("Reading workers set");
        assert!(workers.is_empty(), "workers still present: {:?}", workers);

        let known_queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(ns.queues())
            .query_async(&mut conn)
            .await
            .expect("Reading queues set");
        assert_eq!(known_queues, vec!["round-trip".to_string()]);

        drop(conn);
        cleanup(&pool.0.pool, &namespace).await;
    }

    #[tokio::test]
    async fn panicking_handler_records_failure() {
        let settings = test_settings("panics");
        let namespace = settings.namespace.clone();
        let pool = WorkerPool::new(settings).expect("Creating pool");

        pool.register_fn("Panics", |_queue: String, _args: Vec<Value>| async move {
            panic!("boom");
            #[allow(unreachable_code)]
            Ok(())
        });

        pool.enqueue("panics", "Panics", Vec::new())
            .await
            .expect("Enqueueing");
        pool.run().await.expect("Running pool");

        let ns = Namespace::new(namespace.clone());
        let mut conn = pool.0.pool.get().await.expect("Getting connection");

        let failures: Vec<String> = redis::cmd("LRANGE")
            .arg(ns.failed())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .expect("Reading failed list");
        assert_eq!(failures.len(), 1);

        let failure: Failure = serde_json::from_str(&failures[0]).expect("Decoding failure");
        assert_eq!(failure.exception, "Error");
        assert!(failure.error.contains("boom"), "error was {}", failure.error);
        assert_eq!(failure.queue, "panics");

        let failed: Option<String> = redis::cmd("GET")
            .arg(ns.stat_failed())
            .query_async(&mut conn)
            .await
            .expect("Reading failed stat");
        assert_eq!(failed.as_deref(), Some("1"));

        drop(conn);
        cleanup(&pool.0.pool, &namespace).await;
    }

    #[tokio::test]
    async fn deferred_entry_promotes_to_queue() {
        let settings = test_settings("deferred");
        let namespace = settings.namespace.clone();
        let pool = WorkerPool::new(settings).expect("Creating pool");

        let enqueuer = pool.enqueuer();
        enqueuer
            .enqueue_at(
                chrono::Utc::now() - chrono::Duration::seconds(1),
                "deferred",
                "Later",
                Vec::new(),
            )
            .await
            .expect("Scheduling");

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let saw = ran.clone();
        pool.register_fn("Later", move |_queue: String, _args: Vec<Value>| {
            let saw = saw.clone();
            async move {
                saw.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        });

        pool.run().await.expect("Running pool");
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));

        let ns = Namespace::new(namespace.clone());
        let mut conn = pool.0.pool.get().await.expect("Getting connection");
        let deferred: i64 = redis::cmd("ZCARD")
            .arg(ns.deferred())
            .query_async(&mut conn)
            .await
            .expect("Reading deferred set");
        assert_eq!(deferred, 0);

        drop(conn);
        cleanup(&pool.0.pool, &namespace).await;
    }
}
