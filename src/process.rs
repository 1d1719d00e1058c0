use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use itertools::Itertools;

use crate::{error::Error, namespace::Namespace};

/// The identity of one polling or working task, visible to the rest of the
/// Resque ecosystem as `hostname:pid-id:queue1,queue2,...`. Membership of
/// the workers set under this name is what observers treat as liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub hostname: String,
    pub pid: u32,
    pub id: String,
    pub queues: Vec<String>,
}

impl Process {
    pub fn new(id: impl Into<String>, queues: Vec<String>) -> Result<Process, Error> {
        let hostname = hostname::get()?.to_string_lossy().into_owned();

        Ok(Process {
            hostname,
            pid: std::process::id(),
            id: id.into(),
            queues,
        })
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.hostname,
            self.pid,
            self.id,
            self.queues.iter().join(",")
        )
    }
}

impl FromStr for Process {
    type Err = Error;

    /// Parse a stored identity. Identities written by other Resque-family
    /// workers may omit the `-id` part or carry no queues; both are
    /// tolerated.
    fn from_str(s: &str) -> Result<Process, Error> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::Config(format!("malformed worker identity {:?}", s)));
        }

        let (pid, id) = match parts[1].split_once('-') {
            Some((pid, id)) => (pid, id),
            None => (parts[1], ""),
        };
        let pid: u32 = pid
            .parse()
            .map_err(|_| Error::Config(format!("malformed worker identity {:?}", s)))?;

        let queues = if parts[2].is_empty() {
            Vec::new()
        } else {
            parts[2].split(',').map(String::from).collect()
        };

        Ok(Process {
            hostname: parts[0].to_string(),
            pid,
            id: id.to_string(),
            queues,
        })
    }
}

impl Process {
    /// Announce this process: join the workers set and zero its counters.
    /// The first heartbeat goes into the same transaction so a concurrent
    /// prune sweep never sees the identity without one.
    pub(crate) async fn open(
        &self,
        ns: &Namespace,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<(), Error> {
        let identity = self.to_string();
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(ns.workers())
            .arg(&identity)
            .ignore()
            .cmd("SET")
            .arg(ns.stat_processed_for(&identity))
            .arg("0")
            .ignore()
            .cmd("SET")
            .arg(ns.stat_failed_for(&identity))
            .arg("0")
            .ignore()
            .cmd("HSET")
            .arg(ns.heartbeats())
            .arg(&identity)
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }

    /// Retract this process from the observable worker set and drop its
    /// counters and heartbeat.
    pub(crate) async fn close(
        &self,
        ns: &Namespace,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<(), Error> {
        close_identity(&self.to_string(), ns, conn).await
    }

    pub(crate) async fn start(
        &self,
        ns: &Namespace,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<(), Error> {
        let started = Utc::now().format("%Y-%m-%d %H:%M:%S%.9f %z UTC").to_string();
        redis::cmd("SET")
            .arg(ns.worker_started(&self.to_string()))
            .arg(started)
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }

    /// Delete the work envelope and the started marker. This is the commit
    /// point for a finished job.
    pub(crate) async fn finish(
        &self,
        ns: &Namespace,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<(), Error> {
        let identity = self.to_string();
        redis::pipe()
            .cmd("DEL")
            .arg(ns.worker(&identity))
            .ignore()
            .cmd("DEL")
            .arg(ns.worker_started(&identity))
            .ignore()
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }

    pub(crate) async fn succeed(
        &self,
        ns: &Namespace,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<(), Error> {
        redis::pipe()
            .cmd("INCR")
            .arg(ns.stat_processed())
            .ignore()
            .cmd("INCR")
            .arg(ns.stat_processed_for(&self.to_string()))
            .ignore()
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }

    /// Append a failure record and bump the failure counters.
    pub(crate) async fn fail(
        &self,
        ns: &Namespace,
        conn: &mut deadpool_redis::Connection,
        failure: &crate::payload::Failure,
    ) -> Result<(), Error> {
        let body = serde_json::to_vec(failure)?;
        redis::pipe()
            .cmd("RPUSH")
            .arg(ns.failed())
            .arg(body)
            .ignore()
            .cmd("INCR")
            .arg(ns.stat_failed())
            .ignore()
            .cmd("INCR")
            .arg(ns.stat_failed_for(&self.to_string()))
            .ignore()
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }

    pub(crate) async fn heartbeat(
        &self,
        ns: &Namespace,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<(), Error> {
        redis::cmd("HSET")
            .arg(ns.heartbeats())
            .arg(self.to_string())
            .arg(Utc::now().to_rfc3339())
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }
}

/// `close` keyed by the stored identity string rather than a re-rendered
/// one. The prune sweep uses this so identities written by foreign workers
/// are removed byte-for-byte as they appear in Redis.
pub(crate) async fn close_identity(
    identity: &str,
    ns: &Namespace,
    conn: &mut deadpool_redis::Connection,
) -> Result<(), Error> {
    redis::pipe()
        .cmd("SREM")
        .arg(ns.workers())
        .arg(identity)
        .ignore()
        .cmd("DEL")
        .arg(ns.stat_processed_for(identity))
        .ignore()
        .cmd("DEL")
        .arg(ns.stat_failed_for(identity))
        .ignore()
        .cmd("HDEL")
        .arg(ns.heartbeats())
        .arg(identity)
        .ignore()
        .query_async::<_, ()>(conn)
        .await?;
    Ok(())
}
